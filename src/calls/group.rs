//! Group calls (degraded).
//!
//! A group call is a flag on the group record plus a notification to each
//! member. No peer connection is created and no media is routed; there is no
//! mixing or forwarding component to route it through.

use super::error::CallError;
use crate::types::call::{CallId, CallKind, ParticipantId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupCallStatus {
    Ringing,
    Active,
}

/// The `activeCall` field of a group record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveGroupCall {
    pub call_id: CallId,
    pub initiator: ParticipantId,
    #[serde(rename = "type")]
    pub kind: CallKind,
    pub status: GroupCallStatus,
    pub started_at: DateTime<Utc>,
    /// Members who joined, initiator first.
    pub participants: Vec<ParticipantId>,
}

/// Shared-record store holding group membership and the active call field.
#[async_trait]
pub trait GroupCallStore: Send + Sync {
    async fn members(&self, group: &ParticipantId) -> Result<Vec<ParticipantId>, CallError>;

    async fn active_call(&self, group: &ParticipantId)
    -> Result<Option<ActiveGroupCall>, CallError>;

    /// Write (or clear, with `None`) the group's active call.
    async fn set_active_call(
        &self,
        group: &ParticipantId,
        call: Option<ActiveGroupCall>,
    ) -> Result<(), CallError>;
}

#[async_trait]
pub trait GroupNotifier: Send + Sync {
    async fn notify(&self, member: &ParticipantId, call: &ActiveGroupCall);
}

#[derive(Debug, Default)]
struct GroupRecord {
    members: Vec<ParticipantId>,
    active_call: Option<ActiveGroupCall>,
}

#[derive(Debug, Default)]
pub struct InMemoryGroupStore {
    groups: DashMap<ParticipantId, GroupRecord>,
}

impl InMemoryGroupStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_group(&self, group: impl Into<ParticipantId>, members: Vec<ParticipantId>) {
        self.groups.insert(
            group.into(),
            GroupRecord {
                members,
                active_call: None,
            },
        );
    }
}

#[async_trait]
impl GroupCallStore for InMemoryGroupStore {
    async fn members(&self, group: &ParticipantId) -> Result<Vec<ParticipantId>, CallError> {
        self.groups
            .get(group)
            .map(|record| record.members.clone())
            .ok_or_else(|| CallError::Store(format!("unknown group {group}")))
    }

    async fn active_call(
        &self,
        group: &ParticipantId,
    ) -> Result<Option<ActiveGroupCall>, CallError> {
        self.groups
            .get(group)
            .map(|record| record.active_call.clone())
            .ok_or_else(|| CallError::Store(format!("unknown group {group}")))
    }

    async fn set_active_call(
        &self,
        group: &ParticipantId,
        call: Option<ActiveGroupCall>,
    ) -> Result<(), CallError> {
        let mut record = self
            .groups
            .get_mut(group)
            .ok_or_else(|| CallError::Store(format!("unknown group {group}")))?;
        record.active_call = call;
        Ok(())
    }
}

pub struct GroupCalls {
    local_id: ParticipantId,
    store: Arc<dyn GroupCallStore>,
    notifier: Arc<dyn GroupNotifier>,
}

impl GroupCalls {
    pub fn new(
        local_id: ParticipantId,
        store: Arc<dyn GroupCallStore>,
        notifier: Arc<dyn GroupNotifier>,
    ) -> Self {
        Self {
            local_id,
            store,
            notifier,
        }
    }

    /// Flag a new call on the group record and notify every other member.
    pub async fn start(
        &self,
        group: &ParticipantId,
        kind: CallKind,
    ) -> Result<ActiveGroupCall, CallError> {
        if let Some(existing) = self.store.active_call(group).await? {
            return Err(CallError::Busy(existing.call_id));
        }

        let call = ActiveGroupCall {
            call_id: CallId::generate(),
            initiator: self.local_id.clone(),
            kind,
            status: GroupCallStatus::Ringing,
            started_at: Utc::now(),
            participants: vec![self.local_id.clone()],
        };
        self.store.set_active_call(group, Some(call.clone())).await?;

        let members = self.store.members(group).await?;
        for member in members.iter().filter(|m| **m != self.local_id) {
            self.notifier.notify(member, &call).await;
        }
        info!(
            "Group call {} started in {} ({} members notified, no media routed)",
            call.call_id,
            group,
            members.len().saturating_sub(1)
        );
        Ok(call)
    }

    /// Mark the group's call active and record the local participant.
    pub async fn join(&self, group: &ParticipantId) -> Result<ActiveGroupCall, CallError> {
        let mut call = self
            .store
            .active_call(group)
            .await?
            .ok_or(CallError::NoActiveCall)?;
        call.status = GroupCallStatus::Active;
        if !call.participants.contains(&self.local_id) {
            call.participants.push(self.local_id.clone());
        }
        self.store.set_active_call(group, Some(call.clone())).await?;
        info!("{} joined group call {} in {}", self.local_id, call.call_id, group);
        Ok(call)
    }

    /// Clear the group's call. Returns the call that was cleared, if any.
    pub async fn end(&self, group: &ParticipantId) -> Result<Option<ActiveGroupCall>, CallError> {
        let Some(call) = self.store.active_call(group).await? else {
            debug!("No group call to end in {}", group);
            return Ok(None);
        };
        self.store.set_active_call(group, None).await?;
        info!("Group call {} in {} ended", call.call_id, group);
        Ok(Some(call))
    }

    pub async fn active(
        &self,
        group: &ParticipantId,
    ) -> Result<Option<ActiveGroupCall>, CallError> {
        self.store.active_call(group).await
    }
}
