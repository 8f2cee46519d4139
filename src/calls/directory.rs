//! Participant display identities for the ringing and in-call UI.

use crate::types::call::ParticipantId;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayIdentity {
    pub id: ParticipantId,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

impl DisplayIdentity {
    pub fn new(id: ParticipantId, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            avatar_url: None,
        }
    }

    /// Identity for a participant the directory does not know.
    pub fn fallback(id: &ParticipantId) -> Self {
        Self::new(id.clone(), id.as_str())
    }

    /// Avatar placeholder letter.
    pub fn initial(&self) -> char {
        self.display_name
            .chars()
            .find(|c| c.is_alphanumeric())
            .map(|c| c.to_uppercase().next().unwrap_or(c))
            .unwrap_or('?')
    }
}

#[async_trait]
pub trait Directory: Send + Sync {
    async fn resolve(&self, id: &ParticipantId) -> Option<DisplayIdentity>;
}

/// Resolve `id`, falling back to the raw identifier.
pub async fn resolve_identity(directory: &dyn Directory, id: &ParticipantId) -> DisplayIdentity {
    match directory.resolve(id).await {
        Some(identity) => identity,
        None => DisplayIdentity::fallback(id),
    }
}

#[derive(Debug, Default)]
pub struct StaticDirectory {
    entries: DashMap<ParticipantId, DisplayIdentity>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, identity: DisplayIdentity) {
        self.entries.insert(identity.id.clone(), identity);
    }

    pub fn with(self, id: impl Into<ParticipantId>, display_name: &str) -> Self {
        self.insert(DisplayIdentity::new(id.into(), display_name));
        self
    }
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn resolve(&self, id: &ParticipantId) -> Option<DisplayIdentity> {
        self.entries.get(id).map(|entry| entry.value().clone())
    }
}
