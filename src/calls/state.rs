//! Call state machine implementation.
//!
//! ```text
//! Idle ─► Dialing (caller) ─┐
//!   │                       ├─► Negotiating ─► Active
//!   └──► Ringing (callee) ──┘
//! every non-Idle state ─► Ended
//! ```

use crate::types::call::{CallId, CallKind, CallRole, EndReason, ParticipantId};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Current state of a call.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CallState {
    /// Session created, nothing done yet.
    #[default]
    Idle,
    /// Outgoing call: acquiring media, then waiting for the callee.
    Dialing { started_at: DateTime<Utc> },
    /// Incoming call: prompting the local user.
    Ringing { received_at: DateTime<Utc> },
    /// Offer/answer and ICE exchange in progress.
    Negotiating { since: DateTime<Utc> },
    /// Remote media flowing.
    Active { connected_at: DateTime<Utc> },
    /// Terminal. All resources released.
    Ended {
        reason: EndReason,
        ended_at: DateTime<Utc>,
        duration_secs: Option<i64>,
    },
}

impl CallState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Dialing { .. } => "dialing",
            Self::Ringing { .. } => "ringing",
            Self::Negotiating { .. } => "negotiating",
            Self::Active { .. } => "active",
            Self::Ended { .. } => "ended",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active { .. })
    }

    pub fn is_ended(&self) -> bool {
        matches!(self, Self::Ended { .. })
    }

    /// Neither `Idle` nor `Ended`.
    pub fn is_live(&self) -> bool {
        !matches!(self, Self::Idle | Self::Ended { .. })
    }

    pub fn can_accept(&self) -> bool {
        matches!(self, Self::Ringing { .. })
    }
}

/// State transitions for calls.
#[derive(Debug, Clone)]
pub enum CallTransition {
    Dial,
    IncomingRequest,
    LocalAccepted,
    RemoteAccepted,
    MediaConnected,
    End { reason: EndReason },
}

/// One call, from intent to termination.
///
/// The controller owns the only live instance; clones are snapshots.
#[derive(Debug, Clone, Serialize)]
pub struct CallSession {
    pub id: CallId,
    pub kind: CallKind,
    pub role: CallRole,
    pub peer_id: ParticipantId,
    pub state: CallState,
    pub created_at: DateTime<Utc>,
    /// Names of every state entered, in order, starting with `idle`.
    pub history: Vec<&'static str>,
}

impl CallSession {
    pub fn new(id: CallId, kind: CallKind, role: CallRole, peer_id: ParticipantId) -> Self {
        Self {
            id,
            kind,
            role,
            peer_id,
            state: CallState::Idle,
            created_at: Utc::now(),
            history: vec![CallState::Idle.name()],
        }
    }

    pub fn is_caller(&self) -> bool {
        self.role == CallRole::Caller
    }

    /// Apply a state transition. Returns error if transition is invalid.
    pub fn apply_transition(
        &mut self,
        transition: CallTransition,
    ) -> Result<(), InvalidTransition> {
        let now = Utc::now();
        let new_state = match (&self.state, transition) {
            (CallState::Idle, CallTransition::Dial) if self.is_caller() => {
                CallState::Dialing { started_at: now }
            }
            (CallState::Idle, CallTransition::IncomingRequest) if !self.is_caller() => {
                CallState::Ringing { received_at: now }
            }
            (CallState::Ringing { .. }, CallTransition::LocalAccepted) => {
                CallState::Negotiating { since: now }
            }
            (CallState::Dialing { .. }, CallTransition::RemoteAccepted) => {
                CallState::Negotiating { since: now }
            }
            (CallState::Negotiating { .. }, CallTransition::MediaConnected) => {
                CallState::Active { connected_at: now }
            }
            (CallState::Active { connected_at }, CallTransition::End { reason }) => {
                let duration = now.signed_duration_since(*connected_at).num_seconds();
                CallState::Ended {
                    reason,
                    ended_at: now,
                    duration_secs: Some(duration),
                }
            }
            (
                CallState::Dialing { .. }
                | CallState::Ringing { .. }
                | CallState::Negotiating { .. },
                CallTransition::End { reason },
            ) => CallState::Ended {
                reason,
                ended_at: now,
                duration_secs: None,
            },
            (current, transition) => {
                return Err(InvalidTransition {
                    current_state: current.name().to_string(),
                    attempted: format!("{:?}", transition),
                });
            }
        };
        self.history.push(new_state.name());
        self.state = new_state;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}

/// Every `(from, to)` state-name pair the machine can produce.
pub const ALLOWED_TRANSITIONS: [(&str, &str); 9] = [
    ("idle", "dialing"),
    ("idle", "ringing"),
    ("dialing", "negotiating"),
    ("ringing", "negotiating"),
    ("negotiating", "active"),
    ("dialing", "ended"),
    ("ringing", "ended"),
    ("negotiating", "ended"),
    ("active", "ended"),
];

/// Whether a recorded state history only walks allowed edges.
pub fn is_valid_history(history: &[&str]) -> bool {
    history.first() == Some(&"idle")
        && history
            .windows(2)
            .all(|pair| ALLOWED_TRANSITIONS.contains(&(pair[0], pair[1])))
}
