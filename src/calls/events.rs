//! Notifications for the UI layer.

use super::directory::DisplayIdentity;
use super::media::MediaStream;
use super::state::CallState;
use crate::types::call::{CallId, CallKind, EndReason};
use log::trace;
use tokio::sync::broadcast;

// The size of the broadcast channel buffer.
const CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Clone)]
pub enum CallEvent {
    /// Show the incoming-call prompt.
    IncomingCall {
        call_id: CallId,
        from: DisplayIdentity,
        kind: CallKind,
    },
    StateChanged {
        call_id: CallId,
        state: CallState,
    },
    /// The peer's media arrived. Fired once per call.
    RemoteStream {
        call_id: CallId,
        stream: MediaStream,
    },
    LocalMediaChanged {
        call_id: CallId,
        audio_enabled: bool,
        video_enabled: bool,
    },
    CallEnded {
        call_id: CallId,
        reason: EndReason,
        /// Human readable text for the ended-call screen.
        message: String,
    },
}

impl CallEvent {
    pub fn call_id(&self) -> &CallId {
        match self {
            Self::IncomingCall { call_id, .. }
            | Self::StateChanged { call_id, .. }
            | Self::RemoteStream { call_id, .. }
            | Self::LocalMediaChanged { call_id, .. }
            | Self::CallEnded { call_id, .. } => call_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CallEventBus {
    tx: broadcast::Sender<CallEvent>,
}

impl Default for CallEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl CallEventBus {
    pub fn new() -> Self {
        Self {
            tx: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: CallEvent) {
        if self.tx.send(event).is_err() {
            trace!("No call event subscribers");
        }
    }
}
