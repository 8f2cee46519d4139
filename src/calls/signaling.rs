//! Call signal type definitions.
//!
//! Seven signal types drive a direct call. They travel as the `type` field of
//! a [`CallSignal`](super::signal::CallSignal) over the signal relay.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Signal types for call control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalType {
    /// Caller announces a call. Carries the call kind.
    #[serde(rename = "call-request")]
    CallRequest,

    /// Callee accepted and has acquired media. Carries the call kind.
    #[serde(rename = "call-accepted")]
    CallAccepted,

    /// Callee declined, was busy, or could not acquire media.
    #[serde(rename = "call-rejected")]
    CallRejected,

    /// Caller's session description.
    #[serde(rename = "offer")]
    Offer,

    /// Callee's session description.
    #[serde(rename = "answer")]
    Answer,

    /// One ICE candidate. Order-independent of offer/answer.
    #[serde(rename = "ice-candidate")]
    IceCandidate,

    /// Either party ended the call.
    #[serde(rename = "call-ended")]
    CallEnded,
}

impl SignalType {
    pub const ALL: [SignalType; 7] = [
        Self::CallRequest,
        Self::CallAccepted,
        Self::CallRejected,
        Self::Offer,
        Self::Answer,
        Self::IceCandidate,
        Self::CallEnded,
    ];

    /// Wire name used in the `type` field.
    pub const fn tag_name(&self) -> &'static str {
        match self {
            Self::CallRequest => "call-request",
            Self::CallAccepted => "call-accepted",
            Self::CallRejected => "call-rejected",
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::IceCandidate => "ice-candidate",
            Self::CallEnded => "call-ended",
        }
    }

    /// Whether this signal terminates the call at the receiver.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::CallRejected | Self::CallEnded)
    }
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag_name())
    }
}
