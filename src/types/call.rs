use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque correlation identifier for one call, generated by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random 16-byte id, hex encoded (32 uppercase characters).
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; 16];
        rand::rng().fill_bytes(&mut bytes);
        Self(hex::encode_upper(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CallId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CallId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Identifier of a portal participant (or of a group, on the group-call path).
///
/// Ordering is lexicographic and is what glare resolution compares.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ParticipantId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    #[default]
    Audio,
    Video,
}

impl CallKind {
    pub fn is_video(&self) -> bool {
        matches!(self, Self::Video)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallRole {
    Caller,
    Callee,
}

/// Why a call session ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "detail")]
pub enum EndReason {
    /// Local user hung up.
    LocalHangup,
    /// Local user declined an incoming call.
    Declined,
    /// Peer sent `call-ended`.
    RemoteEnded,
    /// Peer sent `call-rejected`.
    RemoteRejected,
    /// Peer connection reported disconnected, failed or closed.
    ConnectionLost,
    /// Outgoing call was not answered before the dial deadline.
    Timeout,
    /// Incoming call was not answered before the ring deadline.
    Missed,
    /// Camera/microphone could not be acquired.
    MediaUnavailable(String),
    /// SDP or ICE exchange failed.
    NegotiationFailed(String),
    /// Outgoing call abandoned in favour of the peer's crossing call.
    GlareYielded,
}

impl EndReason {
    /// Human readable message for the ended-call UI.
    pub fn message(&self) -> String {
        match self {
            Self::LocalHangup => "Call ended".to_string(),
            Self::Declined => "Call declined".to_string(),
            Self::RemoteEnded => "The other participant ended the call".to_string(),
            Self::RemoteRejected => "Call was declined".to_string(),
            Self::ConnectionLost => "Connection lost".to_string(),
            Self::Timeout => "No answer".to_string(),
            Self::Missed => "Missed call".to_string(),
            Self::MediaUnavailable(guidance) => guidance.clone(),
            Self::NegotiationFailed(detail) => format!("Could not connect the call: {detail}"),
            Self::GlareYielded => "Switched to the incoming call".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_call_ids_are_unique_hex() {
        let a = CallId::generate();
        let b = CallId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_participant_ordering_is_lexicographic() {
        let alice = ParticipantId::from("alice");
        let bob = ParticipantId::from("bob");
        assert!(alice < bob);
    }

    #[test]
    fn test_call_kind_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&CallKind::Video).unwrap(), "\"video\"");
        let kind: CallKind = serde_json::from_str("\"audio\"").unwrap();
        assert_eq!(kind, CallKind::Audio);
    }

    #[test]
    fn test_media_unavailable_message_is_guidance() {
        let reason = EndReason::MediaUnavailable("Allow camera access".into());
        assert_eq!(reason.message(), "Allow camera access");
    }
}
