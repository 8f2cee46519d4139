//! Call-related error types.

use crate::types::call::CallId;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("no call in progress")]
    NoActiveCall,

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] super::state::InvalidTransition),

    #[error("another call is in progress: {0}")]
    Busy(CallId),

    #[error("missing signal payload: {0}")]
    MissingPayload(&'static str),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("media unavailable: {0}")]
    Media(#[from] MediaFailure),

    #[error("negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),

    #[error("group store error: {0}")]
    Store(String),

    #[error("call controller stopped")]
    ControllerStopped,
}

/// Which capture devices a permission failure applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSet {
    Microphone,
    Camera,
    CameraAndMicrophone,
}

impl fmt::Display for DeviceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Microphone => f.write_str("microphone"),
            Self::Camera => f.write_str("camera"),
            Self::CameraAndMicrophone => f.write_str("camera and microphone"),
        }
    }
}

/// Classified camera/microphone acquisition failure.
///
/// Every variant is terminal for the attempt; none is retried automatically.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaFailure {
    #[error("permission denied for {devices}")]
    PermissionDenied { devices: DeviceSet },

    #[error("no capture device found")]
    DeviceNotFound,

    #[error("capture device is in use by another application")]
    DeviceBusy,
}

impl MediaFailure {
    /// User-facing guidance for fixing the failure.
    pub fn remediation(&self) -> String {
        match self {
            Self::PermissionDenied { devices } => format!(
                "Access to your {devices} is blocked. Allow it in your browser or system \
                 privacy settings, then start the call again."
            ),
            Self::DeviceNotFound => "No camera or microphone was found. Connect a device and \
                 try again."
                .to_string(),
            Self::DeviceBusy => "Your camera or microphone is being used by another \
                 application. Close it and start the call again."
                .to_string(),
        }
    }
}

/// Raw failure reported by the local device surface, before classification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("access not allowed")]
    NotAllowed,

    #[error("no matching device")]
    NotFound,

    #[error("device could not be read")]
    NotReadable,

    #[error("constraint cannot be satisfied: {0}")]
    OverConstrained(String),

    #[error("acquisition aborted")]
    Aborted,

    #[error("{0}")]
    Other(String),
}

/// SDP or ICE exchange failure reported by the peer connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NegotiationError {
    #[error("peer connection could not be created: {0}")]
    PeerConnection(String),

    #[error("create offer failed: {0}")]
    CreateOffer(String),

    #[error("create answer failed: {0}")]
    CreateAnswer(String),

    #[error("set local description failed: {0}")]
    LocalDescription(String),

    #[error("set remote description failed: {0}")]
    RemoteDescription(String),

    #[error("add ICE candidate failed: {0}")]
    IceCandidate(String),

    #[error("add track failed: {0}")]
    Track(String),

    #[error("peer connection is closed")]
    Closed,
}
