//! Direct audio/video calls between two participants.
//!
//! Signals travel over an unordered, at-most-once relay; every participant
//! runs one call controller that drives a single session from intent to
//! termination while coordinating device permissions, the peer connection and
//! ringing feedback.
//!
//! # Architecture
//!
//! - [`SignalType`], [`CallSignal`]: the wire entity and its seven types
//! - [`SignalRelay`]: per-recipient publish/subscribe transport
//! - [`PermissionNegotiator`]: camera/microphone acquisition and failure classification
//! - [`media::MediaPipeline`]: local stream plus peer connection for one call
//! - [`RingtoneController`]: ringtone/ringback keyed off call state
//! - [`CallSession`], [`CallState`]: the call state machine
//! - [`CallManager`], [`CallHandle`]: the controller actor and its handle
//! - [`GroupCalls`]: the degraded group-call path (no media)

mod directory;
mod error;
mod events;
mod group;
pub mod media;
pub mod mock;
mod permissions;
mod relay;
mod ringtone;
mod signal;
mod signaling;
mod state;
mod transport;

mod manager;

pub use directory::{Directory, DisplayIdentity, StaticDirectory, resolve_identity};
pub use error::{CallError, DeviceError, DeviceSet, MediaFailure, NegotiationError};
pub use events::{CallEvent, CallEventBus};
pub use group::{
    ActiveGroupCall, GroupCallStatus, GroupCallStore, GroupCalls, GroupNotifier,
    InMemoryGroupStore,
};
pub use manager::{
    CallHandle, CallManager, CallManagerBuilder, CallManagerConfig, CallOptions, GlarePolicy,
};
pub use permissions::{
    AudioConstraints, DeviceKind, MediaConstraints, MediaDevices, PermissionNegotiator,
    PermissionState, VideoConstraints,
};
pub use relay::{LocalRelay, RelayAction, SignalHandler, SignalRelay, Subscription};
pub use ringtone::{RingtoneController, SilentTonePlayer, Tone, ToneError, TonePlayer};
pub use signal::{CallSignal, CallSignalBuilder, SignalData, SignalPayload};
pub use signaling::SignalType;
pub use state::{
    ALLOWED_TRANSITIONS, CallSession, CallState, CallTransition, InvalidTransition,
    is_valid_history,
};
pub use transport::{IceCandidate, IceCandidateBuffer, SdpType, SessionDescription};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a std mutex, recovering the data if a panicking holder poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
