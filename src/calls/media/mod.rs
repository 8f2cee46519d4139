//! Media pipeline for direct calls.
//!
//! # Architecture
//!
//! - [`MediaStream`], [`MediaTrack`]: capture and playback tracks
//! - [`PeerConnection`], [`PeerConnectionFactory`]: the platform's peer
//!   connection, behind a capability trait
//! - [`MediaPipeline`]: owns one peer connection and one local stream per call

mod peer;
mod pipeline;
mod stream;

pub use peer::{PeerConnection, PeerConnectionFactory, PeerConnectionState, PeerEvent};
pub use pipeline::{MediaPipeline, PipelineCallback, PipelineEvent};
pub use stream::{MediaStream, MediaTrack, TrackKind};
