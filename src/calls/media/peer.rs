//! Peer connection capability.
//!
//! The call controller never talks to a concrete WebRTC stack. A platform
//! binding implements [`PeerConnection`] and reports asynchronous happenings
//! (local ICE candidates, remote tracks, connection state) as [`PeerEvent`]s
//! on the channel handed to [`PeerConnectionFactory::create`].

use super::stream::{MediaStream, MediaTrack};
use crate::calls::error::NegotiationError;
use crate::calls::transport::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerConnectionState {
    /// States after which the call cannot continue.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A local ICE candidate was gathered and should be relayed to the peer.
    IceCandidate(IceCandidate),
    /// A remote stream arrived (`ontrack`). May fire more than once.
    Track(MediaStream),
    StateChanged(PeerConnectionState),
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<(), NegotiationError>;

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError>;

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;

    /// Close the connection. Must tolerate repeated calls.
    async fn close(&self);

    fn connection_state(&self) -> PeerConnectionState;
}

pub trait PeerConnectionFactory: Send + Sync {
    fn create(
        &self,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, NegotiationError>;
}
