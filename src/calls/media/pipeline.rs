//! Media pipeline for one call session.
//!
//! Owns the local capture stream and the peer connection. Peer events are
//! forwarded to the owner through a callback:
//!
//! - every local ICE candidate, as [`PipelineEvent::LocalCandidate`]
//! - the first remote stream only, as [`PipelineEvent::RemoteStream`]
//! - connection state changes, as [`PipelineEvent::ConnectionState`]
//!
//! [`MediaPipeline::teardown`] stops every local track and closes the peer
//! connection. It can be called any number of times.

use super::peer::{PeerConnection, PeerConnectionFactory, PeerConnectionState, PeerEvent};
use super::stream::{MediaStream, TrackKind};
use crate::calls::error::NegotiationError;
use crate::calls::transport::{IceCandidate, SessionDescription};
use crate::types::call::CallId;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub enum PipelineEvent {
    LocalCandidate(IceCandidate),
    RemoteStream(MediaStream),
    ConnectionState(PeerConnectionState),
}

pub type PipelineCallback = Arc<dyn Fn(PipelineEvent) + Send + Sync>;

pub struct MediaPipeline {
    call_id: CallId,
    local_stream: Mutex<Option<MediaStream>>,
    peer: Mutex<Option<Arc<dyn PeerConnection>>>,
    remote_stream: Mutex<Option<MediaStream>>,
    remote_surfaced: AtomicBool,
    torn_down: AtomicBool,
    forwarder: Mutex<Option<JoinHandle<()>>>,
    on_event: PipelineCallback,
}

impl MediaPipeline {
    /// Create the peer connection and attach every local track to it.
    ///
    /// On failure the local stream is stopped before returning.
    pub async fn start(
        call_id: CallId,
        local_stream: MediaStream,
        factory: &dyn PeerConnectionFactory,
        on_event: PipelineCallback,
    ) -> Result<Arc<Self>, NegotiationError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = match factory.create(tx) {
            Ok(peer) => peer,
            Err(e) => {
                local_stream.stop_all();
                return Err(e);
            }
        };

        for track in local_stream.tracks() {
            if let Err(e) = peer.add_track(track.clone()).await {
                warn!("Failed to attach {:?} track for call {}: {}", track.kind(), call_id, e);
                local_stream.stop_all();
                peer.close().await;
                return Err(e);
            }
        }

        info!(
            "Media pipeline started for call {} ({} local tracks)",
            call_id,
            local_stream.tracks().len()
        );

        let pipeline = Arc::new(Self {
            call_id,
            local_stream: Mutex::new(Some(local_stream)),
            peer: Mutex::new(Some(peer)),
            remote_stream: Mutex::new(None),
            remote_surfaced: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
            forwarder: Mutex::new(None),
            on_event,
        });

        let handle = tokio::spawn(Self::forward_events(Arc::downgrade(&pipeline), rx));
        *pipeline.forwarder.lock().await = Some(handle);

        Ok(pipeline)
    }

    async fn forward_events(pipeline: Weak<Self>, mut rx: mpsc::UnboundedReceiver<PeerEvent>) {
        while let Some(event) = rx.recv().await {
            let Some(pipeline) = pipeline.upgrade() else {
                break;
            };
            if pipeline.is_torn_down() {
                break;
            }
            pipeline.handle_peer_event(event).await;
        }
    }

    async fn handle_peer_event(&self, event: PeerEvent) {
        match event {
            PeerEvent::IceCandidate(candidate) => {
                (self.on_event)(PipelineEvent::LocalCandidate(candidate));
            }
            PeerEvent::Track(stream) => {
                if self.remote_surfaced.swap(true, Ordering::SeqCst) {
                    debug!(
                        "Ignoring additional remote stream {} for call {}",
                        stream.id(),
                        self.call_id
                    );
                    return;
                }
                *self.remote_stream.lock().await = Some(stream.clone());
                (self.on_event)(PipelineEvent::RemoteStream(stream));
            }
            PeerEvent::StateChanged(state) => {
                debug!("Peer connection for call {} is now {:?}", self.call_id, state);
                (self.on_event)(PipelineEvent::ConnectionState(state));
            }
        }
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    /// Clone the peer handle out so no lock is held across a negotiation step.
    async fn peer(&self) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
        self.peer.lock().await.clone().ok_or(NegotiationError::Closed)
    }

    /// Create an offer and set it as the local description.
    pub async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        let peer = self.peer().await?;
        let offer = peer.create_offer().await?;
        peer.set_local_description(offer.clone()).await?;
        Ok(offer)
    }

    /// Create an answer and set it as the local description.
    pub async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let peer = self.peer().await?;
        let answer = peer.create_answer().await?;
        peer.set_local_description(answer.clone()).await?;
        Ok(answer)
    }

    pub async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.peer().await?.set_remote_description(description).await
    }

    pub async fn add_remote_candidate(
        &self,
        candidate: IceCandidate,
    ) -> Result<(), NegotiationError> {
        self.peer().await?.add_ice_candidate(candidate).await
    }

    /// Flip the enabled flag of every local audio track. Returns the new state.
    pub async fn toggle_mute(&self) -> bool {
        self.toggle(TrackKind::Audio).await
    }

    /// Flip the enabled flag of every local video track. Returns the new state.
    pub async fn toggle_video(&self) -> bool {
        self.toggle(TrackKind::Video).await
    }

    async fn toggle(&self, kind: TrackKind) -> bool {
        let guard = self.local_stream.lock().await;
        let Some(stream) = guard.as_ref() else {
            return false;
        };
        let mut tracks = stream.tracks_of(kind).peekable();
        let Some(first) = tracks.peek() else {
            return false;
        };
        let enabled = !first.is_enabled();
        for track in tracks {
            track.set_enabled(enabled);
        }
        enabled
    }

    /// Current enabled state of local audio and video.
    pub async fn local_media_state(&self) -> (bool, bool) {
        let guard = self.local_stream.lock().await;
        let enabled = |kind: TrackKind| {
            guard
                .as_ref()
                .map(|s| s.tracks_of(kind).any(|t| t.is_enabled()))
                .unwrap_or(false)
        };
        (enabled(TrackKind::Audio), enabled(TrackKind::Video))
    }

    /// Stop every local track, close the peer connection and drop all stream
    /// references. Returns `false` when the pipeline was already torn down.
    pub async fn teardown(&self) -> bool {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return false;
        }

        if let Some(handle) = self.forwarder.lock().await.take() {
            handle.abort();
        }
        if let Some(stream) = self.local_stream.lock().await.take() {
            stream.stop_all();
        }
        self.remote_stream.lock().await.take();
        let peer = self.peer.lock().await.take();
        if let Some(peer) = peer {
            peer.close().await;
        }

        info!("Media pipeline torn down for call {}", self.call_id);
        true
    }
}
