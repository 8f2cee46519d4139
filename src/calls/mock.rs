//! In-memory collaborators for tests and the `callsim` demo.
//!
//! Nothing here touches real hardware or a network. The mock peer connection
//! behaves like a well-mannered WebRTC stack: it refuses ICE candidates before
//! a remote description is set, gathers one host candidate when its local
//! description is set, and reports a remote track plus `Connected` once both
//! descriptions are in place.

use super::error::{DeviceError, NegotiationError};
use super::group::{ActiveGroupCall, GroupNotifier};
use super::lock;
use super::media::{
    MediaStream, MediaTrack, PeerConnection, PeerConnectionFactory, PeerConnectionState,
    PeerEvent, TrackKind,
};
use super::permissions::{DeviceKind, MediaConstraints, MediaDevices, PermissionState};
use super::ringtone::{Tone, ToneError, TonePlayer};
use super::transport::{IceCandidate, SdpType, SessionDescription};
use crate::types::call::{CallId, ParticipantId};
use async_trait::async_trait;
use log::debug;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};

#[derive(Debug)]
pub struct MockTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    live: AtomicBool,
}

impl MockTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: AtomicBool::new(true),
            live: AtomicBool::new(true),
        }
    }
}

impl MediaTrack for MockTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}

/// Camera and microphone that always exist unless told otherwise.
pub struct MockMediaDevices {
    permissions: Mutex<HashMap<DeviceKind, PermissionState>>,
    failures: Mutex<VecDeque<DeviceError>>,
    requests: Mutex<Vec<MediaConstraints>>,
    issued: Mutex<Vec<Arc<MockTrack>>>,
    gate: watch::Sender<bool>,
    next_id: AtomicUsize,
}

impl Default for MockMediaDevices {
    fn default() -> Self {
        Self::new()
    }
}

impl MockMediaDevices {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            permissions: Mutex::new(HashMap::new()),
            failures: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            issued: Mutex::new(Vec::new()),
            gate,
            next_id: AtomicUsize::new(0),
        }
    }

    pub fn set_permission(&self, device: DeviceKind, state: PermissionState) {
        lock(&self.permissions).insert(device, state);
    }

    /// Queue a failure for the next `get_user_media` call. Failures are
    /// consumed in order, one per call.
    pub fn push_failure(&self, error: DeviceError) {
        lock(&self.failures).push_back(error);
    }

    /// Constraints of every `get_user_media` call so far.
    pub fn requests(&self) -> Vec<MediaConstraints> {
        lock(&self.requests).clone()
    }

    /// Tracks handed out that still hold their device.
    pub fn live_tracks(&self) -> Vec<Arc<MockTrack>> {
        lock(&self.issued)
            .iter()
            .filter(|t| t.is_live())
            .cloned()
            .collect()
    }

    pub fn issued_tracks(&self) -> usize {
        lock(&self.issued).len()
    }

    /// Park every subsequent acquisition until [`release`](Self::release).
    pub fn hold(&self) {
        self.gate.send_replace(false);
    }

    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    fn track(&self, kind: TrackKind) -> Arc<MockTrack> {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let label = match kind {
            TrackKind::Audio => "mic",
            TrackKind::Video => "cam",
        };
        let track = Arc::new(MockTrack::new(format!("{label}-{n}"), kind));
        lock(&self.issued).push(track.clone());
        track
    }
}

#[async_trait]
impl MediaDevices for MockMediaDevices {
    async fn permission_state(&self, device: DeviceKind) -> Option<PermissionState> {
        lock(&self.permissions).get(&device).copied()
    }

    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<MediaStream, DeviceError> {
        lock(&self.requests).push(constraints.clone());

        let mut gate = self.gate.subscribe();
        if gate.wait_for(|open| *open).await.is_err() {
            return Err(DeviceError::Aborted);
        }

        if let Some(error) = lock(&self.failures).pop_front() {
            return Err(error);
        }

        let mut tracks: Vec<Arc<dyn MediaTrack>> = vec![self.track(TrackKind::Audio)];
        if constraints.wants_video() {
            tracks.push(self.track(TrackKind::Video));
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(MediaStream::new(format!("local-{n}"), tracks))
    }
}

#[derive(Debug, Default)]
struct PeerInner {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    candidates: Vec<IceCandidate>,
    tracks: usize,
    negotiations: usize,
    close_count: usize,
    connected: bool,
    remote_tracks: usize,
}

pub struct MockPeerConnection {
    label: String,
    events: mpsc::UnboundedSender<PeerEvent>,
    fail_add_track: bool,
    state: Mutex<PeerConnectionState>,
    inner: Mutex<PeerInner>,
}

impl MockPeerConnection {
    fn new(label: String, events: mpsc::UnboundedSender<PeerEvent>, fail_add_track: bool) -> Self {
        Self {
            label,
            events,
            fail_add_track,
            state: Mutex::new(PeerConnectionState::New),
            inner: Mutex::new(PeerInner::default()),
        }
    }

    pub fn attached_tracks(&self) -> usize {
        lock(&self.inner).tracks
    }

    pub fn close_count(&self) -> usize {
        lock(&self.inner).close_count
    }

    /// Offers and answers created so far.
    pub fn negotiation_count(&self) -> usize {
        lock(&self.inner).negotiations
    }

    /// Remote candidates accepted by the connection, in order.
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        lock(&self.inner).candidates.clone()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        lock(&self.inner).local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        lock(&self.inner).remote.clone()
    }

    /// Fire an `ontrack` event carrying a fresh remote stream.
    pub fn emit_remote_track(&self) {
        let n = {
            let mut inner = lock(&self.inner);
            inner.remote_tracks += 1;
            inner.remote_tracks
        };
        let track: Arc<dyn MediaTrack> = Arc::new(MockTrack::new(
            format!("{}-remote-audio-{n}", self.label),
            TrackKind::Audio,
        ));
        let stream = MediaStream::new(format!("{}-remote-{n}", self.label), vec![track]);
        let _ = self.events.send(PeerEvent::Track(stream));
    }

    /// Force a connection state change, as a network failure would.
    pub fn simulate_state(&self, state: PeerConnectionState) {
        *lock(&self.state) = state;
        let _ = self.events.send(PeerEvent::StateChanged(state));
    }

    fn is_closed(&self) -> bool {
        *lock(&self.state) == PeerConnectionState::Closed
    }

    fn maybe_connect(&self) {
        let ready = {
            let mut inner = lock(&self.inner);
            let ready = !inner.connected && inner.local.is_some() && inner.remote.is_some();
            if ready {
                inner.connected = true;
            }
            ready
        };
        if ready {
            debug!("Mock peer {} connected", self.label);
            self.emit_remote_track();
            self.simulate_state(PeerConnectionState::Connected);
        }
    }
}

#[async_trait]
impl PeerConnection for MockPeerConnection {
    async fn add_track(&self, _track: Arc<dyn MediaTrack>) -> Result<(), NegotiationError> {
        if self.fail_add_track {
            return Err(NegotiationError::Track("sender rejected track".into()));
        }
        lock(&self.inner).tracks += 1;
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        if self.is_closed() {
            return Err(NegotiationError::Closed);
        }
        let mut inner = lock(&self.inner);
        inner.negotiations += 1;
        Ok(SessionDescription::offer(format!(
            "v=0\r\no={} {} 1 IN IP4 127.0.0.1\r\ns=-\r\n",
            self.label, inner.negotiations
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        if self.is_closed() {
            return Err(NegotiationError::Closed);
        }
        let mut inner = lock(&self.inner);
        match &inner.remote {
            Some(remote) if remote.sdp_type == SdpType::Offer => {}
            _ => return Err(NegotiationError::CreateAnswer("no remote offer".into())),
        }
        inner.negotiations += 1;
        Ok(SessionDescription::answer(format!(
            "v=0\r\no={} {} 1 IN IP4 127.0.0.1\r\ns=-\r\n",
            self.label, inner.negotiations
        )))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        if self.is_closed() {
            return Err(NegotiationError::Closed);
        }
        lock(&self.inner).local = Some(description);
        {
            let mut state = lock(&self.state);
            if *state == PeerConnectionState::New {
                *state = PeerConnectionState::Connecting;
            }
        }
        let candidate = IceCandidate::new(format!(
            "candidate:1 1 UDP 2130706431 10.0.0.1 50000 typ host ufrag {}",
            self.label
        ))
        .with_sdp_mid("0")
        .with_sdp_m_line_index(0);
        let _ = self.events.send(PeerEvent::IceCandidate(candidate));
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        if self.is_closed() {
            return Err(NegotiationError::Closed);
        }
        lock(&self.inner).remote = Some(description);
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        let mut inner = lock(&self.inner);
        if inner.remote.is_none() {
            return Err(NegotiationError::IceCandidate(
                "remote description not set".into(),
            ));
        }
        if !candidate.candidate.starts_with("candidate:") {
            return Err(NegotiationError::IceCandidate(format!(
                "malformed candidate: {}",
                candidate.candidate
            )));
        }
        inner.candidates.push(candidate);
        Ok(())
    }

    async fn close(&self) {
        lock(&self.inner).close_count += 1;
        *lock(&self.state) = PeerConnectionState::Closed;
    }

    fn connection_state(&self) -> PeerConnectionState {
        *lock(&self.state)
    }
}

pub struct MockPeerFactory {
    label: String,
    created: Mutex<Vec<Arc<MockPeerConnection>>>,
    fail_add_track: AtomicBool,
    fail_create: AtomicBool,
}

impl MockPeerFactory {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            created: Mutex::new(Vec::new()),
            fail_add_track: AtomicBool::new(false),
            fail_create: AtomicBool::new(false),
        }
    }

    pub fn fail_add_track(&self, fail: bool) {
        self.fail_add_track.store(fail, Ordering::SeqCst);
    }

    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn last(&self) -> Option<Arc<MockPeerConnection>> {
        lock(&self.created).last().cloned()
    }

    pub fn created(&self) -> Vec<Arc<MockPeerConnection>> {
        lock(&self.created).clone()
    }
}

impl PeerConnectionFactory for MockPeerFactory {
    fn create(
        &self,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(NegotiationError::PeerConnection("no ICE servers".into()));
        }
        let peer = Arc::new(MockPeerConnection::new(
            self.label.clone(),
            events,
            self.fail_add_track.load(Ordering::SeqCst),
        ));
        lock(&self.created).push(peer.clone());
        Ok(peer)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToneAction {
    Start(Tone),
    Stop,
}

/// Tone player that records what it was asked to do.
#[derive(Debug, Default)]
pub struct RecordingTonePlayer {
    blocked: bool,
    actions: Mutex<Vec<ToneAction>>,
}

impl RecordingTonePlayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A player whose every start fails, like a browser blocking autoplay.
    pub fn blocked() -> Self {
        Self {
            blocked: true,
            actions: Mutex::new(Vec::new()),
        }
    }

    pub fn actions(&self) -> Vec<ToneAction> {
        lock(&self.actions).clone()
    }
}

impl TonePlayer for RecordingTonePlayer {
    fn start_loop(&self, tone: Tone) -> Result<(), ToneError> {
        if self.blocked {
            return Err(ToneError("autoplay blocked".into()));
        }
        lock(&self.actions).push(ToneAction::Start(tone));
        Ok(())
    }

    fn stop(&self) {
        lock(&self.actions).push(ToneAction::Stop);
    }
}

/// Group notifier that records `(member, callId)` pairs.
#[derive(Debug, Default)]
pub struct RecordingGroupNotifier {
    notified: Mutex<Vec<(ParticipantId, CallId)>>,
}

impl RecordingGroupNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notified(&self) -> Vec<(ParticipantId, CallId)> {
        lock(&self.notified).clone()
    }
}

#[async_trait]
impl GroupNotifier for RecordingGroupNotifier {
    async fn notify(&self, member: &ParticipantId, call: &ActiveGroupCall) {
        lock(&self.notified).push((member.clone(), call.call_id.clone()));
    }
}
