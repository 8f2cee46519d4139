//! Call session controller.
//!
//! One [`CallManager`] task runs per local participant. It owns the single
//! live [`CallSession`] and processes one [`ControllerInput`] at a time:
//! user commands, relay signals, media pipeline events, finished async
//! operations and deadline expiries. Async steps (device acquisition, SDP,
//! ICE) run in spawned tasks that post their result back tagged with the
//! `callId`; results for a call that is no longer live are discarded and any
//! media they carry is released.

use super::directory::{Directory, DisplayIdentity, StaticDirectory, resolve_identity};
use super::error::{CallError, NegotiationError};
use super::events::{CallEvent, CallEventBus};
use super::media::{
    MediaPipeline, PeerConnectionFactory, PipelineCallback, PipelineEvent, TrackKind,
};
use super::permissions::{MediaDevices, PermissionNegotiator};
use super::relay::{SignalHandler, SignalRelay, Subscription};
use super::ringtone::{RingtoneController, SilentTonePlayer, TonePlayer};
use super::signal::{CallSignal, CallSignalBuilder, SignalPayload};
use super::signaling::SignalType;
use super::state::{CallSession, CallState, CallTransition, InvalidTransition};
use super::transport::{IceCandidate, IceCandidateBuffer, SdpType, SessionDescription};
use crate::types::call::{CallId, CallKind, CallRole, EndReason, ParticipantId};
use log::{debug, error, info, warn};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// How to resolve two crossing `call-request`s between the same pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GlarePolicy {
    /// The participant with the lower identifier keeps its outgoing call; the
    /// other abandons its own and rings for the winner's.
    #[default]
    LowerIdWins,
    /// Reject the crossing request and keep dialing.
    RejectIncoming,
}

/// Configuration for the call manager.
#[derive(Debug, Clone)]
pub struct CallManagerConfig {
    /// How long an outgoing call may stay in `Dialing`.
    pub dial_timeout: Duration,
    /// How long an incoming call rings before it is missed.
    pub ring_timeout: Duration,
    /// Remote ICE candidates buffered per call before a remote description.
    pub max_pending_candidates: usize,
    /// Ended call ids remembered so late or duplicated signals are ignored.
    pub recently_ended_capacity: usize,
    pub glare_policy: GlarePolicy,
    /// How long an `offer` or candidates that outran their `call-request` are held.
    pub early_signal_ttl: Duration,
    /// Unknown calls whose early signals are held at once.
    pub max_early_calls: usize,
}

impl Default for CallManagerConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(45),
            ring_timeout: Duration::from_secs(45),
            max_pending_candidates: 64,
            recently_ended_capacity: 32,
            glare_policy: GlarePolicy::default(),
            early_signal_ttl: Duration::from_secs(10),
            max_early_calls: 4,
        }
    }
}

/// Options for starting a call.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallOptions {
    pub kind: CallKind,
}

impl CallOptions {
    pub fn audio() -> Self {
        Self {
            kind: CallKind::Audio,
        }
    }

    pub fn video() -> Self {
        Self {
            kind: CallKind::Video,
        }
    }
}

enum Command {
    Start {
        peer: ParticipantId,
        options: CallOptions,
        reply: oneshot::Sender<Result<CallId, CallError>>,
    },
    Accept {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Decline {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    End {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Toggle {
        kind: TrackKind,
        reply: oneshot::Sender<Result<bool, CallError>>,
    },
    Current {
        reply: oneshot::Sender<Option<CallSession>>,
    },
    Last {
        reply: oneshot::Sender<Option<CallSession>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// One SDP step, run off the controller task.
enum NegotiationStep {
    CreateOffer,
    CreateAnswer,
    ApplyRemote(SessionDescription),
}

enum StepOutcome {
    LocalDescription(SessionDescription),
    RemoteApplied,
}

enum ControllerInput {
    Command(Command),
    Signal(CallSignal),
    Media {
        call_id: CallId,
        event: PipelineEvent,
    },
    MediaReady {
        call_id: CallId,
        result: Result<Arc<MediaPipeline>, CallError>,
    },
    Negotiated {
        call_id: CallId,
        result: Result<StepOutcome, NegotiationError>,
    },
    Resolved {
        call_id: CallId,
        identity: DisplayIdentity,
    },
    Deadline {
        call_id: CallId,
        state: &'static str,
    },
}

#[derive(Debug)]
enum RemoteDescription {
    None,
    /// Arrived before the pipeline existed.
    Stashed(SessionDescription),
    Applying,
    Applied,
}

/// The live session plus everything the controller tracks for it.
struct ActiveCall {
    session: CallSession,
    pipeline: Option<Arc<MediaPipeline>>,
    remote: RemoteDescription,
    pending_candidates: IceCandidateBuffer,
    local_set: bool,
    remote_stream: bool,
    /// Whether the peer knows this call exists.
    announced: bool,
    /// Media acquisition is queued behind an orphaned one.
    awaiting_device: bool,
    deadline: Option<JoinHandle<()>>,
}

impl ActiveCall {
    fn new(session: CallSession, max_pending_candidates: usize) -> Self {
        let announced = session.role == CallRole::Callee;
        Self {
            session,
            pipeline: None,
            remote: RemoteDescription::None,
            pending_candidates: IceCandidateBuffer::new(max_pending_candidates),
            local_set: false,
            remote_stream: false,
            announced,
            awaiting_device: false,
            deadline: None,
        }
    }

    fn id(&self) -> &CallId {
        &self.session.id
    }

    fn cancel_deadline(&mut self) {
        if let Some(deadline) = self.deadline.take() {
            deadline.abort();
        }
    }

    fn ready_for_active(&self) -> bool {
        matches!(self.session.state, CallState::Negotiating { .. })
            && self.local_set
            && matches!(self.remote, RemoteDescription::Applied)
            && self.remote_stream
    }
}

/// Negotiation signals for a call whose `call-request` has not arrived yet.
struct EarlySignals {
    call_id: CallId,
    from: ParticipantId,
    received_at: Instant,
    offer: Option<SessionDescription>,
    candidates: IceCandidateBuffer,
}

/// What to do with an inbound `call-request`.
enum RequestDisposition {
    Ring,
    Duplicate,
    Glare,
    Busy,
}

pub struct CallManagerBuilder {
    local_id: ParticipantId,
    relay: Arc<dyn SignalRelay>,
    devices: Arc<dyn MediaDevices>,
    peers: Arc<dyn PeerConnectionFactory>,
    tone_player: Arc<dyn TonePlayer>,
    directory: Arc<dyn Directory>,
    config: CallManagerConfig,
}

impl CallManagerBuilder {
    pub fn tone_player(mut self, player: Arc<dyn TonePlayer>) -> Self {
        self.tone_player = player;
        self
    }

    pub fn directory(mut self, directory: Arc<dyn Directory>) -> Self {
        self.directory = directory;
        self
    }

    pub fn config(mut self, config: CallManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Subscribe to the relay and start the controller task.
    pub async fn spawn(self) -> Result<CallHandle, CallError> {
        let (inbox, inbox_rx) = mpsc::unbounded_channel();

        let signal_inbox = inbox.clone();
        let handler: SignalHandler = Arc::new(move |signal| {
            let _ = signal_inbox.send(ControllerInput::Signal(signal));
        });
        let subscription = self.relay.subscribe(&self.local_id, handler).await?;

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let outbound_task = tokio::spawn(send_outbound(self.relay.clone(), outbound_rx));

        let events = CallEventBus::new();
        let manager = CallManager {
            local_id: self.local_id.clone(),
            config: self.config,
            negotiator: Arc::new(PermissionNegotiator::new(self.devices)),
            peers: self.peers,
            directory: self.directory,
            ringtone: RingtoneController::new(self.tone_player),
            events: events.clone(),
            inbox: inbox.clone(),
            outbound,
            outbound_task,
            subscription,
            active: None,
            last_call: None,
            recently_ended: VecDeque::new(),
            early: VecDeque::new(),
            acquiring: None,
        };
        tokio::spawn(manager.run(inbox_rx));
        info!("Call manager started for {}", self.local_id);

        Ok(CallHandle {
            local_id: self.local_id,
            inbox,
            events,
        })
    }
}

/// Keeps outgoing signals in the order the controller produced them.
async fn send_outbound(relay: Arc<dyn SignalRelay>, mut rx: mpsc::UnboundedReceiver<CallSignal>) {
    while let Some(signal) = rx.recv().await {
        let (signal_type, call_id) = (signal.signal_type, signal.call_id.clone());
        if let Err(e) = relay.send(signal).await {
            warn!("Failed to send {} for call {}: {}", signal_type, call_id, e);
        }
    }
}

pub struct CallManager {
    local_id: ParticipantId,
    config: CallManagerConfig,
    negotiator: Arc<PermissionNegotiator>,
    peers: Arc<dyn PeerConnectionFactory>,
    directory: Arc<dyn Directory>,
    ringtone: RingtoneController,
    events: CallEventBus,
    inbox: mpsc::UnboundedSender<ControllerInput>,
    outbound: mpsc::UnboundedSender<CallSignal>,
    outbound_task: JoinHandle<()>,
    subscription: Subscription,
    active: Option<ActiveCall>,
    last_call: Option<CallSession>,
    recently_ended: VecDeque<CallId>,
    early: VecDeque<EarlySignals>,
    /// Call whose device acquisition is still in flight, live or not.
    acquiring: Option<CallId>,
}

impl CallManager {
    pub fn builder(
        local_id: impl Into<ParticipantId>,
        relay: Arc<dyn SignalRelay>,
        devices: Arc<dyn MediaDevices>,
        peers: Arc<dyn PeerConnectionFactory>,
    ) -> CallManagerBuilder {
        CallManagerBuilder {
            local_id: local_id.into(),
            relay,
            devices,
            peers,
            tone_player: Arc::new(SilentTonePlayer),
            directory: Arc::new(StaticDirectory::new()),
            config: CallManagerConfig::default(),
        }
    }

    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<ControllerInput>) {
        let mut shutdown_reply = None;
        while let Some(input) = inbox.recv().await {
            if let ControllerInput::Command(Command::Shutdown { reply }) = input {
                shutdown_reply = Some(reply);
                break;
            }
            self.handle(input).await;
        }
        inbox.close();

        if self.active.is_some() {
            self.hang_up().await;
        }
        let Self {
            local_id,
            outbound,
            outbound_task,
            subscription,
            ..
        } = self;
        subscription.unsubscribe();
        drop(outbound);
        if let Err(e) = outbound_task.await {
            error!("Outbound signal task for {} failed: {}", local_id, e);
        }
        info!("Call manager stopped for {}", local_id);
        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
    }

    async fn handle(&mut self, input: ControllerInput) {
        match input {
            ControllerInput::Command(command) => self.handle_command(command).await,
            ControllerInput::Signal(signal) => self.handle_signal(signal).await,
            ControllerInput::Media { call_id, event } => self.handle_media(call_id, event).await,
            ControllerInput::MediaReady { call_id, result } => {
                self.handle_media_ready(call_id, result).await
            }
            ControllerInput::Negotiated { call_id, result } => {
                self.handle_negotiated(call_id, result).await
            }
            ControllerInput::Resolved { call_id, identity } => {
                let Some(call) = self.current(&call_id) else {
                    return;
                };
                if call.session.state.can_accept() {
                    let kind = call.session.kind;
                    self.events.publish(CallEvent::IncomingCall {
                        call_id,
                        from: identity,
                        kind,
                    });
                }
            }
            ControllerInput::Deadline { call_id, state } => {
                self.handle_deadline(call_id, state).await
            }
        }
    }

    // ---- commands ----

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start {
                peer,
                options,
                reply,
            } => {
                let result = self.start_call(peer, options);
                let _ = reply.send(result);
            }
            Command::Accept { reply } => {
                let result = self.accept();
                let _ = reply.send(result);
            }
            Command::Decline { reply } => {
                let result = self.decline().await;
                let _ = reply.send(result);
            }
            Command::End { reply } => {
                self.hang_up().await;
                let _ = reply.send(Ok(()));
            }
            Command::Toggle { kind, reply } => {
                let result = self.toggle(kind).await;
                let _ = reply.send(result);
            }
            Command::Current { reply } => {
                let _ = reply.send(self.active.as_ref().map(|c| c.session.clone()));
            }
            Command::Last { reply } => {
                let _ = reply.send(self.last_call.clone());
            }
            // Handled by the run loop.
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn start_call(
        &mut self,
        peer: ParticipantId,
        options: CallOptions,
    ) -> Result<CallId, CallError> {
        if let Some(call) = &self.active {
            info!(
                "Refusing call to {}: call {} is still {}",
                peer,
                call.id(),
                call.session.state.name()
            );
            return Err(CallError::Busy(call.id().clone()));
        }

        let call_id = CallId::generate();
        let session = CallSession::new(call_id.clone(), options.kind, CallRole::Caller, peer);
        info!(
            "Starting {} call {} to {}",
            options.kind, call_id, session.peer_id
        );
        self.active = Some(ActiveCall::new(session, self.config.max_pending_candidates));
        self.transition(CallTransition::Dial)?;
        self.acquire_media();
        Ok(call_id)
    }

    fn accept(&mut self) -> Result<(), CallError> {
        let call = self.active.as_ref().ok_or(CallError::NoActiveCall)?;
        info!("Accepting call {} from {}", call.id(), call.session.peer_id);
        self.transition(CallTransition::LocalAccepted)?;
        self.acquire_media();
        Ok(())
    }

    async fn decline(&mut self) -> Result<(), CallError> {
        let call = self.active.as_ref().ok_or(CallError::NoActiveCall)?;
        if !call.session.state.can_accept() {
            return Err(CallError::InvalidTransition(InvalidTransition {
                current_state: call.session.state.name().to_string(),
                attempted: "Decline".to_string(),
            }));
        }
        self.end_session(EndReason::Declined, Some(SignalType::CallRejected))
            .await;
        Ok(())
    }

    /// End whatever call is live. Ringing calls are declined. No-op when idle.
    async fn hang_up(&mut self) {
        let Some(call) = &self.active else {
            debug!("Hang up with no live call");
            return;
        };
        if call.session.state.can_accept() {
            self.end_session(EndReason::Declined, Some(SignalType::CallRejected))
                .await;
        } else {
            self.end_session(EndReason::LocalHangup, Some(SignalType::CallEnded))
                .await;
        }
    }

    async fn toggle(&mut self, kind: TrackKind) -> Result<bool, CallError> {
        let (call_id, pipeline) = self
            .active
            .as_ref()
            .and_then(|c| c.pipeline.clone().map(|p| (c.id().clone(), p)))
            .ok_or(CallError::NoActiveCall)?;

        let enabled = match kind {
            TrackKind::Audio => pipeline.toggle_mute().await,
            TrackKind::Video => pipeline.toggle_video().await,
        };
        let (audio_enabled, video_enabled) = pipeline.local_media_state().await;
        debug!(
            "Call {}: audio {}, video {}",
            call_id,
            if audio_enabled { "on" } else { "muted" },
            if video_enabled { "on" } else { "off" }
        );
        self.events.publish(CallEvent::LocalMediaChanged {
            call_id,
            audio_enabled,
            video_enabled,
        });
        Ok(enabled)
    }

    // ---- inbound signals ----

    async fn handle_signal(&mut self, signal: CallSignal) {
        if !signal.is_addressed_to(&self.local_id) {
            warn!(
                "Dropping {} for call {} addressed to {}",
                signal.signal_type, signal.call_id, signal.to
            );
            return;
        }
        let payload = match signal.payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(
                    "Dropping malformed {} for call {}: {}",
                    signal.signal_type, signal.call_id, e
                );
                return;
            }
        };
        if self.recently_ended.contains(&signal.call_id) {
            debug!(
                "Ignoring {} for ended call {}",
                signal.signal_type, signal.call_id
            );
            return;
        }

        if let SignalPayload::Request(kind) = payload {
            self.on_call_request(signal, kind).await;
            return;
        }

        match self
            .current(&signal.call_id)
            .map(|call| call.session.peer_id == signal.from)
        {
            Some(true) => {}
            Some(false) => {
                warn!(
                    "Ignoring {} for call {} from unexpected sender {}",
                    signal.signal_type, signal.call_id, signal.from
                );
                return;
            }
            None => {
                self.on_unknown_call(signal, payload);
                return;
            }
        }

        let call_id = signal.call_id;
        match payload {
            SignalPayload::Request(_) => {}
            SignalPayload::Accepted(_) => self.on_remote_accepted(&call_id),
            SignalPayload::Rejected => {
                info!("Call {} rejected by peer", call_id);
                self.end_session(EndReason::RemoteRejected, None).await;
            }
            SignalPayload::Ended => {
                info!("Call {} ended by peer", call_id);
                self.end_session(EndReason::RemoteEnded, None).await;
            }
            SignalPayload::Offer(offer) => {
                self.on_remote_description(&call_id, offer, CallRole::Callee)
            }
            SignalPayload::Answer(answer) => {
                if self
                    .current(&call_id)
                    .is_some_and(|c| matches!(c.session.state, CallState::Dialing { .. }))
                {
                    debug!("Answer for call {} arrived before call-accepted", call_id);
                    self.on_remote_accepted(&call_id);
                }
                self.on_remote_description(&call_id, answer, CallRole::Caller);
            }
            SignalPayload::Candidate(candidate) => self.on_remote_candidate(&call_id, candidate),
        }
    }

    /// The relay may deliver a caller's `offer` and candidates ahead of its
    /// `call-request`; those are held for a short while. A terminal signal
    /// marks the id ended so a late request for it never rings.
    fn on_unknown_call(&mut self, signal: CallSignal, payload: SignalPayload) {
        let (signal_type, call_id) = (signal.signal_type, signal.call_id.clone());
        if signal_type.is_terminal() {
            debug!("{} for call {} arrived before its call-request", signal_type, call_id);
            self.remember(call_id);
            return;
        }
        match payload {
            SignalPayload::Offer(offer) => {
                let early = self.early_entry(&signal);
                if early.offer.is_none() {
                    early.offer = Some(offer);
                }
            }
            SignalPayload::Candidate(candidate) => {
                self.early_entry(&signal).candidates.push(candidate)
            }
            _ => {
                debug!("Ignoring {} for unknown call {}", signal_type, call_id);
                return;
            }
        }
        debug!("Holding {} for call {} until its call-request", signal_type, call_id);
    }

    fn prune_early(&mut self) {
        let ttl = self.config.early_signal_ttl;
        self.early.retain(|early| {
            let fresh = early.received_at.elapsed() < ttl;
            if !fresh {
                debug!("Dropping early signals for call {}", early.call_id);
            }
            fresh
        });
    }

    fn early_entry(&mut self, signal: &CallSignal) -> &mut EarlySignals {
        self.prune_early();
        let index = match self
            .early
            .iter()
            .position(|e| e.call_id == signal.call_id && e.from == signal.from)
        {
            Some(index) => index,
            None => {
                if self.early.len() >= self.config.max_early_calls.max(1)
                    && let Some(evicted) = self.early.pop_front()
                {
                    debug!("Dropping early signals for call {}", evicted.call_id);
                }
                self.early.push_back(EarlySignals {
                    call_id: signal.call_id.clone(),
                    from: signal.from.clone(),
                    received_at: Instant::now(),
                    offer: None,
                    candidates: IceCandidateBuffer::new(self.config.max_pending_candidates),
                });
                self.early.len() - 1
            }
        };
        &mut self.early[index]
    }

    fn take_early(&mut self, call_id: &CallId, from: &ParticipantId) -> Option<EarlySignals> {
        self.prune_early();
        let index = self
            .early
            .iter()
            .position(|e| &e.call_id == call_id && &e.from == from)?;
        self.early.remove(index)
    }

    async fn on_call_request(&mut self, signal: CallSignal, kind: CallKind) {
        if signal.from == self.local_id {
            warn!("Ignoring call-request {} from self", signal.call_id);
            return;
        }

        let disposition = match &self.active {
            None => RequestDisposition::Ring,
            Some(call) if *call.id() == signal.call_id => RequestDisposition::Duplicate,
            Some(call)
                if call.session.is_caller()
                    && matches!(call.session.state, CallState::Dialing { .. })
                    && call.session.peer_id == signal.from =>
            {
                RequestDisposition::Glare
            }
            Some(_) => RequestDisposition::Busy,
        };

        match disposition {
            RequestDisposition::Ring => self.ring(signal, kind),
            RequestDisposition::Duplicate => {
                debug!("Duplicate call-request for call {}", signal.call_id)
            }
            RequestDisposition::Busy => {
                info!(
                    "Busy: rejecting call {} from {}",
                    signal.call_id, signal.from
                );
                self.reject_unknown(&signal);
            }
            RequestDisposition::Glare => self.resolve_glare(signal, kind).await,
        }
    }

    async fn resolve_glare(&mut self, signal: CallSignal, kind: CallKind) {
        match self.config.glare_policy {
            GlarePolicy::LowerIdWins if self.local_id < signal.from => {
                info!(
                    "Glare with {}: keeping outgoing call, ignoring call {}",
                    signal.from, signal.call_id
                );
                self.remember(signal.call_id);
            }
            GlarePolicy::LowerIdWins => {
                info!(
                    "Glare with {}: yielding to their call {}",
                    signal.from, signal.call_id
                );
                self.end_session(EndReason::GlareYielded, Some(SignalType::CallEnded))
                    .await;
                self.ring(signal, kind);
            }
            GlarePolicy::RejectIncoming => {
                info!(
                    "Glare with {}: rejecting their call {}",
                    signal.from, signal.call_id
                );
                self.reject_unknown(&signal);
            }
        }
    }

    /// Answer a request that never becomes a session with `call-rejected`.
    fn reject_unknown(&mut self, signal: &CallSignal) {
        let reply = CallSignalBuilder::new(
            SignalType::CallRejected,
            signal.call_id.clone(),
            self.local_id.clone(),
            signal.from.clone(),
        )
        .build();
        self.send(reply);
        self.remember(signal.call_id.clone());
    }

    fn ring(&mut self, signal: CallSignal, kind: CallKind) {
        let session = CallSession::new(
            signal.call_id.clone(),
            kind,
            CallRole::Callee,
            signal.from.clone(),
        );
        info!(
            "Incoming {} call {} from {}",
            kind, signal.call_id, signal.from
        );
        let mut call = ActiveCall::new(session, self.config.max_pending_candidates);
        if let Some(early) = self.take_early(&signal.call_id, &signal.from) {
            debug!(
                "Call {}: restoring early {}{} candidates",
                signal.call_id,
                if early.offer.is_some() { "offer and " } else { "" },
                early.candidates.len()
            );
            if let Some(offer) = early.offer {
                call.remote = RemoteDescription::Stashed(offer);
            }
            call.pending_candidates = early.candidates;
        }
        self.active = Some(call);
        if let Err(e) = self.transition(CallTransition::IncomingRequest) {
            error!("Call {} could not ring: {}", signal.call_id, e);
            self.active = None;
            return;
        }

        let directory = self.directory.clone();
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            let identity = resolve_identity(directory.as_ref(), &signal.from).await;
            let _ = inbox.send(ControllerInput::Resolved {
                call_id: signal.call_id,
                identity,
            });
        });
    }

    fn on_remote_accepted(&mut self, call_id: &CallId) {
        let Some(call) = self.current(call_id) else {
            return;
        };
        if !call.session.is_caller() || !matches!(call.session.state, CallState::Dialing { .. }) {
            debug!(
                "Ignoring call-accepted for call {} in {}",
                call_id,
                call.session.state.name()
            );
            return;
        }
        info!("Call {} accepted by peer", call_id);
        if let Err(e) = self.transition(CallTransition::RemoteAccepted) {
            warn!("Call {}: {}", call_id, e);
        }
    }

    fn on_remote_description(
        &mut self,
        call_id: &CallId,
        description: SessionDescription,
        expected_role: CallRole,
    ) {
        let Some(call) = self.current_mut(call_id) else {
            return;
        };
        if call.session.role != expected_role {
            warn!(
                "Ignoring {:?} description for call {} as {:?}",
                description.sdp_type, call_id, call.session.role
            );
            return;
        }
        if !matches!(call.remote, RemoteDescription::None) {
            debug!(
                "Ignoring duplicate {:?} for call {} ({:?})",
                description.sdp_type, call_id, call.remote
            );
            return;
        }

        let ready = matches!(call.session.state, CallState::Negotiating { .. })
            && call.pipeline.is_some()
            && (expected_role == CallRole::Callee || call.local_set);
        if !ready {
            debug!(
                "Stashing {:?} for call {} until media is ready",
                description.sdp_type, call_id
            );
            call.remote = RemoteDescription::Stashed(description);
            return;
        }
        self.apply_remote(description);
    }

    fn on_remote_candidate(&mut self, call_id: &CallId, candidate: IceCandidate) {
        let inbox = self.inbox.clone();
        let Some(call) = self.current_mut(call_id) else {
            return;
        };
        let applied = matches!(call.remote, RemoteDescription::Applied);
        match call.pipeline.clone() {
            Some(pipeline) if applied => {
                spawn_add_candidates(inbox, call_id.clone(), pipeline, vec![candidate]);
            }
            _ => {
                debug!(
                    "Buffering ICE candidate for call {} until remote description is set",
                    call_id
                );
                call.pending_candidates.push(candidate);
            }
        }
    }

    // ---- media & negotiation ----

    /// Acquire devices and build the pipeline for the live call, or queue that
    /// behind an orphaned acquisition still holding the device.
    fn acquire_media(&mut self) {
        let orphan = self.acquiring.clone();
        let Some(call) = self.active.as_mut() else {
            return;
        };
        if let Some(orphan) = orphan {
            debug!(
                "Call {} waiting for acquisition of call {} to finish",
                call.id(),
                orphan
            );
            call.awaiting_device = true;
            return;
        }

        let call_id = call.id().clone();
        let kind = call.session.kind;
        self.acquiring = Some(call_id.clone());

        let negotiator = self.negotiator.clone();
        let peers = self.peers.clone();
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            let result = async {
                let stream = negotiator.acquire(kind).await?;
                let events = inbox.clone();
                let tagged = call_id.clone();
                let on_event: PipelineCallback = Arc::new(move |event| {
                    let _ = events.send(ControllerInput::Media {
                        call_id: tagged.clone(),
                        event,
                    });
                });
                let pipeline =
                    MediaPipeline::start(call_id.clone(), stream, peers.as_ref(), on_event).await?;
                Ok::<_, CallError>(pipeline)
            }
            .await;
            let _ = inbox.send(ControllerInput::MediaReady { call_id, result });
        });
    }

    async fn handle_media_ready(
        &mut self,
        call_id: CallId,
        result: Result<Arc<MediaPipeline>, CallError>,
    ) {
        if self.acquiring.as_ref() == Some(&call_id) {
            self.acquiring = None;
        }

        if self.current(&call_id).is_none() {
            if let Ok(pipeline) = result {
                info!("Releasing media acquired for abandoned call {}", call_id);
                pipeline.teardown().await;
            }
            if let Some(call) = self.active.as_mut()
                && call.awaiting_device
            {
                call.awaiting_device = false;
                self.acquire_media();
            }
            return;
        }

        let pipeline = match result {
            Ok(pipeline) => pipeline,
            Err(CallError::Media(failure)) => {
                warn!("Call {}: {}", call_id, failure);
                // Only sent by a callee; an unannounced caller sends nothing.
                self.end_session(
                    EndReason::MediaUnavailable(failure.remediation()),
                    Some(SignalType::CallRejected),
                )
                .await;
                return;
            }
            Err(e) => {
                warn!("Call {}: media pipeline failed: {}", call_id, e);
                self.end_session(
                    EndReason::NegotiationFailed(e.to_string()),
                    Some(SignalType::CallRejected),
                )
                .await;
                return;
            }
        };

        let Some(call) = self.current_mut(&call_id) else {
            return;
        };
        call.pipeline = Some(pipeline.clone());
        let kind = call.session.kind;
        let role = call.session.role;
        let stashed = match std::mem::replace(&mut call.remote, RemoteDescription::None) {
            RemoteDescription::Stashed(description) => Some(description),
            other => {
                call.remote = other;
                None
            }
        };

        match role {
            CallRole::Caller => {
                call.announced = true;
                let request = self.signal(SignalType::CallRequest).map(|b| b.kind(kind));
                if let Some(request) = request {
                    self.send(request.build());
                }
                spawn_step(
                    self.inbox.clone(),
                    call_id,
                    pipeline,
                    NegotiationStep::CreateOffer,
                );
            }
            CallRole::Callee => {
                if let Some(accepted) = self.signal(SignalType::CallAccepted) {
                    self.send(accepted.kind(kind).build());
                }
                if let Some(offer) = stashed {
                    self.apply_remote(offer);
                }
            }
        }
    }

    fn apply_remote(&mut self, description: SessionDescription) {
        let Some(call) = self.active.as_mut() else {
            return;
        };
        let Some(pipeline) = call.pipeline.clone() else {
            call.remote = RemoteDescription::Stashed(description);
            return;
        };
        call.remote = RemoteDescription::Applying;
        debug!(
            "Applying remote {:?} for call {}",
            description.sdp_type,
            call.id()
        );
        spawn_step(
            self.inbox.clone(),
            call.id().clone(),
            pipeline,
            NegotiationStep::ApplyRemote(description),
        );
    }

    async fn handle_negotiated(
        &mut self,
        call_id: CallId,
        result: Result<StepOutcome, NegotiationError>,
    ) {
        if self.current(&call_id).is_none() {
            debug!("Discarding negotiation result for stale call {}", call_id);
            return;
        }

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Call {}: negotiation failed: {}", call_id, e);
                self.end_session(
                    EndReason::NegotiationFailed(e.to_string()),
                    Some(SignalType::CallEnded),
                )
                .await;
                return;
            }
        };

        match outcome {
            StepOutcome::LocalDescription(description) => {
                if let Some(call) = self.active.as_mut() {
                    call.local_set = true;
                }
                let builder = self.signal(match description.sdp_type {
                    SdpType::Offer => SignalType::Offer,
                    SdpType::Answer => SignalType::Answer,
                });
                if let Some(builder) = builder {
                    let signal = match description.sdp_type {
                        SdpType::Offer => builder.offer(description),
                        SdpType::Answer => builder.answer(description),
                    };
                    self.send(signal.build());
                }
                // An answer that raced ahead of our own offer.
                let stashed = self.active.as_mut().and_then(|call| {
                    match std::mem::replace(&mut call.remote, RemoteDescription::None) {
                        RemoteDescription::Stashed(d)
                            if matches!(call.session.state, CallState::Negotiating { .. }) =>
                        {
                            Some(d)
                        }
                        other => {
                            call.remote = other;
                            None
                        }
                    }
                });
                if let Some(description) = stashed {
                    self.apply_remote(description);
                }
            }
            StepOutcome::RemoteApplied => {
                let Some(call) = self.active.as_mut() else {
                    return;
                };
                call.remote = RemoteDescription::Applied;
                let pending = call.pending_candidates.drain();
                if let Some(pipeline) = call.pipeline.clone() {
                    if !pending.is_empty() {
                        debug!(
                            "Replaying {} buffered ICE candidates for call {}",
                            pending.len(),
                            call_id
                        );
                        spawn_add_candidates(
                            self.inbox.clone(),
                            call_id.clone(),
                            pipeline.clone(),
                            pending,
                        );
                    }
                    if call.session.role == CallRole::Callee {
                        spawn_step(
                            self.inbox.clone(),
                            call_id.clone(),
                            pipeline,
                            NegotiationStep::CreateAnswer,
                        );
                    }
                }
            }
        }
        self.check_active();
    }

    async fn handle_media(&mut self, call_id: CallId, event: PipelineEvent) {
        if self.current(&call_id).is_none() {
            debug!("Discarding media event for stale call {}", call_id);
            return;
        }
        match event {
            PipelineEvent::LocalCandidate(candidate) => {
                if let Some(builder) = self.signal(SignalType::IceCandidate) {
                    self.send(builder.candidate(candidate).build());
                }
            }
            PipelineEvent::RemoteStream(stream) => {
                if let Some(call) = self.active.as_mut() {
                    call.remote_stream = true;
                }
                info!("Remote stream {} arrived for call {}", stream.id(), call_id);
                self.events.publish(CallEvent::RemoteStream {
                    call_id: call_id.clone(),
                    stream,
                });
                self.check_active();
            }
            PipelineEvent::ConnectionState(state) if state.is_terminal() => {
                warn!("Peer connection for call {} is {:?}", call_id, state);
                self.end_session(EndReason::ConnectionLost, Some(SignalType::CallEnded))
                    .await;
            }
            PipelineEvent::ConnectionState(state) => {
                debug!("Peer connection for call {} is {:?}", call_id, state);
            }
        }
    }

    fn check_active(&mut self) {
        if self.active.as_ref().is_some_and(ActiveCall::ready_for_active)
            && let Err(e) = self.transition(CallTransition::MediaConnected)
        {
            warn!("{}", e);
        }
    }

    async fn handle_deadline(&mut self, call_id: CallId, state: &'static str) {
        let Some(call) = self.current(&call_id) else {
            return;
        };
        if call.session.state.name() != state {
            return;
        }
        match call.session.state {
            CallState::Dialing { .. } => {
                warn!(
                    "Call {} unanswered after {:?}",
                    call_id, self.config.dial_timeout
                );
                self.end_session(EndReason::Timeout, Some(SignalType::CallEnded))
                    .await;
            }
            CallState::Ringing { .. } => {
                info!(
                    "Call {} missed after ringing {:?}",
                    call_id, self.config.ring_timeout
                );
                self.end_session(EndReason::Missed, Some(SignalType::CallRejected))
                    .await;
            }
            _ => {}
        }
    }

    // ---- helpers ----

    fn current(&self, call_id: &CallId) -> Option<&ActiveCall> {
        self.active.as_ref().filter(|c| c.id() == call_id)
    }

    fn current_mut(&mut self, call_id: &CallId) -> Option<&mut ActiveCall> {
        self.active.as_mut().filter(|c| c.id() == call_id)
    }

    /// Builder for a signal on the live call, addressed to its peer.
    fn signal(&self, signal_type: SignalType) -> Option<CallSignalBuilder> {
        self.active.as_ref().map(|call| {
            CallSignalBuilder::new(
                signal_type,
                call.id().clone(),
                self.local_id.clone(),
                call.session.peer_id.clone(),
            )
        })
    }

    fn send(&self, signal: CallSignal) {
        debug!(
            "Sending {} for call {} to {}",
            signal.signal_type, signal.call_id, signal.to
        );
        if self.outbound.send(signal).is_err() {
            error!("Outbound signal queue closed for {}", self.local_id);
        }
    }

    fn remember(&mut self, call_id: CallId) {
        if self.recently_ended.contains(&call_id) {
            return;
        }
        if self.recently_ended.len() >= self.config.recently_ended_capacity.max(1) {
            self.recently_ended.pop_front();
        }
        self.early.retain(|early| early.call_id != call_id);
        self.recently_ended.push_back(call_id);
    }

    /// Move the live call along the state machine, keeping the ringtone,
    /// deadlines and subscribers in step.
    fn transition(&mut self, transition: CallTransition) -> Result<(), InvalidTransition> {
        let Some(call) = self.active.as_mut() else {
            return Ok(());
        };
        let from = call.session.state.name();
        call.session.apply_transition(transition)?;
        let state = call.session.state.clone();
        info!("Call {}: {} -> {}", call.id(), from, state.name());

        call.cancel_deadline();
        let timeout = match state {
            CallState::Dialing { .. } => Some(self.config.dial_timeout),
            CallState::Ringing { .. } => Some(self.config.ring_timeout),
            _ => None,
        };
        if let Some(timeout) = timeout {
            let inbox = self.inbox.clone();
            let call_id = call.id().clone();
            let state_name = state.name();
            call.deadline = Some(tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = inbox.send(ControllerInput::Deadline {
                    call_id,
                    state: state_name,
                });
            }));
        }

        self.ringtone.sync(&state);
        self.events.publish(CallEvent::StateChanged {
            call_id: call.id().clone(),
            state,
        });
        Ok(())
    }

    /// Terminal transition. Releases every resource of the live call exactly
    /// once; later calls find no live call and do nothing.
    async fn end_session(&mut self, reason: EndReason, notify: Option<SignalType>) {
        let Some(mut call) = self.active.take() else {
            return;
        };
        call.cancel_deadline();
        let from = call.session.state.name();
        if let Err(e) = call
            .session
            .apply_transition(CallTransition::End {
                reason: reason.clone(),
            })
        {
            warn!("Call {}: {}", call.id(), e);
        }
        self.ringtone.sync(&call.session.state);

        if let Some(signal_type) = notify
            && call.announced
        {
            self.send(
                CallSignalBuilder::new(
                    signal_type,
                    call.id().clone(),
                    self.local_id.clone(),
                    call.session.peer_id.clone(),
                )
                .build(),
            );
        }

        if let Some(pipeline) = call.pipeline.take() {
            pipeline.teardown().await;
        }
        let dropped = call.pending_candidates.drain().len();
        if dropped > 0 {
            debug!("Dropped {} buffered candidates for call {}", dropped, call.id());
        }

        let call_id = call.id().clone();
        self.remember(call_id.clone());
        info!("Call {}: {} -> ended ({:?})", call_id, from, reason);
        self.events.publish(CallEvent::StateChanged {
            call_id: call_id.clone(),
            state: call.session.state.clone(),
        });
        self.events.publish(CallEvent::CallEnded {
            call_id,
            message: reason.message(),
            reason,
        });
        self.last_call = Some(call.session);
    }
}

fn spawn_step(
    inbox: mpsc::UnboundedSender<ControllerInput>,
    call_id: CallId,
    pipeline: Arc<MediaPipeline>,
    step: NegotiationStep,
) {
    tokio::spawn(async move {
        let result = match step {
            NegotiationStep::CreateOffer => pipeline
                .create_offer()
                .await
                .map(StepOutcome::LocalDescription),
            NegotiationStep::CreateAnswer => pipeline
                .create_answer()
                .await
                .map(StepOutcome::LocalDescription),
            NegotiationStep::ApplyRemote(description) => pipeline
                .set_remote_description(description)
                .await
                .map(|()| StepOutcome::RemoteApplied),
        };
        let _ = inbox.send(ControllerInput::Negotiated { call_id, result });
    });
}

/// Add remote candidates in order. The first rejected one is reported back
/// as a negotiation failure.
fn spawn_add_candidates(
    inbox: mpsc::UnboundedSender<ControllerInput>,
    call_id: CallId,
    pipeline: Arc<MediaPipeline>,
    candidates: Vec<IceCandidate>,
) {
    tokio::spawn(async move {
        for candidate in candidates {
            if let Err(e) = pipeline.add_remote_candidate(candidate).await {
                warn!("Call {}: could not add ICE candidate: {}", call_id, e);
                let _ = inbox.send(ControllerInput::Negotiated {
                    call_id,
                    result: Err(e),
                });
                return;
            }
        }
    });
}

/// Cheap, cloneable handle to a running [`CallManager`].
#[derive(Clone)]
pub struct CallHandle {
    local_id: ParticipantId,
    inbox: mpsc::UnboundedSender<ControllerInput>,
    events: CallEventBus,
}

impl CallHandle {
    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, CallError> {
        let (tx, rx) = oneshot::channel();
        self.inbox
            .send(ControllerInput::Command(command(tx)))
            .map_err(|_| CallError::ControllerStopped)?;
        rx.await.map_err(|_| CallError::ControllerStopped)
    }

    /// Start an outgoing call. Fails with [`CallError::Busy`] while another
    /// call is live. Device failures end the call; watch [`CallEvent::CallEnded`].
    pub async fn start_call(
        &self,
        peer: impl Into<ParticipantId>,
        options: CallOptions,
    ) -> Result<CallId, CallError> {
        let peer = peer.into();
        self.request(|reply| Command::Start {
            peer,
            options,
            reply,
        })
        .await?
    }

    pub async fn accept(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Accept { reply }).await?
    }

    pub async fn decline(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Decline { reply }).await?
    }

    /// Hang up. Safe to call at any time, any number of times.
    pub async fn end_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::End { reply }).await?
    }

    /// Returns whether local audio is now enabled.
    pub async fn toggle_mute(&self) -> Result<bool, CallError> {
        self.request(|reply| Command::Toggle {
            kind: TrackKind::Audio,
            reply,
        })
        .await?
    }

    /// Returns whether local video is now enabled.
    pub async fn toggle_video(&self) -> Result<bool, CallError> {
        self.request(|reply| Command::Toggle {
            kind: TrackKind::Video,
            reply,
        })
        .await?
    }

    pub async fn current_call(&self) -> Option<CallSession> {
        self.request(|reply| Command::Current { reply })
            .await
            .ok()
            .flatten()
    }

    /// The most recently ended call.
    pub async fn last_call(&self) -> Option<CallSession> {
        self.request(|reply| Command::Last { reply })
            .await
            .ok()
            .flatten()
    }

    /// Hang up any live call and stop the controller.
    pub async fn shutdown(&self) {
        if self
            .request(|reply| Command::Shutdown { reply })
            .await
            .is_err()
        {
            debug!("Call manager for {} already stopped", self.local_id);
        }
    }
}
