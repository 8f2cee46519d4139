#![allow(dead_code)]

use portal_calls::calls::mock::{MockMediaDevices, MockPeerFactory, RecordingTonePlayer};
use portal_calls::calls::{
    CallEvent, CallHandle, CallManager, CallManagerConfig, CallSignal, CallSignalBuilder,
    CallState, LocalRelay, SignalHandler, SignalRelay, SignalType, Subscription,
};
use portal_calls::types::call::{CallId, CallKind, EndReason, ParticipantId};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

/// Upper bound for any single wait. Virtual under paused time.
pub const WAIT: Duration = Duration::from_secs(60);

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// One call controller wired to mock collaborators.
pub struct Participant {
    pub id: ParticipantId,
    pub handle: CallHandle,
    pub devices: Arc<MockMediaDevices>,
    pub peers: Arc<MockPeerFactory>,
    pub tones: Arc<RecordingTonePlayer>,
    pub events: broadcast::Receiver<CallEvent>,
}

pub async fn participant(id: &str, relay: &LocalRelay) -> Participant {
    participant_with(id, relay, CallManagerConfig::default()).await
}

pub async fn participant_with(
    id: &str,
    relay: &LocalRelay,
    config: CallManagerConfig,
) -> Participant {
    init_logging();
    let devices = Arc::new(MockMediaDevices::new());
    let peers = Arc::new(MockPeerFactory::new(id));
    let tones = Arc::new(RecordingTonePlayer::new());
    let handle = CallManager::builder(id, Arc::new(relay.clone()), devices.clone(), peers.clone())
        .tone_player(tones.clone())
        .config(config)
        .spawn()
        .await
        .expect("call manager should start");
    let events = handle.subscribe();
    Participant {
        id: ParticipantId::from(id),
        handle,
        devices,
        peers,
        tones,
        events,
    }
}

impl Participant {
    async fn next_event(&mut self) -> CallEvent {
        tokio::time::timeout(WAIT, self.events.recv())
            .await
            .unwrap_or_else(|_| panic!("{}: timed out waiting for a call event", self.id))
            .unwrap_or_else(|e| panic!("{}: event stream failed: {e}", self.id))
    }

    /// Wait until the controller enters the state named `name`.
    pub async fn wait_for_state(&mut self, name: &str) -> CallState {
        loop {
            if let CallEvent::StateChanged { state, .. } = self.next_event().await
                && state.name() == name
            {
                return state;
            }
        }
    }

    /// Wait for the incoming-call prompt.
    pub async fn wait_for_incoming(&mut self) -> (CallId, String, CallKind) {
        loop {
            if let CallEvent::IncomingCall {
                call_id,
                from,
                kind,
            } = self.next_event().await
            {
                return (call_id, from.display_name, kind);
            }
        }
    }

    pub async fn wait_for_ended(&mut self) -> (EndReason, String) {
        loop {
            if let CallEvent::CallEnded {
                reason, message, ..
            } = self.next_event().await
            {
                return (reason, message);
            }
        }
    }

    /// Wait for any event matching `pred`.
    pub async fn wait_for_event(&mut self, pred: impl Fn(&CallEvent) -> bool) -> CallEvent {
        loop {
            let event = self.next_event().await;
            if pred(&event) {
                return event;
            }
        }
    }

    /// Events already queued, without waiting.
    pub fn drain_events(&mut self) -> Vec<CallEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    pub async fn history(&self) -> Vec<&'static str> {
        self.handle
            .last_call()
            .await
            .expect("a call should have ended")
            .history
    }
}

/// Types of every signal `from` handed to the relay, in order, ICE excluded.
pub fn sent_by(relay: &LocalRelay, from: &str) -> Vec<SignalType> {
    relay
        .sent_signals()
        .into_iter()
        .filter(|s| s.from.as_str() == from && s.signal_type != SignalType::IceCandidate)
        .map(|s| s.signal_type)
        .collect()
}

pub fn count_sent(relay: &LocalRelay, from: &str, signal_type: SignalType) -> usize {
    relay
        .sent_signals()
        .iter()
        .filter(|s| s.from.as_str() == from && s.signal_type == signal_type)
        .count()
}

/// Poll `cond` until it holds.
pub async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    let poll = async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    if tokio::time::timeout(WAIT, poll).await.is_err() {
        panic!("timed out waiting for {what}");
    }
}

/// A hand-driven participant: records what it receives and sends whatever
/// the test tells it to.
pub struct ScriptedPeer {
    pub id: ParticipantId,
    relay: LocalRelay,
    received: Arc<Mutex<Vec<CallSignal>>>,
    _subscription: Subscription,
}

impl ScriptedPeer {
    pub async fn new(id: &str, relay: &LocalRelay) -> Self {
        init_logging();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let handler: SignalHandler = Arc::new(move |signal| sink.lock().unwrap().push(signal));
        let subscription = relay
            .subscribe(&ParticipantId::from(id), handler)
            .await
            .expect("subscribe");
        Self {
            id: ParticipantId::from(id),
            relay: relay.clone(),
            received,
            _subscription: subscription,
        }
    }

    pub fn signal(&self, signal_type: SignalType, call_id: &CallId, to: &str) -> CallSignalBuilder {
        CallSignalBuilder::new(
            signal_type,
            call_id.clone(),
            self.id.clone(),
            ParticipantId::from(to),
        )
    }

    pub async fn send(&self, signal: CallSignal) {
        self.relay.send(signal).await.expect("relay send");
    }

    pub fn received(&self) -> Vec<CallSignal> {
        self.received.lock().unwrap().clone()
    }

    pub fn received_types(&self) -> Vec<SignalType> {
        self.received().into_iter().map(|s| s.signal_type).collect()
    }

    /// Wait for a signal of `signal_type` and return the first one received.
    pub async fn wait_for(&self, signal_type: SignalType) -> CallSignal {
        let find = || {
            self.received()
                .into_iter()
                .find(|s| s.signal_type == signal_type)
        };
        let poll = async {
            loop {
                if let Some(signal) = find() {
                    return signal;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(WAIT, poll)
            .await
            .unwrap_or_else(|_| panic!("{}: timed out waiting for {signal_type}", self.id))
    }
}

/// Run `caller` → `callee` until both sides are active.
pub async fn connect(caller: &mut Participant, callee: &mut Participant, kind: CallKind) -> CallId {
    let options = match kind {
        CallKind::Audio => portal_calls::calls::CallOptions::audio(),
        CallKind::Video => portal_calls::calls::CallOptions::video(),
    };
    let call_id = caller
        .handle
        .start_call(callee.id.clone(), options)
        .await
        .expect("start call");
    let (incoming, _, _) = callee.wait_for_incoming().await;
    assert_eq!(incoming, call_id);
    callee.handle.accept().await.expect("accept");
    caller.wait_for_state("active").await;
    callee.wait_for_state("active").await;
    call_id
}
