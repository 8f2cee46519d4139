//! Signal relay: per-recipient publish/subscribe for call signals.
//!
//! The relay is an unordered, at-most-once bus. It stores nothing and
//! confirms nothing; a signal sent to a participant with no subscriber is
//! lost.

use super::error::CallError;
use super::lock;
use super::signal::CallSignal;
use crate::types::call::ParticipantId;
use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, trace};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub type SignalHandler = Arc<dyn Fn(CallSignal) + Send + Sync>;

/// Live subscription. Dropping it unsubscribes.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

#[async_trait]
pub trait SignalRelay: Send + Sync {
    /// Fire-and-forget publish into `signal.to`'s channel.
    async fn send(&self, signal: CallSignal) -> Result<(), CallError>;

    /// Deliver every signal addressed to `participant` to `handler`.
    async fn subscribe(
        &self,
        participant: &ParticipantId,
        handler: SignalHandler,
    ) -> Result<Subscription, CallError>;
}

/// What [`LocalRelay`] does with a signal matching its filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayAction {
    Deliver,
    /// Lose the signal, as an unreliable transport would.
    Drop,
    /// Keep the signal until [`LocalRelay::release_held`].
    Hold,
    /// Deliver the signal twice.
    Duplicate,
}

type SignalFilter = Box<dyn Fn(&CallSignal) -> RelayAction + Send + Sync>;

struct RelayInner {
    channels: DashMap<ParticipantId, (u64, SignalHandler)>,
    next_token: AtomicU64,
    sent: Mutex<Vec<CallSignal>>,
    held: Mutex<Vec<CallSignal>>,
    filter: Mutex<Option<SignalFilter>>,
}

/// In-process relay. Signals pass through their JSON wire form on the way.
#[derive(Clone)]
pub struct LocalRelay {
    inner: Arc<RelayInner>,
}

impl Default for LocalRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalRelay {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RelayInner {
                channels: DashMap::new(),
                next_token: AtomicU64::new(1),
                sent: Mutex::new(Vec::new()),
                held: Mutex::new(Vec::new()),
                filter: Mutex::new(None),
            }),
        }
    }

    /// Every signal handed to [`send`](SignalRelay::send), in send order,
    /// including dropped and held ones.
    pub fn sent_signals(&self) -> Vec<CallSignal> {
        lock(&self.inner.sent).clone()
    }

    pub fn set_filter(&self, filter: impl Fn(&CallSignal) -> RelayAction + Send + Sync + 'static) {
        *lock(&self.inner.filter) = Some(Box::new(filter));
    }

    pub fn clear_filter(&self) {
        lock(&self.inner.filter).take();
    }

    /// Deliver every held signal in the order it was sent. Returns how many.
    pub fn release_held(&self) -> usize {
        let held = std::mem::take(&mut *lock(&self.inner.held));
        let count = held.len();
        for signal in held {
            self.deliver(signal);
        }
        count
    }

    pub fn is_subscribed(&self, participant: &ParticipantId) -> bool {
        self.inner.channels.contains_key(participant)
    }

    fn deliver(&self, signal: CallSignal) {
        let handler = self
            .inner
            .channels
            .get(&signal.to)
            .map(|entry| entry.value().1.clone());
        match handler {
            Some(handler) => handler(signal),
            None => debug!(
                "No subscriber for {}, dropping {} for call {}",
                signal.to, signal.signal_type, signal.call_id
            ),
        }
    }
}

#[async_trait]
impl SignalRelay for LocalRelay {
    async fn send(&self, signal: CallSignal) -> Result<(), CallError> {
        let wire = signal.encode()?;
        trace!("relay <- {}", wire);
        let signal = CallSignal::decode(&wire)?;
        lock(&self.inner.sent).push(signal.clone());

        let action = lock(&self.inner.filter)
            .as_ref()
            .map(|filter| filter(&signal))
            .unwrap_or(RelayAction::Deliver);

        match action {
            RelayAction::Deliver => self.deliver(signal),
            RelayAction::Drop => debug!(
                "Relay dropped {} for call {}",
                signal.signal_type, signal.call_id
            ),
            RelayAction::Hold => lock(&self.inner.held).push(signal),
            RelayAction::Duplicate => {
                self.deliver(signal.clone());
                self.deliver(signal);
            }
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        participant: &ParticipantId,
        handler: SignalHandler,
    ) -> Result<Subscription, CallError> {
        let token = self.inner.next_token.fetch_add(1, Ordering::SeqCst);
        if self
            .inner
            .channels
            .insert(participant.clone(), (token, handler))
            .is_some()
        {
            debug!("Replacing existing subscription for {}", participant);
        }

        let inner = Arc::downgrade(&self.inner);
        let participant = participant.clone();
        Ok(Subscription::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner
                    .channels
                    .remove_if(&participant, |_, (current, _)| *current == token);
            }
        }))
    }
}
