//! The `CallSignal` wire entity.
//!
//! ```json
//! {
//!   "type": "offer",
//!   "from": "alice", "to": "bob", "callId": "AC90CFD09DF712D981142B172706F9F2",
//!   "data": { "offer": { "type": "offer", "sdp": "v=0..." } }
//! }
//! ```
//!
//! `data` is omitted for `call-rejected` and `call-ended`.

use super::error::CallError;
use super::signaling::SignalType;
use super::transport::{IceCandidate, SessionDescription};
use crate::types::call::{CallId, CallKind, ParticipantId};
use serde::{Deserialize, Serialize};

/// Variant payload of a signal. At most one field is set for a valid signal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalData {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<CallKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<IceCandidate>,
}

impl SignalData {
    pub fn is_empty(&self) -> bool {
        self.kind.is_none()
            && self.offer.is_none()
            && self.answer.is_none()
            && self.candidate.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSignal {
    #[serde(rename = "type")]
    pub signal_type: SignalType,
    pub from: ParticipantId,
    pub to: ParticipantId,
    pub call_id: CallId,
    #[serde(default, skip_serializing_if = "SignalData::is_empty")]
    pub data: SignalData,
}

/// Typed view of a signal's payload, checked against its type.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalPayload {
    Request(CallKind),
    Accepted(Option<CallKind>),
    Rejected,
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(IceCandidate),
    Ended,
}

impl CallSignal {
    /// Decode and validate a signal from its JSON form.
    pub fn decode(json: &str) -> Result<Self, CallError> {
        let signal: CallSignal =
            serde_json::from_str(json).map_err(|e| CallError::Parse(e.to_string()))?;
        signal.payload()?;
        Ok(signal)
    }

    pub fn encode(&self) -> Result<String, CallError> {
        serde_json::to_string(self).map_err(|e| CallError::Parse(e.to_string()))
    }

    /// Extract the payload matching `type`, failing when a required field is missing.
    pub fn payload(&self) -> Result<SignalPayload, CallError> {
        let data = &self.data;
        match self.signal_type {
            SignalType::CallRequest => data
                .kind
                .map(SignalPayload::Request)
                .ok_or(CallError::MissingPayload("type")),
            SignalType::CallAccepted => Ok(SignalPayload::Accepted(data.kind)),
            SignalType::CallRejected => Ok(SignalPayload::Rejected),
            SignalType::Offer => data
                .offer
                .clone()
                .map(SignalPayload::Offer)
                .ok_or(CallError::MissingPayload("offer")),
            SignalType::Answer => data
                .answer
                .clone()
                .map(SignalPayload::Answer)
                .ok_or(CallError::MissingPayload("answer")),
            SignalType::IceCandidate => data
                .candidate
                .clone()
                .map(SignalPayload::Candidate)
                .ok_or(CallError::MissingPayload("candidate")),
            SignalType::CallEnded => Ok(SignalPayload::Ended),
        }
    }

    /// Whether this signal is addressed to `owner`'s channel.
    pub fn is_addressed_to(&self, owner: &ParticipantId) -> bool {
        &self.to == owner
    }
}

/// Builder for outgoing call signals.
pub struct CallSignalBuilder {
    signal_type: SignalType,
    call_id: CallId,
    from: ParticipantId,
    to: ParticipantId,
    data: SignalData,
}

impl CallSignalBuilder {
    pub fn new(
        signal_type: SignalType,
        call_id: CallId,
        from: ParticipantId,
        to: ParticipantId,
    ) -> Self {
        Self {
            signal_type,
            call_id,
            from,
            to,
            data: SignalData::default(),
        }
    }

    pub fn kind(mut self, kind: CallKind) -> Self {
        self.data.kind = Some(kind);
        self
    }

    pub fn offer(mut self, offer: SessionDescription) -> Self {
        self.data.offer = Some(offer);
        self
    }

    pub fn answer(mut self, answer: SessionDescription) -> Self {
        self.data.answer = Some(answer);
        self
    }

    pub fn candidate(mut self, candidate: IceCandidate) -> Self {
        self.data.candidate = Some(candidate);
        self
    }

    pub fn build(self) -> CallSignal {
        CallSignal {
            signal_type: self.signal_type,
            from: self.from,
            to: self.to,
            call_id: self.call_id,
            data: self.data,
        }
    }
}
