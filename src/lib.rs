//! Peer-to-peer call signaling and session negotiation for the collaboration
//! portal.

pub mod calls;
pub mod types;
