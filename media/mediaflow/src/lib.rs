//! # Negotiated peer to peer media transports
//!
//! A [`Mediaflow`] negotiates a secure transport for audio, video and data channels between two endpoints.
//! It gathers candidates using STUN and TURN, creates and answers SDP offers, runs ICE connectivity checks,
//! performs a DTLS handshake on the selected candidate pair and derives the SRTP keys from it.
//!
//! The flow is sans-io. When the `tokio` feature is enabled [`tokio::TokioIo`] can be used to drive a flow
//! using a UDP socket and TCP streams to TURN servers. Many flows on one event loop can be managed using a
//! [`FlowSet`].

mod config;
mod datachannel;
mod demux;
mod dtls;
mod error;
mod flow;
mod flow_set;
mod identity;
mod milestones;
mod privacy;
mod sdp;
mod srtp;
#[cfg(feature = "tokio")]
pub mod tokio;

pub use config::{Codec, CryptoKind, MediaKind, MediaflowConfig};
pub use datachannel::{ChannelId, ChannelState};
pub use error::{CloseReason, Error};
pub use flow::{Established, Mediaflow, MediaflowEvent};
pub use flow_set::{FlowId, FlowSet};
pub use identity::DtlsIdentity;
pub use srtp::SrtpError;

pub use ice::{CandidateKind, IceConfig, ReceivedPkt, Side, TurnServer, TurnTransport};
pub use sdp_types::IceCandidate;

fn opt_min<T: Ord>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (None, None) => None,
        (None, Some(b)) => Some(b),
        (Some(a), None) => Some(a),
        (Some(a), Some(b)) => Some(std::cmp::min(a, b)),
    }
}
