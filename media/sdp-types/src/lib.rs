//! SDP (RFC8866) types with a parser tolerant to what browsers send, covering the
//! ICE, DTLS and data channel attributes used during media negotiation.

mod attributes;
mod bandwidth;
mod connection;
mod media;
mod media_description;
mod origin;
mod parse;
mod parser;
mod session_description;
mod tagged_address;
mod time;

pub use attributes::{
    Direction, Fingerprint, FingerprintAlgorithm, Fmtp, Group, IceCandidate, IceOptions,
    IcePassword, IceUsernameFragment, InvalidCandidateParamError, Rtcp, RtcpFeedback,
    RtcpFeedbackPt, RtpMap, Setup, SourceAttribute, Ssrc, UnknownAttribute, UntaggedAddress,
};
pub use bandwidth::Bandwidth;
pub use connection::Connection;
pub use media::{Media, MediaType, TransportProtocol};
pub use media_description::MediaDescription;
pub use origin::Origin;
pub use parser::ParseSessionDescriptionError;
pub use session_description::SessionDescription;
pub use tagged_address::TaggedAddress;
pub use time::Time;
