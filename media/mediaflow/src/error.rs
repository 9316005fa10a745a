use crate::srtp::SrtpError;
use sdp_types::ParseSessionDescriptionError;
use std::fmt;

/// Errors returned by the [`Mediaflow`](crate::Mediaflow) API
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A candidate source did not respond within its retransmission budget
    #[error("candidate source did not respond in time")]
    GatherTimeout,
    /// A TURN server rejected the allocation or was unreachable
    #[error("TURN allocation failed, {0}")]
    AllocationFailed(String),
    /// Gathering completed without a single candidate allowed by the privacy policy
    #[error("gathering completed without usable candidates")]
    NoUsableCandidates,
    #[error("failed to parse SDP, {0}")]
    SdpParse(String),
    /// No media line of the remote description could be accepted
    #[error("no common codec with the peer")]
    CodecMismatch,
    #[error("peer certificate does not match the fingerprint of the SDP")]
    CryptoVerificationFailed,
    /// The data channel is not open yet
    #[error("data channel is not open")]
    ChannelNotReady,
    #[error("unknown data channel")]
    UnknownChannel,
    #[error("invalid state, {0}")]
    InvalidState(&'static str),
    #[error(transparent)]
    OpenSsl(#[from] openssl::error::ErrorStack),
    #[error(transparent)]
    Srtp(#[from] SrtpError),
}

impl From<ParseSessionDescriptionError> for Error {
    fn from(e: ParseSessionDescriptionError) -> Self {
        Error::SdpParse(e.to_string())
    }
}

impl From<ice::GatherError> for Error {
    fn from(e: ice::GatherError) -> Self {
        match e {
            ice::GatherError::Timeout => Error::GatherTimeout,
            e @ (ice::GatherError::AllocationFailed { .. } | ice::GatherError::TransportFailed(_)) => {
                Error::AllocationFailed(e.to_string())
            }
        }
    }
}

/// Reason a flow was closed, reported with [`MediaflowEvent::Closed`](crate::MediaflowEvent::Closed)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed locally using [`Mediaflow::close`](crate::Mediaflow::close)
    Normal,
    /// Every candidate pair failed
    IceFailed,
    /// The DTLS handshake failed or timed out
    DtlsFailed,
    /// The peer's certificate did not match the negotiated fingerprint
    CryptoVerificationFailed,
    /// Gathering completed without any candidate allowed by the privacy policy
    NoUsableCandidates,
    /// The TURN allocation carrying the selected pair expired
    RelayExpired,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CloseReason::Normal => "normal",
            CloseReason::IceFailed => "ice failed",
            CloseReason::DtlsFailed => "dtls failed",
            CloseReason::CryptoVerificationFailed => "crypto verification failed",
            CloseReason::NoUsableCandidates => "no usable candidates",
            CloseReason::RelayExpired => "relay expired",
        })
    }
}
