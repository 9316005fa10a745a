/// Reason a single candidate source (STUN or TURN server) failed
///
/// These never fail the gathering as a whole, other sources proceed independently.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatherError {
    #[error("server did not respond within the retransmission budget")]
    Timeout,
    #[error("allocation rejected with {code} {reason}")]
    AllocationFailed { code: u32, reason: String },
    #[error("transport to the server failed: {0}")]
    TransportFailed(String),
}

/// Returned when trying to send data before a candidate pair has been selected
#[derive(Debug, thiserror::Error)]
#[error("no candidate pair has been selected")]
pub struct NotConnected;
