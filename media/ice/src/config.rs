use std::cmp::min;
use std::net::SocketAddr;
use std::time::Duration;

/// Timing and limits of an [`IceAgent`](crate::IceAgent)
#[derive(Debug, Clone)]
pub struct IceConfig {
    /// Initial STUN retransmission timeout, doubled with every retransmit
    pub initial_rto: Duration,
    /// Upper limit of the retransmission timeout
    pub max_rto: Duration,
    /// Number of retransmits before a STUN transaction is considered failed
    pub max_retransmits: u32,
    /// Interval in which server reflexive bindings are refreshed
    pub binding_refresh_interval: Duration,
    /// Minimum interval between two connectivity checks (Ta)
    pub check_interval: Duration,
    /// Maximum number of candidate pairs, lowest priority pairs are pruned first
    pub max_pairs: usize,
    /// Lifetime requested for TURN allocations
    pub turn_lifetime: Duration,
    /// Interval in which TURN permissions and channel bindings are refreshed
    pub permission_refresh_interval: Duration,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            initial_rto: Duration::from_millis(250),
            max_rto: Duration::from_secs(3),
            // RFC 5389 default
            max_retransmits: 7,
            binding_refresh_interval: Duration::from_secs(20),
            check_interval: Duration::from_millis(50),
            max_pairs: 100,
            turn_lifetime: Duration::from_secs(600),
            // permissions expire after 5 minutes
            permission_refresh_interval: Duration::from_secs(240),
        }
    }
}

impl IceConfig {
    pub(crate) fn retransmit_delta(&self, attempts: u32) -> Duration {
        let rto = self
            .initial_rto
            .checked_mul(1 << attempts.min(16))
            .unwrap_or(self.max_rto);

        min(rto, self.max_rto)
    }
}

/// Transport used to talk to a TURN server
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TurnTransport {
    #[default]
    Udp,
    Tcp,
    /// TLS over TCP
    Tls,
}

impl TurnTransport {
    pub fn is_stream(self) -> bool {
        matches!(self, TurnTransport::Tcp | TurnTransport::Tls)
    }
}

/// A TURN server with its long-term credentials
#[derive(Debug, Clone)]
pub struct TurnServer {
    pub addr: SocketAddr,
    pub transport: TurnTransport,
    pub username: String,
    pub password: String,
    /// Name the server certificate is verified against when using [`TurnTransport::Tls`].
    ///
    /// If not set the certificate is not verified, the allocation is still protected by the long-term credentials.
    pub tls_domain: Option<String>,
}

impl TurnServer {
    pub fn new(
        addr: SocketAddr,
        transport: TurnTransport,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            addr,
            transport,
            username: username.into(),
            password: password.into(),
            tls_domain: None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn retransmit_backoff_is_capped() {
        let config = IceConfig::default();

        assert_eq!(config.retransmit_delta(0), Duration::from_millis(250));
        assert_eq!(config.retransmit_delta(2), Duration::from_secs(1));
        assert_eq!(config.retransmit_delta(4), Duration::from_secs(3));
        assert_eq!(config.retransmit_delta(40), Duration::from_secs(3));
    }
}
