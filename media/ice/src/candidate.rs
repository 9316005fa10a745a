use crate::TurnId;
use sdp_types::{IceCandidate, UntaggedAddress};
use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::net::{IpAddr, SocketAddr};

/// Type of an ICE candidate, the discriminant is the type preference used to compute its priority
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum CandidateKind {
    Host = 126,
    PeerReflexive = 110,
    ServerReflexive = 100,
    Relayed = 0,
}

impl CandidateKind {
    pub(crate) fn from_sdp(typ: &str) -> Option<Self> {
        match typ {
            "host" => Some(CandidateKind::Host),
            "srflx" => Some(CandidateKind::ServerReflexive),
            "prflx" => Some(CandidateKind::PeerReflexive),
            "relay" => Some(CandidateKind::Relayed),
            _ => None,
        }
    }

    pub fn as_sdp(self) -> &'static str {
        match self {
            CandidateKind::Host => "host",
            CandidateKind::PeerReflexive => "prflx",
            CandidateKind::ServerReflexive => "srflx",
            CandidateKind::Relayed => "relay",
        }
    }

    /// Offset added to the local preference, so candidates of the same kind are ordered by insertion
    fn local_preference_offset(self) -> u32 {
        match self {
            CandidateKind::Host => (65535 / 4) * 3,
            CandidateKind::PeerReflexive => (65535 / 4) * 2,
            CandidateKind::ServerReflexive => 65535 / 4,
            CandidateKind::Relayed => 0,
        }
    }
}

/// Decides which candidates are visible to the peer and take part in connectivity checks
///
/// Candidates rejected by the filter still exist inside the agent (e.g. as base of a TURN allocation),
/// but are never signaled, paired or reported.
pub trait CandidateFilter {
    /// Returns if a local candidate of this kind may be signaled & paired
    fn allow_local(&self, kind: CandidateKind) -> bool;

    /// Returns if a remote candidate of this kind may be accepted & paired
    fn allow_remote(&self, kind: CandidateKind) -> bool;
}

/// Filter that allows every candidate
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl CandidateFilter for AllowAll {
    fn allow_local(&self, _: CandidateKind) -> bool {
        true
    }

    fn allow_remote(&self, _: CandidateKind) -> bool {
        true
    }
}

pub(crate) struct Candidate {
    pub(crate) addr: SocketAddr,
    // transport: udp
    pub(crate) kind: CandidateKind,
    pub(crate) priority: u32,
    pub(crate) foundation: String,

    // The transport address that an ICE agent sends from for a particular candidate.
    // For host, server-reflexive, and peer-reflexive candidates, the base is the same as the host candidate.
    // For relayed candidates, the base is the same as the relayed candidate.
    pub(crate) base: SocketAddr,

    /// Related address signaled in SDP, the base of reflexive candidates or the mapped address of relayed ones
    pub(crate) related: Option<SocketAddr>,

    /// TURN allocation a relayed candidate belongs to
    pub(crate) relay: Option<TurnId>,
}

impl Candidate {
    pub(crate) fn to_sdp(&self) -> IceCandidate {
        IceCandidate {
            foundation: self.foundation.clone().into(),
            component: 1,
            transport: "UDP".into(),
            priority: self.priority.into(),
            address: UntaggedAddress::IpAddress(self.addr.ip()),
            port: self.addr.port(),
            typ: self.kind.as_sdp().into(),
            rel_addr: self
                .related
                .map(|addr| UntaggedAddress::IpAddress(addr.ip())),
            rel_port: self.related.map(|addr| addr.port()),
            unknown: vec![],
        }
    }
}

/// Calculate the candidate priority using offsets + count of candidates of the same type
pub(crate) fn local_priority(kind: CandidateKind, same_kind_count: usize) -> u32 {
    let local_preference =
        (same_kind_count as u32).min(65535 / 4 - 1) + kind.local_preference_offset();

    let kind_preference = (kind as u32) << 24;
    let local_preference = local_preference << 8;

    // component 1
    kind_preference + local_preference + 255
}

pub(crate) fn pair_priority(
    local_candidate: &Candidate,
    remote_candidate: &Candidate,
    is_controlling: bool,
) -> u64 {
    let (g, d) = if is_controlling {
        (
            u64::from(local_candidate.priority),
            u64::from(remote_candidate.priority),
        )
    } else {
        (
            u64::from(remote_candidate.priority),
            u64::from(local_candidate.priority),
        )
    };

    // pair priority = 2^32*MIN(G,D) + 2*MAX(G,D) + (G>D?1:0)
    (1 << 32) * g.min(d) + 2 * g.max(d) + u64::from(g > d)
}

pub(crate) fn compute_foundation(
    kind: CandidateKind,
    base: IpAddr,
    server: Option<IpAddr>,
    proto: &str,
) -> u64 {
    let mut hasher = DefaultHasher::new();
    (kind, base, server, proto).hash(&mut hasher);
    hasher.finish()
}

pub(crate) struct DisplayPair<'a>(pub(crate) &'a Candidate, pub(crate) &'a Candidate);

impl fmt::Display for DisplayPair<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn fmt_candidate(f: &mut fmt::Formatter<'_>, c: &Candidate) -> fmt::Result {
            match c.kind {
                CandidateKind::Host => write!(f, "host({})", c.addr),
                CandidateKind::PeerReflexive => {
                    write!(f, "peer-reflexive(base:{}, peer:{})", c.base, c.addr)
                }
                CandidateKind::ServerReflexive => {
                    write!(f, "server-reflexive(base:{}, server:{})", c.base, c.addr)
                }
                CandidateKind::Relayed => write!(f, "relayed({})", c.addr),
            }
        }

        fmt_candidate(f, self.0)?;
        write!(f, " <-> ")?;
        fmt_candidate(f, self.1)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn candidate(kind: CandidateKind, priority: u32) -> Candidate {
        let addr: SocketAddr = "10.0.0.1:1000".parse().unwrap();

        Candidate {
            addr,
            kind,
            priority,
            foundation: "1".into(),
            base: addr,
            related: None,
            relay: None,
        }
    }

    #[test]
    fn type_preference_orders_candidates() {
        let host = local_priority(CandidateKind::Host, 0);
        let prflx = local_priority(CandidateKind::PeerReflexive, 0);
        let srflx = local_priority(CandidateKind::ServerReflexive, 0);
        let relay = local_priority(CandidateKind::Relayed, 0);

        assert!(host > prflx && prflx > srflx && srflx > relay);

        // later candidates of the same kind are ranked higher, but never above the next kind
        assert!(local_priority(CandidateKind::Host, 1) > host);
        assert!(local_priority(CandidateKind::Relayed, 100_000) < srflx);
    }

    #[test]
    fn pair_priority_is_symmetric_between_roles() {
        let a = candidate(CandidateKind::Host, 2113937151);
        let b = candidate(CandidateKind::Relayed, 16777215);

        // the controlling agent's view of (a, b) equals the controlled agent's view of (b, a)
        assert_eq!(pair_priority(&a, &b, true), pair_priority(&b, &a, false));
        assert!(pair_priority(&a, &a, true) > pair_priority(&a, &b, true));
    }

    #[test]
    fn sdp_candidate() {
        let mut relay = candidate(CandidateKind::Relayed, 16777215);
        relay.related = Some("192.0.2.1:4000".parse().unwrap());

        assert_eq!(
            relay.to_sdp().to_string(),
            "1 1 UDP 16777215 10.0.0.1 1000 typ relay raddr 192.0.2.1 rport 4000"
        );
    }
}
