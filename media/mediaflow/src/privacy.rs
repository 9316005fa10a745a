use ice::{CandidateFilter, CandidateKind};

/// Candidate policy of a flow
///
/// With privacy enabled only relayed candidates are signaled. Remote candidates are accepted if they are
/// relayed or were discovered during connectivity checks (peer-reflexive), host and server-reflexive
/// addresses of the peer are never contacted. Gathering is unaffected, the hidden candidates are still
/// used as bases of the TURN allocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PrivacyFilter {
    pub(crate) enabled: bool,
}

impl CandidateFilter for PrivacyFilter {
    fn allow_local(&self, kind: CandidateKind) -> bool {
        !self.enabled || kind == CandidateKind::Relayed
    }

    fn allow_remote(&self, kind: CandidateKind) -> bool {
        !self.enabled || matches!(kind, CandidateKind::Relayed | CandidateKind::PeerReflexive)
    }
}
