#![deny(unreachable_pub, unsafe_code)]

//! sans io implementation of a trickle ICE agent with STUN & TURN candidate gathering
//!
//! The agent never touches a socket or reads the clock. It is driven by calling [`IceAgent::poll`] after the
//! duration returned by [`IceAgent::timeout`] and by passing every received packet to [`IceAgent::receive`].
//! Everything it wants to send is returned through [`IceAgent::pop_event`].

use rand::distr::{Alphanumeric, SampleString};
use sdp_types::{IceCandidate, UntaggedAddress};
use slotmap::{SlotMap, new_key_type};
use std::{
    cmp::Reverse,
    collections::VecDeque,
    mem::take,
    net::{IpAddr, SocketAddr},
    time::{Duration, Instant},
};
use stun::StunServerBinding;
use stun_types::{
    Class, IsStunMessageInfo, Message, TransactionId,
    attributes::{
        ErrorCode, Fingerprint, IceControlled, IceControlling, Priority, UseCandidate,
        XorMappedAddress,
    },
    is_stun_message,
};
use turn::{TurnEvent, TurnSession};

mod candidate;
mod config;
mod error;
mod stun;
mod turn;

use candidate::{Candidate, DisplayPair, compute_foundation, local_priority, pair_priority};

pub use candidate::{AllowAll, CandidateFilter, CandidateKind};
pub use config::{IceConfig, TurnServer, TurnTransport};
pub use error::{GatherError, NotConnected};

/// A message received on a socket
pub struct ReceivedPkt<D = Vec<u8>> {
    /// The received data
    pub data: D,
    /// Source address of the message
    pub source: SocketAddr,
    /// Local socket destination address of the message
    pub destination: SocketAddr,
}

/// Which agent a candidate belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Local,
    Remote,
}

/// ICE related events emitted by the [`IceAgent`]
#[derive(Debug)]
pub enum IceEvent {
    GatheringStateChanged {
        old: IceGatheringState,
        new: IceGatheringState,
    },
    ConnectionStateChanged {
        old: IceConnectionState,
        new: IceConnectionState,
    },
    /// A new local candidate is available and should be trickled to the peer
    LocalCandidate(IceCandidate),
    /// A STUN or TURN server failed to provide a candidate, other servers are unaffected
    SourceFailed {
        server: SocketAddr,
        error: GatherError,
    },
    /// A candidate pair has been selected, this happens at most once
    Selected(SelectedPair),
    /// A TURN allocation expired and its relayed candidate was removed
    RelayExpired { server: SocketAddr },
    /// Send a datagram from the local UDP socket
    SendData {
        data: Vec<u8>,
        source: Option<IpAddr>,
        target: SocketAddr,
    },
    /// Write bytes to the stream connection of a TURN server, the connection must be opened on first use
    SendStream { server: SocketAddr, data: Vec<u8> },
}

/// Description of the candidate pair the agent selected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectedPair {
    pub local: CandidateKind,
    pub remote: CandidateKind,
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
}

/// State of gathering candidates from external (STUN/TURN) servers.
/// If no server is configured this state will jump directly to `Complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IceGatheringState {
    /// The ICE agent was just created
    New,
    /// The ICE agent is in the process of gathering candidates
    Gathering,
    /// Every server either produced a candidate or failed. If a new server is added
    /// the state will revert to `Gathering`.
    Complete,
}

/// State of the ICE agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
// Ordering might look weird, but it's so the total state of all ice agents can be "combined" using `min`
pub enum IceConnectionState {
    /// No candidate pair succeeded after gathering completed, or the relay of the selected pair expired
    ///
    /// A peer that signaled its end-of-candidates without anything to pair with also counts as failed.
    Failed,

    /// Reserved for consent freshness, never entered by this agent
    Disconnected,

    /// The ICE agent is awaiting local & remote ice candidates
    New,
    /// The ICE agent is in the process of checking candidates pairs
    Checking,
    /// A candidate pair has been selected
    Connected,
}

new_key_type!(
    struct LocalCandidateId;
    struct RemoteCandidateId;
    pub(crate) struct TurnId;
);

struct CandidatePair {
    local: LocalCandidateId,
    remote: RemoteCandidateId,
    priority: u64,
    state: CandidatePairState,

    // Nominated by the peer
    received_use_candidate: bool,
}

#[derive(Debug, Clone, PartialEq)]
enum CandidatePairState {
    /// A check has not been sent for this pair, but the pair is not Frozen.
    Waiting,

    /// A check has been sent for this pair, but the transaction is in progress.
    InProgress {
        transaction_id: TransactionId,
        stun_request: Vec<u8>,
        retransmit_at: Instant,
        retransmits: u32,
        target: SocketAddr,
    },

    // A check has been sent for this pair, and it produced a successful result.
    Succeeded,

    /// A check has been sent for this pair, and it failed (a response to the check
    /// was never received, or a failure response was received).
    Failed,
}

#[derive(Clone, Copy)]
struct Selection {
    local: LocalCandidateId,
    remote: RemoteCandidateId,
}

/// Credentials of an ICE agent
///
/// These must be exchanges using some external signaling protocol like SDP
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCredentials {
    pub ufrag: String,
    pub pwd: String,
}

impl IceCredentials {
    pub fn random() -> Self {
        let mut rng = rand::rng();

        Self {
            ufrag: Alphanumeric.sample_string(&mut rng, 8),
            pwd: Alphanumeric.sample_string(&mut rng, 32),
        }
    }
}

/// The ICE agent state machine
pub struct IceAgent {
    config: IceConfig,
    filter: Box<dyn CandidateFilter + Send>,

    stun_servers: Vec<StunServerBinding>,
    turn_sessions: SlotMap<TurnId, TurnSession>,

    local_credentials: IceCredentials,
    remote_credentials: Option<IceCredentials>,
    remote_end_of_candidates: bool,

    local_candidates: SlotMap<LocalCandidateId, Candidate>,
    remote_candidates: SlotMap<RemoteCandidateId, Candidate>,

    /// Sorted by priority, highest first
    pairs: Vec<CandidatePair>,
    triggered_check_queue: VecDeque<(LocalCandidateId, RemoteCandidateId)>,

    is_controlling: bool,
    control_tie_breaker: u64,

    gathering_state: IceGatheringState,
    connection_state: IceConnectionState,

    selected: Option<Selection>,
    /// The relay the selected pair was using is gone
    selected_lost: bool,

    last_ta_trigger: Option<Instant>,

    /// STUN Messages that are received before the remote credentials are available
    backlog: Vec<ReceivedPkt<Message>>,

    events: VecDeque<IceEvent>,
}

impl IceAgent {
    /// Create a new agent. The offering side should be controlling.
    pub fn new(config: IceConfig, local_credentials: IceCredentials, is_controlling: bool) -> Self {
        IceAgent {
            config,
            filter: Box::new(AllowAll),
            stun_servers: vec![],
            turn_sessions: SlotMap::with_key(),
            local_credentials,
            remote_credentials: None,
            remote_end_of_candidates: false,
            local_candidates: SlotMap::with_key(),
            remote_candidates: SlotMap::with_key(),
            pairs: Vec::new(),
            triggered_check_queue: VecDeque::new(),
            is_controlling,
            control_tie_breaker: rand::random(),
            gathering_state: IceGatheringState::New,
            connection_state: IceConnectionState::New,
            selected: None,
            selected_lost: false,
            last_ta_trigger: None,
            backlog: vec![],
            events: VecDeque::new(),
        }
    }

    /// Restrict which candidates are signaled, accepted and paired
    ///
    /// Existing pairs not passing the filter are discarded.
    pub fn set_filter(&mut self, filter: impl CandidateFilter + Send + 'static) {
        self.filter = Box::new(filter);

        let local_candidates = &self.local_candidates;
        let remote_candidates = &self.remote_candidates;
        let filter = &self.filter;

        self.pairs.retain(|pair| {
            filter.allow_local(local_candidates[pair.local].kind)
                && filter.allow_remote(remote_candidates[pair.remote].kind)
        });
    }

    pub fn is_controlling(&self) -> bool {
        self.is_controlling
    }

    /// Change the role of the agent, this is usually done once the offer/answer roles are known
    pub fn set_controlling(&mut self, is_controlling: bool) {
        if self.is_controlling != is_controlling {
            self.is_controlling = is_controlling;
            self.recompute_pair_priorities();
        }
    }

    /// Set all the remote information in one step. This function is usually called once after receiving a SDP.
    pub fn set_remote_data(
        &mut self,
        credentials: IceCredentials,
        candidates: &[IceCandidate],
        end_of_candidates: bool,
    ) {
        self.set_remote_credentials(credentials);

        for candidate in candidates {
            self.add_remote_candidate(candidate);
        }

        if end_of_candidates {
            self.set_remote_end_of_candidates();
        }
    }

    /// Set the peer's ufrag & password. Checks received before this are processed on the next [`poll`](IceAgent::poll).
    pub fn set_remote_credentials(&mut self, credentials: IceCredentials) {
        self.remote_credentials = Some(credentials);
    }

    pub fn remote_credentials(&self) -> Option<&IceCredentials> {
        self.remote_credentials.as_ref()
    }

    /// The peer signaled that it will not send any more candidates
    pub fn set_remote_end_of_candidates(&mut self) {
        self.remote_end_of_candidates = true;
    }

    pub fn remote_end_of_candidates(&self) -> bool {
        self.remote_end_of_candidates
    }

    /// Return the ice-agent's ice credentials
    pub fn credentials(&self) -> &IceCredentials {
        &self.local_credentials
    }

    /// Register a host address. This will be used to create a host candidate.
    /// For the ICE agent to work properly, all available ip addresses of the host system should be provided.
    pub fn add_host_addr(&mut self, addr: SocketAddr) {
        if addr.ip().is_unspecified() {
            return;
        }

        if let SocketAddr::V6(v6) = addr {
            let ip = v6.ip();
            if ip.to_ipv4().is_some() || ip.to_ipv4_mapped().is_some() {
                return;
            }
        }

        self.add_local_candidate(CandidateKind::Host, addr, addr, None, None);
    }

    /// Add a STUN server which the ICE agent should use to gather additional (server-reflexive) candidates.
    pub fn add_stun_server(&mut self, server: SocketAddr) {
        self.stun_servers.push(StunServerBinding::new(server));
    }

    /// Add a TURN server to allocate a relayed candidate on.
    ///
    /// Every server is tried independently, a failing server does not affect the others.
    pub fn add_turn_server(&mut self, server: TurnServer) {
        self.turn_sessions.insert(TurnSession::new(server));
    }

    /// Returns the current ICE candidate gathering state
    pub fn gathering_state(&self) -> IceGatheringState {
        self.gathering_state
    }

    /// Returns the current ICE connection state
    pub fn connection_state(&self) -> IceConnectionState {
        self.connection_state
    }

    /// Returns the selected candidate pair
    pub fn selected(&self) -> Option<SelectedPair> {
        if self.selected_lost {
            return None;
        }

        let selection = self.selected?;

        let local = &self.local_candidates[selection.local];
        let remote = &self.remote_candidates[selection.remote];

        Some(SelectedPair {
            local: local.kind,
            remote: remote.kind,
            local_addr: local.addr,
            remote_addr: remote.addr,
        })
    }

    fn add_local_candidate(
        &mut self,
        kind: CandidateKind,
        base: SocketAddr,
        addr: SocketAddr,
        related: Option<SocketAddr>,
        relay: Option<TurnId>,
    ) {
        // Check if we need to create a new candidate for this
        let already_exists = self
            .local_candidates
            .values()
            .any(|c| c.kind == kind && c.base == base && c.addr == addr);

        if already_exists {
            // ignore
            return;
        }

        log::debug!("add local candidate {kind:?} {addr}");

        let same_kind_count = self
            .local_candidates
            .values()
            .filter(|c| c.kind == kind)
            .count();

        let server = relay
            .and_then(|id| self.turn_sessions.get(id))
            .map(|session| session.server().addr.ip());

        let candidate = Candidate {
            addr,
            kind,
            priority: local_priority(kind, same_kind_count),
            foundation: compute_foundation(kind, base.ip(), server, "udp").to_string(),
            base,
            related,
            relay,
        };

        // Peer reflexive candidates are learned by the peer through connectivity checks
        if kind != CandidateKind::PeerReflexive && self.filter.allow_local(kind) {
            self.events
                .push_back(IceEvent::LocalCandidate(candidate.to_sdp()));
        }

        self.local_candidates.insert(candidate);

        self.form_pairs();
    }

    /// Add a peer's ice-candidate which has been received using an extern signaling protocol
    pub fn add_remote_candidate(&mut self, candidate: &IceCandidate) {
        let Some(kind) = CandidateKind::from_sdp(candidate.typ.as_str()) else {
            log::debug!("Discard remote candidate with unknown type candidate:{candidate}");
            return;
        };

        // TODO: ICE-TCP candidates (RFC 6544) are not supported
        if !candidate.transport.eq_ignore_ascii_case("udp") {
            return;
        }

        // rtcp-mux is mandatory, RTCP candidates are never used
        if candidate.component != 1 {
            log::debug!("Discard remote candidate with unsupported component candidate:{candidate}");
            return;
        }

        if !self.filter.allow_remote(kind) {
            log::debug!("Discard filtered remote candidate candidate:{candidate}");
            return;
        }

        let Ok(priority) = u32::try_from(candidate.priority) else {
            log::warn!("Candidate has priority larger than u32::MAX");
            return;
        };

        let ip = match candidate.address {
            UntaggedAddress::Fqdn(..) => return,
            UntaggedAddress::IpAddress(ip_addr) => ip_addr,
        };

        let addr = SocketAddr::new(ip, candidate.port);

        if self.remote_candidates.values().any(|c| c.addr == addr) {
            return;
        }

        let related = match (&candidate.rel_addr, candidate.rel_port) {
            (Some(UntaggedAddress::IpAddress(ip)), Some(port)) => Some(SocketAddr::new(*ip, port)),
            _ => None,
        };

        self.remote_candidates.insert(Candidate {
            addr,
            kind,
            priority,
            foundation: candidate.foundation.to_string(),
            base: addr,
            related,
            relay: None,
        });

        self.form_pairs();
    }

    /// Returns if the local candidate may be used for connectivity checks
    fn is_pairable_local(&self, candidate: &Candidate) -> bool {
        // Reflexive candidates are checked through their base
        matches!(candidate.kind, CandidateKind::Host | CandidateKind::Relayed)
            && self.filter.allow_local(candidate.kind)
    }

    fn form_pairs(&mut self) {
        for (local_id, local_candidate) in &self.local_candidates {
            if !self.is_pairable_local(local_candidate) {
                continue;
            }

            for (remote_id, remote_candidate) in &self.remote_candidates {
                // Remote peer-reflexive candidates are not paired here
                if remote_candidate.kind == CandidateKind::PeerReflexive {
                    continue;
                }

                if !self.filter.allow_remote(remote_candidate.kind) {
                    continue;
                }

                // Exclude pairs with different ip version
                match (local_candidate.addr.ip(), remote_candidate.addr.ip()) {
                    (IpAddr::V4(l), IpAddr::V4(r)) if l.is_link_local() == r.is_link_local() => {
                        /* ok */
                    }
                    // Only pair IPv6 addresses when either both or neither are link local addresses
                    (IpAddr::V6(l), IpAddr::V6(r))
                        if l.is_unicast_link_local() == r.is_unicast_link_local() =>
                    { /* ok */ }
                    _ => {
                        // Would make an invalid pair, skip
                        continue;
                    }
                }

                Self::add_candidate_pair(
                    local_id,
                    local_candidate,
                    remote_id,
                    remote_candidate,
                    self.is_controlling,
                    &mut self.pairs,
                    false,
                );
            }
        }

        self.prune_pairs();
    }

    fn add_candidate_pair(
        local_id: LocalCandidateId,
        local_candidate: &Candidate,
        remote_id: RemoteCandidateId,
        remote_candidate: &Candidate,
        is_controlling: bool,
        pairs: &mut Vec<CandidatePair>,
        received_use_candidate: bool,
    ) {
        if pairs
            .iter()
            .any(|p| p.local == local_id && p.remote == remote_id)
        {
            // pair already exists
            return;
        }

        let priority = pair_priority(local_candidate, remote_candidate, is_controlling);

        log::debug!(
            "add pair {}, priority: {priority}",
            DisplayPair(local_candidate, remote_candidate),
        );

        pairs.push(CandidatePair {
            local: local_id,
            remote: remote_id,
            priority,
            state: CandidatePairState::Waiting,
            received_use_candidate,
        });
        pairs.sort_by_key(|p| Reverse(p.priority));
    }

    fn recompute_pair_priorities(&mut self) {
        for pair in &mut self.pairs {
            pair.priority = pair_priority(
                &self.local_candidates[pair.local],
                &self.remote_candidates[pair.remote],
                self.is_controlling,
            );
        }

        self.pairs.sort_by_key(|p| Reverse(p.priority));
    }

    /// Prune the lowest priority waiting pairs until `max_pairs` is reached
    fn prune_pairs(&mut self) {
        while self.pairs.len() > self.config.max_pairs {
            let Some(position) = self
                .pairs
                .iter()
                .rposition(|p| p.state == CandidatePairState::Waiting)
            else {
                break;
            };

            let pair = self.pairs.remove(position);

            log::debug!(
                "Pruned pair {}",
                DisplayPair(
                    &self.local_candidates[pair.local],
                    &self.remote_candidates[pair.remote]
                )
            );
        }
    }

    /// Receive a datagram for this ICE agent
    ///
    /// STUN & TURN traffic is consumed, everything else (e.g. DTLS or RTP) is returned. Data relayed through a TURN
    /// server is returned with the peer as source and the relayed address as destination.
    pub fn receive(&mut self, now: Instant, pkt: ReceivedPkt) -> Option<ReceivedPkt> {
        let turn_session = self
            .turn_sessions
            .iter()
            .find(|(_, s)| s.server().addr == pkt.source && !s.server().transport.is_stream())
            .map(|(id, _)| id);

        // A STUN and TURN server may share an address, binding responses are matched by transaction
        if let Some(id) = turn_session
            && !self.is_stun_server_response(&pkt.data)
        {
            self.turn_sessions[id].receive(now, &self.config, &pkt.data);
            return self.drain_turn_events(now).pop();
        }

        if matches!(is_stun_message(&pkt.data), IsStunMessageInfo::Yes { .. }) {
            self.receive_stun_datagram(now, pkt.source, pkt.destination, pkt.data);
            self.drain_turn_events(now);
            None
        } else {
            Some(pkt)
        }
    }

    /// Receive bytes from the stream connection to a TURN server
    pub fn receive_stream(&mut self, now: Instant, server: SocketAddr, data: &[u8]) -> Vec<ReceivedPkt> {
        let Some(session) = self
            .turn_sessions
            .values_mut()
            .find(|s| s.server().addr == server && s.server().transport.is_stream())
        else {
            log::trace!("Received stream data from unknown TURN server {server}");
            return vec![];
        };

        session.receive_stream(now, &self.config, data);

        self.drain_turn_events(now)
    }

    /// The stream connection to a TURN server failed or was closed
    pub fn stream_failed(&mut self, now: Instant, server: SocketAddr) {
        for session in self.turn_sessions.values_mut() {
            if session.server().addr == server && session.server().transport.is_stream() {
                session.stream_failed("connection failed");
            }
        }

        self.drain_turn_events(now);
    }

    fn is_stun_server_response(&self, data: &[u8]) -> bool {
        if self.stun_servers.is_empty() {
            return false;
        }

        Message::parse(data).is_ok_and(|msg| {
            self.stun_servers
                .iter()
                .any(|s| s.wants_stun_response(msg.transaction_id()))
        })
    }

    fn receive_stun_datagram(
        &mut self,
        now: Instant,
        source: SocketAddr,
        destination: SocketAddr,
        data: Vec<u8>,
    ) {
        let mut stun_msg = match Message::parse(data) {
            Ok(stun_msg) => stun_msg,
            Err(e) => {
                log::debug!("Failed to parse stun message {e}");
                return;
            }
        };

        // Check our stun server binding checks before verifying integrity since these aren't authenticated
        if matches!(stun_msg.class(), Class::Success | Class::Error) {
            let binding = self
                .stun_servers
                .iter_mut()
                .find(|b| b.wants_stun_response(stun_msg.transaction_id()));

            if let Some(binding) = binding {
                if stun_msg.class() == Class::Error {
                    log::debug!("STUN server {} responded with an error", binding.server());
                    return;
                }

                if let Some(addr) = binding.receive_stun_response(now, &self.config, &mut stun_msg)
                    && let Some(base) = self.host_base(destination)
                {
                    self.add_local_candidate(
                        CandidateKind::ServerReflexive,
                        base,
                        addr,
                        Some(base),
                        None,
                    );
                }

                return;
            }
        }

        let passed_fingerprint_check = stun_msg
            .attribute::<Fingerprint>()
            .is_some_and(|r| r.is_ok());

        if !passed_fingerprint_check {
            log::trace!(
                "Incoming STUN {:?} failed fingerprint check, discarding",
                stun_msg.class()
            );
            return;
        }

        let pkt = ReceivedPkt {
            data: stun_msg,
            source,
            destination,
        };

        self.receive_stun(now, pkt);
    }

    /// Find the host candidate a packet was received on. Sockets bound to an unspecified address
    /// report it as destination, in that case the port is matched.
    fn host_base(&self, destination: SocketAddr) -> Option<SocketAddr> {
        let hosts = || {
            self.local_candidates
                .values()
                .filter(|c| c.kind == CandidateKind::Host)
        };

        hosts()
            .find(|c| c.addr == destination)
            .or_else(|| {
                hosts().find(|c| {
                    c.addr.port() == destination.port()
                        && c.addr.is_ipv4() == destination.is_ipv4()
                })
            })
            .or_else(|| hosts().find(|c| c.addr.is_ipv4() == destination.is_ipv4()))
            .map(|c| c.base)
    }

    fn receive_stun(&mut self, now: Instant, pkt: ReceivedPkt<Message>) {
        match pkt.data.class() {
            Class::Request => self.receive_stun_request(now, pkt),
            Class::Indication => { /* ignore */ }
            Class::Success => self.receive_stun_success(now, pkt),
            Class::Error => self.receive_stun_error(pkt),
        }
    }

    fn receive_stun_success(&mut self, now: Instant, mut pkt: ReceivedPkt<Message>) {
        // Store messages later if the remote credentials aren't set yet
        let Some(remote_credentials) = &self.remote_credentials else {
            self.backlog.push(pkt);
            return;
        };

        if !stun::verify_integrity(&self.local_credentials, remote_credentials, &mut pkt.data) {
            log::debug!("Incoming stun success failed the integrity check, discarding");
            return;
        }

        let Some(pair) = self
            .pairs
            .iter_mut()
            .find(|p| {
                matches!(p.state, CandidatePairState::InProgress { transaction_id, .. } if pkt.data.transaction_id() == transaction_id)
            }) else {
                log::debug!("Failed to find transaction for STUN success, discarding");
                return;
            };

        let CandidatePairState::InProgress { target, .. } = &pair.state else {
            unreachable!()
        };

        // The source of the response must equal the destination of the request, otherwise the pair failed
        if pkt.source != *target {
            log::debug!(
                "got success response with invalid source address for pair {}",
                DisplayPair(
                    &self.local_candidates[pair.local],
                    &self.remote_candidates[pair.remote]
                )
            );

            pair.state = CandidatePairState::Failed;
            return;
        }

        log::debug!(
            "got success response for pair {}",
            DisplayPair(
                &self.local_candidates[pair.local],
                &self.remote_candidates[pair.remote],
            ),
        );

        pair.state = CandidatePairState::Succeeded;

        let local_id = pair.local;
        let remote_id = pair.remote;

        // Controlling agents nominate every check, the controlled one waits for the peer's nomination
        let nominated = self.is_controlling || pair.received_use_candidate;

        // Check if we discover a new peer-reflexive candidate here
        let local_candidate = &self.local_candidates[local_id];

        if local_candidate.kind == CandidateKind::Host {
            if let Some(Ok(mapped_addr)) = pkt.data.attribute::<XorMappedAddress>() {
                let base = local_candidate.base;

                if mapped_addr.0 != local_candidate.addr
                    && self.filter.allow_local(CandidateKind::PeerReflexive)
                {
                    self.add_local_candidate(
                        CandidateKind::PeerReflexive,
                        base,
                        mapped_addr.0,
                        Some(base),
                        None,
                    );
                }
            } else {
                log::trace!("no (valid) XOR-MAPPED-ADDRESS attribute in STUN success response");
            }
        }

        if nominated {
            self.select(now, local_id, remote_id);
        }
    }

    fn receive_stun_error(&mut self, mut pkt: ReceivedPkt<Message>) {
        let Some(remote_credentials) = &self.remote_credentials else {
            self.backlog.push(pkt);
            return;
        };

        if !stun::verify_integrity(&self.local_credentials, remote_credentials, &mut pkt.data) {
            log::debug!("Incoming stun error response failed the integrity check, discarding");
            return;
        }

        let Some(pair) = self
            .pairs
            .iter_mut()
            .find(|p| {
                matches!(p.state, CandidatePairState::InProgress { transaction_id, .. } if pkt.data.transaction_id() == transaction_id)
            }) else {
                log::debug!("Failed to find transaction for STUN error, discarding");
                return;
            };

        let error_code = match pkt.data.attribute::<ErrorCode>() {
            Some(Ok(error_code)) => error_code.number,
            _ => {
                log::debug!("STUN error response without a valid ERROR-CODE");
                pair.state = CandidatePairState::Failed;
                return;
            }
        };

        log::debug!("Candidate pair failed with code={error_code}");

        // If the Binding request generates a 487 (Role Conflict) error response,
        // and if the ICE agent included an ICE-CONTROLLED attribute in the request,
        // the agent MUST switch to the controlling role.
        // If the agent included an ICE-CONTROLLING attribute in the request, the agent MUST switch to the controlled role.
        if error_code == stun::ROLE_CONFLICT {
            // Once the agent has switched its role, the agent MUST add the
            // candidate pair whose check generated the 487 error response to the
            // triggered-check queue associated with the checklist to which the pair
            // belongs, and set the candidate pair state to Waiting.
            pair.state = CandidatePairState::Waiting;
            self.triggered_check_queue
                .push_back((pair.local, pair.remote));

            // The error carries the role the peer keeps
            if pkt.data.attribute::<IceControlling>().is_some() {
                self.set_controlling(false);
            } else if pkt.data.attribute::<IceControlled>().is_some() {
                self.set_controlling(true);
            }
        } else {
            pair.state = CandidatePairState::Failed;
        }
    }

    fn receive_stun_request(&mut self, now: Instant, mut pkt: ReceivedPkt<Message>) {
        let Some(remote_credentials) = &self.remote_credentials else {
            self.backlog.push(pkt);
            return;
        };

        if !stun::verify_integrity(&self.local_credentials, remote_credentials, &mut pkt.data) {
            log::debug!("Incoming stun request failed the integrity check, discarding");
            return;
        }

        let Some(local_id) = self.local_candidate_for(pkt.destination) else {
            log::debug!(
                "Failed to find matching local candidate for incoming STUN request ({})",
                pkt.destination
            );
            return;
        };

        let Some(Ok(priority)) = pkt.data.attribute::<Priority>() else {
            log::debug!("Incoming stun request did not contain PRIORITY attribute");
            return;
        };
        let priority = priority.0;

        let use_candidate = pkt.data.attribute::<UseCandidate>().is_some();

        // Detect and handle role conflict
        if self.is_controlling {
            if let Some(Ok(ice_controlling)) = pkt.data.attribute::<IceControlling>() {
                if self.control_tie_breaker >= ice_controlling.0 {
                    let response = stun::make_role_error(
                        pkt.data.transaction_id(),
                        &self.local_credentials,
                        pkt.source,
                        true,
                        self.control_tie_breaker,
                    );

                    self.send_from(local_id, pkt.source, response);
                    return;
                } else {
                    self.set_controlling(false);
                }
            }
        } else if let Some(Ok(ice_controlled)) = pkt.data.attribute::<IceControlled>() {
            if self.control_tie_breaker >= ice_controlled.0 {
                let response = stun::make_role_error(
                    pkt.data.transaction_id(),
                    &self.local_credentials,
                    pkt.source,
                    false,
                    self.control_tie_breaker,
                );

                self.send_from(local_id, pkt.source, response);
                return;
            } else {
                self.set_controlling(true);
            }
        }

        let matching_remote_candidate = self
            .remote_candidates
            .iter()
            .find(|(_, c)| c.addr == pkt.source);

        let remote_id = match matching_remote_candidate {
            Some((remote, _)) => remote,
            None => {
                if !self.filter.allow_remote(CandidateKind::PeerReflexive) {
                    log::debug!("Ignoring check from unknown address {}", pkt.source);
                    return;
                }

                // No remote candidate with the source ip addr, create new peer-reflexive candidate
                self.remote_candidates.insert(Candidate {
                    addr: pkt.source,
                    kind: CandidateKind::PeerReflexive,
                    priority,
                    foundation: "~".into(),
                    base: pkt.source,
                    related: None,
                    relay: None,
                })
            }
        };

        // Pair it with the local candidate
        Self::add_candidate_pair(
            local_id,
            &self.local_candidates[local_id],
            remote_id,
            &self.remote_candidates[remote_id],
            self.is_controlling,
            &mut self.pairs,
            false,
        );

        let pair = self
            .pairs
            .iter_mut()
            .find(|p| p.local == local_id && p.remote == remote_id)
            .expect("pair was added above or already existed");

        pair.received_use_candidate |= use_candidate;

        log::trace!(
            "got connectivity check for pair {}",
            DisplayPair(
                &self.local_candidates[pair.local],
                &self.remote_candidates[pair.remote],
            )
        );

        // Triggered check, unless the agent is done checking
        if self.selected.is_none() {
            match pair.state {
                CandidatePairState::Waiting => {
                    self.triggered_check_queue.push_back((local_id, remote_id));
                }
                CandidatePairState::Failed => {
                    pair.state = CandidatePairState::Waiting;
                    self.triggered_check_queue.push_back((local_id, remote_id));
                }
                CandidatePairState::InProgress { .. } | CandidatePairState::Succeeded => {}
            }
        }

        let nominate = !self.is_controlling
            && pair.received_use_candidate
            && pair.state == CandidatePairState::Succeeded;

        let stun_response = stun::make_success_response(
            pkt.data.transaction_id(),
            &self.local_credentials,
            pkt.source,
        );

        self.send_from(local_id, pkt.source, stun_response);

        if nominate {
            self.select(now, local_id, remote_id);
        }
    }

    /// Find the local candidate a check was received on
    fn local_candidate_for(&self, destination: SocketAddr) -> Option<LocalCandidateId> {
        let candidates = || {
            self.local_candidates
                .iter()
                .filter(|(_, c)| self.is_pairable_local(c))
        };

        candidates()
            .find(|(_, c)| c.addr == destination)
            .or_else(|| {
                candidates().find(|(_, c)| {
                    c.kind == CandidateKind::Host
                        && c.addr.port() == destination.port()
                        && c.addr.is_ipv4() == destination.is_ipv4()
                        && destination.ip().is_unspecified()
                })
            })
            .map(|(id, _)| id)
    }

    /// Select the pair, the first selection is final
    fn select(&mut self, now: Instant, local_id: LocalCandidateId, remote_id: RemoteCandidateId) {
        if self.selected.is_some() || self.selected_lost {
            return;
        }

        let local = &self.local_candidates[local_id];
        let remote = &self.remote_candidates[remote_id];

        log::debug!("selected pair {}", DisplayPair(local, remote));

        let selected = SelectedPair {
            local: local.kind,
            remote: remote.kind,
            local_addr: local.addr,
            remote_addr: remote.addr,
        };

        // Relayed data uses a channel once it is bound
        if let Some(session) = local.relay.and_then(|id| self.turn_sessions.get_mut(id)) {
            session.bind_channel(now, &self.config, remote.addr);
        }

        self.selected = Some(Selection {
            local: local_id,
            remote: remote_id,
        });
        self.triggered_check_queue.clear();
        self.events.push_back(IceEvent::Selected(selected));
    }

    /// Send data to the peer using the selected candidate pair
    pub fn send(&mut self, now: Instant, data: Vec<u8>) -> Result<(), NotConnected> {
        if self.selected_lost {
            return Err(NotConnected);
        }

        let selection = self.selected.ok_or(NotConnected)?;
        let target = self.remote_candidates[selection.remote].addr;

        self.send_from(selection.local, target, data);
        self.drain_turn_events(now);

        Ok(())
    }

    /// Send data from the local candidate, relayed candidates send through their TURN server
    fn send_from(&mut self, local_id: LocalCandidateId, target: SocketAddr, data: Vec<u8>) {
        let local = &self.local_candidates[local_id];

        match local.relay {
            Some(turn_id) => {
                if let Some(session) = self.turn_sessions.get_mut(turn_id) {
                    session.send_to(target, &data);
                }
            }
            None => self.events.push_back(IceEvent::SendData {
                data,
                source: Some(local.base.ip()),
                target,
            }),
        }
    }

    /// Release all TURN allocations and stop gathering
    pub fn shutdown(&mut self, now: Instant) {
        for session in self.turn_sessions.values_mut() {
            session.shutdown();
        }

        self.stun_servers.clear();
        self.triggered_check_queue.clear();

        self.drain_turn_events(now);
    }

    /// Drive the ICE agent forward. This must be called after the duration returned by [`timeout`](IceAgent::timeout).
    pub fn poll(&mut self, now: Instant) {
        // Progress all STUN-server bindings (used to create and maintain server-reflexive candidates)
        for stun_server_bindings in &mut self.stun_servers {
            stun_server_bindings.poll(now, &self.config, |event| self.events.push_back(event));
        }

        for session in self.turn_sessions.values_mut() {
            session.poll(now, &self.config);
        }

        if self.remote_credentials.is_some() {
            for pkt in take(&mut self.backlog) {
                self.receive_stun(now, pkt);
            }
        }

        self.poll_permissions(now);
        self.poll_retransmit(now);
        self.drain_turn_events(now);
        self.poll_state();

        // Skip anything beyond this before we received the remote credentials & candidates
        let Some(remote_credentials) = &self.remote_credentials else {
            return;
        };

        // The selection is final, no more checks are required
        if self.selected.is_some() {
            return;
        }

        // Limit new checks to 1 per Ta
        if let Some(it) = self.last_ta_trigger
            && it + self.config.check_interval > now
        {
            return;
        }

        // If the triggered-check queue associated with the checklist
        // contains one or more candidate pairs, the agent removes the top
        // pair from the queue, performs a connectivity check on that pair,
        // puts the candidate pair state to In-Progress, and aborts the
        // subsequent steps.
        let mut position = None;

        while let Some((local_id, remote_id)) = self.triggered_check_queue.pop_front() {
            position = self.pairs.iter().position(|p| {
                p.local == local_id
                    && p.remote == remote_id
                    && p.state == CandidatePairState::Waiting
                    && self.is_checkable(p)
            });

            if position.is_some() {
                break;
            }
        }

        // If there are one or more candidate pairs in the Waiting state,
        // the agent picks the highest-priority candidate pair in the Waiting state,
        // performs a connectivity check on that pair, puts the candidate pair state to
        // In-Progress, and aborts the subsequent steps.
        let position = position.or_else(|| {
            self.pairs
                .iter()
                .position(|p| p.state == CandidatePairState::Waiting && self.is_checkable(p))
        });

        let Some(position) = position else {
            return;
        };

        self.last_ta_trigger = Some(now);

        let pair = &self.pairs[position];

        log::debug!(
            "start connectivity check for pair {}",
            DisplayPair(
                &self.local_candidates[pair.local],
                &self.remote_candidates[pair.remote]
            )
        );

        let transaction_id = TransactionId::random();

        let stun_request = stun::make_binding_request(
            transaction_id,
            &self.local_credentials,
            remote_credentials,
            &self.local_candidates[pair.local],
            self.is_controlling,
            self.control_tie_breaker,
        );

        let local_id = pair.local;
        let target = self.remote_candidates[pair.remote].addr;

        self.pairs[position].state = CandidatePairState::InProgress {
            transaction_id,
            stun_request: stun_request.clone(),
            retransmit_at: now + self.config.retransmit_delta(0),
            retransmits: 0,
            target,
        };

        self.send_from(local_id, target, stun_request);
        self.drain_turn_events(now);
    }

    /// Relayed pairs can only be checked once the TURN server permits traffic with the peer
    fn is_checkable(&self, pair: &CandidatePair) -> bool {
        match self.local_candidates[pair.local].relay {
            Some(turn_id) => self.turn_sessions.get(turn_id).is_some_and(|session| {
                session.has_permission(self.remote_candidates[pair.remote].addr.ip())
            }),
            None => true,
        }
    }

    /// Request TURN permissions for every peer paired with a relayed candidate
    fn poll_permissions(&mut self, now: Instant) {
        for pair in &mut self.pairs {
            let Some(turn_id) = self.local_candidates[pair.local].relay else {
                continue;
            };

            let Some(session) = self.turn_sessions.get_mut(turn_id) else {
                continue;
            };

            let peer = self.remote_candidates[pair.remote].addr.ip();

            if session.has_failed_permission(peer) {
                if pair.state == CandidatePairState::Waiting {
                    pair.state = CandidatePairState::Failed;
                }

                continue;
            }

            session.create_permission(now, &self.config, peer);
        }
    }

    /// Check all pending STUN transactions for pending retransmits
    fn poll_retransmit(&mut self, now: Instant) {
        let mut retransmits = vec![];

        for pair in &mut self.pairs {
            let CandidatePairState::InProgress {
                transaction_id: _,
                stun_request,
                retransmit_at,
                retransmits: attempts,
                target,
            } = &mut pair.state
            else {
                continue;
            };

            if *retransmit_at > now {
                continue;
            }

            if *attempts >= self.config.max_retransmits {
                log::debug!(
                    "connectivity check timed out for pair {}",
                    DisplayPair(
                        &self.local_candidates[pair.local],
                        &self.remote_candidates[pair.remote]
                    )
                );

                pair.state = CandidatePairState::Failed;
                continue;
            }

            *attempts += 1;
            *retransmit_at += self.config.retransmit_delta(*attempts);

            retransmits.push((pair.local, *target, stun_request.clone()));
        }

        for (local_id, target, stun_request) in retransmits {
            self.send_from(local_id, target, stun_request);
        }
    }

    /// Handle everything the TURN sessions emitted, returns application data relayed from peers
    fn drain_turn_events(&mut self, now: Instant) -> Vec<ReceivedPkt> {
        let mut received = vec![];

        loop {
            let mut handled_any = false;
            let ids: Vec<TurnId> = self.turn_sessions.keys().collect();

            for id in ids {
                while let Some(event) = self.turn_sessions[id].pop_event() {
                    handled_any = true;

                    if let Some(pkt) = self.handle_turn_event(now, id, event) {
                        received.push(pkt);
                    }
                }
            }

            if !handled_any {
                return received;
            }
        }
    }

    fn handle_turn_event(&mut self, now: Instant, id: TurnId, event: TurnEvent) -> Option<ReceivedPkt> {
        let server = self.turn_sessions[id].server();
        let server_addr = server.addr;
        let is_stream = server.transport.is_stream();

        match event {
            TurnEvent::Transmit(data) => {
                if is_stream {
                    self.events.push_back(IceEvent::SendStream {
                        server: server_addr,
                        data,
                    });
                } else {
                    self.events.push_back(IceEvent::SendData {
                        data,
                        source: None,
                        target: server_addr,
                    });
                }
            }
            TurnEvent::Allocated { relayed, mapped } => {
                // The mapped address of a stream connection is not usable for UDP
                if let Some(mapped) = mapped
                    && !is_stream
                    && let Some(base) = self.host_base(mapped)
                {
                    self.add_local_candidate(
                        CandidateKind::ServerReflexive,
                        base,
                        mapped,
                        Some(base),
                        None,
                    );
                }

                self.add_local_candidate(CandidateKind::Relayed, relayed, relayed, mapped, Some(id));
            }
            TurnEvent::Failed(error) => {
                log::debug!("TURN server {server_addr} failed, {error}");
                self.events.push_back(IceEvent::SourceFailed {
                    server: server_addr,
                    error,
                });
            }
            TurnEvent::PermissionCreated(_) => {
                // checks on the pair start with the next poll
            }
            TurnEvent::Expired => self.remove_relay(id),
            TurnEvent::Data { peer, data } => {
                let relayed = self.turn_sessions[id].relayed_addr()?;

                if matches!(is_stun_message(&data), IsStunMessageInfo::Yes { .. }) {
                    self.receive_stun_datagram(now, peer, relayed, data);
                } else {
                    return Some(ReceivedPkt {
                        data,
                        source: peer,
                        destination: relayed,
                    });
                }
            }
        }

        None
    }

    /// Remove the relayed candidate of an expired allocation and all its pairs
    fn remove_relay(&mut self, id: TurnId) {
        let server = self.turn_sessions[id].server().addr;

        let removed: Vec<LocalCandidateId> = self
            .local_candidates
            .iter()
            .filter(|(_, c)| c.relay == Some(id))
            .map(|(local_id, _)| local_id)
            .collect();

        self.pairs.retain(|p| !removed.contains(&p.local));
        self.triggered_check_queue
            .retain(|(local_id, _)| !removed.contains(local_id));

        if self
            .selected
            .is_some_and(|selection| removed.contains(&selection.local))
        {
            log::warn!("Relay of the selected pair on {server} expired");
            self.selected_lost = true;
        } else {
            for local_id in removed {
                self.local_candidates.remove(local_id);
            }
        }

        self.events.push_back(IceEvent::RelayExpired { server });
    }

    fn poll_state(&mut self) {
        // Check gathering state
        let all_completed = self.stun_servers.iter().all(|s| s.is_completed())
            && self.turn_sessions.values().all(|s| s.is_completed());

        if all_completed && self.gathering_state != IceGatheringState::Complete {
            self.events.push_back(IceEvent::GatheringStateChanged {
                old: self.gathering_state,
                new: IceGatheringState::Complete,
            });

            self.gathering_state = IceGatheringState::Complete;
        } else if !all_completed && self.gathering_state != IceGatheringState::Gathering {
            self.events.push_back(IceEvent::GatheringStateChanged {
                old: self.gathering_state,
                new: IceGatheringState::Gathering,
            });

            self.gathering_state = IceGatheringState::Gathering;
        }

        // Check connection state
        let still_possible = self.pairs.iter().any(|pair| {
            matches!(
                pair.state,
                CandidatePairState::Waiting | CandidatePairState::InProgress { .. }
            )
        });

        if self.selected_lost {
            self.set_connection_state(IceConnectionState::Failed);
        } else if self.selected.is_some() {
            self.set_connection_state(IceConnectionState::Connected);
        } else if still_possible {
            self.set_connection_state(IceConnectionState::Checking);
        } else if self.gathering_state == IceGatheringState::Complete
            && (!self.pairs.is_empty() || self.nothing_to_pair())
        {
            self.set_connection_state(IceConnectionState::Failed);
        }
    }

    /// The peer signaled all its candidates and none of them could be paired
    fn nothing_to_pair(&self) -> bool {
        self.remote_credentials.is_some() && self.remote_end_of_candidates && self.pairs.is_empty()
    }

    fn set_connection_state(&mut self, new: IceConnectionState) {
        if self.connection_state != new {
            log::debug!("ICE connection state {:?} -> {new:?}", self.connection_state);

            self.events.push_back(IceEvent::ConnectionStateChanged {
                old: self.connection_state,
                new,
            });
            self.connection_state = new;
        }
    }

    /// Returns the next event to process
    ///
    /// This must be called until it returns None
    pub fn pop_event(&mut self) -> Option<IceEvent> {
        self.events.pop_front()
    }

    /// Returns a duration after which to call [`poll`](IceAgent::poll)
    pub fn timeout(&self, now: Instant) -> Option<Duration> {
        if self.remote_credentials.is_some() && !self.backlog.is_empty() {
            return Some(Duration::ZERO);
        }

        // Next TA trigger
        let has_pending_checks = self.selected.is_none()
            && self
                .pairs
                .iter()
                .any(|p| p.state == CandidatePairState::Waiting);

        let ta = if self.remote_credentials.is_some() && has_pending_checks {
            Some(
                self.last_ta_trigger
                    .map(|it| (it + self.config.check_interval).saturating_duration_since(now))
                    .unwrap_or_default(),
            )
        } else {
            None
        };

        let retransmits = self.pairs.iter().filter_map(|p| match &p.state {
            CandidatePairState::InProgress { retransmit_at, .. } => {
                Some(retransmit_at.saturating_duration_since(now))
            }
            _ => None,
        });

        // Next stun binding refresh/retransmit
        let stun_bindings = self.stun_servers.iter().filter_map(|b| b.timeout(now));
        let turn_sessions = self.turn_sessions.values().filter_map(|s| s.timeout(now));

        ta.into_iter()
            .chain(retransmits)
            .chain(stun_bindings)
            .chain(turn_sessions)
            .min()
    }

    /// Returns all local candidates to signal to the peer, does not include peer-reflexive candidates
    pub fn ice_candidates(&self) -> Vec<IceCandidate> {
        self.local_candidates
            .values()
            .filter(|c| c.kind != CandidateKind::PeerReflexive && self.filter.allow_local(c.kind))
            .map(Candidate::to_sdp)
            .collect()
    }

    /// Returns all visible candidates of the given side & kind
    pub fn candidates(&self, side: Side, kind: CandidateKind) -> Vec<IceCandidate> {
        let (candidates, allowed): (Vec<&Candidate>, bool) = match side {
            Side::Local => (
                self.local_candidates.values().collect(),
                self.filter.allow_local(kind),
            ),
            Side::Remote => (
                self.remote_candidates.values().collect(),
                self.filter.allow_remote(kind),
            ),
        };

        if !allowed {
            return vec![];
        }

        candidates
            .into_iter()
            .filter(|c| c.kind == kind)
            .map(Candidate::to_sdp)
            .collect()
    }

    /// Returns the number of visible candidates of the given side & kind
    pub fn candidate_count(&self, side: Side, kind: CandidateKind) -> usize {
        self.candidates(side, kind).len()
    }
}
