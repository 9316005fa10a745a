use common::{FakeServer, PASSWORD, Peer, Sim, USERNAME};
use mediaflow::{
    CandidateKind, CloseReason, Error, MediaflowEvent, Side, TurnServer, TurnTransport,
};
use std::time::Duration;
use stun_types::attributes::ErrorCode;

mod common;

const TURN: &str = "198.51.100.1:3478";
const OTHER_TURN: &str = "198.51.100.2:3478";

fn turn(server: &str) -> TurnServer {
    TurnServer::new(common::addr(server), TurnTransport::Udp, USERNAME, PASSWORD)
}

fn relay_only_peer(host: &str, servers: &[&str]) -> Peer {
    Peer::new(host, |config| {
        config.privacy = true;
        config.turn_servers = servers.iter().map(|server| turn(server)).collect();
    })
}

fn local_candidates(peer: &Peer) -> Vec<&str> {
    peer.events
        .iter()
        .filter_map(|event| match event {
            MediaflowEvent::LocalCandidate(candidate) => Some(candidate.as_str()),
            _ => None,
        })
        .collect()
}

#[test]
fn turn_allocation_yields_relayed_and_reflexive_candidates() {
    let mut sim = Sim::new(
        vec![Peer::new("10.0.0.1:5000", |config| config.turn_servers = vec![turn(TURN)])],
        vec![FakeServer::new(TURN)],
    );

    assert!(!sim.peers[0].flow.is_gathered());
    assert!(sim.run_until(Duration::from_secs(5), |sim| sim.peers[0].flow.is_gathered()));

    let flow = &sim.peers[0].flow;
    assert_eq!(flow.candidate_count(Side::Local, CandidateKind::Host), 1);
    assert_eq!(flow.candidate_count(Side::Local, CandidateKind::ServerReflexive), 1);
    assert_eq!(flow.candidate_count(Side::Local, CandidateKind::Relayed), 1);

    let relayed = sim.servers[0].allocations[0].relayed;
    let candidates = local_candidates(&sim.peers[0]);
    assert_eq!(candidates.len(), 3);
    assert!(
        candidates
            .iter()
            .any(|c| c.contains(&format!("{} {} typ relay", relayed.ip(), relayed.port())))
    );

    assert_eq!(sim.peers[0].gathered_failures(), Some(0));
}

#[test]
fn stun_server_yields_reflexive_candidate() {
    let mut sim = Sim::new(
        vec![Peer::new("10.0.0.1:5000", |config| {
            config.stun_servers = vec![common::addr(TURN)]
        })],
        vec![FakeServer::new(TURN)],
    );

    assert!(sim.run_until(Duration::from_secs(5), |sim| sim.peers[0].flow.is_gathered()));

    let flow = &sim.peers[0].flow;
    assert_eq!(flow.candidate_count(Side::Local, CandidateKind::ServerReflexive), 1);
    assert_eq!(flow.candidate_count(Side::Local, CandidateKind::Relayed), 0);
    assert_eq!(sim.servers[0].requests, 1);
}

#[test]
fn turn_over_tcp() {
    let mut sim = Sim::new(
        vec![Peer::new("10.0.0.1:5000", |config| config.privacy = true)],
        vec![FakeServer::new(TURN)],
    );

    sim.a()
        .flow
        .gather_turn_tcp(common::addr(TURN), false, USERNAME, PASSWORD);

    assert!(sim.run_until(Duration::from_secs(5), |sim| sim.peers[0].flow.is_gathered()));

    let flow = &sim.peers[0].flow;
    assert_eq!(flow.candidate_count(Side::Local, CandidateKind::Relayed), 1);
    // the mapped address of a stream is not usable for UDP
    assert_eq!(flow.candidate_count(Side::Local, CandidateKind::ServerReflexive), 0);
    assert_eq!(sim.peers[0].closed(), None);
}

#[test]
fn privacy_only_signals_relayed_candidates() {
    let mut sim = Sim::new(
        vec![
            relay_only_peer("10.0.0.1:5000", &[TURN]),
            relay_only_peer("10.0.0.2:5000", &[TURN]),
        ],
        vec![FakeServer::new(TURN)],
    );

    sim.establish();

    for peer in &sim.peers {
        let flow = &peer.flow;
        assert!(flow.privacy());

        assert_eq!(flow.candidate_count(Side::Local, CandidateKind::Relayed), 1);
        assert_eq!(flow.candidate_count(Side::Local, CandidateKind::Host), 0);
        assert_eq!(flow.candidate_count(Side::Local, CandidateKind::ServerReflexive), 0);
        assert_eq!(flow.candidate_count(Side::Local, CandidateKind::PeerReflexive), 0);
        assert_eq!(flow.candidate_count(Side::Remote, CandidateKind::Relayed), 1);
        assert_eq!(flow.candidate_count(Side::Remote, CandidateKind::Host), 0);
        assert_eq!(flow.candidate_count(Side::Remote, CandidateKind::ServerReflexive), 0);
        assert_eq!(flow.candidate_count(Side::Remote, CandidateKind::PeerReflexive), 0);

        let candidates = local_candidates(peer);
        assert!(!candidates.is_empty());
        assert!(candidates.iter().all(|c| c.contains("typ relay")));
        assert!(!candidates.iter().any(|c| c.contains("typ prflx")));

        let established = peer.established().unwrap();
        assert_eq!(established.local, CandidateKind::Relayed);
        assert_eq!(established.remote, CandidateKind::Relayed);
    }
}

#[test]
fn without_privacy_host_and_relayed_candidates_are_signaled() {
    let turn_peer = |host| Peer::new(host, |config| config.turn_servers = vec![turn(TURN)]);

    let mut sim = Sim::new(
        vec![turn_peer("10.0.0.1:5000"), turn_peer("10.0.0.2:5000")],
        vec![FakeServer::new(TURN)],
    );

    sim.establish();

    for peer in &sim.peers {
        let flow = &peer.flow;
        assert!(!flow.privacy());

        assert_eq!(flow.candidate_count(Side::Local, CandidateKind::Host), 1);
        assert_eq!(flow.candidate_count(Side::Local, CandidateKind::Relayed), 1);
        assert_eq!(flow.candidate_count(Side::Remote, CandidateKind::Host), 1);
        assert_eq!(flow.candidate_count(Side::Remote, CandidateKind::Relayed), 1);

        let candidates = local_candidates(peer);
        assert!(candidates.iter().any(|c| c.contains("typ host")));
        assert!(candidates.iter().any(|c| c.contains("typ relay")));
    }
}

#[test]
fn privacy_without_relay_has_no_usable_candidates() {
    let mut sim = Sim::new(vec![relay_only_peer("10.0.0.1:5000", &[])], vec![]);

    assert!(sim.run_until(Duration::from_secs(5), |sim| sim.peers[0].closed().is_some()));
    assert_eq!(sim.peers[0].closed(), Some(CloseReason::NoUsableCandidates));
    assert_eq!(sim.peers[0].gathered_failures(), None);

    let now = sim.now;
    assert!(matches!(
        sim.a().flow.send_rtp(now, &[0x80, 96, 0, 1, 0, 0, 0, 0, 0, 0, 0, 1]),
        Err(Error::NoUsableCandidates)
    ));
}

#[test]
fn failed_turn_server_does_not_fail_gathering() {
    let mut sim = Sim::new(
        vec![
            relay_only_peer("10.0.0.1:5000", &[OTHER_TURN, TURN]),
            relay_only_peer("10.0.0.2:5000", &[TURN]),
        ],
        vec![
            FakeServer::new(TURN),
            FakeServer::rejecting(OTHER_TURN, ErrorCode::ALLOCATION_QUOTA_REACHED),
        ],
    );

    sim.establish();

    let failed = sim.peers[0]
        .events
        .iter()
        .find_map(|event| match event {
            MediaflowEvent::Gathered { failed } => Some(failed),
            _ => None,
        })
        .unwrap();

    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].0, common::addr(OTHER_TURN));
    assert!(matches!(&failed[0].1, Error::AllocationFailed(reason) if reason.contains("486")));

    assert_eq!(
        sim.peers[0].flow.candidate_count(Side::Local, CandidateKind::Relayed),
        1
    );
    assert_eq!(sim.peers[0].established().unwrap().local, CandidateKind::Relayed);
    assert_eq!(sim.peers[1].gathered_failures(), Some(0));
}

#[test]
fn is_gathered_does_not_send_requests() {
    let mut sim = Sim::new(
        vec![Peer::new("10.0.0.1:5000", |config| config.turn_servers = vec![turn(TURN)])],
        vec![FakeServer::new(TURN)],
    );

    // queried before the first poll, must not start gathering
    for _ in 0..10 {
        assert!(!sim.peers[0].flow.is_gathered());
    }
    assert!(!sim.peers[0].flow.has_events());

    assert!(sim.run_until(Duration::from_secs(5), |sim| sim.peers[0].flow.is_gathered()));
    let requests = sim.servers[0].requests;

    for _ in 0..10 {
        assert!(sim.peers[0].flow.is_gathered());
    }

    sim.flush();
    assert_eq!(sim.servers[0].requests, requests);

    let gathered = sim.peers[0]
        .events
        .iter()
        .filter(|event| matches!(event, MediaflowEvent::Gathered { .. }))
        .count();
    assert_eq!(gathered, 1);
}

#[test]
fn local_end_of_candidates_skips_waiting() {
    let mut sim = Sim::new(
        // nothing answers on this server, gathering alone would never complete in time
        vec![Peer::new("10.0.0.1:5000", |config| {
            config.turn_servers = vec![turn("203.0.113.99:3478")]
        })],
        vec![],
    );

    sim.a().flow.set_local_eoc();
    assert!(sim.peers[0].flow.is_gathered());

    assert!(sim.run_until(Duration::from_secs(1), |sim| {
        sim.peers[0].gathered_failures().is_some()
    }));
}

#[test]
fn local_end_of_candidates_waits_for_relay_under_privacy() {
    let mut sim = Sim::new(
        vec![relay_only_peer("10.0.0.1:5000", &[TURN])],
        vec![FakeServer::new(TURN)],
    );

    // nothing is visible yet, the allocation is still pending
    sim.a().flow.set_local_eoc();

    assert!(sim.run_until(Duration::from_secs(5), |sim| {
        sim.peers[0].gathered_failures().is_some()
    }));

    assert_eq!(sim.peers[0].closed(), None);
    assert_eq!(
        sim.peers[0].flow.candidate_count(Side::Local, CandidateKind::Relayed),
        1
    );
}

#[test]
fn close_releases_allocation() {
    let mut sim = Sim::new(
        vec![relay_only_peer("10.0.0.1:5000", &[TURN])],
        vec![FakeServer::new(TURN)],
    );

    assert!(sim.run_until(Duration::from_secs(5), |sim| sim.peers[0].flow.is_gathered()));
    assert_eq!(sim.servers[0].allocations.len(), 1);

    let now = sim.now;
    sim.a().flow.close(now);
    sim.flush();

    assert!(sim.servers[0].allocations.is_empty());
    assert_eq!(sim.peers[0].closed(), Some(CloseReason::Normal));
}
