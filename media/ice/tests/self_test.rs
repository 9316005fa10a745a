use mediaflow_ice::{
    CandidateKind, IceAgent, IceConfig, IceConnectionState, IceCredentials, IceEvent, ReceivedPkt,
    SelectedPair, Side,
};
use std::{mem::take, net::SocketAddr, time::Instant};

fn create_pair(a_controlling: bool, b_controlling: bool) -> (IceAgent, IceAgent) {
    let a = IceCredentials::random();
    let b = IceCredentials::random();

    let mut a_agent = IceAgent::new(IceConfig::default(), a.clone(), a_controlling);
    let mut b_agent = IceAgent::new(IceConfig::default(), b.clone(), b_controlling);

    a_agent.set_remote_credentials(b);
    b_agent.set_remote_credentials(a);

    (a_agent, b_agent)
}

struct Packet {
    data: Vec<u8>,
    source: SocketAddr,
    destination: SocketAddr,
}

#[derive(Default)]
struct Peer {
    selected: Vec<SelectedPair>,
    received: Vec<Vec<u8>>,
}

fn add_hosts(a: &mut IceAgent, b: &mut IceAgent) {
    for addr in [
        "127.0.0.1",
        "192.168.178.10",
        "10.10.10.10",
        "10.127.10.10",
        "172.17.0.1",
    ] {
        a.add_host_addr(format!("{addr}:5555").parse().unwrap());
        b.add_host_addr(format!("{addr}:4444").parse().unwrap());
    }

    for c in a.ice_candidates() {
        b.add_remote_candidate(&c);
    }

    for c in b.ice_candidates() {
        a.add_remote_candidate(&c);
    }
}

/// Run both agents until they are connected, returns what each observed
fn run(a: &mut IceAgent, b: &mut IceAgent) -> (Peer, Peer) {
    let mut now = Instant::now();
    let mut a_peer = Peer::default();
    let mut b_peer = Peer::default();

    for _ in 0..1000 {
        if a.connection_state() == IceConnectionState::Connected
            && b.connection_state() == IceConnectionState::Connected
        {
            return (a_peer, b_peer);
        }

        a.poll(now);
        b.poll(now);

        let mut to_a = Vec::new();
        let mut to_b = Vec::new();

        while {
            poll_agent(now, a, 5555, &mut a_peer, &mut to_b, &mut to_a);
            poll_agent(now, b, 4444, &mut b_peer, &mut to_a, &mut to_b);

            !to_a.is_empty() || !to_b.is_empty()
        } {}

        let timeout = [a.timeout(now), b.timeout(now)].into_iter().flatten().min();
        now += timeout.expect("agents must have pending work until connected");
    }

    panic!("agents did not connect");
}

fn poll_agent(
    now: Instant,
    agent: &mut IceAgent,
    agent_port: u16,
    peer: &mut Peer,
    to_peer: &mut Vec<Packet>,
    from_peer: &mut Vec<Packet>,
) {
    for packet in take(from_peer) {
        let pkt = ReceivedPkt {
            data: packet.data,
            source: packet.source,
            destination: packet.destination,
        };

        if let Some(pkt) = agent.receive(now, pkt) {
            peer.received.push(pkt.data);
        }
    }

    while let Some(event) = agent.pop_event() {
        match event {
            IceEvent::SendData {
                data,
                source,
                target,
            } => {
                to_peer.push(Packet {
                    data,
                    source: SocketAddr::new(source.unwrap(), agent_port),
                    destination: target,
                });
            }
            IceEvent::Selected(pair) => peer.selected.push(pair),
            _ => {}
        }
    }
}

#[test]
fn same_network() {
    let _ = env_logger::try_init();
    let (mut a, mut b) = create_pair(true, false);
    add_hosts(&mut a, &mut b);

    let (a_peer, b_peer) = run(&mut a, &mut b);

    assert_eq!(a_peer.selected.len(), 1);
    assert_eq!(b_peer.selected.len(), 1);
    assert_eq!(a_peer.selected[0].local, CandidateKind::Host);
    assert_eq!(a_peer.selected[0].remote, CandidateKind::Host);
    assert_eq!(a.selected(), Some(a_peer.selected[0]));

    // peer reflexive candidates never appear when all addresses are known
    assert_eq!(a.candidate_count(Side::Remote, CandidateKind::PeerReflexive), 0);
    assert_eq!(b.candidate_count(Side::Remote, CandidateKind::PeerReflexive), 0);
}

#[test]
fn data_flows_over_selected_pair() {
    let _ = env_logger::try_init();
    let (mut a, mut b) = create_pair(true, false);
    add_hosts(&mut a, &mut b);

    run(&mut a, &mut b);

    let now = Instant::now();
    a.send(now, b"application data".to_vec()).unwrap();

    let mut to_b = vec![];
    let mut b_peer = Peer::default();
    poll_agent(now, &mut a, 5555, &mut Peer::default(), &mut to_b, &mut vec![]);
    assert_eq!(to_b.len(), 1);

    poll_agent(now, &mut b, 4444, &mut b_peer, &mut vec![], &mut to_b);
    assert_eq!(b_peer.received, vec![b"application data".to_vec()]);
}

#[test]
fn role_conflict_is_resolved() {
    let _ = env_logger::try_init();
    let (mut a, mut b) = create_pair(true, true);
    add_hosts(&mut a, &mut b);

    let (a_peer, b_peer) = run(&mut a, &mut b);

    assert_ne!(a.is_controlling(), b.is_controlling());
    assert_eq!(a_peer.selected.len(), 1);
    assert_eq!(b_peer.selected.len(), 1);
}
