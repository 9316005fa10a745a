//! Deterministic network simulation for flows
//!
//! Every flow owns a single host address. Datagrams are delivered instantly and in order, time only advances
//! to the earliest timeout of all flows. The fake server answers STUN bindings and implements enough of TURN
//! (long-term auth, allocations, permissions, channels) to relay between flows.
#![allow(dead_code)]

use mediaflow::{
    Codec, CloseReason, DtlsIdentity, Established, Mediaflow, MediaflowConfig, MediaflowEvent,
    ReceivedPkt,
};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    net::{IpAddr, SocketAddr},
    time::{Duration, Instant},
};
use stun_types::{
    Class, Message, MessageBuilder, Method, TransactionId,
    attributes::{
        ChannelNumber, Data, ErrorCode, Lifetime, MessageIntegrity, MessageIntegrityKey, Nonce,
        Realm, XorMappedAddress, XorPeerAddress, XorRelayedAddress, long_term_password_md5,
    },
    channel_data::{ChannelData, is_channel_data},
    stream::{Frame, StreamFramer},
};

pub(crate) const USERNAME: &str = "user";
pub(crate) const PASSWORD: &str = "pass";
const REALM: &str = "mediaflow.test";
const NONCE: &[u8] = b"5a1e0c7f3b2d";

const MAX_STEPS: usize = 100_000;

pub(crate) fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub(crate) fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

/// A flow with its host address and every event that was not about sending data
pub(crate) struct Peer {
    pub(crate) flow: Mediaflow,
    pub(crate) addr: SocketAddr,
    pub(crate) events: Vec<MediaflowEvent>,
}

impl Peer {
    pub(crate) fn new(host: &str, configure: impl FnOnce(&mut MediaflowConfig)) -> Self {
        let addr = addr(host);

        let mut config = MediaflowConfig {
            local_addr: addr,
            audio_codecs: vec![Codec::OPUS, Codec::PCMU],
            ..MediaflowConfig::default()
        };

        configure(&mut config);

        let mut flow = Mediaflow::new(config, DtlsIdentity::generate().unwrap());
        flow.add_local_host_candidate(addr);

        Self {
            flow,
            addr,
            events: vec![],
        }
    }

    pub(crate) fn established(&self) -> Option<&Established> {
        self.events.iter().find_map(|event| match event {
            MediaflowEvent::Established(established) => Some(established),
            _ => None,
        })
    }

    pub(crate) fn established_count(&self) -> usize {
        self.events
            .iter()
            .filter(|event| matches!(event, MediaflowEvent::Established(_)))
            .count()
    }

    pub(crate) fn closed(&self) -> Option<CloseReason> {
        self.events.iter().find_map(|event| match event {
            MediaflowEvent::Closed(reason) => Some(*reason),
            _ => None,
        })
    }

    pub(crate) fn gathered_failures(&self) -> Option<usize> {
        self.events.iter().find_map(|event| match event {
            MediaflowEvent::Gathered { failed } => Some(failed.len()),
            _ => None,
        })
    }

    pub(crate) fn channel_messages(&self) -> Vec<&[u8]> {
        self.events
            .iter()
            .filter_map(|event| match event {
                MediaflowEvent::ChannelMessage { data, .. } => Some(data.as_slice()),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn opened_channels(&self) -> Vec<&str> {
        self.events
            .iter()
            .filter_map(|event| match event {
                MediaflowEvent::ChannelOpen { label, .. } => Some(label.as_str()),
                _ => None,
            })
            .collect()
    }
}

enum Transmit {
    Datagram {
        source: SocketAddr,
        target: SocketAddr,
        data: Vec<u8>,
    },
    ToServer {
        client: SocketAddr,
        server: SocketAddr,
        data: Vec<u8>,
    },
    ToClient {
        server: SocketAddr,
        client: SocketAddr,
        data: Vec<u8>,
    },
}

pub(crate) struct Sim {
    pub(crate) now: Instant,
    pub(crate) peers: Vec<Peer>,
    pub(crate) servers: Vec<FakeServer>,
    /// Drop every datagram sent directly between two flows
    pub(crate) block_direct: bool,
    queue: VecDeque<Transmit>,
}

impl Sim {
    pub(crate) fn new(peers: Vec<Peer>, servers: Vec<FakeServer>) -> Self {
        init_log();

        Self {
            now: Instant::now(),
            peers,
            servers,
            block_direct: false,
            queue: VecDeque::new(),
        }
    }

    pub(crate) fn a(&mut self) -> &mut Peer {
        &mut self.peers[0]
    }

    pub(crate) fn b(&mut self) -> &mut Peer {
        &mut self.peers[1]
    }

    /// Gather on both sides and exchange the offer and answer, the first peer offers
    pub(crate) fn negotiate(&mut self) {
        self.negotiate_with(|answer| answer);
    }

    /// Like [`Sim::negotiate`] but the answer is changed before the offerer receives it
    pub(crate) fn negotiate_with(&mut self, alter_answer: impl FnOnce(String) -> String) {
        assert!(
            self.run_until(Duration::from_secs(10), |sim| sim
                .peers
                .iter()
                .all(|peer| peer.flow.is_gathered())),
            "gathering did not complete"
        );

        let offer = self.peers[0].flow.generate_offer().unwrap();
        let answer = self.peers[1].flow.offer_answer(&offer).unwrap();
        self.peers[0].flow.handle_answer(&alter_answer(answer)).unwrap();
        self.flush();
    }

    /// Negotiate and wait until both flows are established
    pub(crate) fn establish(&mut self) {
        self.negotiate();
        self.wait_established();
    }

    pub(crate) fn wait_established(&mut self) {
        assert!(
            self.run_until(Duration::from_secs(30), |sim| sim
                .peers
                .iter()
                .all(|peer| peer.established().is_some())),
            "flows did not establish"
        );
    }

    /// Advance time until the condition holds, returns false if it did not within the limit
    pub(crate) fn run_until(&mut self, limit: Duration, mut condition: impl FnMut(&Sim) -> bool) -> bool {
        let deadline = self.now + limit;

        for _ in 0..MAX_STEPS {
            for peer in &mut self.peers {
                peer.flow.poll(self.now);
            }

            self.flush();

            if condition(self) {
                return true;
            }

            let timeout = self
                .peers
                .iter()
                .filter_map(|peer| peer.flow.timeout(self.now))
                .min();

            let Some(timeout) = timeout else {
                return false;
            };

            if self.now + timeout > deadline {
                return false;
            }

            self.now += timeout;
        }

        false
    }

    /// Deliver everything in flight, including whatever is sent in response
    pub(crate) fn flush(&mut self) {
        loop {
            for i in 0..self.peers.len() {
                self.collect(i);
            }

            let Some(transmit) = self.queue.pop_front() else {
                return;
            };

            self.deliver(transmit);
        }
    }

    fn collect(&mut self, i: usize) {
        let peer = &mut self.peers[i];

        while let Some(event) = peer.flow.pop_event() {
            match event {
                MediaflowEvent::SendData { data, target, .. } => self.queue.push_back(Transmit::Datagram {
                    source: peer.addr,
                    target,
                    data,
                }),
                MediaflowEvent::SendStream { server, data } => self.queue.push_back(Transmit::ToServer {
                    client: peer.addr,
                    server,
                    data,
                }),
                event => peer.events.push(event),
            }
        }
    }

    fn deliver(&mut self, transmit: Transmit) {
        let now = self.now;

        match transmit {
            Transmit::Datagram {
                source,
                target,
                data,
            } => {
                if let Some(peer) = self.peers.iter_mut().find(|peer| peer.addr == target) {
                    let direct = self.servers.iter().all(|server| server.addr.ip() != source.ip());

                    if direct && self.block_direct {
                        return;
                    }

                    peer.flow.receive(
                        now,
                        ReceivedPkt {
                            data,
                            source,
                            destination: target,
                        },
                    );

                    return;
                }

                let Some(server) = self.servers.iter_mut().find(|server| server.addr.ip() == target.ip()) else {
                    return;
                };

                let output = if target == server.addr {
                    server.receive(Client::Udp(source), &data)
                } else {
                    server.receive_relayed(source, target, &data)
                };

                let server_addr = server.addr;
                self.enqueue(server_addr, output);
            }
            Transmit::ToServer {
                client,
                server,
                data,
            } => {
                let Some(server) = self.servers.iter_mut().find(|s| s.addr == server) else {
                    return;
                };

                let output = server.receive_stream(client, &data);
                let server_addr = server.addr;
                self.enqueue(server_addr, output);
            }
            Transmit::ToClient {
                server,
                client,
                data,
            } => {
                if let Some(peer) = self.peers.iter_mut().find(|peer| peer.addr == client) {
                    peer.flow.receive_stream(now, server, &data);
                }
            }
        }
    }

    fn enqueue(&mut self, server: SocketAddr, output: Vec<Output>) {
        for output in output {
            self.queue.push_back(match output {
                Output::Datagram {
                    source,
                    target,
                    data,
                } => Transmit::Datagram {
                    source,
                    target,
                    data,
                },
                Output::Stream { client, data } => Transmit::ToClient {
                    server,
                    client,
                    data,
                },
            });
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Client {
    Udp(SocketAddr),
    Stream(SocketAddr),
}

impl Client {
    fn addr(self) -> SocketAddr {
        match self {
            Client::Udp(addr) | Client::Stream(addr) => addr,
        }
    }
}

pub(crate) enum Output {
    Datagram {
        source: SocketAddr,
        target: SocketAddr,
        data: Vec<u8>,
    },
    Stream {
        client: SocketAddr,
        data: Vec<u8>,
    },
}

pub(crate) struct Allocation {
    client: Client,
    pub(crate) relayed: SocketAddr,
    permissions: HashSet<IpAddr>,
    channels: HashMap<u16, SocketAddr>,
}

/// STUN and TURN server on a single address
pub(crate) struct FakeServer {
    pub(crate) addr: SocketAddr,
    /// Answer authenticated allocations with this error code
    pub(crate) reject_allocations: Option<u32>,
    /// Number of requests received, including unauthenticated ones
    pub(crate) requests: usize,
    pub(crate) allocations: Vec<Allocation>,
    next_port: u16,
    framers: HashMap<SocketAddr, StreamFramer>,
}

impl FakeServer {
    pub(crate) fn new(addr: &str) -> Self {
        Self {
            addr: self::addr(addr),
            reject_allocations: None,
            requests: 0,
            allocations: vec![],
            next_port: 49152,
            framers: HashMap::new(),
        }
    }

    pub(crate) fn rejecting(addr: &str, code: u32) -> Self {
        Self {
            reject_allocations: Some(code),
            ..Self::new(addr)
        }
    }

    fn key() -> Vec<u8> {
        long_term_password_md5(USERNAME, REALM, PASSWORD)
    }

    /// Bytes received on the stream connection of a client
    fn receive_stream(&mut self, client: SocketAddr, data: &[u8]) -> Vec<Output> {
        let framer = self.framers.entry(client).or_default();
        framer.push(data);

        let mut frames = vec![];
        while let Ok(Some(frame)) = framer.next_frame() {
            frames.push(frame);
        }

        frames
            .into_iter()
            .flat_map(|frame| match frame {
                Frame::Stun(data) | Frame::ChannelData(data) => self.receive(Client::Stream(client), &data),
            })
            .collect()
    }

    /// A message sent by a client to the server address
    fn receive(&mut self, client: Client, data: &[u8]) -> Vec<Output> {
        if is_channel_data(data) {
            let Ok(channel_data) = ChannelData::parse(data) else {
                return vec![];
            };

            return self.relay_out(client, |allocation| {
                allocation.channels.get(&channel_data.number).copied()
            }, channel_data.data);
        }

        let Ok(mut msg) = Message::parse(data) else {
            return vec![];
        };

        match (msg.class(), msg.method()) {
            (Class::Indication, Method::Send) => {
                let Some(Ok(peer)) = msg.attribute::<XorPeerAddress>() else {
                    return vec![];
                };

                let Some(Ok(payload)) = msg.attribute::<Data>() else {
                    return vec![];
                };
                let payload = payload.0.to_vec();

                self.relay_out(client, |_| Some(peer.0), &payload)
            }
            (Class::Request, Method::Binding) => {
                self.requests += 1;

                let mut response = MessageBuilder::new(Class::Success, Method::Binding, msg.transaction_id());
                response.add_attr(XorMappedAddress(client.addr()));

                self.respond(client, response.finish())
            }
            (Class::Request, _) => {
                self.requests += 1;
                self.receive_turn_request(client, msg)
            }
            _ => vec![],
        }
    }

    fn receive_turn_request(&mut self, client: Client, mut msg: Message) -> Vec<Output> {
        let authenticated = msg
            .attribute_with::<MessageIntegrity>(MessageIntegrityKey::new(Self::key()))
            .is_some_and(|result| result.is_ok());

        if !authenticated {
            let mut challenge = MessageBuilder::new(Class::Error, msg.method(), msg.transaction_id());
            challenge.add_attr(ErrorCode {
                number: ErrorCode::UNAUTHORIZED,
                reason: "Unauthorized",
            });
            challenge.add_attr(Realm::new(REALM));
            challenge.add_attr(Nonce::new(NONCE));

            return self.respond(client, challenge.finish());
        }

        let mut response = MessageBuilder::new(Class::Success, msg.method(), msg.transaction_id());

        match msg.method() {
            Method::Allocate => {
                if let Some(code) = self.reject_allocations {
                    let mut error = MessageBuilder::new(Class::Error, Method::Allocate, msg.transaction_id());
                    error.add_attr(ErrorCode {
                        number: code,
                        reason: "Rejected",
                    });
                    error.add_attr_with(MessageIntegrity, MessageIntegrityKey::new(Self::key()));

                    return self.respond(client, error.finish());
                }

                let relayed = match self.allocations.iter().find(|a| a.client == client) {
                    Some(allocation) => allocation.relayed,
                    None => {
                        let relayed = SocketAddr::new(self.addr.ip(), self.next_port);
                        self.next_port += 1;

                        self.allocations.push(Allocation {
                            client,
                            relayed,
                            permissions: HashSet::new(),
                            channels: HashMap::new(),
                        });

                        relayed
                    }
                };

                response.add_attr(XorRelayedAddress(relayed));
                response.add_attr(XorMappedAddress(client.addr()));
                response.add_attr(Lifetime(600));
            }
            Method::Refresh => {
                let lifetime = msg.attribute::<Lifetime>().and_then(Result::ok).map_or(600, |l| l.0);

                if lifetime == 0 {
                    self.allocations.retain(|a| a.client != client);
                }

                response.add_attr(Lifetime(lifetime));
            }
            Method::CreatePermission => {
                let Some(Ok(peer)) = msg.attribute::<XorPeerAddress>() else {
                    return vec![];
                };

                if let Some(allocation) = self.allocations.iter_mut().find(|a| a.client == client) {
                    allocation.permissions.insert(peer.0.ip());
                }
            }
            Method::ChannelBind => {
                let Some(Ok(number)) = msg.attribute::<ChannelNumber>() else {
                    return vec![];
                };

                let Some(Ok(peer)) = msg.attribute::<XorPeerAddress>() else {
                    return vec![];
                };

                if let Some(allocation) = self.allocations.iter_mut().find(|a| a.client == client) {
                    allocation.permissions.insert(peer.0.ip());
                    allocation.channels.insert(number.0, peer.0);
                }
            }
            _ => return vec![],
        }

        response.add_attr_with(MessageIntegrity, MessageIntegrityKey::new(Self::key()));
        self.respond(client, response.finish())
    }

    /// Send data from the relayed address of the client's allocation
    fn relay_out(
        &mut self,
        client: Client,
        peer: impl FnOnce(&Allocation) -> Option<SocketAddr>,
        data: &[u8],
    ) -> Vec<Output> {
        let Some(allocation) = self.allocations.iter().find(|a| a.client == client) else {
            return vec![];
        };

        match peer(allocation) {
            Some(peer) if allocation.permissions.contains(&peer.ip()) => vec![Output::Datagram {
                source: allocation.relayed,
                target: peer,
                data: data.to_vec(),
            }],
            _ => vec![],
        }
    }

    /// A datagram arrived on a relayed address, forward it to the client
    fn receive_relayed(&mut self, source: SocketAddr, relayed: SocketAddr, data: &[u8]) -> Vec<Output> {
        let Some(allocation) = self.allocations.iter().find(|a| a.relayed == relayed) else {
            return vec![];
        };

        if !allocation.permissions.contains(&source.ip()) {
            return vec![];
        }

        let channel = allocation
            .channels
            .iter()
            .find(|(_, peer)| **peer == source)
            .map(|(number, _)| *number);

        let message = match channel {
            Some(number) => match (ChannelData { number, data }).encode() {
                Ok(message) => message,
                Err(_) => return vec![],
            },
            None => {
                let mut indication =
                    MessageBuilder::new(Class::Indication, Method::Data, TransactionId::random());
                indication.add_attr(XorPeerAddress(source));
                indication.add_attr(Data::new(data));
                indication.finish()
            }
        };

        let client = allocation.client;
        self.respond(client, message)
    }

    fn respond(&self, client: Client, data: Vec<u8>) -> Vec<Output> {
        match client {
            Client::Udp(addr) => vec![Output::Datagram {
                source: self.addr,
                target: addr,
                data,
            }],
            Client::Stream(addr) => vec![Output::Stream { client: addr, data }],
        }
    }
}
