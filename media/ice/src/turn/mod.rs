//! Sans-IO TURN client managing a single allocation
//!
//! [RFC8656](https://datatracker.ietf.org/doc/html/rfc8656)

use crate::{GatherError, IceConfig, TurnServer, TurnTransport};
use auth::LongTermAuth;
use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use stun_types::attributes::{
    CHANNEL_NUMBER_RANGE, ChannelNumber, Data, ErrorCode, Lifetime, RequestedTransport,
    XorMappedAddress, XorPeerAddress, XorRelayedAddress,
};
use stun_types::channel_data::{ChannelData, is_channel_data};
use stun_types::stream::{Frame, StreamFramer};
use stun_types::{Class, Message, MessageBuilder, Method, TransactionId};
use tls::TlsClient;

mod auth;
mod tls;

/// How often a challenge (401/438) may be answered before giving up
const MAX_AUTH_ATTEMPTS: u32 = 3;

pub(crate) enum TurnEvent {
    /// Bytes that must be written to the server transport
    Transmit(Vec<u8>),
    Allocated {
        relayed: SocketAddr,
        mapped: Option<SocketAddr>,
    },
    Failed(GatherError),
    PermissionCreated(IpAddr),
    /// The allocation could not be refreshed and is gone
    Expired,
    /// Data relayed from a peer
    Data { peer: SocketAddr, data: Vec<u8> },
}

enum AllocationState {
    New,
    Allocating,
    Allocated {
        relayed: SocketAddr,
        refresh_at: Instant,
        expires_at: Instant,
    },
    Failed,
    Closed,
}

enum Connection {
    Datagram,
    Stream {
        framer: StreamFramer,
        tls: Option<TlsClient>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransactionKind {
    Allocate,
    Refresh,
    CreatePermission(IpAddr),
    ChannelBind { peer: SocketAddr, number: u16 },
}

struct Transaction {
    id: TransactionId,
    kind: TransactionKind,
    request: Vec<u8>,
    retransmit_at: Instant,
    retransmits: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PermissionState {
    Pending,
    Installed,
    Failed,
}

struct Permission {
    state: PermissionState,
    refresh_at: Instant,
}

struct Channel {
    number: u16,
    bound: bool,
    refresh_at: Instant,
}

pub(crate) struct TurnSession {
    server: TurnServer,
    state: AllocationState,

    auth: Option<LongTermAuth>,
    auth_attempts: u32,

    transactions: Vec<Transaction>,
    permissions: HashMap<IpAddr, Permission>,
    channels: HashMap<SocketAddr, Channel>,
    next_channel: u16,

    connection: Connection,
    events: VecDeque<TurnEvent>,
}

impl TurnSession {
    pub(crate) fn new(server: TurnServer) -> Self {
        let mut events = VecDeque::new();
        let mut state = AllocationState::New;

        let connection = match server.transport {
            TurnTransport::Udp => Connection::Datagram,
            TurnTransport::Tcp => Connection::Stream {
                framer: StreamFramer::new(),
                tls: None,
            },
            TurnTransport::Tls => match TlsClient::new(server.tls_domain.as_deref()) {
                Ok(tls) => Connection::Stream {
                    framer: StreamFramer::new(),
                    tls: Some(tls),
                },
                Err(e) => {
                    log::warn!("Failed to create TLS client for {}, {e}", server.addr);
                    state = AllocationState::Failed;
                    events.push_back(TurnEvent::Failed(GatherError::TransportFailed(
                        e.to_string(),
                    )));
                    Connection::Datagram
                }
            },
        };

        Self {
            server,
            state,
            auth: None,
            auth_attempts: 0,
            transactions: vec![],
            permissions: HashMap::new(),
            channels: HashMap::new(),
            next_channel: *CHANNEL_NUMBER_RANGE.start(),
            connection,
            events,
        }
    }

    pub(crate) fn server(&self) -> &TurnServer {
        &self.server
    }

    pub(crate) fn relayed_addr(&self) -> Option<SocketAddr> {
        match self.state {
            AllocationState::Allocated { relayed, .. } => Some(relayed),
            _ => None,
        }
    }

    /// Returns if the allocation either succeeded or definitely failed
    pub(crate) fn is_completed(&self) -> bool {
        !matches!(self.state, AllocationState::New | AllocationState::Allocating)
    }

    pub(crate) fn has_permission(&self, ip: IpAddr) -> bool {
        self.permissions
            .get(&ip)
            .is_some_and(|p| p.state == PermissionState::Installed)
    }

    pub(crate) fn has_failed_permission(&self, ip: IpAddr) -> bool {
        self.permissions
            .get(&ip)
            .is_some_and(|p| p.state == PermissionState::Failed)
    }

    pub(crate) fn pop_event(&mut self) -> Option<TurnEvent> {
        self.events.pop_front()
    }

    pub(crate) fn timeout(&self, now: Instant) -> Option<Duration> {
        let allocation = match self.state {
            AllocationState::New => Some(now),
            AllocationState::Allocated {
                refresh_at,
                expires_at,
                ..
            } => Some(refresh_at.min(expires_at)),
            AllocationState::Allocating | AllocationState::Failed | AllocationState::Closed => {
                None
            }
        };

        let transactions = self.transactions.iter().map(|t| t.retransmit_at);

        let refreshes = self
            .permissions
            .values()
            .filter(|p| p.state == PermissionState::Installed)
            .map(|p| p.refresh_at)
            .chain(
                self.channels
                    .values()
                    .filter(|c| c.bound)
                    .map(|c| c.refresh_at),
            )
            .filter(|_| matches!(self.state, AllocationState::Allocated { .. }));

        allocation
            .into_iter()
            .chain(transactions)
            .chain(refreshes)
            .min()
            .map(|at| at.saturating_duration_since(now))
    }

    pub(crate) fn poll(&mut self, now: Instant, config: &IceConfig) {
        match self.state {
            AllocationState::New => {
                log::debug!(
                    "Allocating relay on {} via {:?}",
                    self.server.addr,
                    self.server.transport
                );

                self.state = AllocationState::Allocating;
                self.send_request(now, config, TransactionKind::Allocate);
            }
            AllocationState::Allocated {
                relayed,
                refresh_at,
                expires_at,
            } => {
                if now >= expires_at {
                    self.expire();
                    return;
                }

                if now >= refresh_at {
                    // the refresh transaction takes over from here
                    self.state = AllocationState::Allocated {
                        relayed,
                        refresh_at: expires_at,
                        expires_at,
                    };
                    self.send_request(now, config, TransactionKind::Refresh);
                }
            }
            AllocationState::Allocating | AllocationState::Failed | AllocationState::Closed => {}
        }

        self.poll_transactions(now, config);

        if matches!(self.state, AllocationState::Allocated { .. }) {
            self.poll_refreshes(now, config);
        }
    }

    fn poll_transactions(&mut self, now: Instant, config: &IceConfig) {
        let is_stream = self.server.transport.is_stream();

        let mut retransmits = vec![];
        let mut timed_out = vec![];

        for transaction in &mut self.transactions {
            if transaction.retransmit_at > now {
                continue;
            }

            if transaction.retransmits >= config.max_retransmits {
                timed_out.push(transaction.id);
                continue;
            }

            transaction.retransmits += 1;
            transaction.retransmit_at += config.retransmit_delta(transaction.retransmits);

            // Reliable transports only use the timer to detect a timeout
            if !is_stream {
                retransmits.push(transaction.request.clone());
            }
        }

        for request in retransmits {
            self.transmit(request);
        }

        for id in timed_out {
            if let Some(position) = self.transactions.iter().position(|t| t.id == id) {
                let transaction = self.transactions.swap_remove(position);

                log::debug!(
                    "TURN {:?} transaction to {} timed out",
                    transaction.kind,
                    self.server.addr
                );

                self.transaction_failed(transaction.kind, GatherError::Timeout);
            }
        }
    }

    fn poll_refreshes(&mut self, now: Instant, config: &IceConfig) {
        let due_permissions: Vec<IpAddr> = self
            .permissions
            .iter()
            .filter(|(_, p)| p.state == PermissionState::Installed && p.refresh_at <= now)
            .map(|(ip, _)| *ip)
            .collect();

        for ip in due_permissions {
            if let Some(permission) = self.permissions.get_mut(&ip) {
                permission.refresh_at = now + config.permission_refresh_interval;
            }

            self.send_request(now, config, TransactionKind::CreatePermission(ip));
        }

        let due_channels: Vec<(SocketAddr, u16)> = self
            .channels
            .iter()
            .filter(|(_, c)| c.bound && c.refresh_at <= now)
            .map(|(peer, c)| (*peer, c.number))
            .collect();

        for (peer, number) in due_channels {
            if let Some(channel) = self.channels.get_mut(&peer) {
                channel.refresh_at = now + config.permission_refresh_interval;
            }

            self.send_request(now, config, TransactionKind::ChannelBind { peer, number });
        }
    }

    /// Install a permission for the peer, so the server relays its packets
    pub(crate) fn create_permission(&mut self, now: Instant, config: &IceConfig, ip: IpAddr) {
        if !matches!(self.state, AllocationState::Allocated { .. })
            || self.permissions.contains_key(&ip)
        {
            return;
        }

        self.permissions.insert(
            ip,
            Permission {
                state: PermissionState::Pending,
                refresh_at: now + config.permission_refresh_interval,
            },
        );

        self.send_request(now, config, TransactionKind::CreatePermission(ip));
    }

    /// Bind a channel to the peer, until the binding succeeds data is sent using Send indications
    pub(crate) fn bind_channel(&mut self, now: Instant, config: &IceConfig, peer: SocketAddr) {
        if !matches!(self.state, AllocationState::Allocated { .. })
            || self.channels.contains_key(&peer)
            || !CHANNEL_NUMBER_RANGE.contains(&self.next_channel)
        {
            return;
        }

        let number = self.next_channel;
        self.next_channel += 1;

        self.channels.insert(
            peer,
            Channel {
                number,
                bound: false,
                refresh_at: now + config.permission_refresh_interval,
            },
        );

        self.send_request(now, config, TransactionKind::ChannelBind { peer, number });
    }

    /// Relay data to the peer
    pub(crate) fn send_to(&mut self, peer: SocketAddr, data: &[u8]) {
        let channel = self.channels.get(&peer).filter(|c| c.bound);

        let message = if let Some(channel) = channel {
            let channel_data = ChannelData {
                number: channel.number,
                data,
            };

            match channel_data.encode() {
                Ok(message) => message,
                Err(e) => {
                    log::warn!("Failed to encode ChannelData, {e}");
                    return;
                }
            }
        } else {
            let mut builder =
                MessageBuilder::new(Class::Indication, Method::Send, TransactionId::random());
            builder.add_attr(XorPeerAddress(peer));
            builder.add_attr(Data::new(data));
            builder.finish()
        };

        self.transmit(message);
    }

    /// Release the allocation, the request is sent once and not retransmitted
    pub(crate) fn shutdown(&mut self) {
        if !matches!(self.state, AllocationState::Allocated { .. }) {
            self.state = AllocationState::Closed;
            return;
        }

        log::debug!("Releasing allocation on {}", self.server.addr);

        let mut builder =
            MessageBuilder::new(Class::Request, Method::Refresh, TransactionId::random());
        builder.add_attr(Lifetime(0));

        if let Some(auth) = &self.auth {
            auth.authenticate(&mut builder);
        }

        self.transmit(builder.finish());

        self.state = AllocationState::Closed;
        self.transactions.clear();
        self.permissions.clear();
        self.channels.clear();
    }

    /// The stream connection to the server could not be established or broke
    pub(crate) fn stream_failed(&mut self, reason: &str) {
        log::debug!("Connection to TURN server {} failed, {reason}", self.server.addr);

        match self.state {
            AllocationState::New | AllocationState::Allocating => {
                self.state = AllocationState::Failed;
                self.transactions.clear();
                self.events.push_back(TurnEvent::Failed(GatherError::TransportFailed(
                    reason.into(),
                )));
            }
            AllocationState::Allocated { .. } => self.expire(),
            AllocationState::Failed | AllocationState::Closed => {}
        }
    }

    /// Receive a datagram from the server
    pub(crate) fn receive(&mut self, now: Instant, config: &IceConfig, data: &[u8]) {
        if is_channel_data(data) {
            match ChannelData::parse(data) {
                Ok(channel_data) => self.receive_channel_data(channel_data),
                Err(e) => log::trace!("Discarding invalid ChannelData, {e}"),
            }

            return;
        }

        let msg = match Message::parse(data) {
            Ok(msg) => msg,
            Err(e) => {
                log::trace!("Discarding invalid message from TURN server, {e}");
                return;
            }
        };

        match msg.class() {
            Class::Indication if msg.method() == Method::Data => self.receive_data_indication(msg),
            Class::Success | Class::Error => self.receive_response(now, config, msg),
            _ => log::trace!("Discarding unexpected {:?} from TURN server", msg.class()),
        }
    }

    /// Receive bytes from the stream connection to the server
    pub(crate) fn receive_stream(&mut self, now: Instant, config: &IceConfig, data: &[u8]) {
        let Connection::Stream { framer, tls } = &mut self.connection else {
            return;
        };

        let (plaintext, outgoing) = match tls {
            Some(tls) => match tls.receive(data) {
                Ok(plaintext) => (plaintext, tls.take_outgoing()),
                Err(e) => {
                    self.stream_failed(&e.to_string());
                    return;
                }
            },
            None => (data.to_vec(), vec![]),
        };

        framer.push(&plaintext);

        let mut frames = vec![];
        let mut invalid = false;

        loop {
            match framer.next_frame() {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => break,
                Err(e) => {
                    framer.clear();
                    invalid = true;
                    log::warn!("TURN server {} {e}", self.server.addr);
                    break;
                }
            }
        }

        if !outgoing.is_empty() {
            self.events.push_back(TurnEvent::Transmit(outgoing));
        }

        for frame in frames {
            match frame {
                Frame::Stun(message) | Frame::ChannelData(message) => {
                    self.receive(now, config, &message)
                }
            }
        }

        if invalid {
            self.stream_failed("received invalid stream data");
        }
    }

    fn receive_channel_data(&mut self, channel_data: ChannelData<'_>) {
        let peer = self
            .channels
            .iter()
            .find(|(_, c)| c.number == channel_data.number)
            .map(|(peer, _)| *peer);

        match peer {
            Some(peer) => self.events.push_back(TurnEvent::Data {
                peer,
                data: channel_data.data.to_vec(),
            }),
            None => log::trace!("ChannelData for unknown channel {}", channel_data.number),
        }
    }

    fn receive_data_indication(&mut self, mut msg: Message) {
        let peer = match msg.attribute::<XorPeerAddress>() {
            Some(Ok(peer)) => peer.0,
            _ => {
                log::trace!("Data indication without XOR-PEER-ADDRESS");
                return;
            }
        };

        let data = match msg.attribute::<Data>() {
            Some(Ok(data)) => data.0.to_vec(),
            _ => {
                log::trace!("Data indication without DATA");
                return;
            }
        };

        self.events.push_back(TurnEvent::Data { peer, data });
    }

    fn receive_response(&mut self, now: Instant, config: &IceConfig, mut msg: Message) {
        let Some(position) = self
            .transactions
            .iter()
            .position(|t| t.id == msg.transaction_id())
        else {
            log::trace!("TURN response for unknown transaction, discarding");
            return;
        };

        if let Some(auth) = &self.auth
            && !auth.verify(&mut msg)
        {
            log::debug!("TURN response failed the integrity check, discarding");
            return;
        }

        let transaction = self.transactions.swap_remove(position);

        if msg.class() == Class::Error {
            let (code, reason) = match msg.attribute::<ErrorCode>() {
                Some(Ok(error_code)) => (error_code.number, error_code.reason.to_string()),
                _ => (0, "missing error code".to_string()),
            };

            self.receive_error(now, config, transaction.kind, code, reason, &mut msg);
        } else {
            self.receive_success(now, config, transaction.kind, &mut msg);
        }
    }

    fn receive_error(
        &mut self,
        now: Instant,
        config: &IceConfig,
        kind: TransactionKind,
        code: u32,
        reason: String,
        msg: &mut Message,
    ) {
        log::debug!(
            "TURN {kind:?} on {} failed with {code} {reason}",
            self.server.addr
        );

        let retry = match code {
            ErrorCode::UNAUTHORIZED if self.auth.is_none() => {
                self.auth = LongTermAuth::from_challenge(&self.server, msg);
                self.auth.is_some()
            }
            ErrorCode::UNAUTHORIZED | ErrorCode::STALE_NONCE => {
                let server = &self.server;
                self.auth
                    .as_mut()
                    .is_some_and(|auth| auth.rechallenge(server, msg))
            }
            _ => false,
        };

        if retry && self.auth_attempts < MAX_AUTH_ATTEMPTS {
            self.auth_attempts += 1;
            self.send_request(now, config, kind);
        } else {
            self.transaction_failed(kind, GatherError::AllocationFailed { code, reason });
        }
    }

    fn receive_success(
        &mut self,
        now: Instant,
        config: &IceConfig,
        kind: TransactionKind,
        msg: &mut Message,
    ) {
        // successfully authenticated, allow future nonce changes to be answered again
        self.auth_attempts = 0;

        let lifetime = msg
            .attribute::<Lifetime>()
            .and_then(Result::ok)
            .map(|lifetime| Duration::from_secs(lifetime.0.into()));

        match kind {
            TransactionKind::Allocate => {
                let relayed = match msg.attribute::<XorRelayedAddress>() {
                    Some(Ok(relayed)) => relayed.0,
                    _ => {
                        self.transaction_failed(
                            kind,
                            GatherError::AllocationFailed {
                                code: 0,
                                reason: "response is missing XOR-RELAYED-ADDRESS".into(),
                            },
                        );
                        return;
                    }
                };

                let mapped = msg
                    .attribute::<XorMappedAddress>()
                    .and_then(Result::ok)
                    .map(|mapped| mapped.0);

                log::debug!(
                    "Allocated relay {relayed} on {}, mapped address {mapped:?}",
                    self.server.addr
                );

                self.set_allocated(now, relayed, lifetime.unwrap_or(config.turn_lifetime));
                self.events
                    .push_back(TurnEvent::Allocated { relayed, mapped });
            }
            TransactionKind::Refresh => {
                if let AllocationState::Allocated { relayed, .. } = self.state {
                    self.set_allocated(now, relayed, lifetime.unwrap_or(config.turn_lifetime));
                }
            }
            TransactionKind::CreatePermission(ip) => {
                let Some(permission) = self.permissions.get_mut(&ip) else {
                    return;
                };

                let was_pending = permission.state == PermissionState::Pending;

                permission.state = PermissionState::Installed;
                permission.refresh_at = now + config.permission_refresh_interval;

                if was_pending {
                    log::debug!("Installed permission for {ip} on {}", self.server.addr);
                    self.events.push_back(TurnEvent::PermissionCreated(ip));
                }
            }
            TransactionKind::ChannelBind { peer, .. } => {
                if let Some(channel) = self.channels.get_mut(&peer) {
                    channel.bound = true;
                    channel.refresh_at = now + config.permission_refresh_interval;
                }
            }
        }
    }

    fn transaction_failed(&mut self, kind: TransactionKind, error: GatherError) {
        match kind {
            TransactionKind::Allocate => {
                if matches!(self.state, AllocationState::Allocating) {
                    self.state = AllocationState::Failed;
                    self.events.push_back(TurnEvent::Failed(error));
                }
            }
            TransactionKind::Refresh => self.expire(),
            TransactionKind::CreatePermission(ip) => {
                log::warn!("Failed to create permission for {ip}, {error}");

                if let Some(permission) = self.permissions.get_mut(&ip) {
                    permission.state = PermissionState::Failed;
                }
            }
            TransactionKind::ChannelBind { peer, .. } => {
                // keep using Send indications
                self.channels.remove(&peer);
            }
        }
    }

    fn set_allocated(&mut self, now: Instant, relayed: SocketAddr, lifetime: Duration) {
        self.state = AllocationState::Allocated {
            relayed,
            refresh_at: now + lifetime / 2,
            expires_at: now + lifetime,
        };
    }

    fn expire(&mut self) {
        log::warn!("Allocation on {} expired", self.server.addr);

        self.state = AllocationState::Failed;
        self.transactions.clear();
        self.permissions.clear();
        self.channels.clear();
        self.events.push_back(TurnEvent::Expired);
    }

    fn send_request(&mut self, now: Instant, config: &IceConfig, kind: TransactionKind) {
        let id = TransactionId::random();

        let mut builder = match kind {
            TransactionKind::Allocate => {
                let mut builder = MessageBuilder::new(Class::Request, Method::Allocate, id);
                builder.add_attr(RequestedTransport::UDP);
                builder.add_attr(Lifetime(lifetime_secs(config.turn_lifetime)));
                builder
            }
            TransactionKind::Refresh => {
                let mut builder = MessageBuilder::new(Class::Request, Method::Refresh, id);
                builder.add_attr(Lifetime(lifetime_secs(config.turn_lifetime)));
                builder
            }
            TransactionKind::CreatePermission(ip) => {
                let mut builder = MessageBuilder::new(Class::Request, Method::CreatePermission, id);
                builder.add_attr(XorPeerAddress(SocketAddr::new(ip, 0)));
                builder
            }
            TransactionKind::ChannelBind { peer, number } => {
                let mut builder = MessageBuilder::new(Class::Request, Method::ChannelBind, id);
                builder.add_attr(ChannelNumber(number));
                builder.add_attr(XorPeerAddress(peer));
                builder
            }
        };

        if let Some(auth) = &self.auth {
            auth.authenticate(&mut builder);
        }

        let request = builder.finish();

        self.transmit(request.clone());

        self.transactions.push(Transaction {
            id,
            kind,
            request,
            retransmit_at: now + config.retransmit_delta(0),
            retransmits: 0,
        });
    }

    fn transmit(&mut self, message: Vec<u8>) {
        let result = match &mut self.connection {
            Connection::Datagram | Connection::Stream { tls: None, .. } => Ok(message),
            Connection::Stream { tls: Some(tls), .. } => {
                tls.write(&message).map(|_| tls.take_outgoing())
            }
        };

        match result {
            Ok(bytes) if bytes.is_empty() => {}
            Ok(bytes) => self.events.push_back(TurnEvent::Transmit(bytes)),
            Err(e) => self.stream_failed(&e.to_string()),
        }
    }
}

fn lifetime_secs(lifetime: Duration) -> u32 {
    u32::try_from(lifetime.as_secs()).unwrap_or(u32::MAX)
}
