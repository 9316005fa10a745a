//! Minimal data channel protocol carried in DTLS application data records
//!
//! Every record holds exactly one message, all integers are in network byte order:
//!
//! ```text
//! OPEN     0x03 | id: u16 | reliable: u8 | label length: u16 | label
//! ACK      0x02 | id: u16
//! DATA     0x01 | id: u16 | seq: u32 | payload
//! DATA_ACK 0x04 | id: u16 | seq: u32
//! CLOSE    0x05 | id: u16
//! ```
//!
//! The DTLS client allocates even channel ids, the server odd ones. If both peers open a channel with the
//! same label at the same time, both end up using the client's id.

use crate::Error;
use bytes::{Buf, BufMut, BytesMut};
use slotmap::{SlotMap, new_key_type};
use std::{
    cmp::min,
    collections::{BTreeMap, VecDeque},
    time::{Duration, Instant},
};

const INITIAL_RETRANSMIT: Duration = Duration::from_millis(200);
const MAX_RETRANSMIT: Duration = Duration::from_secs(3);
const MAX_ATTEMPTS: u32 = 8;

/// Closed channels are remembered for state queries until this many channels closed after them
const MAX_CLOSED_CHANNELS: usize = 16;

const TYPE_DATA: u8 = 0x01;
const TYPE_ACK: u8 = 0x02;
const TYPE_OPEN: u8 = 0x03;
const TYPE_DATA_ACK: u8 = 0x04;
const TYPE_CLOSE: u8 = 0x05;

new_key_type! {
    /// Local handle of a data channel
    pub struct ChannelId;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
}

#[derive(Debug)]
pub(crate) enum ChannelEvent {
    Opened { id: ChannelId, label: String },
    Message { id: ChannelId, data: Vec<u8> },
    Closed { id: ChannelId },
}

#[derive(Debug, PartialEq, Eq)]
enum Message<'a> {
    Open {
        id: u16,
        reliable: bool,
        label: &'a str,
    },
    Ack {
        id: u16,
    },
    Data {
        id: u16,
        seq: u32,
        payload: &'a [u8],
    },
    DataAck {
        id: u16,
        seq: u32,
    },
    Close {
        id: u16,
    },
}

impl<'a> Message<'a> {
    fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();

        match *self {
            Message::Open {
                id,
                reliable,
                label,
            } => {
                buf.put_u8(TYPE_OPEN);
                buf.put_u16(id);
                buf.put_u8(u8::from(reliable));
                // labels are truncated to what the length field can express, on a char boundary
                let mut len = label.len().min(usize::from(u16::MAX));
                while !label.is_char_boundary(len) {
                    len -= 1;
                }

                buf.put_u16(len as u16);
                buf.put_slice(&label.as_bytes()[..len]);
            }
            Message::Ack { id } => {
                buf.put_u8(TYPE_ACK);
                buf.put_u16(id);
            }
            Message::Data { id, seq, payload } => {
                buf.put_u8(TYPE_DATA);
                buf.put_u16(id);
                buf.put_u32(seq);
                buf.put_slice(payload);
            }
            Message::DataAck { id, seq } => {
                buf.put_u8(TYPE_DATA_ACK);
                buf.put_u16(id);
                buf.put_u32(seq);
            }
            Message::Close { id } => {
                buf.put_u8(TYPE_CLOSE);
                buf.put_u16(id);
            }
        }

        buf.to_vec()
    }

    fn parse(mut data: &'a [u8]) -> Option<Self> {
        if data.remaining() < 3 {
            return None;
        }

        let typ = data.get_u8();
        let id = data.get_u16();

        let message = match typ {
            TYPE_OPEN => {
                if data.remaining() < 3 {
                    return None;
                }

                let reliable = data.get_u8() != 0;
                let len = usize::from(data.get_u16());
                let label = std::str::from_utf8(data.get(..len)?).ok()?;

                Message::Open {
                    id,
                    reliable,
                    label,
                }
            }
            TYPE_ACK => Message::Ack { id },
            TYPE_DATA => {
                if data.remaining() < 4 {
                    return None;
                }

                let seq = data.get_u32();

                Message::Data {
                    id,
                    seq,
                    payload: data,
                }
            }
            TYPE_DATA_ACK => {
                if data.remaining() < 4 {
                    return None;
                }

                Message::DataAck {
                    id,
                    seq: data.get_u32(),
                }
            }
            TYPE_CLOSE => Message::Close { id },
            _ => return None,
        };

        Some(message)
    }
}

struct Pending {
    message: Vec<u8>,
    retransmit_at: Instant,
    attempts: u32,
}

impl Pending {
    fn new(now: Instant, message: Vec<u8>) -> Self {
        Self {
            message,
            retransmit_at: now + INITIAL_RETRANSMIT,
            attempts: 1,
        }
    }
}

struct Channel {
    label: String,
    reliable: bool,
    state: ChannelState,
    wire_id: Option<u16>,

    open: Option<Pending>,

    next_send_seq: u32,
    unacked: BTreeMap<u32, Pending>,

    next_recv_seq: u32,
    reorder: BTreeMap<u32, Vec<u8>>,
}

impl Channel {
    fn new(label: String, reliable: bool, state: ChannelState, wire_id: Option<u16>) -> Self {
        Self {
            label,
            reliable,
            state,
            wire_id,
            open: None,
            next_send_seq: 0,
            unacked: BTreeMap::new(),
            next_recv_seq: 0,
            reorder: BTreeMap::new(),
        }
    }

    fn closed(&mut self) {
        self.state = ChannelState::Closed;
        self.open = None;
        self.unacked.clear();
        self.reorder.clear();
    }
}

/// All data channels of a flow
pub(crate) struct DataChannels {
    channels: SlotMap<ChannelId, Channel>,
    /// Set once the DTLS role is known
    is_client: Option<bool>,
    next_wire_id: u16,
    /// Closed channels, oldest first
    closed: VecDeque<ChannelId>,
    outbound: VecDeque<Vec<u8>>,
    events: VecDeque<ChannelEvent>,
}

impl DataChannels {
    pub(crate) fn new() -> Self {
        Self {
            channels: SlotMap::with_key(),
            is_client: None,
            next_wire_id: 0,
            closed: VecDeque::new(),
            outbound: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    /// The DTLS session is connected, send the open requests of every channel created so far
    pub(crate) fn start(&mut self, now: Instant, is_client: bool) {
        if self.is_client.is_some() {
            return;
        }

        self.is_client = Some(is_client);
        self.next_wire_id = if is_client { 0 } else { 1 };

        let waiting: Vec<ChannelId> = self
            .channels
            .iter()
            .filter(|(_, c)| c.wire_id.is_none() && c.state == ChannelState::Connecting)
            .map(|(id, _)| id)
            .collect();

        for id in waiting {
            self.send_open(now, id);
        }
    }

    fn allocate_wire_id(&mut self) -> u16 {
        let id = self.next_wire_id;
        self.next_wire_id = self.next_wire_id.wrapping_add(2);
        id
    }

    fn send_open(&mut self, now: Instant, id: ChannelId) {
        let wire_id = self.allocate_wire_id();
        let channel = &mut self.channels[id];

        let message = Message::Open {
            id: wire_id,
            reliable: channel.reliable,
            label: &channel.label,
        }
        .encode();

        log::debug!("opening data channel {:?} with id {wire_id}", channel.label);

        channel.wire_id = Some(wire_id);
        channel.open = Some(Pending::new(now, message.clone()));
        self.outbound.push_back(message);
    }

    /// Open a channel, returns the existing channel if one with the same label is not closed
    pub(crate) fn open(&mut self, now: Instant, label: &str, reliable: bool) -> ChannelId {
        if let Some(id) = self.find_by_label(label) {
            return id;
        }

        let id = self.channels.insert(Channel::new(
            label.into(),
            reliable,
            ChannelState::Connecting,
            None,
        ));

        if self.is_client.is_some() {
            self.send_open(now, id);
        }

        id
    }

    pub(crate) fn send(&mut self, now: Instant, id: ChannelId, data: &[u8]) -> Result<(), Error> {
        let channel = self.channels.get_mut(id).ok_or(Error::UnknownChannel)?;

        let (ChannelState::Open, Some(wire_id)) = (channel.state, channel.wire_id) else {
            return Err(Error::ChannelNotReady);
        };

        let seq = channel.next_send_seq;
        channel.next_send_seq = channel.next_send_seq.wrapping_add(1);

        let message = Message::Data {
            id: wire_id,
            seq,
            payload: data,
        }
        .encode();

        if channel.reliable {
            channel
                .unacked
                .insert(seq, Pending::new(now, message.clone()));
        }

        self.outbound.push_back(message);

        Ok(())
    }

    /// Close the channel, the peer is notified without waiting for a response
    pub(crate) fn close(&mut self, id: ChannelId) -> Result<(), Error> {
        let channel = self.channels.get_mut(id).ok_or(Error::UnknownChannel)?;

        if channel.state == ChannelState::Closed {
            return Ok(());
        }

        if let Some(wire_id) = channel.wire_id {
            self.outbound
                .push_back(Message::Close { id: wire_id }.encode());
        }

        self.set_closed(id);

        Ok(())
    }

    fn set_closed(&mut self, id: ChannelId) {
        self.channels[id].closed();
        self.closed.push_back(id);

        while self.closed.len() > MAX_CLOSED_CHANNELS {
            if let Some(oldest) = self.closed.pop_front() {
                self.channels.remove(oldest);
            }
        }
    }

    /// State of the channel, `None` for unknown channels and channels that closed long ago
    pub(crate) fn state(&self, id: ChannelId) -> Option<ChannelState> {
        self.channels.get(id).map(|c| c.state)
    }

    pub(crate) fn label(&self, id: ChannelId) -> Option<&str> {
        self.channels.get(id).map(|c| c.label.as_str())
    }

    fn find_by_label(&self, label: &str) -> Option<ChannelId> {
        self.channels
            .iter()
            .find(|(_, c)| c.label == label && c.state != ChannelState::Closed)
            .map(|(id, _)| id)
    }

    fn find_by_wire_id(&self, wire_id: u16) -> Option<ChannelId> {
        self.channels
            .iter()
            .find(|(_, c)| c.wire_id == Some(wire_id) && c.state != ChannelState::Closed)
            .map(|(id, _)| id)
    }

    fn set_open(&mut self, id: ChannelId) {
        let channel = &mut self.channels[id];

        if channel.state == ChannelState::Connecting {
            log::debug!("data channel {:?} is open", channel.label);

            channel.state = ChannelState::Open;
            self.events.push_back(ChannelEvent::Opened {
                id,
                label: channel.label.clone(),
            });
        }
    }

    /// Receive a DTLS application data record, ignored until [`start`](Self::start) was called
    pub(crate) fn receive(&mut self, data: &[u8]) {
        if self.is_client.is_none() {
            log::trace!("discarding data channel message, channels are not started");
            return;
        }

        let Some(message) = Message::parse(data) else {
            log::trace!("discarding malformed data channel message");
            return;
        };

        match message {
            Message::Open {
                id: wire_id,
                reliable,
                label,
            } => self.receive_open(wire_id, reliable, label),
            Message::Ack { id: wire_id } => {
                if let Some(id) = self.find_by_wire_id(wire_id) {
                    self.channels[id].open = None;
                    self.set_open(id);
                }
            }
            Message::Data {
                id: wire_id,
                seq,
                payload,
            } => self.receive_data(wire_id, seq, payload),
            Message::DataAck { id: wire_id, seq } => {
                if let Some(id) = self.find_by_wire_id(wire_id) {
                    self.channels[id].unacked.remove(&seq);
                }
            }
            Message::Close { id: wire_id } => {
                if let Some(id) = self.find_by_wire_id(wire_id) {
                    log::debug!("data channel {:?} closed by peer", self.channels[id].label);

                    self.set_closed(id);
                    self.events.push_back(ChannelEvent::Closed { id });
                }
            }
        }
    }

    fn receive_open(&mut self, wire_id: u16, reliable: bool, label: &str) {
        let Some(id) = self.find_by_label(label) else {
            log::debug!("peer opened data channel {label:?} with id {wire_id}");

            let id = self.channels.insert(Channel::new(
                label.into(),
                reliable,
                ChannelState::Connecting,
                Some(wire_id),
            ));

            self.outbound
                .push_back(Message::Ack { id: wire_id }.encode());
            self.set_open(id);
            return;
        };

        let channel = &mut self.channels[id];

        match channel.wire_id {
            // retransmitted open
            Some(own) if own == wire_id => {}
            // both sides opened the same label, the client's (even) id wins
            Some(own) if own % 2 == 1 && wire_id % 2 == 0 => {
                log::debug!("data channel {label:?} merged into id {wire_id}");

                channel.wire_id = Some(wire_id);
                channel.open = None;
            }
            Some(_) => {
                // the peer adopts our id once it receives our open
                self.set_open(id);
                return;
            }
            None => {
                channel.wire_id = Some(wire_id);
                channel.open = None;
            }
        }

        self.outbound
            .push_back(Message::Ack { id: wire_id }.encode());
        self.set_open(id);
    }

    fn receive_data(&mut self, wire_id: u16, seq: u32, payload: &[u8]) {
        let Some(id) = self.find_by_wire_id(wire_id) else {
            log::trace!("discarding data for unknown channel id {wire_id}");
            return;
        };

        // Data implies that the peer received our open
        self.channels[id].open = None;
        self.set_open(id);

        let channel = &mut self.channels[id];

        if !channel.reliable {
            self.events.push_back(ChannelEvent::Message {
                id,
                data: payload.to_vec(),
            });
            return;
        }

        self.outbound
            .push_back(Message::DataAck { id: wire_id, seq }.encode());

        if seq.wrapping_sub(channel.next_recv_seq) > u32::MAX / 2 {
            // duplicate of an already delivered message
            return;
        }

        channel.reorder.insert(seq, payload.to_vec());

        while let Some(data) = channel.reorder.remove(&channel.next_recv_seq) {
            channel.next_recv_seq = channel.next_recv_seq.wrapping_add(1);
            self.events.push_back(ChannelEvent::Message { id, data });
        }
    }

    pub(crate) fn poll(&mut self, now: Instant) {
        let mut expired_channels = vec![];

        for (id, channel) in &mut self.channels {
            let mut expired = false;

            let pending = channel.open.iter_mut().chain(channel.unacked.values_mut());

            for pending in pending {
                if pending.retransmit_at > now {
                    continue;
                }

                if pending.attempts >= MAX_ATTEMPTS {
                    expired = true;
                    break;
                }

                let delta = min(INITIAL_RETRANSMIT * (1 << pending.attempts), MAX_RETRANSMIT);

                pending.attempts += 1;
                pending.retransmit_at = now + delta;
                self.outbound.push_back(pending.message.clone());
            }

            if expired {
                log::debug!(
                    "data channel {:?} closed, peer stopped acknowledging",
                    channel.label
                );

                expired_channels.push(id);
            }
        }

        for id in expired_channels {
            self.set_closed(id);
            self.events.push_back(ChannelEvent::Closed { id });
        }
    }

    pub(crate) fn timeout(&self, now: Instant) -> Option<Duration> {
        self.channels
            .values()
            .flat_map(|c| c.open.iter().chain(c.unacked.values()))
            .map(|p| p.retransmit_at.saturating_duration_since(now))
            .min()
    }

    pub(crate) fn pop_outbound(&mut self) -> Option<Vec<u8>> {
        self.outbound.pop_front()
    }

    pub(crate) fn pop_event(&mut self) -> Option<ChannelEvent> {
        self.events.pop_front()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn exchange(now: Instant, a: &mut DataChannels, b: &mut DataChannels) {
        loop {
            let mut any = false;

            while let Some(msg) = a.pop_outbound() {
                b.receive(&msg);
                any = true;
            }

            while let Some(msg) = b.pop_outbound() {
                a.receive(&msg);
                any = true;
            }

            if !any {
                break;
            }

            a.poll(now);
            b.poll(now);
        }
    }

    fn opened(channels: &mut DataChannels) -> Vec<String> {
        let mut labels = vec![];

        while let Some(event) = channels.pop_event() {
            if let ChannelEvent::Opened { label, .. } = event {
                labels.push(label);
            }
        }

        labels
    }

    #[test]
    fn message_encoding() {
        let open = Message::Open {
            id: 2,
            reliable: true,
            label: "chat",
        };

        let encoded = open.encode();
        assert_eq!(encoded, [0x03, 0x00, 0x02, 0x01, 0x00, 0x04, b'c', b'h', b'a', b't']);
        assert_eq!(Message::parse(&encoded), Some(open));

        assert_eq!(
            Message::parse(&[0x01, 0x00, 0x03, 0, 0, 0, 7, 0xFF]),
            Some(Message::Data {
                id: 3,
                seq: 7,
                payload: &[0xFF]
            })
        );

        // truncated label
        assert_eq!(Message::parse(&[0x03, 0x00, 0x02, 0x01, 0x00, 0x04, b'c']), None);
        assert_eq!(Message::parse(&[0x09, 0x00, 0x02]), None);
    }

    #[test]
    fn open_before_start_is_queued() {
        let now = Instant::now();
        let mut client = DataChannels::new();
        let mut server = DataChannels::new();

        let id = client.open(now, "calling-3.0", true);
        assert!(client.pop_outbound().is_none());
        assert!(matches!(client.send(now, id, b"early"), Err(Error::ChannelNotReady)));

        client.start(now, true);
        server.start(now, false);
        exchange(now, &mut client, &mut server);

        assert_eq!(client.state(id), Some(ChannelState::Open));
        assert_eq!(opened(&mut client), ["calling-3.0"]);
        assert_eq!(opened(&mut server), ["calling-3.0"]);
    }

    #[test]
    fn simultaneous_open_merges() {
        let now = Instant::now();
        let mut client = DataChannels::new();
        let mut server = DataChannels::new();

        client.start(now, true);
        server.start(now, false);

        let client_id = client.open(now, "calling-3.0", true);
        let server_id = server.open(now, "calling-3.0", true);

        exchange(now, &mut client, &mut server);

        assert_eq!(client.channels[client_id].wire_id, Some(0));
        assert_eq!(server.channels[server_id].wire_id, Some(0));
        assert_eq!(opened(&mut client).len(), 1);
        assert_eq!(opened(&mut server).len(), 1);

        assert!(client.channels[client_id].open.is_none());
        assert!(server.channels[server_id].open.is_none());
        assert_eq!(client.open(now, "calling-3.0", false), client_id);
    }

    #[test]
    fn reliable_delivery_is_ordered() {
        let now = Instant::now();
        let mut client = DataChannels::new();
        let mut server = DataChannels::new();

        client.start(now, true);
        server.start(now, false);

        let id = client.open(now, "chat", true);
        exchange(now, &mut client, &mut server);
        opened(&mut server);

        client.send(now, id, b"one").unwrap();
        client.send(now, id, b"two").unwrap();

        let first = client.pop_outbound().unwrap();
        let second = client.pop_outbound().unwrap();

        // deliver out of order
        server.receive(&second);
        assert!(server.pop_event().is_none());
        server.receive(&first);

        let mut received = vec![];
        while let Some(ChannelEvent::Message { data, .. }) = server.pop_event() {
            received.push(data);
        }
        assert_eq!(received, [b"one".to_vec(), b"two".to_vec()]);

        // duplicates are acknowledged but not delivered twice
        server.receive(&first);
        assert!(server.pop_event().is_none());

        exchange(now, &mut client, &mut server);
        assert!(client.channels[id].unacked.is_empty());
    }

    #[test]
    fn unacknowledged_open_is_retransmitted_then_closed() {
        let mut now = Instant::now();
        let mut client = DataChannels::new();

        client.start(now, true);
        let id = client.open(now, "lost", true);
        assert!(client.pop_outbound().is_some());

        let mut retransmits = 0;

        while client.state(id) == Some(ChannelState::Connecting) {
            now += client.timeout(now).unwrap();
            client.poll(now);

            while client.pop_outbound().is_some() {
                retransmits += 1;
            }
        }

        assert_eq!(retransmits, MAX_ATTEMPTS - 1);
        assert_eq!(client.state(id), Some(ChannelState::Closed));
        assert!(matches!(client.pop_event(), Some(ChannelEvent::Closed { .. })));
        assert!(client.timeout(now).is_none());
    }

    #[test]
    fn messages_before_start_are_ignored() {
        let now = Instant::now();
        let mut peer = DataChannels::new();
        peer.start(now, true);
        peer.open(now, "chat", true);
        let open = peer.pop_outbound().unwrap();

        // channels of a flow which did not negotiate data are never started
        let mut unused = DataChannels::new();
        unused.receive(&open);

        assert!(unused.pop_event().is_none());
        assert!(unused.pop_outbound().is_none());
        assert!(unused.channels.is_empty());
    }

    #[test]
    fn long_labels_are_cut_on_char_boundary() {
        let label = "ä".repeat(usize::from(u16::MAX) / 2 + 1);
        assert!(label.len() > usize::from(u16::MAX));

        let encoded = Message::Open {
            id: 0,
            reliable: true,
            label: &label,
        }
        .encode();

        let Some(Message::Open { label: parsed, .. }) = Message::parse(&encoded) else {
            panic!("truncated open must parse");
        };

        assert_eq!(parsed.len(), usize::from(u16::MAX) - 1);
        assert!(parsed.chars().all(|c| c == 'ä'));
    }

    #[test]
    fn closed_channels_are_forgotten() {
        let now = Instant::now();
        let mut client = DataChannels::new();
        client.start(now, true);

        let ids: Vec<ChannelId> = (0..40)
            .map(|i| {
                let id = client.open(now, &format!("channel-{i}"), false);
                client.close(id).unwrap();
                id
            })
            .collect();

        assert_eq!(client.channels.len(), MAX_CLOSED_CHANNELS);
        assert_eq!(client.state(ids[0]), None);
        assert_eq!(client.state(ids[39]), Some(ChannelState::Closed));
    }

    #[test]
    fn close_is_unilateral() {
        let now = Instant::now();
        let mut client = DataChannels::new();
        let mut server = DataChannels::new();

        client.start(now, true);
        server.start(now, false);

        let id = client.open(now, "chat", false);
        exchange(now, &mut client, &mut server);
        opened(&mut client);
        opened(&mut server);

        client.close(id).unwrap();
        assert_eq!(client.state(id), Some(ChannelState::Closed));
        assert!(matches!(client.send(now, id, b"late"), Err(Error::ChannelNotReady)));

        exchange(now, &mut client, &mut server);
        assert!(matches!(server.pop_event(), Some(ChannelEvent::Closed { .. })));

        assert!(matches!(
            client.close(ChannelId::default()),
            Err(Error::UnknownChannel)
        ));
    }
}
