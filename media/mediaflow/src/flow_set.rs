use crate::{Mediaflow, MediaflowEvent, opt_min};
use ice::ReceivedPkt;
use slotmap::{SlotMap, new_key_type};
use std::{
    collections::VecDeque,
    net::SocketAddr,
    time::{Duration, Instant},
};

new_key_type! {
    /// Key of a [`Mediaflow`] inside a [`FlowSet`]
    pub struct FlowId;
}

/// Owns the flows of one event loop and multiplexes their events
///
/// Flows are fully independent of each other, the set only routes calls by [`FlowId`].
#[derive(Default)]
pub struct FlowSet {
    flows: SlotMap<FlowId, Mediaflow>,
    events: VecDeque<(FlowId, MediaflowEvent)>,
}

impl FlowSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, flow: Mediaflow) -> FlowId {
        self.flows.insert(flow)
    }

    pub fn get(&self, id: FlowId) -> Option<&Mediaflow> {
        self.flows.get(id)
    }

    pub fn get_mut(&mut self, id: FlowId) -> Option<&mut Mediaflow> {
        self.flows.get_mut(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = FlowId> + '_ {
        self.flows.keys()
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Destroy a flow, cancelling everything in flight
    ///
    /// The flow is closed first, the resulting events (TURN deallocations, DTLS close_notify and the
    /// `Closed` event) are still returned by [`pop_event`](FlowSet::pop_event).
    pub fn remove(&mut self, now: Instant, id: FlowId) -> bool {
        let Some(mut flow) = self.flows.remove(id) else {
            return false;
        };

        flow.close(now);

        while let Some(event) = flow.pop_event() {
            self.events.push_back((id, event));
        }

        true
    }

    pub fn receive(&mut self, now: Instant, id: FlowId, pkt: ReceivedPkt) {
        let Some(flow) = self.flows.get_mut(id) else {
            log::trace!("Dropping packet for removed flow from {}", pkt.source);
            return;
        };

        flow.receive(now, pkt);
        Self::collect(&mut self.events, id, flow);
    }

    pub fn receive_stream(&mut self, now: Instant, id: FlowId, server: SocketAddr, data: &[u8]) {
        if let Some(flow) = self.flows.get_mut(id) {
            flow.receive_stream(now, server, data);
            Self::collect(&mut self.events, id, flow);
        }
    }

    /// Poll every flow
    pub fn poll(&mut self, now: Instant) {
        for (id, flow) in &mut self.flows {
            flow.poll(now);
            Self::collect(&mut self.events, id, flow);
        }
    }

    /// Earliest timeout of all flows
    pub fn timeout(&self, now: Instant) -> Option<Duration> {
        if !self.events.is_empty() {
            return Some(Duration::ZERO);
        }

        self.flows
            .values()
            .fold(None, |timeout, flow| opt_min(timeout, flow.timeout(now)))
    }

    pub fn pop_event(&mut self) -> Option<(FlowId, MediaflowEvent)> {
        self.events.pop_front()
    }

    fn collect(events: &mut VecDeque<(FlowId, MediaflowEvent)>, id: FlowId, flow: &mut Mediaflow) {
        while let Some(event) = flow.pop_event() {
            events.push_back((id, event));
        }
    }
}
