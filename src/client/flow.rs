//! Per-flow state and packet classification on the endpoint.

use std::collections::VecDeque;

use rustc_hash::FxHashMap;

use crate::demand::{Counters, QueueState};

pub type FlowId = u32;

/// Scheduled flows wait for timeslot grants; the internal flow carries
/// control-plane traffic straight to the wire.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FlowKind {
    Internal,
    Scheduled,
}

pub struct Flow<T> {
    pub src_dst_key: u64,
    pub kind: FlowKind,
    pub state: QueueState,
    pub counters: Counters,

    /// Transmission budget remaining in the last scheduled timeslot, in
    /// nanoseconds of line time. Goes negative when a packet overruns it.
    pub credit: i64,

    queue: VecDeque<(u32, T)>,
}

impl<T> Flow<T> {
    pub fn new(src_dst_key: u64, kind: FlowKind) -> Self {
        Self {
            src_dst_key,
            kind,
            state: QueueState::Unqueued,
            counters: Counters::default(),
            credit: 0,
            queue: VecDeque::new(),
        }
    }

    pub fn qlen(&self) -> u32 {
        self.queue.len() as u32
    }

    pub fn push(&mut self, len_bytes: u32, pkt: T) {
        self.queue.push_back((len_bytes, pkt));
    }

    pub fn pop(&mut self) -> Option<(u32, T)> {
        self.queue.pop_front()
    }

    pub fn peek_len(&self) -> Option<u32> {
        self.queue.front().map(|(len, _)| *len)
    }
}

/// Slab of flows with stable indices plus a key index. A flow never moves
/// once created, so a `FlowId` stays valid until the flow is removed.
pub struct FlowTable<T> {
    slots: Vec<Option<Flow<T>>>,
    free: Vec<FlowId>,
    index: FxHashMap<u64, FlowId>,
}

impl<T> FlowTable<T> {
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            slots: Vec::with_capacity(cap),
            free: Vec::new(),
            index: FxHashMap::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn lookup(&self, key: u64) -> Option<FlowId> {
        self.index.get(&key).copied()
    }

    pub fn get(&self, id: FlowId) -> &Flow<T> {
        self.slots[id as usize].as_ref().expect("stale flow id")
    }

    pub fn get_mut(&mut self, id: FlowId) -> &mut Flow<T> {
        self.slots[id as usize].as_mut().expect("stale flow id")
    }

    /// Lookup tolerating ids whose flow has been removed; queue entries can
    /// outlive their flow.
    pub fn try_get_mut(&mut self, id: FlowId) -> Option<&mut Flow<T>> {
        self.slots.get_mut(id as usize).and_then(|slot| slot.as_mut())
    }

    pub fn get_or_create(&mut self, key: u64) -> FlowId {
        if let Some(id) = self.lookup(key) {
            return id;
        }

        let flow = Flow::new(key, FlowKind::Scheduled);

        let id = match self.free.pop() {
            Some(id) => {
                self.slots[id as usize] = Some(flow);
                id
            }
            None => {
                let id = self.slots.len() as FlowId;
                self.slots.push(Some(flow));
                id
            }
        };

        self.index.insert(key, id);
        id
    }

    pub fn remove(&mut self, id: FlowId) {
        let flow = self.slots[id as usize].take().expect("stale flow id");
        self.index.remove(&flow.src_dst_key);
        self.free.push(id);
    }

    pub fn ids(&self) -> Vec<FlowId> {
        self.index.values().copied().collect()
    }
}

/// What the classifier needs to know about an outgoing packet.
#[derive(Clone, Copy, Debug)]
pub struct PktInfo {
    pub len_bytes: u32,
    pub priority: u8,
    pub proto: PktProto,
    pub src_ip: u32,
    pub dst_ip: u32,
    pub dst_port: u16,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PktProto {
    Tcp,
    Udp,
    Arp,
    Other(u8),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Classification {
    /// Control-plane traffic: skip the timeslot machinery entirely.
    Internal(InternalReason),
    /// Data traffic, keyed by destination.
    Key(u64),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InternalReason {
    HighPrio,
    Ntp,
    Arp,
    CannotClassify,
}

const NTP_PORT: u16 = 123;

const PRIO2BAND: [u8; 16] = [1, 2, 2, 2, 1, 2, 0, 0, 1, 1, 1, 1, 1, 1, 1, 1];

/// Translates an IP address to a short endpoint ID.
pub fn ip_to_id(ipaddr: u32) -> u16 {
    (ipaddr & ((1 << 8) - 1)) as u16
}

pub fn classify(info: &PktInfo) -> Classification {
    let band = PRIO2BAND[(info.priority & 0xF) as usize];
    if band == 0 {
        return Classification::Internal(InternalReason::HighPrio);
    }

    match info.proto {
        PktProto::Arp => Classification::Internal(InternalReason::Arp),
        PktProto::Udp if info.dst_port == NTP_PORT => {
            Classification::Internal(InternalReason::Ntp)
        }
        PktProto::Tcp | PktProto::Udp => Classification::Key(ip_to_id(info.dst_ip) as u64),
        PktProto::Other(_) => {
            if info.dst_ip == 0 {
                Classification::Internal(InternalReason::CannotClassify)
            } else {
                Classification::Key(ip_to_id(info.dst_ip) as u64)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(priority: u8, proto: PktProto, dst_ip: u32, dst_port: u16) -> PktInfo {
        PktInfo {
            len_bytes: 1500,
            priority,
            proto,
            src_ip: 0x0A000001,
            dst_ip,
            dst_port,
        }
    }

    #[test]
    fn classification_bands() {
        // TC_PRIO_CONTROL maps to band 0
        assert_eq!(
            classify(&info(7, PktProto::Tcp, 0x0A000005, 80)),
            Classification::Internal(InternalReason::HighPrio)
        );

        assert_eq!(
            classify(&info(0, PktProto::Tcp, 0x0A000005, 80)),
            Classification::Key(5)
        );

        assert_eq!(
            classify(&info(0, PktProto::Udp, 0x0A000005, NTP_PORT)),
            Classification::Internal(InternalReason::Ntp)
        );

        assert_eq!(
            classify(&info(0, PktProto::Arp, 0, 0)),
            Classification::Internal(InternalReason::Arp)
        );
    }

    #[test]
    fn table_identity_is_stable() {
        let mut table: FlowTable<()> = FlowTable::with_capacity(4);

        let a = table.get_or_create(5);
        let b = table.get_or_create(9);
        assert_ne!(a, b);
        assert_eq!(table.get_or_create(5), a);

        // Force slot reuse; the key index follows
        table.remove(a);
        assert_eq!(table.lookup(5), None);
        let c = table.get_or_create(11);
        assert_eq!(c, a);
        assert_eq!(table.lookup(11), Some(c));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn flow_fifo_order() {
        let mut flow: Flow<u32> = Flow::new(1, FlowKind::Scheduled);

        flow.push(100, 1);
        flow.push(200, 2);

        assert_eq!(flow.peek_len(), Some(100));
        assert_eq!(flow.pop(), Some((100, 1)));
        assert_eq!(flow.pop(), Some((200, 2)));
        assert_eq!(flow.pop(), None);
    }
}
