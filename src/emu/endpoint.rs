//! Emulated endpoint groups: a rack's worth of endpoints sharing a driver.

use super::packet::{EmuOutput, EmuPacket};
use super::qmgr::{Dropper, DropTailQm, QueueManager, Scheduler, SingleQueueSch};
use super::queue_bank::{PortDropStats, QueueBank, QueueBankStats};

/// Endpoints are symmetric to router ports: traffic from the application
/// side queues in a per-endpoint FIFO until the endpoint's network port can
/// take it; traffic from the network side is delivered up the stack, which
/// in the emulation means it becomes admitted traffic.
pub struct EndpointGroup {
    first_id: u16,
    n_endpoints: usize,
    bank: QueueBank,
    qm: DropTailQm,
    sch: SingleQueueSch,
}

impl EndpointGroup {
    pub fn new(first_id: u16, n_endpoints: usize, queue_capacity: u32) -> Self {
        Self {
            first_id,
            n_endpoints,
            bank: QueueBank::new(n_endpoints, 1),
            qm: DropTailQm {
                capacity: queue_capacity,
            },
            sch: SingleQueueSch,
        }
    }

    pub fn first_id(&self) -> u16 {
        self.first_id
    }

    pub fn n_endpoints(&self) -> usize {
        self.n_endpoints
    }

    pub fn contains(&self, endpoint: u16) -> bool {
        (endpoint as usize).wrapping_sub(self.first_id as usize) < self.n_endpoints
    }

    fn port_of(&self, endpoint: u16) -> usize {
        debug_assert!(self.contains(endpoint));
        (endpoint - self.first_id) as usize
    }

    /// A packet arrived from the application (comm core): queue it at its
    /// source endpoint, dropping on overflow.
    pub fn rcv_from_app(&mut self, pkt: EmuPacket, time: u64, dropper: &mut Dropper) {
        let port = self.port_of(pkt.src);
        self.qm.enqueue(&mut self.bank, port, 0, pkt, time, dropper);
    }

    /// A packet arrived from the network for one of our endpoints: deliver
    /// it up the stack, which admits it.
    pub fn rcv_from_net(&mut self, pkt: EmuPacket, output: &mut EmuOutput) {
        debug_assert!(self.contains(pkt.dst));
        output.admit(pkt);
    }

    /// One packet per endpoint port, at most `max` total.
    pub fn pull_batch(&mut self, max: usize, out: &mut Vec<EmuPacket>) -> usize {
        let mut n = 0;
        for port in 0..self.n_endpoints {
            if n >= max {
                break;
            }
            if let Some(pkt) = self.sch.pull(&mut self.bank, port) {
                out.push(pkt);
                n += 1;
            }
        }
        n
    }

    /// The endpoint lost sync with the arbiter and rebased its demand:
    /// everything queued here is stale and gets dropped on the floor.
    pub fn reset(&mut self, endpoint: u16) {
        if !self.contains(endpoint) {
            return;
        }
        let port = self.port_of(endpoint);
        self.bank.drain_port(port);
    }

    pub fn queue_bank_stats(&self) -> &QueueBankStats {
        self.bank.stats()
    }

    pub fn port_drop_stats(&self) -> &PortDropStats {
        self.bank.port_drop_stats()
    }
}
