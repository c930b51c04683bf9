//! Port x queue FIFO bank shared by a router's queue manager and scheduler.

use std::collections::VecDeque;

use super::packet::EmuPacket;

/// Read-only snapshot counters, one slot per (port, queue).
#[derive(Clone, Debug)]
pub struct QueueBankStats {
    n_queues: usize,
    pub high_water: Vec<u32>,
    pub enqueues: Vec<u64>,
    pub drops: Vec<u64>,
    pub marks: Vec<u64>,
}

impl QueueBankStats {
    fn new(n_ports: usize, n_queues: usize) -> Self {
        let n = n_ports * n_queues;
        Self {
            n_queues,
            high_water: vec![0; n],
            enqueues: vec![0; n],
            drops: vec![0; n],
            marks: vec![0; n],
        }
    }

    pub fn slot(&self, port: usize, queue: usize) -> usize {
        port * self.n_queues + queue
    }
}

/// Per-port drop accounting, split by who made the decision.
#[derive(Clone, Debug, Default)]
pub struct PortDropStats {
    pub qm_drops: Vec<u64>,
    pub full_drops: Vec<u64>,
}

pub struct QueueBank {
    n_ports: usize,
    n_queues: usize,
    queues: Vec<VecDeque<EmuPacket>>,
    stats: QueueBankStats,
    port_drops: PortDropStats,
}

impl QueueBank {
    pub fn new(n_ports: usize, n_queues: usize) -> Self {
        assert!(n_ports > 0 && n_queues > 0);

        Self {
            n_ports,
            n_queues,
            queues: (0..n_ports * n_queues).map(|_| VecDeque::new()).collect(),
            stats: QueueBankStats::new(n_ports, n_queues),
            port_drops: PortDropStats {
                qm_drops: vec![0; n_ports],
                full_drops: vec![0; n_ports],
            },
        }
    }

    pub fn n_ports(&self) -> usize {
        self.n_ports
    }

    pub fn n_queues(&self) -> usize {
        self.n_queues
    }

    fn slot(&self, port: usize, queue: usize) -> usize {
        debug_assert!(port < self.n_ports && queue < self.n_queues);
        port * self.n_queues + queue
    }

    pub fn occupancy(&self, port: usize, queue: usize) -> u32 {
        self.queues[self.slot(port, queue)].len() as u32
    }

    /// Unconditional enqueue; admission decisions belong to the queue
    /// manager in front of the bank.
    pub fn enqueue(&mut self, port: usize, queue: usize, pkt: EmuPacket) {
        let slot = self.slot(port, queue);
        self.queues[slot].push_back(pkt);

        self.stats.enqueues[slot] += 1;
        let occupancy = self.queues[slot].len() as u32;
        if occupancy > self.stats.high_water[slot] {
            self.stats.high_water[slot] = occupancy;
        }
    }

    pub fn dequeue(&mut self, port: usize, queue: usize) -> Option<EmuPacket> {
        let slot = self.slot(port, queue);
        self.queues[slot].pop_front()
    }

    pub fn drain_port(&mut self, port: usize) -> Vec<EmuPacket> {
        let mut out = Vec::new();
        for queue in 0..self.n_queues {
            let slot = self.slot(port, queue);
            out.extend(self.queues[slot].drain(..));
        }
        out
    }

    pub fn record_mark(&mut self, port: usize, queue: usize) {
        let slot = self.slot(port, queue);
        self.stats.marks[slot] += 1;
    }

    pub fn record_qm_drop(&mut self, port: usize, queue: usize) {
        let slot = self.slot(port, queue);
        self.stats.drops[slot] += 1;
        self.port_drops.qm_drops[port] += 1;
    }

    pub fn record_full_drop(&mut self, port: usize, queue: usize) {
        let slot = self.slot(port, queue);
        self.stats.drops[slot] += 1;
        self.port_drops.full_drops[port] += 1;
    }

    pub fn stats(&self) -> &QueueBankStats {
        &self.stats
    }

    pub fn port_drop_stats(&self) -> &PortDropStats {
        &self.port_drops
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkt(src: u16, dst: u16) -> EmuPacket {
        EmuPacket {
            src,
            dst,
            flow: 0,
            id: 0,
            prio: 0,
            ecn: false,
        }
    }

    #[test]
    fn fifo_per_slot() {
        let mut bank = QueueBank::new(2, 2);

        bank.enqueue(1, 0, pkt(1, 2));
        bank.enqueue(1, 0, pkt(3, 4));
        bank.enqueue(1, 1, pkt(5, 6));

        assert_eq!(bank.occupancy(1, 0), 2);
        assert_eq!(bank.dequeue(1, 0).unwrap().src, 1);
        assert_eq!(bank.dequeue(1, 0).unwrap().src, 3);
        assert_eq!(bank.dequeue(1, 0), None);
        assert_eq!(bank.occupancy(1, 1), 1);
    }

    #[test]
    fn high_water_tracks_peak() {
        let mut bank = QueueBank::new(1, 1);

        for _ in 0..5 {
            bank.enqueue(0, 0, pkt(0, 1));
        }
        for _ in 0..3 {
            bank.dequeue(0, 0);
        }
        bank.enqueue(0, 0, pkt(0, 1));

        let slot = bank.stats().slot(0, 0);
        assert_eq!(bank.stats().high_water[slot], 5);
        assert_eq!(bank.stats().enqueues[slot], 6);
    }
}
