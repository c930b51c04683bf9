//! An emulated router: routing table, classifier, queue manager and
//! scheduler composed over one queue bank.

use rand::rngs::SmallRng;
use rand::SeedableRng;

use super::packet::EmuPacket;
use super::qmgr::{
    DctcpQm, DropTailQm, Dropper, HullParams, HullQm, PrioSch, QueueManager, RedParams, RedQm,
    RrSch, Scheduler, SingleQueueSch,
};
use super::queue_bank::{PortDropStats, QueueBank, QueueBankStats};
use super::EMU_RACK_SHIFT;

pub trait RoutingTable {
    fn route(&self, pkt: &EmuPacket) -> usize;
}

pub trait Classifier {
    fn classify(&self, pkt: &EmuPacket) -> usize;
}

/// Top-of-rack: endpoints of the local rack sit on the low ports, anything
/// else hashes across the uplinks.
pub struct TorRoutingTable {
    rack_index: u16,
    n_endpoint_ports: usize,
    n_uplinks: usize,
}

impl TorRoutingTable {
    pub fn new(rack_index: u16, n_endpoint_ports: usize, n_uplinks: usize) -> Self {
        Self {
            rack_index,
            n_endpoint_ports,
            n_uplinks,
        }
    }
}

fn path_hash(pkt: &EmuPacket) -> usize {
    (7 * pkt.src as usize) + (9 * pkt.dst as usize) + pkt.flow as usize
}

impl RoutingTable for TorRoutingTable {
    fn route(&self, pkt: &EmuPacket) -> usize {
        if (pkt.dst >> EMU_RACK_SHIFT) == self.rack_index {
            (pkt.dst as usize) & (self.n_endpoint_ports - 1)
        } else {
            debug_assert!(self.n_uplinks > 0, "off-rack packet in a single-rack fabric");
            self.n_endpoint_ports + path_hash(pkt) % self.n_uplinks
        }
    }
}

/// Core router: pick a link toward the destination's rack, hashing across
/// the parallel links to that rack.
pub struct CoreRoutingTable {
    links_per_tor: usize,
}

impl CoreRoutingTable {
    pub fn new(links_per_tor: usize) -> Self {
        assert!(links_per_tor.is_power_of_two());
        Self { links_per_tor }
    }
}

impl RoutingTable for CoreRoutingTable {
    fn route(&self, pkt: &EmuPacket) -> usize {
        let tor = (pkt.dst >> EMU_RACK_SHIFT) as usize;
        tor * self.links_per_tor + path_hash(pkt) % self.links_per_tor
    }
}

/// Everything in queue 0.
pub struct SingleQueueCla;

impl Classifier for SingleQueueCla {
    fn classify(&self, _pkt: &EmuPacket) -> usize {
        0
    }
}

/// Queue by packet priority.
pub struct PrioCla {
    n_queues: usize,
}

impl PrioCla {
    pub fn new(n_queues: usize) -> Self {
        Self { n_queues }
    }
}

impl Classifier for PrioCla {
    fn classify(&self, pkt: &EmuPacket) -> usize {
        (pkt.prio as usize).min(self.n_queues - 1)
    }
}

/// Which queue-management scheme a router (or endpoint group) runs.
#[derive(Clone, Copy, Debug)]
pub enum QueueScheme {
    DropTail { capacity: u32 },
    Red(RedParams),
    Dctcp { capacity: u32, mark_threshold: u32 },
    Hull(HullParams),
    Prio { n_queues: usize, capacity: u32 },
    RoundRobin { n_queues: usize, capacity: u32 },
}

impl QueueScheme {
    fn n_queues(&self) -> usize {
        match self {
            QueueScheme::Prio { n_queues, .. } | QueueScheme::RoundRobin { n_queues, .. } => {
                *n_queues
            }
            _ => 1,
        }
    }
}

pub struct Router {
    rt: Box<dyn RoutingTable + Send>,
    cla: Box<dyn Classifier + Send>,
    qm: Box<dyn QueueManager + Send>,
    sch: Box<dyn Scheduler + Send>,
    bank: QueueBank,
}

impl Router {
    pub fn new(
        scheme: QueueScheme,
        rt: Box<dyn RoutingTable + Send>,
        n_ports: usize,
        seed: u64,
    ) -> Self {
        let n_queues = scheme.n_queues();
        let bank = QueueBank::new(n_ports, n_queues);

        let cla: Box<dyn Classifier + Send> = match scheme {
            QueueScheme::Prio { .. } | QueueScheme::RoundRobin { .. } => {
                Box::new(PrioCla::new(n_queues))
            }
            _ => Box::new(SingleQueueCla),
        };

        let qm: Box<dyn QueueManager + Send> = match scheme {
            QueueScheme::DropTail { capacity } => Box::new(DropTailQm { capacity }),
            QueueScheme::Red(params) => Box::new(RedQm::new(
                params,
                n_ports,
                n_queues,
                SmallRng::seed_from_u64(seed),
            )),
            QueueScheme::Dctcp {
                capacity,
                mark_threshold,
            } => Box::new(DctcpQm {
                capacity,
                mark_threshold,
            }),
            QueueScheme::Hull(params) => Box::new(HullQm::new(params, n_ports)),
            QueueScheme::Prio { capacity, .. } | QueueScheme::RoundRobin { capacity, .. } => {
                Box::new(DropTailQm { capacity })
            }
        };

        let sch: Box<dyn Scheduler + Send> = match scheme {
            QueueScheme::Prio { .. } => Box::new(PrioSch),
            QueueScheme::RoundRobin { .. } => Box::new(RrSch::new(n_ports)),
            _ => Box::new(SingleQueueSch),
        };

        Self {
            rt,
            cla,
            qm,
            sch,
            bank,
        }
    }

    pub fn n_ports(&self) -> usize {
        self.bank.n_ports()
    }

    pub fn push(&mut self, pkt: EmuPacket, time: u64, dropper: &mut Dropper) {
        let port = self.rt.route(&pkt);
        let queue = self.cla.classify(&pkt);
        self.qm
            .enqueue(&mut self.bank, port, queue, pkt, time, dropper);
    }

    pub fn pull(&mut self, port: usize) -> Option<EmuPacket> {
        self.sch.pull(&mut self.bank, port)
    }

    /// One packet per output port under `port_mask`, at most `max` total.
    pub fn pull_batch(&mut self, port_mask: u64, max: usize, out: &mut Vec<EmuPacket>) -> usize {
        let mut n = 0;
        for port in 0..self.bank.n_ports().min(64) {
            if n >= max || port_mask & (1 << port) == 0 {
                continue;
            }
            if let Some(pkt) = self.sch.pull(&mut self.bank, port) {
                out.push(pkt);
                n += 1;
            }
        }
        n
    }

    pub fn queue_bank_stats(&self) -> &QueueBankStats {
        self.bank.stats()
    }

    pub fn port_drop_stats(&self) -> &PortDropStats {
        self.bank.port_drop_stats()
    }
}
