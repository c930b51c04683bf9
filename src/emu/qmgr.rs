//! Pluggable enqueue policies (queue managers) and dequeue policies
//! (schedulers) over a [`QueueBank`].

use rand::rngs::SmallRng;
use rand::Rng;

use super::packet::{AdmittedEdge, EmuPacket, EMU_FLAG_DROP};
use super::queue_bank::QueueBank;

/// Owns the decision to drop an emulated packet and the packet's fate
/// afterwards: every drop is recorded so the source endpoint rebooks the
/// timeslot.
#[derive(Debug, Default)]
pub struct Dropper {
    drops: Vec<AdmittedEdge>,
    pub dropped_packets: u64,
}

impl Dropper {
    pub fn drop_pkt(&mut self, pkt: EmuPacket) {
        self.dropped_packets += 1;
        self.drops.push(AdmittedEdge {
            src: pkt.src,
            dst: pkt.dst,
            id: pkt.id,
            flags: EMU_FLAG_DROP,
        });
    }

    pub fn take_drops(&mut self) -> Vec<AdmittedEdge> {
        std::mem::take(&mut self.drops)
    }
}

pub trait QueueManager {
    fn enqueue(
        &mut self,
        bank: &mut QueueBank,
        port: usize,
        queue: usize,
        pkt: EmuPacket,
        time: u64,
        dropper: &mut Dropper,
    );
}

pub trait Scheduler {
    fn pull(&mut self, bank: &mut QueueBank, port: usize) -> Option<EmuPacket>;
}

/// Drop on full, nothing else.
pub struct DropTailQm {
    pub capacity: u32,
}

impl QueueManager for DropTailQm {
    fn enqueue(
        &mut self,
        bank: &mut QueueBank,
        port: usize,
        queue: usize,
        pkt: EmuPacket,
        _time: u64,
        dropper: &mut Dropper,
    ) {
        if bank.occupancy(port, queue) >= self.capacity {
            bank.record_full_drop(port, queue);
            dropper.drop_pkt(pkt);
            return;
        }
        bank.enqueue(port, queue, pkt);
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RedParams {
    pub capacity: u32,
    /// EWMA weight for the average queue length.
    pub q_weight: f64,
    pub min_th: f64,
    pub max_th: f64,
    pub max_p: f64,
}

/// Random early detection: drop probability rises linearly between the
/// thresholds of the averaged queue length.
pub struct RedQm {
    params: RedParams,
    avg: Vec<f64>,
    rng: SmallRng,
}

impl RedQm {
    pub fn new(params: RedParams, n_ports: usize, n_queues: usize, rng: SmallRng) -> Self {
        assert!(params.min_th < params.max_th);
        Self {
            params,
            avg: vec![0.0; n_ports * n_queues],
            rng,
        }
    }
}

impl QueueManager for RedQm {
    fn enqueue(
        &mut self,
        bank: &mut QueueBank,
        port: usize,
        queue: usize,
        pkt: EmuPacket,
        _time: u64,
        dropper: &mut Dropper,
    ) {
        let cur = bank.occupancy(port, queue);

        if cur >= self.params.capacity {
            bank.record_full_drop(port, queue);
            dropper.drop_pkt(pkt);
            return;
        }

        let slot = port * bank.n_queues() + queue;
        let avg = &mut self.avg[slot];
        *avg = (1.0 - self.params.q_weight) * *avg + self.params.q_weight * cur as f64;

        if *avg >= self.params.max_th {
            bank.record_qm_drop(port, queue);
            dropper.drop_pkt(pkt);
            return;
        }

        if *avg >= self.params.min_th {
            let p = self.params.max_p * (*avg - self.params.min_th)
                / (self.params.max_th - self.params.min_th);
            if self.rng.gen::<f64>() < p {
                bank.record_qm_drop(port, queue);
                dropper.drop_pkt(pkt);
                return;
            }
        }

        bank.enqueue(port, queue, pkt);
    }
}

/// Drop-tail queueing with an ECN mark whenever the instantaneous queue
/// length reaches the marking threshold.
pub struct DctcpQm {
    pub capacity: u32,
    pub mark_threshold: u32,
}

impl QueueManager for DctcpQm {
    fn enqueue(
        &mut self,
        bank: &mut QueueBank,
        port: usize,
        queue: usize,
        mut pkt: EmuPacket,
        _time: u64,
        dropper: &mut Dropper,
    ) {
        let occupancy = bank.occupancy(port, queue);

        if occupancy >= self.capacity {
            bank.record_full_drop(port, queue);
            dropper.drop_pkt(pkt);
            return;
        }

        if occupancy >= self.mark_threshold {
            pkt.ecn = true;
            bank.record_mark(port, queue);
        }

        bank.enqueue(port, queue, pkt);
    }
}

#[derive(Clone, Copy, Debug)]
pub struct HullParams {
    pub capacity: u32,
    /// Phantom-queue marking threshold, in packet atoms.
    pub mark_threshold: i64,
    /// Fraction of line rate the phantom queue drains at, in thousandths.
    pub gamma_permille: i64,
}

/// Phantom-queue marking: a counter per port drains at `gamma` times line
/// rate and grows one atom per enqueued packet; exceeding the threshold
/// marks, exceeding the real queue drops.
pub struct HullQm {
    params: HullParams,
    phantom: Vec<i64>,
    last_update: Vec<u64>,
}

/// One emulated packet in phantom-queue units, scaled so gamma can be
/// expressed in thousandths.
const HULL_ATOM: i64 = 1000;

impl HullQm {
    pub fn new(params: HullParams, n_ports: usize) -> Self {
        Self {
            params,
            phantom: vec![0; n_ports],
            last_update: vec![0; n_ports],
        }
    }
}

impl QueueManager for HullQm {
    fn enqueue(
        &mut self,
        bank: &mut QueueBank,
        port: usize,
        queue: usize,
        mut pkt: EmuPacket,
        time: u64,
        dropper: &mut Dropper,
    ) {
        if bank.occupancy(port, queue) >= self.params.capacity {
            bank.record_full_drop(port, queue);
            dropper.drop_pkt(pkt);
            return;
        }

        // Drain the phantom queue for the elapsed timeslots, then charge
        // this packet to it.
        let elapsed = time.saturating_sub(self.last_update[port]) as i64;
        self.last_update[port] = time;

        let phantom = &mut self.phantom[port];
        *phantom -= elapsed * self.params.gamma_permille;
        if *phantom < 0 {
            *phantom = 0;
        }
        *phantom += HULL_ATOM;

        if *phantom > self.params.mark_threshold * HULL_ATOM {
            pkt.ecn = true;
            bank.record_mark(port, queue);
        }

        bank.enqueue(port, queue, pkt);
    }
}

/// One FIFO per port.
pub struct SingleQueueSch;

impl Scheduler for SingleQueueSch {
    fn pull(&mut self, bank: &mut QueueBank, port: usize) -> Option<EmuPacket> {
        bank.dequeue(port, 0)
    }
}

/// Strict priority: queue 0 is highest.
pub struct PrioSch;

impl Scheduler for PrioSch {
    fn pull(&mut self, bank: &mut QueueBank, port: usize) -> Option<EmuPacket> {
        for queue in 0..bank.n_queues() {
            if let Some(pkt) = bank.dequeue(port, queue) {
                return Some(pkt);
            }
        }
        None
    }
}

/// Round-robin over the per-priority FIFOs, one packet per pull.
pub struct RrSch {
    next: Vec<usize>,
}

impl RrSch {
    pub fn new(n_ports: usize) -> Self {
        Self {
            next: vec![0; n_ports],
        }
    }
}

impl Scheduler for RrSch {
    fn pull(&mut self, bank: &mut QueueBank, port: usize) -> Option<EmuPacket> {
        let n = bank.n_queues();
        for i in 0..n {
            let queue = (self.next[port] + i) % n;
            if let Some(pkt) = bank.dequeue(port, queue) {
                self.next[port] = (queue + 1) % n;
                return Some(pkt);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn pkt(id: u16) -> EmuPacket {
        EmuPacket {
            src: 0,
            dst: 1,
            flow: 0,
            id,
            prio: 0,
            ecn: false,
        }
    }

    fn prio_pkt(id: u16, prio: u8) -> EmuPacket {
        EmuPacket { prio, ..pkt(id) }
    }

    #[test]
    fn drop_tail_caps_occupancy() {
        let mut bank = QueueBank::new(1, 1);
        let mut qm = DropTailQm { capacity: 3 };
        let mut dropper = Dropper::default();

        for id in 0..5 {
            qm.enqueue(&mut bank, 0, 0, pkt(id), 0, &mut dropper);
            assert!(bank.occupancy(0, 0) <= 3);
        }

        assert_eq!(bank.occupancy(0, 0), 3);
        assert_eq!(dropper.dropped_packets, 2);
        assert_eq!(bank.port_drop_stats().full_drops[0], 2);

        let drops = dropper.take_drops();
        assert_eq!(drops.len(), 2);
        assert!(drops.iter().all(|edge| edge.flags == EMU_FLAG_DROP));
    }

    #[test]
    fn dctcp_marks_above_threshold() {
        let mut bank = QueueBank::new(1, 1);
        let mut qm = DctcpQm {
            capacity: 10,
            mark_threshold: 2,
        };
        let mut dropper = Dropper::default();

        for id in 0..5 {
            qm.enqueue(&mut bank, 0, 0, pkt(id), 0, &mut dropper);
        }

        // First two packets saw occupancy < 2, the rest get marked
        let mut marked = 0;
        while let Some(p) = bank.dequeue(0, 0) {
            if p.ecn {
                marked += 1;
            }
        }
        assert_eq!(marked, 3);
        assert_eq!(dropper.dropped_packets, 0);
    }

    #[test]
    fn red_drops_hard_above_max_th() {
        let params = RedParams {
            capacity: 100,
            q_weight: 1.0, // average follows instantaneous length exactly
            min_th: 2.0,
            max_th: 4.0,
            max_p: 1.0,
        };
        let mut bank = QueueBank::new(1, 1);
        let mut qm = RedQm::new(params, 1, 1, SmallRng::seed_from_u64(7));
        let mut dropper = Dropper::default();

        for id in 0..20 {
            qm.enqueue(&mut bank, 0, 0, pkt(id), 0, &mut dropper);
        }

        // Occupancy can never grow past max_th with max_p = 1
        assert!(bank.occupancy(0, 0) <= 4);
        assert!(dropper.dropped_packets >= 15);
    }

    #[test]
    fn hull_phantom_marks_and_drains() {
        let params = HullParams {
            capacity: 100,
            mark_threshold: 3,
            gamma_permille: 950,
        };
        let mut bank = QueueBank::new(1, 1);
        let mut qm = HullQm::new(params, 1);
        let mut dropper = Dropper::default();

        // A burst within one timeslot overflows the phantom queue
        for id in 0..5 {
            qm.enqueue(&mut bank, 0, 0, pkt(id), 0, &mut dropper);
        }
        let marked: Vec<bool> = std::iter::from_fn(|| bank.dequeue(0, 0))
            .map(|p| p.ecn)
            .collect();
        assert_eq!(marked, vec![false, false, false, true, true]);

        // After a long idle stretch the phantom queue has drained
        qm.enqueue(&mut bank, 0, 0, pkt(9), 1_000, &mut dropper);
        assert!(!bank.dequeue(0, 0).unwrap().ecn);
    }

    #[test]
    fn strict_priority_order() {
        let mut bank = QueueBank::new(1, 3);
        let mut qm = DropTailQm { capacity: 10 };
        let mut sch = PrioSch;
        let mut dropper = Dropper::default();

        qm.enqueue(&mut bank, 0, 2, prio_pkt(1, 2), 0, &mut dropper);
        qm.enqueue(&mut bank, 0, 0, prio_pkt(2, 0), 0, &mut dropper);
        qm.enqueue(&mut bank, 0, 1, prio_pkt(3, 1), 0, &mut dropper);

        let order: Vec<u16> = std::iter::from_fn(|| sch.pull(&mut bank, 0))
            .map(|p| p.id)
            .collect();
        assert_eq!(order, vec![2, 3, 1]);
    }

    #[test]
    fn round_robin_alternates() {
        let mut bank = QueueBank::new(1, 2);
        let mut sch = RrSch::new(1);

        for id in 0..3 {
            bank.enqueue(0, 0, pkt(id));
            bank.enqueue(0, 1, pkt(10 + id));
        }

        let order: Vec<u16> = std::iter::from_fn(|| sch.pull(&mut bank, 0))
            .map(|p| p.id)
            .collect();
        assert_eq!(order, vec![0, 10, 1, 11, 2, 12]);
    }
}
