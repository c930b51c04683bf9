//! Per-destination timeslot accounting.
//!
//! The same counter record backs both sides of the protocol: the endpoint
//! embeds one per flow, the arbiter keeps a dense table of them indexed by
//! (source, destination). Counters only move forward between resets:
//!
//!   demand >= requested >= acked     alloc <= demand     used <= alloc

use std::sync::{Mutex, MutexGuard};

/// Where a flow currently sits in the request machinery.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum QueueState {
    #[default]
    Unqueued,
    RequestQueue,
    RetransmitQueue,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CounterError {
    /// An ack claimed more timeslots than were ever demanded. The peer and
    /// we disagree irreconcilably; the caller forces a protocol reset.
    AckBeyondDemand,
    /// An allocation arrived for a flow with no outstanding demand.
    AllocBeyondDemand,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Counters {
    pub demand: u64,
    pub requested: u64,
    pub acked: u64,
    pub alloc: u64,
    pub used: u64,
}

impl Counters {
    pub fn inc_demand(&mut self, n: u64) {
        self.demand += n;
    }

    pub fn inc_alloc(&mut self, n: u64) -> Result<(), CounterError> {
        if self.alloc + n > self.demand {
            return Err(CounterError::AllocBeyondDemand);
        }
        self.alloc += n;
        Ok(())
    }

    pub fn inc_used(&mut self, n: u64) {
        self.used += n;
        debug_assert!(self.used <= self.alloc);
    }

    /// Raises `requested` to `new_requested`; returns the increase.
    pub fn request_to(&mut self, new_requested: u64) -> u64 {
        debug_assert!(new_requested <= self.demand);
        let delta = new_requested.saturating_sub(self.requested);
        self.requested = self.requested.max(new_requested);
        delta
    }

    /// Records a cumulative acknowledgment; returns how many newly-acked
    /// timeslots it covered (zero for stale acks).
    pub fn ack(&mut self, new_acked: u64) -> Result<u64, CounterError> {
        if new_acked > self.demand {
            return Err(CounterError::AckBeyondDemand);
        }
        let delta = new_acked.saturating_sub(self.acked);
        self.acked = self.acked.max(new_acked);
        Ok(delta)
    }

    /// Rebases after a protocol reset: served timeslots are forgotten,
    /// outstanding demand survives to be re-requested. Returns `true` when
    /// the record is fully served and can be garbage-collected.
    pub fn rebase_for_reset(&mut self) -> bool {
        self.demand -= self.used;
        self.requested = 0;
        self.acked = 0;
        self.alloc = 0;
        self.used = 0;
        self.demand == 0
    }

    /// The per-flow invariants. Cheap enough to check after every update in
    /// tests; production callers consult it when deciding to force a reset.
    pub fn invariants_hold(&self) -> bool {
        self.demand >= self.requested
            && self.requested >= self.acked
            && self.alloc <= self.demand
            && self.used <= self.alloc
    }
}

#[derive(Debug, Default)]
pub struct Record {
    pub counters: Counters,
    pub state: QueueState,
}

/// Dense (source, destination) -> record table on the arbiter. Records are
/// individually locked; writes to a given source's rows are additionally
/// confined to one admission partition.
pub struct DemandTable {
    records: Box<[Mutex<Record>]>,
    stride: usize,
}

impl DemandTable {
    pub fn new(n_endpoints: usize) -> Self {
        assert!(n_endpoints > 0);

        let stride = n_endpoints.next_power_of_two();
        let records = (0..stride * stride)
            .map(|_| Mutex::new(Record::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self { records, stride }
    }

    pub fn n_flows(&self) -> usize {
        self.records.len()
    }

    fn index(&self, src: u16, dst: u16) -> usize {
        debug_assert!((src as usize) < self.stride && (dst as usize) < self.stride);
        src as usize * self.stride + dst as usize
    }

    pub fn get(&self, src: u16, dst: u16) -> MutexGuard<'_, Record> {
        self.records[self.index(src, dst)]
            .lock()
            .expect("demand record poisoned")
    }

    /// Deterministic partitioning of sources across admission cores.
    pub fn partition_of(src: u16, n_partitions: usize) -> usize {
        src as usize % n_partitions
    }

    /// Rebases every flow of `src` after that endpoint's connection reset.
    /// Returns the surviving (dst, demand) backlog to re-admit.
    pub fn rebase_src(&self, src: u16) -> Vec<(u16, u64)> {
        let mut survivors = Vec::new();

        for dst in 0..self.stride as u16 {
            let mut record = self.get(src, dst);
            let gc = record.counters.rebase_for_reset();
            record.state = QueueState::Unqueued;
            if !gc {
                survivors.push((dst, record.counters.demand));
            }
        }

        survivors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_ordering() {
        let mut c = Counters::default();

        c.inc_demand(10);
        assert_eq!(c.request_to(7), 7);
        assert_eq!(c.request_to(7), 0);
        assert_eq!(c.ack(5), Ok(5));
        assert_eq!(c.ack(3), Ok(0));
        assert!(c.invariants_hold());

        // Acking beyond demand is a peer-state divergence
        assert_eq!(c.ack(11), Err(CounterError::AckBeyondDemand));
    }

    #[test]
    fn alloc_bounded_by_demand() {
        let mut c = Counters::default();
        c.inc_demand(2);

        assert_eq!(c.inc_alloc(1), Ok(()));
        assert_eq!(c.inc_alloc(1), Ok(()));
        assert_eq!(c.inc_alloc(1), Err(CounterError::AllocBeyondDemand));

        c.inc_used(2);
        assert!(c.invariants_hold());
    }

    #[test]
    fn rebase_preserves_outstanding_demand() {
        let mut c = Counters::default();
        c.inc_demand(10);
        c.request_to(10);
        c.ack(10).unwrap();
        c.inc_alloc(6).unwrap();
        c.inc_used(4);

        // 4 served, 6 outstanding (2 allocated-but-missed re-request too)
        assert!(!c.rebase_for_reset());
        assert_eq!(c.demand, 6);
        assert_eq!(c, Counters {
            demand: 6,
            ..Default::default()
        });

        // A fully-served flow is collectable
        let mut done = Counters::default();
        done.inc_demand(3);
        done.inc_alloc(3).unwrap();
        done.inc_used(3);
        assert!(done.rebase_for_reset());
    }

    #[test]
    fn table_rebase_src() {
        let table = DemandTable::new(4);

        table.get(1, 2).counters.inc_demand(5);
        table.get(1, 3).counters.inc_demand(2);
        {
            let mut r = table.get(1, 3);
            r.counters.inc_alloc(2).unwrap();
            r.counters.inc_used(2);
            r.state = QueueState::RequestQueue;
        }

        let survivors = table.rebase_src(1);
        assert_eq!(survivors, vec![(2, 5)]);
        assert_eq!(table.get(1, 3).state, QueueState::Unqueued);
    }
}
