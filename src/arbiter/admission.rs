//! The admission core: drains demand events and runs the allocator one
//! logical timeslot at a time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::emu::EmuState;

use super::ring::Ring;
use super::DemandEvent;

/// The pluggable allocation engine. The emulated fabric is the provided
/// implementation; a timeslot matcher such as PIM plugs in the same way.
pub trait Allocator {
    fn add_backlog(&mut self, src: u16, dst: u16, amount: u32);

    fn reset_endpoint(&mut self, endpoint: u16);

    /// Allocates one logical timeslot; admitted records leave through the
    /// allocator's own output ring.
    fn timeslot(&mut self);
}

impl Allocator for EmuState {
    fn add_backlog(&mut self, src: u16, dst: u16, amount: u32) {
        EmuState::add_backlog(self, src, dst, amount);
    }

    fn reset_endpoint(&mut self, endpoint: u16) {
        EmuState::endpoint_reset(self, endpoint);
    }

    fn timeslot(&mut self) {
        self.emulate_timeslot();
    }
}

/// Most demand events applied per timeslot, so a demand burst cannot stall
/// allocation.
const MAX_DEMANDS_PER_TSLOT: usize = 256;

#[derive(Clone, Debug, Default)]
pub struct AdmissionStat {
    pub processed_tslots: u64,
    pub demands_drained: u64,
    pub resets_drained: u64,
}

pub struct AdmissionCore<A: Allocator> {
    allocator: A,
    q_new_demands: Arc<Ring<DemandEvent>>,
    q_endpoint_resets: Arc<Ring<u16>>,
    logical_timeslot: u64,
    stat: AdmissionStat,
    scratch: Vec<DemandEvent>,
}

impl<A: Allocator> AdmissionCore<A> {
    pub fn new(
        allocator: A,
        q_new_demands: Arc<Ring<DemandEvent>>,
        q_endpoint_resets: Arc<Ring<u16>>,
        first_timeslot: u64,
    ) -> Self {
        Self {
            allocator,
            q_new_demands,
            q_endpoint_resets,
            logical_timeslot: first_timeslot,
            stat: AdmissionStat::default(),
            scratch: Vec::with_capacity(MAX_DEMANDS_PER_TSLOT),
        }
    }

    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    pub fn logical_timeslot(&self) -> u64 {
        self.logical_timeslot
    }

    pub fn stats(&self) -> &AdmissionStat {
        &self.stat
    }

    /// One logical timeslot: ingest state changes, then allocate.
    pub fn step(&mut self) {
        while let Some(endpoint) = self.q_endpoint_resets.dequeue() {
            self.stat.resets_drained += 1;
            self.allocator.reset_endpoint(endpoint);
        }

        let mut events = std::mem::take(&mut self.scratch);
        events.clear();
        self.q_new_demands
            .dequeue_burst(&mut events, MAX_DEMANDS_PER_TSLOT);

        for ev in events.iter() {
            self.stat.demands_drained += 1;
            self.allocator.add_backlog(ev.src, ev.dst, ev.backlog);
        }
        self.scratch = events;

        self.allocator.timeslot();
        self.stat.processed_tslots += 1;
        self.logical_timeslot += 1;
    }

    /// Runs until `stop` is raised. Intended for a dedicated thread.
    pub fn run(&mut self, stop: &AtomicBool) {
        while !stop.load(Ordering::Relaxed) {
            self.step();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingAllocator {
        backlog: Vec<(u16, u16, u32)>,
        resets: Vec<u16>,
        tslots: u64,
    }

    impl Allocator for RecordingAllocator {
        fn add_backlog(&mut self, src: u16, dst: u16, amount: u32) {
            self.backlog.push((src, dst, amount));
        }

        fn reset_endpoint(&mut self, endpoint: u16) {
            self.resets.push(endpoint);
        }

        fn timeslot(&mut self) {
            self.tslots += 1;
        }
    }

    #[test]
    fn drains_in_order_then_allocates() {
        let q_demands = Arc::new(Ring::new(16));
        let q_resets = Arc::new(Ring::new(16));
        let mut core = AdmissionCore::new(
            RecordingAllocator::default(),
            Arc::clone(&q_demands),
            Arc::clone(&q_resets),
            100,
        );

        q_demands
            .enqueue(DemandEvent {
                src: 1,
                dst: 2,
                backlog: 5,
            })
            .unwrap();
        q_resets.enqueue(7).unwrap();

        core.step();

        assert_eq!(core.allocator().resets, vec![7]);
        assert_eq!(core.allocator().backlog, vec![(1, 2, 5)]);
        assert_eq!(core.allocator().tslots, 1);
        assert_eq!(core.logical_timeslot(), 101);

        core.step();
        assert_eq!(core.allocator().tslots, 2);
        assert_eq!(core.stats().processed_tslots, 2);
    }
}
