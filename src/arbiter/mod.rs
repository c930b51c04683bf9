//! The arbiter: comm core on the wire side, admission core running the
//! allocator, bounded rings in between.
//!
//! ```text
//!   endpoint frames --> CommCore --(DemandEvent ring)--> AdmissionCore
//!        ALLOC <-------    |    <--(admitted ring)------ EmuState
//! ```
//!
//! Each core is a plain struct driven by its own thread; nothing blocks on
//! a ring in either direction.

pub mod admission;
pub mod comm;
pub mod ring;

use std::sync::Arc;

use crate::emu::{EmuState, FabricConfig};

pub use admission::{AdmissionCore, Allocator};
pub use comm::{CommConfig, CommCore};
pub use ring::{Pool, Ring};

/// A demand update crossing from the comm core to an admission core:
/// `backlog` newly demanded timeslots for (src, dst).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DemandEvent {
    pub src: u16,
    pub dst: u16,
    pub backlog: u32,
}

pub const Q_NEW_DEMANDS_RING_SIZE: usize = 1 << 16;
pub const Q_RESETS_RING_SIZE: usize = 1 << 6;

/// Builds a comm core and an emulator-backed admission core wired together.
/// The caller owns the threads; see `AdmissionCore::run`.
pub fn build(
    comm_cfg: CommConfig,
    mut fabric_cfg: FabricConfig,
    first_timeslot: u64,
) -> (CommCore, AdmissionCore<EmuState>) {
    assert_eq!(
        comm_cfg.n_partitions, 1,
        "one emulated fabric serves one admission partition"
    );

    fabric_cfg.first_timeslot = first_timeslot;
    let fabric = EmuState::new(fabric_cfg);

    let q_new_demands: Vec<_> = (0..comm_cfg.n_partitions)
        .map(|_| Arc::new(Ring::new(Q_NEW_DEMANDS_RING_SIZE)))
        .collect();
    let q_endpoint_resets = Arc::new(Ring::new(Q_RESETS_RING_SIZE));

    let q_admitted = Arc::clone(&fabric.q_admitted_out);
    let admitted_pool = Arc::clone(&fabric.admitted_pool);

    let comm = CommCore::new(
        comm_cfg,
        q_new_demands.clone(),
        Arc::clone(&q_endpoint_resets),
        q_admitted,
        admitted_pool,
    );

    // A single admission partition drives the whole fabric; sharding over
    // more cores partitions sources across separate demand rings.
    let admission = AdmissionCore::new(
        fabric,
        Arc::clone(&q_new_demands[0]),
        q_endpoint_resets,
        first_timeslot,
    );

    (comm, admission)
}
