//! The emulated fabric backing the arbiter's allocation decisions.
//!
//! Instead of computing a matching, the arbiter can run each timeslot
//! through a model of the actual network: endpoint groups and routers with
//! real queue banks and configurable queue-management policies. Whatever
//! the model delivers, marks, or drops in a timeslot becomes that
//! timeslot's admitted traffic.

pub mod drivers;
pub mod endpoint;
pub mod packet;
pub mod qmgr;
pub mod queue_bank;
pub mod router;
pub mod topology;

pub use packet::{AdmittedEdge, AdmittedTraffic, EmuPacket, EMU_FLAG_DROP, EMU_FLAG_ECN_MARK};
pub use router::QueueScheme;
pub use topology::{EmuState, FabricConfig, Topology};

pub const EMU_RACK_SHIFT: u16 = 5;
pub const EMU_ENDPOINTS_PER_RACK: usize = 1 << EMU_RACK_SHIFT;

/// Most packets a driver moves across a ring in one timeslot.
pub const ROUTER_MAX_BURST: usize = EMU_ENDPOINTS_PER_RACK;

/// Per-core emulation statistics.
#[derive(Clone, Debug, Default)]
pub struct EmuStat {
    pub router_driver_pulled: u64,
    pub router_driver_pushed: u64,
    pub send_packets_failed: u64,
    pub backlog_ring_full: u64,
    pub admitted_ring_full: u64,
    pub admitted_alloc_failed: u64,
}
