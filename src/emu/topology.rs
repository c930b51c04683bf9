//! Wiring endpoint groups and routers into a fabric.

use std::sync::Arc;

use rand::rngs::SmallRng;
use rand::SeedableRng;
use rustc_hash::FxHashMap;

use crate::arbiter::ring::{Pool, Ring};

use super::drivers::{EndpointDriver, RouterDriver};
use super::endpoint::EndpointGroup;
use super::packet::{AdmittedTraffic, EmuOutput, EmuPacket};
use super::qmgr::Dropper;
use super::queue_bank::{PortDropStats, QueueBankStats};
use super::router::{CoreRoutingTable, QueueScheme, Router, TorRoutingTable};
use super::{EmuStat, EMU_ENDPOINTS_PER_RACK};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Topology {
    /// One rack: a single ToR connected to all endpoints.
    SingleRack,
    /// Two racks of endpoints, two ToRs, one core router between them.
    TwoRack,
}

#[derive(Clone, Copy, Debug)]
pub struct FabricConfig {
    pub topology: Topology,
    pub scheme: QueueScheme,
    pub endpoint_queue_capacity: u32,
    pub drop_on_failed_enqueue: bool,
    pub packet_ring_size: usize,
    pub admitted_pool_size: usize,
    /// Logical timeslot carried by the first admitted record.
    pub first_timeslot: u64,
    pub seed: u64,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            topology: Topology::SingleRack,
            scheme: QueueScheme::DropTail { capacity: 128 },
            endpoint_queue_capacity: 128,
            drop_on_failed_enqueue: false,
            packet_ring_size: 1 << 10,
            admitted_pool_size: 1 << 8,
            first_timeslot: 0,
            seed: 0x66A57,
        }
    }
}

/// The whole emulated fabric, stepped one timeslot at a time by the
/// admission core. The comm core talks to it only through the public
/// rings: demand packets in, resets in, admitted records out.
pub struct EmuState {
    endpoint_drivers: Vec<EndpointDriver>,
    router_drivers: Vec<RouterDriver>,

    pub q_epg_new_pkts: Vec<Arc<Ring<EmuPacket>>>,
    pub q_resets: Vec<Arc<Ring<u16>>>,
    pub q_admitted_out: Arc<Ring<Box<AdmittedTraffic>>>,
    pub admitted_pool: Arc<Pool<AdmittedTraffic>>,

    output: EmuOutput,
    dropper: Dropper,
    stat: EmuStat,

    n_endpoints: usize,
    cur_tslot: u64,
    next_pkt_id: FxHashMap<(u16, u16), u16>,
}

impl EmuState {
    pub fn new(cfg: FabricConfig) -> Self {
        let admitted_pool = Arc::new(Pool::new(cfg.admitted_pool_size));
        let q_admitted_out = Arc::new(Ring::new(2 * cfg.admitted_pool_size));

        let mut state = Self {
            endpoint_drivers: Vec::new(),
            router_drivers: Vec::new(),
            q_epg_new_pkts: Vec::new(),
            q_resets: Vec::new(),
            q_admitted_out,
            admitted_pool,
            output: EmuOutput::default(),
            dropper: Dropper::default(),
            stat: EmuStat::default(),
            n_endpoints: 0,
            cur_tslot: cfg.first_timeslot,
            next_pkt_id: FxHashMap::default(),
        };

        match cfg.topology {
            Topology::SingleRack => state.construct_single_rack(&cfg),
            Topology::TwoRack => state.construct_two_rack(&cfg),
        }

        state
    }

    fn new_epg(
        &mut self,
        cfg: &FabricConfig,
        first_id: u16,
        q_to_router: Arc<Ring<EmuPacket>>,
        q_from_router: Arc<Ring<EmuPacket>>,
    ) {
        let q_new_pkts = Arc::new(Ring::new(cfg.packet_ring_size));
        let q_resets = Arc::new(Ring::new(cfg.packet_ring_size));

        let epg = EndpointGroup::new(
            first_id,
            EMU_ENDPOINTS_PER_RACK,
            cfg.endpoint_queue_capacity,
        );

        self.endpoint_drivers.push(EndpointDriver::new(
            epg,
            Arc::clone(&q_new_pkts),
            q_to_router,
            q_from_router,
            Arc::clone(&q_resets),
        ));
        self.q_epg_new_pkts.push(q_new_pkts);
        self.q_resets.push(q_resets);
    }

    fn construct_single_rack(&mut self, cfg: &FabricConfig) {
        self.n_endpoints = EMU_ENDPOINTS_PER_RACK;

        let q_router_ingress = Arc::new(Ring::new(cfg.packet_ring_size));
        let q_router_egress = Arc::new(Ring::new(cfg.packet_ring_size));

        let rt = Box::new(TorRoutingTable::new(0, EMU_ENDPOINTS_PER_RACK, 0));
        let router = Router::new(cfg.scheme, rt, EMU_ENDPOINTS_PER_RACK, cfg.seed);

        self.router_drivers.push(RouterDriver::new(
            router,
            Arc::clone(&q_router_ingress),
            vec![(Arc::clone(&q_router_egress), 0xFFFF_FFFF)],
            SmallRng::seed_from_u64(cfg.seed),
            cfg.drop_on_failed_enqueue,
        ));

        self.new_epg(cfg, 0, q_router_ingress, q_router_egress);
    }

    fn construct_two_rack(&mut self, cfg: &FabricConfig) {
        let racks = 2;
        self.n_endpoints = racks * EMU_ENDPOINTS_PER_RACK;

        let q_epg_ingress: Vec<_> = (0..racks)
            .map(|_| Arc::new(Ring::new(cfg.packet_ring_size)))
            .collect();
        let q_router_ingress: Vec<_> = (0..racks + 1)
            .map(|_| Arc::new(Ring::new(cfg.packet_ring_size)))
            .collect();

        // ToRs: 32 ports down to the rack, 32 up to the core.
        for rack in 0..racks {
            let rt = Box::new(TorRoutingTable::new(
                rack as u16,
                EMU_ENDPOINTS_PER_RACK,
                EMU_ENDPOINTS_PER_RACK,
            ));
            let router = Router::new(
                cfg.scheme,
                rt,
                2 * EMU_ENDPOINTS_PER_RACK,
                cfg.seed + rack as u64,
            );

            self.router_drivers.push(RouterDriver::new(
                router,
                Arc::clone(&q_router_ingress[rack]),
                vec![
                    (Arc::clone(&q_epg_ingress[rack]), 0x0000_0000_FFFF_FFFF),
                    (Arc::clone(&q_router_ingress[racks]), 0xFFFF_FFFF_0000_0000),
                ],
                SmallRng::seed_from_u64(cfg.seed + 10 + rack as u64),
                cfg.drop_on_failed_enqueue,
            ));
        }

        // Core: 32 links to each ToR; ToR 0 on the low ports.
        let rt = Box::new(CoreRoutingTable::new(EMU_ENDPOINTS_PER_RACK));
        let router = Router::new(
            cfg.scheme,
            rt,
            2 * EMU_ENDPOINTS_PER_RACK,
            cfg.seed + 100,
        );

        self.router_drivers.push(RouterDriver::new(
            router,
            Arc::clone(&q_router_ingress[racks]),
            vec![
                (Arc::clone(&q_router_ingress[0]), 0x0000_0000_FFFF_FFFF),
                (Arc::clone(&q_router_ingress[1]), 0xFFFF_FFFF_0000_0000),
            ],
            SmallRng::seed_from_u64(cfg.seed + 200),
            cfg.drop_on_failed_enqueue,
        ));

        for rack in 0..racks {
            self.new_epg(
                cfg,
                (rack * EMU_ENDPOINTS_PER_RACK) as u16,
                Arc::clone(&q_router_ingress[rack]),
                Arc::clone(&q_epg_ingress[rack]),
            );
        }
    }

    pub fn n_endpoints(&self) -> usize {
        self.n_endpoints
    }

    pub fn current_timeslot(&self) -> u64 {
        self.cur_tslot
    }

    fn epg_of(&self, endpoint: u16) -> usize {
        endpoint as usize / EMU_ENDPOINTS_PER_RACK
    }

    /// Injects `amount` timeslots of demand from `src` to `dst`. Returns
    /// how many packets actually made it onto the ring.
    pub fn add_backlog(&mut self, src: u16, dst: u16, amount: u32) -> u32 {
        let epg = self.epg_of(src);
        let next_id = self.next_pkt_id.entry((src, dst)).or_insert(0);

        let mut pushed = 0;
        for _ in 0..amount {
            let pkt = EmuPacket {
                src,
                dst,
                flow: 0,
                id: *next_id,
                prio: 0,
                ecn: false,
            };

            if self.q_epg_new_pkts[epg].enqueue(pkt).is_err() {
                self.stat.backlog_ring_full += 1;
                break;
            }
            *next_id = next_id.wrapping_add(1);
            pushed += 1;
        }

        pushed
    }

    /// Signals that `endpoint`'s connection reset: its queued traffic in
    /// the fabric is drained at the next step.
    pub fn endpoint_reset(&mut self, endpoint: u16) {
        let epg = self.epg_of(endpoint);
        let _ = self.q_resets[epg].enqueue(endpoint);
    }

    /// Emulates one timeslot across the whole fabric and emits one
    /// admitted-traffic record.
    pub fn emulate_timeslot(&mut self) {
        for driver in self.endpoint_drivers.iter_mut() {
            driver.step(
                self.cur_tslot,
                &mut self.output,
                &mut self.dropper,
                &mut self.stat,
            );
        }

        for driver in self.router_drivers.iter_mut() {
            driver.step(&mut self.dropper, &mut self.stat);
        }

        // Dropped packets join the admitted stream so their sources rebook.
        for edge in self.dropper.take_drops() {
            self.output.record_drop(edge);
        }

        match self.admitted_pool.get() {
            Some(mut admitted) => {
                self.output.flush_into(self.cur_tslot, &mut admitted);
                if let Err(mut admitted) = self.q_admitted_out.enqueue(admitted) {
                    self.stat.admitted_ring_full += 1;
                    self.output.reclaim(&mut admitted);
                    self.admitted_pool.put(admitted);
                }
            }
            None => {
                self.stat.admitted_alloc_failed += 1;
            }
        }

        self.cur_tslot += 1;
    }

    pub fn stats(&self) -> &EmuStat {
        &self.stat
    }

    pub fn dropped_packets(&self) -> u64 {
        self.dropper.dropped_packets
    }

    pub fn admitted_packets(&self) -> u64 {
        self.output.admitted_packets
    }

    pub fn router_queue_bank_stats(&self, router: usize) -> &QueueBankStats {
        self.router_drivers[router].router().queue_bank_stats()
    }

    pub fn router_port_drop_stats(&self, router: usize) -> &PortDropStats {
        self.router_drivers[router].router().port_drop_stats()
    }

    pub fn endpoint_queue_bank_stats(&self, epg: usize) -> &QueueBankStats {
        self.endpoint_drivers[epg].epg().queue_bank_stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain_admitted(state: &mut EmuState) -> Vec<AdmittedTraffic> {
        let mut records = Vec::new();
        while let Some(admitted) = state.q_admitted_out.dequeue() {
            records.push((*admitted).clone());
            state.admitted_pool.put(admitted);
        }
        records
    }

    #[test]
    fn single_rack_delivers_backlog() {
        let mut state = EmuState::new(FabricConfig::default());

        assert_eq!(state.add_backlog(0, 3, 4), 4);

        for _ in 0..8 {
            state.emulate_timeslot();
        }

        let records = drain_admitted(&mut state);
        let admitted: u32 = records.iter().map(|r| r.n_admitted() as u32).sum();
        assert_eq!(admitted, 4);

        // One packet per endpoint per timeslot: four distinct timeslots
        let with_traffic = records.iter().filter(|r| r.n_admitted() > 0).count();
        assert_eq!(with_traffic, 4);

        for record in records.iter().filter(|r| r.n_admitted() > 0) {
            assert_eq!(record.edges[0].src, 0);
            assert_eq!(record.edges[0].dst, 3);
        }
    }

    #[test]
    fn two_rack_crosses_the_core() {
        let cfg = FabricConfig {
            topology: Topology::TwoRack,
            ..Default::default()
        };
        let mut state = EmuState::new(cfg);

        // Rack 0 endpoint to rack 1 endpoint
        assert_eq!(state.add_backlog(1, 40, 2), 2);

        for _ in 0..12 {
            state.emulate_timeslot();
        }

        let records = drain_admitted(&mut state);
        let admitted: u32 = records.iter().map(|r| r.n_admitted() as u32).sum();
        assert_eq!(admitted, 2);
    }

    #[test]
    fn reset_drops_queued_backlog() {
        let mut state = EmuState::new(FabricConfig::default());

        state.add_backlog(5, 9, 3);

        // One step moves the backlog into endpoint 5's queue and puts one
        // packet on the wire; the reset then drains the remaining two.
        state.emulate_timeslot();
        state.endpoint_reset(5);

        for _ in 0..6 {
            state.emulate_timeslot();
        }

        let records = drain_admitted(&mut state);
        let admitted: u32 = records.iter().map(|r| r.n_admitted() as u32).sum();
        assert_eq!(admitted, 1);
    }
}
