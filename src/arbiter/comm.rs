//! The comm core: one protocol connection per endpoint, demand ingestion
//! on the receive side, allocation packing on the transmit side.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::demand::DemandTable;
use crate::emu::{AdmittedTraffic, EMU_FLAG_DROP, EMU_FLAG_ECN_MARK};
use crate::proto::{
    serial, Conn, ConnContext, ConnRole, PacketDesc, ProtoStat, RxResult,
};

use super::ring::{Pool, Ring};
use super::DemandEvent;

/// Most admitted records pulled per comm loop iteration.
const MAX_ADMITTED_PER_LOOP: usize = 16;

/// A demand jump larger than this within one AREQ is likely a guard-band
/// reconstruction artifact rather than real traffic.
const SUSPICIOUS_DEMAND_JUMP: u64 = 1 << 14;

#[derive(Clone, Debug)]
pub struct CommConfig {
    pub arbiter_ip: u32,
    pub endpoint_ips: Vec<u32>,
    pub rst_win_ns: u64,
    pub send_timeout_ns: u64,
    /// Log of the per-connection outgoing window; the controller keeps a
    /// smaller window than endpoints since ALLOC packets age fast.
    pub wnd_log: u32,
    pub n_partitions: usize,
}

impl Default for CommConfig {
    fn default() -> Self {
        Self {
            arbiter_ip: 0x0A0000FE,
            endpoint_ips: Vec::new(),
            rst_win_ns: 2_000_000_000,
            send_timeout_ns: 5_000_000,
            wnd_log: 8,
            n_partitions: 1,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct CommStat {
    pub demand_increases: u64,
    pub redundant_areq: u64,
    pub demand_ring_full: u64,
    pub reset_ring_full: u64,
    pub neg_ack_tslots: u64,
    pub acked_pkts: u64,
    pub dropped_rebooked: u64,
    pub fabric_unwanted_alloc: u64,
    pub alloc_pkts_sent: u64,
    pub grants_for_unsynced: u64,
    pub unexpected_alloc: u64,
    pub rx_unknown_endpoint: u64,
}

struct CommShared {
    arbiter_ip: u32,
    demand: DemandTable,
    q_new_demands: Vec<Arc<Ring<DemandEvent>>>,
    q_endpoint_resets: Arc<Ring<u16>>,
    stat: CommStat,
}

impl CommShared {
    fn push_demand(&mut self, src: u16, dst: u16, backlog: u64) {
        // The table is only updated when the event actually lands on the
        // ring, so a dropped event re-derives on the next AREQ.
        let partition = DemandTable::partition_of(src, self.q_new_demands.len());
        let event = DemandEvent {
            src,
            dst,
            backlog: backlog.min(u32::MAX as u64) as u32,
        };

        match self.q_new_demands[partition].enqueue(event) {
            Ok(()) => {
                self.demand.get(src, dst).counters.inc_demand(backlog);
                self.stat.demand_increases += 1;
            }
            Err(_) => self.stat.demand_ring_full += 1,
        }
    }
}

/// One timeslot grant headed for an endpoint.
type Grant = (u64, u16, u8);

struct ConnSlot {
    conn: Conn,
    addr: u32,
    timer: Option<u64>,
    grants: Vec<Grant>,
}

pub struct CommCore {
    shared: CommShared,
    conns: Vec<ConnSlot>,
    addr_index: FxHashMap<u32, u16>,
    q_admitted: Arc<Ring<Box<AdmittedTraffic>>>,
    admitted_pool: Arc<Pool<AdmittedTraffic>>,
    scratch: Vec<Box<AdmittedTraffic>>,
}

struct CommCb<'a> {
    src: u16,
    shared: &'a mut CommShared,
    timer: &'a mut Option<u64>,
}

impl<'a> ConnContext for CommCb<'a> {
    fn handle_reset(&mut self) {
        // The endpoint rebased: clear its fabric state and re-admit the
        // surviving backlog.
        if self.shared.q_endpoint_resets.enqueue(self.src).is_err() {
            self.shared.stat.reset_ring_full += 1;
        }

        let survivors = self.shared.demand.rebase_src(self.src);
        for (dst, demand) in survivors {
            self.shared.push_demand(self.src, dst, demand);
        }
    }

    fn handle_areq(&mut self, pairs: &[(u16, u16)]) {
        for &(dst, count) in pairs {
            let current = self.shared.demand.get(self.src, dst).counters.demand;
            let new_demand = serial::expand_count16(count, current);

            if new_demand <= current {
                self.shared.stat.redundant_areq += 1;
                continue;
            }

            let delta = new_demand - current;
            if delta > SUSPICIOUS_DEMAND_JUMP {
                warn!(
                    src = self.src,
                    dst, delta, "implausible demand jump in AREQ"
                );
            }

            self.shared.push_demand(self.src, dst, delta);
        }
    }

    fn handle_alloc(&mut self, _base_tslot: u32, _dsts: &[u16], _specs: &[u8]) {
        // Endpoints never send allocations.
        self.shared.stat.unexpected_alloc += 1;
    }

    fn handle_ack(&mut self, _pd: PacketDesc) {
        self.shared.stat.acked_pkts += 1;
    }

    fn handle_neg_ack(&mut self, pd: PacketDesc) {
        // A lost ALLOC packet: the endpoint will never learn of these
        // grants, so their timeslots are re-admitted.
        let mut per_dst: SmallVec<[(u16, u64); serial::FASTPASS_PKT_MAX_DSTS]> = SmallVec::new();

        for &spec in pd.tslot_desc.iter() {
            let dst_ind = (spec >> 4) as usize;
            if dst_ind == 0 || dst_ind > pd.dsts.len() {
                continue;
            }
            let dst = pd.dsts[dst_ind - 1];

            match per_dst.iter_mut().find(|(d, _)| *d == dst) {
                Some((_, n)) => *n += 1,
                None => per_dst.push((dst, 1)),
            }
        }

        for (dst, n) in per_dst {
            self.shared.stat.neg_ack_tslots += n;
            self.shared.push_demand(self.src, dst, n);
        }
    }

    fn trigger_request(&mut self, _now: u64) {
        // The arbiter transmits whenever it has allocations; there is no
        // request pacing on this side.
    }

    fn set_timer(&mut self, when: u64) {
        *self.timer = Some(when);
    }

    fn cancel_timer(&mut self) {
        *self.timer = None;
    }
}

impl CommCore {
    pub fn new(
        cfg: CommConfig,
        q_new_demands: Vec<Arc<Ring<DemandEvent>>>,
        q_endpoint_resets: Arc<Ring<u16>>,
        q_admitted: Arc<Ring<Box<AdmittedTraffic>>>,
        admitted_pool: Arc<Pool<AdmittedTraffic>>,
    ) -> Self {
        assert_eq!(cfg.n_partitions, q_new_demands.len());
        assert!(!cfg.endpoint_ips.is_empty());

        let mut addr_index = FxHashMap::default();
        let conns = cfg
            .endpoint_ips
            .iter()
            .enumerate()
            .map(|(id, &addr)| {
                addr_index.insert(addr, id as u16);
                ConnSlot {
                    conn: Conn::new(
                        ConnRole::Arbiter,
                        cfg.arbiter_ip,
                        addr,
                        cfg.wnd_log,
                        cfg.rst_win_ns,
                        cfg.send_timeout_ns,
                    ),
                    addr,
                    timer: None,
                    grants: Vec::new(),
                }
            })
            .collect();

        Self {
            shared: CommShared {
                arbiter_ip: cfg.arbiter_ip,
                demand: DemandTable::new(cfg.endpoint_ips.len()),
                q_new_demands,
                q_endpoint_resets,
                stat: CommStat::default(),
            },
            conns,
            addr_index,
            q_admitted,
            admitted_pool,
            scratch: Vec::with_capacity(MAX_ADMITTED_PER_LOOP),
        }
    }

    pub fn stats(&self) -> &CommStat {
        &self.shared.stat
    }

    pub fn demand_table(&self) -> &DemandTable {
        &self.shared.demand
    }

    pub fn conn_stats(&self, endpoint: u16) -> &ProtoStat {
        self.conns[endpoint as usize].conn.stats()
    }

    /// A control frame arrived from `saddr`.
    pub fn handle_rx(&mut self, frame: &[u8], saddr: u32, now: u64) -> RxResult {
        let Some(&endpoint) = self.addr_index.get(&saddr) else {
            self.shared.stat.rx_unknown_endpoint += 1;
            return RxResult::WrongSrc;
        };

        let daddr = self.shared.arbiter_ip;
        let slot = &mut self.conns[endpoint as usize];
        let mut cb = CommCb {
            src: endpoint,
            shared: &mut self.shared,
            timer: &mut slot.timer,
        };

        slot.conn.handle_rx_packet(frame, saddr, daddr, now, &mut cb)
    }

    /// Fires any due retransmit timers.
    pub fn handle_timeouts(&mut self, now: u64) {
        for endpoint in 0..self.conns.len() {
            let slot = &mut self.conns[endpoint];
            match slot.timer {
                Some(when) if when <= now => {
                    slot.timer = None;
                    let mut cb = CommCb {
                        src: endpoint as u16,
                        shared: &mut self.shared,
                        timer: &mut slot.timer,
                    };
                    slot.conn.handle_timeout(now, &mut cb);
                }
                _ => (),
            }
        }
    }

    /// Drains admitted-traffic records, converts drops back into demand,
    /// and sends ALLOC packets carrying the grants. `send` is called with
    /// (endpoint id, frame bytes) for every packet produced.
    pub fn process_admitted<F>(&mut self, now: u64, send: &mut F)
    where
        F: FnMut(u16, &[u8]),
    {
        let mut records = std::mem::take(&mut self.scratch);
        self.q_admitted
            .dequeue_burst(&mut records, MAX_ADMITTED_PER_LOOP);

        for record in records.drain(..) {
            let timeslot = record.timeslot;

            for edge in record.edges.iter() {
                if edge.flags & EMU_FLAG_DROP != 0 {
                    // Dropped in the fabric: the slot has to be granted
                    // again, so it goes back into the backlog.
                    self.shared.stat.dropped_rebooked += 1;
                    self.shared.push_demand(edge.src, edge.dst, 1);
                    continue;
                }

                if edge.src as usize >= self.conns.len() {
                    continue;
                }

                {
                    let mut rec = self.shared.demand.get(edge.src, edge.dst);
                    if rec.counters.inc_alloc(1).is_err() {
                        // The fabric admitted more than was ever demanded;
                        // grant it anyway and let the endpoint account it.
                        self.shared.stat.fabric_unwanted_alloc += 1;
                    }
                }

                let flags = if edge.flags & EMU_FLAG_ECN_MARK != 0 { 1 } else { 0 };
                self.conns[edge.src as usize]
                    .grants
                    .push((timeslot, edge.dst, flags));
            }

            self.admitted_pool.put(record);
        }
        self.scratch = records;

        self.flush_grants(now, send);
    }

    fn flush_grants<F>(&mut self, now: u64, send: &mut F)
    where
        F: FnMut(u16, &[u8]),
    {
        for endpoint in 0..self.conns.len() {
            if self.conns[endpoint].grants.is_empty() {
                continue;
            }

            if !self.conns[endpoint].conn.in_sync() {
                // No live connection to carry them; the endpoint rebooks
                // once it reconnects.
                let n = self.conns[endpoint].grants.len() as u64;
                self.shared.stat.grants_for_unsynced += n;
                self.conns[endpoint].grants.clear();
                continue;
            }

            let mut grants = std::mem::take(&mut self.conns[endpoint].grants);
            grants.sort_unstable();

            let mut batch = AllocBatch::default();
            for &(tslot, dst, flags) in grants.iter() {
                if !batch.try_push(tslot, dst, flags) {
                    self.send_alloc(endpoint, &batch, now, send);
                    batch = AllocBatch::default();
                    let pushed = batch.try_push(tslot, dst, flags);
                    debug_assert!(pushed);
                }
            }
            if !batch.specs.is_empty() {
                self.send_alloc(endpoint, &batch, now, send);
            }

            grants.clear();
            self.conns[endpoint].grants = grants;
        }
    }

    fn send_alloc<F>(&mut self, endpoint: usize, batch: &AllocBatch, now: u64, send: &mut F)
    where
        F: FnMut(u16, &[u8]),
    {
        let pd = PacketDesc {
            base_tslot: batch.base,
            dsts: batch.dsts.clone(),
            tslot_desc: batch.specs.iter().copied().collect(),
            ..Default::default()
        };

        let slot = &mut self.conns[endpoint];
        let seqno = {
            let mut cb = CommCb {
                src: endpoint as u16,
                shared: &mut self.shared,
                timer: &mut slot.timer,
            };
            slot.conn.prepare_to_send(&mut cb);
            slot.conn.commit_packet(pd, now, &mut cb)
        };

        let mut buf = [0u8; serial::FASTPASS_ARBITER_MAX_PAYLOAD];
        let len = slot
            .conn
            .encode_committed(seqno, &mut buf, 0)
            .expect("alloc batch within payload bound");

        debug!(endpoint, len, "alloc packet");
        self.shared.stat.alloc_pkts_sent += 1;
        send(endpoint as u16, &buf[..len]);
    }
}

/// Grants packed into one ALLOC payload: consecutive slots from `base`,
/// with 16-slot-granular skips between runs.
#[derive(Default)]
struct AllocBatch {
    base: u64,
    cursor: u64,
    dsts: SmallVec<[u16; serial::FASTPASS_PKT_MAX_DSTS]>,
    specs: SmallVec<[u8; serial::FASTPASS_PKT_MAX_ALLOC_TSLOTS]>,
}

impl AllocBatch {
    /// Appends a grant, returning `false` when it cannot join this batch
    /// (unencodable gap, or a full destination or spec list).
    fn try_push(&mut self, tslot: u64, dst: u16, flags: u8) -> bool {
        if self.specs.is_empty() {
            self.base = tslot;
            self.cursor = tslot;
        }

        let gap = tslot.wrapping_sub(self.cursor);
        let skip_bytes = if gap == 0 {
            0
        } else if gap % 16 == 0 && gap <= 256 {
            1
        } else {
            return false;
        };

        let dst_ind = match self.dsts.iter().position(|&d| d == dst) {
            Some(i) => i,
            None => {
                if self.dsts.len() == serial::FASTPASS_PKT_MAX_DSTS {
                    return false;
                }
                self.dsts.push(dst);
                self.dsts.len() - 1
            }
        };

        if self.specs.len() + skip_bytes + 1 > serial::FASTPASS_PKT_MAX_ALLOC_TSLOTS {
            return false;
        }

        if skip_bytes == 1 {
            self.specs.push((gap / 16 - 1) as u8);
        }
        self.specs.push(((dst_ind as u8 + 1) << 4) | (flags & 0xF));
        self.cursor = tslot + 1;

        true
    }
}
