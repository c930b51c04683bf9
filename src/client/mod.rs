//! The endpoint client scheduler.
//!
//! Outgoing packets are classified into flows, metered into timeslot-sized
//! chunks of demand, and held until the arbiter grants their slots. The
//! client owns one protocol connection to the arbiter, a token-bucket pacer
//! for request packets, and the allocation horizon driving the dequeue
//! watchdog.
//!
//! The whole structure is driven under one coarse lock by its host: packet
//! enqueue/dequeue, timer fires and received frames all enter through
//! `&mut self` methods. The pacer sits behind its own small lock so the
//! receive path can schedule a request without the heavy lock held.

pub mod flow;

use std::sync::Mutex;

use tracing::{debug, warn};

use crate::demand::QueueState;
use crate::horizon::Horizon;
use crate::pacer::RequestPacer;
use crate::proto::{
    serial, AreqSpec, Conn, ConnContext, ConnRole, PacketDesc, ProtoStat, RxResult,
    FASTPASS_WND_LOG,
};
use crate::{FASTPASS_HORIZON, FASTPASS_REQUEST_LOW_WATERMARK, FASTPASS_REQUEST_WINDOW};
use flow::{classify, Classification, Flow, FlowId, FlowKind, FlowTable, InternalReason, PktInfo};

/// Timers the host runs on the client's behalf. Set-or-cancel is
/// idempotent; a timer that fires after [`Client::destroy`] is a no-op.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TimerName {
    /// Request pacer expiry: call `handle_timer(Request)`.
    Request,
    /// Protocol retransmit timeout.
    Retransmit,
    /// Next allocated timeslot becomes current: re-run dequeue.
    Watchdog,
}

/// Calls from the client back into its host.
pub trait ClientContext {
    /// Transmit a control frame to the arbiter.
    fn send_frame(&mut self, frame: &[u8]);

    fn set_timer(&mut self, timer: TimerName, when_ns: u64);

    fn unset_timer(&mut self, timer: TimerName);

    /// The egress queue may have packets ready; the host should dequeue.
    fn unthrottle(&mut self);
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DropReason {
    QdiscLimit,
    FlowLimit,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConfigError {
    ZeroPacketLimit,
    HashTableLog,
    ZeroDataRate,
    ZeroTslotLen,
    PacerParams,
}

/// Qdisc-style parameters. Reconfiguring protocol-affecting fields tears
/// down and re-creates the connection (see [`Client::reconfigure`]).
#[derive(Clone, Debug)]
pub struct Config {
    pub packet_limit: u32,
    pub flow_packet_limit: u32,
    pub hash_tbl_log: u32,
    pub data_rate_bytes_per_sec: u64,
    pub tslot_nsec: u64,
    pub req_cost_ns: u64,
    pub req_bucket_ns: u64,
    pub req_min_gap_ns: u64,
    pub local_ip: u32,
    pub controller_ip: u32,
    pub reset_window_us: u32,
    pub send_timeout_us: u32,
}

impl Default for Config {
    fn default() -> Self {
        let tslot_nsec = 13_000;
        let req_cost_ns = 2 * tslot_nsec;

        Self {
            packet_limit: 10_000,
            flow_packet_limit: 100,
            hash_tbl_log: 10,
            data_rate_bytes_per_sec: 125_000_000,
            tslot_nsec,
            req_cost_ns,
            req_bucket_ns: 4 * req_cost_ns,
            req_min_gap_ns: 1_000,
            local_ip: 0x7F000002,
            controller_ip: 0x7F000001,
            reset_window_us: 2_000_000,
            send_timeout_us: 5_000,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.packet_limit == 0 {
            return Err(ConfigError::ZeroPacketLimit);
        }
        if !(1..=18).contains(&self.hash_tbl_log) {
            return Err(ConfigError::HashTableLog);
        }
        if self.data_rate_bytes_per_sec == 0 {
            return Err(ConfigError::ZeroDataRate);
        }
        if self.tslot_nsec == 0 {
            return Err(ConfigError::ZeroTslotLen);
        }
        if self.req_cost_ns == 0 || self.req_bucket_ns < self.req_cost_ns {
            return Err(ConfigError::PacerParams);
        }
        Ok(())
    }

    fn affects_connection(&self, other: &Config) -> bool {
        self.local_ip != other.local_ip
            || self.controller_ip != other.controller_ip
            || self.reset_window_us != other.reset_window_us
            || self.send_timeout_us != other.send_timeout_us
    }
}

#[derive(Clone, Debug, Default)]
pub struct SchedStat {
    pub data_pkts: u64,
    pub ntp_pkts: u64,
    pub arp_pkts: u64,
    pub non_ctrl_highprio_pkts: u64,
    pub classify_errors: u64,
    pub dropped_qdisc_limit: u64,
    pub dropped_flow_limit: u64,

    pub missed_timeslots: u64,
    pub alloc_too_late: u64,
    pub alloc_premature: u64,
    pub alloc_bad_dst: u64,
    pub unwanted_alloc: u64,
    pub flow_not_found_oob: u64,
    pub flow_not_found_update: u64,
    pub used_timeslots: u64,

    pub requests: u64,
    pub request_with_empty_flowqueue: u64,
    pub queued_flow_already_acked: u64,

    pub gc_flows: u64,
    pub unexpected_areq: u64,
    pub ack_beyond_demand: u64,
}

struct Sched<T> {
    packet_limit: u32,
    flow_packet_limit: u32,
    tslot_len: u64,
    data_rate: u64,

    flows: FlowTable<T>,
    internal: Flow<T>,

    unreq_flows: std::collections::VecDeque<FlowId>,
    retrans_flows: std::collections::VecDeque<FlowId>,
    n_unreq_flows: u32,

    tslot_start_time: u64,
    horizon: Horizon,

    qlen: u32,

    demand_tslots: u64,
    requested_tslots: u64,
    alloc_tslots: u64,
    acked_tslots: u64,

    pending_force_reset: bool,
    stat: SchedStat,
}

pub struct Client<T> {
    cfg: Config,
    conn: Conn,
    sched: Sched<T>,
    pacer: Mutex<RequestPacer>,
    destroyed: bool,
}

/// Ethernet framing overhead charged per packet when computing line time.
const L2_OVERHEAD_BYTES: u64 = 24;

impl<T> Sched<T> {
    fn new(cfg: &Config, now: u64) -> Self {
        Self {
            packet_limit: cfg.packet_limit,
            flow_packet_limit: cfg.flow_packet_limit,
            tslot_len: cfg.tslot_nsec,
            data_rate: cfg.data_rate_bytes_per_sec,
            flows: FlowTable::with_capacity(1 << cfg.hash_tbl_log),
            internal: Flow::new(0, FlowKind::Internal),
            unreq_flows: Default::default(),
            retrans_flows: Default::default(),
            n_unreq_flows: 0,
            tslot_start_time: now - now % cfg.tslot_nsec,
            horizon: Horizon::new(now / cfg.tslot_nsec),
            qlen: 0,
            demand_tslots: 0,
            requested_tslots: 0,
            alloc_tslots: 0,
            acked_tslots: 0,
            pending_force_reset: false,
            stat: SchedStat::default(),
        }
    }

    fn l2t_ns(&self, len_bytes: u32) -> u64 {
        (len_bytes as u64 + L2_OVERHEAD_BYTES) * 1_000_000_000 / self.data_rate
    }

    fn flowqueue_is_empty(&self) -> bool {
        self.n_unreq_flows == 0
    }

    fn arm_pacer<C: ClientContext>(
        pacer: &Mutex<RequestPacer>,
        ctx: &mut C,
        now: u64,
    ) {
        let armed = pacer.lock().expect("pacer lock poisoned").trigger(now);
        if let Some(when) = armed {
            ctx.set_timer(TimerName::Request, when);
        }
    }

    /// Puts a flow on the request queue unless it is already queued.
    fn enqueue_request<C: ClientContext>(
        &mut self,
        fid: FlowId,
        pacer: &Mutex<RequestPacer>,
        ctx: &mut C,
        now: u64,
    ) {
        let f = self.flows.get_mut(fid);
        if f.state != QueueState::Unqueued {
            return;
        }

        f.state = QueueState::RequestQueue;
        self.unreq_flows.push_back(fid);
        self.n_unreq_flows += 1;

        Self::arm_pacer(pacer, ctx, now);
    }

    /// Retransmissions take strict priority over fresh requests.
    fn enqueue_retransmit<C: ClientContext>(
        &mut self,
        fid: FlowId,
        pacer: &Mutex<RequestPacer>,
        ctx: &mut C,
        now: u64,
    ) {
        let f = self.flows.get_mut(fid);
        match f.state {
            QueueState::RetransmitQueue => return,
            QueueState::RequestQueue => {
                // The request-queue entry goes stale and is skipped later.
                f.state = QueueState::RetransmitQueue;
            }
            QueueState::Unqueued => {
                f.state = QueueState::RetransmitQueue;
                self.n_unreq_flows += 1;
            }
        }
        self.retrans_flows.push_back(fid);

        Self::arm_pacer(pacer, ctx, now);
    }

    /// Pops the next flow due for a request, retransmit queue first,
    /// skipping entries whose flow has since moved or been collected.
    fn flowqueue_dequeue(&mut self) -> Option<FlowId> {
        while let Some(fid) = self.retrans_flows.pop_front() {
            if let Some(f) = self.flows.try_get_mut(fid) {
                if f.state == QueueState::RetransmitQueue {
                    f.state = QueueState::Unqueued;
                    self.n_unreq_flows -= 1;
                    return Some(fid);
                }
            }
        }

        while let Some(fid) = self.unreq_flows.pop_front() {
            if let Some(f) = self.flows.try_get_mut(fid) {
                if f.state == QueueState::RequestQueue {
                    f.state = QueueState::Unqueued;
                    self.n_unreq_flows -= 1;
                    return Some(fid);
                }
            }
        }

        None
    }

    fn flow_is_below_watermark(&self, fid: FlowId) -> bool {
        let c = &self.flows.get(fid).counters;
        c.requested <= c.alloc + FASTPASS_REQUEST_LOW_WATERMARK
    }

    fn flow_inc_demand<C: ClientContext>(
        &mut self,
        fid: FlowId,
        pacer: &Mutex<RequestPacer>,
        ctx: &mut C,
        now: u64,
    ) {
        let f = self.flows.get_mut(fid);
        f.counters.inc_demand(1);
        self.demand_tslots += 1;

        let c = self.flows.get(fid).counters;
        if c.demand == c.requested + 1 && self.flow_is_below_watermark(fid) {
            self.enqueue_request(fid, pacer, ctx, now);
        }
    }

    fn flow_inc_alloc<C: ClientContext>(
        &mut self,
        fid: FlowId,
        pacer: &Mutex<RequestPacer>,
        ctx: &mut C,
        now: u64,
    ) {
        let f = self.flows.get_mut(fid);
        if f.counters.alloc == f.counters.demand {
            debug!(key = f.src_dst_key, "allocation over demand");
            self.stat.unwanted_alloc += 1;
            return;
        }

        f.counters
            .inc_alloc(1)
            .expect("alloc passed the demand check");
        self.alloc_tslots += 1;

        let f = self.flows.get(fid);
        if f.state == QueueState::Unqueued
            && f.counters.requested != f.counters.demand
            && self.flow_is_below_watermark(fid)
        {
            self.enqueue_request(fid, pacer, ctx, now);
        }
    }

    /// An allocation arrived for a slot we cannot use (elapsed, too far
    /// ahead, or missed): book it and re-request.
    fn out_of_bounds_alloc<C: ClientContext>(
        &mut self,
        dst_key: u64,
        pacer: &Mutex<RequestPacer>,
        ctx: &mut C,
        now: u64,
    ) {
        let Some(fid) = self.flows.lookup(dst_key) else {
            // Invalid destination, or the flow was fully served and
            // collected already.
            self.stat.flow_not_found_oob += 1;
            return;
        };

        self.flow_inc_demand(fid, pacer, ctx, now);
        self.flow_inc_alloc(fid, pacer, ctx, now);
    }

    /// Moves one timeslot's worth of packets from `fid` to the internal
    /// (egress-ready) queue.
    fn move_timeslot_from_flow(&mut self, fid: FlowId) {
        let mut credit = self.tslot_len as i64;

        loop {
            let Some(len) = self.flows.get(fid).peek_len() else {
                break;
            };

            credit -= self.l2t_ns(len) as i64;
            if credit < 0 {
                break;
            }

            let (len, pkt) = self.flows.get_mut(fid).pop().unwrap();
            self.internal.push(len, pkt);
        }
    }

    fn move_current<C: ClientContext>(
        &mut self,
        pacer: &Mutex<RequestPacer>,
        ctx: &mut C,
        now: u64,
    ) {
        let key = self.horizon.current_key();
        self.horizon.unmark_current();

        let Some(fid) = self.flows.lookup(key) else {
            self.stat.flow_not_found_update += 1;
            return;
        };

        self.move_timeslot_from_flow(fid);
        self.stat.used_timeslots += 1;
        self.flow_inc_alloc(fid, pacer, ctx, now);

        let c = &mut self.flows.get_mut(fid).counters;
        if c.used < c.alloc {
            c.inc_used(1);
        }
    }

    /// Advances the horizon to the timeslot containing `now`, consuming or
    /// rebooking every scheduled slot passed along the way.
    fn update_current_timeslot<C: ClientContext>(
        &mut self,
        pacer: &Mutex<RequestPacer>,
        ctx: &mut C,
        now: u64,
    ) {
        if now < self.tslot_start_time + self.tslot_len {
            // Still inside the current slot.
            if self.horizon.cur_is_marked() && self.internal.qlen() == 0 {
                self.move_current(pacer, ctx, now);
            }
            return;
        }

        loop {
            let next = self.horizon.next_nonempty();
            let next_start = next
                .map(|n| self.tslot_start_time + n as u64 * self.tslot_len);

            match next_start {
                Some(start) if now >= start => {
                    self.horizon.advance(next.unwrap() as u64);
                    self.tslot_start_time = start;

                    if now >= self.tslot_start_time + self.tslot_len {
                        // The scheduled slot already elapsed.
                        self.stat.missed_timeslots += 1;
                        let key = self.horizon.current_key();
                        self.horizon.unmark_current();
                        self.out_of_bounds_alloc(key, pacer, ctx, now);
                        continue;
                    }

                    if self.internal.qlen() == 0 {
                        self.move_current(pacer, ctx, now);
                    }
                    return;
                }
                _ => {
                    // No booked slot before `now`: jump straight there.
                    let advance = (now - self.tslot_start_time) / self.tslot_len;
                    self.tslot_start_time += advance * self.tslot_len;
                    self.horizon.advance(advance);
                    return;
                }
            }
        }
    }

    fn set_watchdog<C: ClientContext>(&self, ctx: &mut C) {
        match self.horizon.next_nonempty() {
            None => ctx.unset_timer(TimerName::Watchdog),
            Some(next) => ctx.set_timer(
                TimerName::Watchdog,
                self.tslot_start_time + next as u64 * self.tslot_len,
            ),
        }
    }

    /// Garbage-collects and rebases every flow after a protocol reset.
    fn reset_flows<C: ClientContext>(
        &mut self,
        pacer: &Mutex<RequestPacer>,
        ctx: &mut C,
        now: u64,
    ) {
        self.demand_tslots = 0;
        self.requested_tslots = 0;
        self.alloc_tslots = 0;
        self.acked_tslots = 0;

        // Grants from before the reset no longer mean anything.
        self.horizon = Horizon::new(self.horizon.current());

        for fid in self.flows.ids() {
            let f = self.flows.get_mut(fid);
            let fully_served = f.counters.rebase_for_reset();

            if fully_served && f.qlen() == 0 && f.state == QueueState::Unqueued {
                self.flows.remove(fid);
                self.stat.gc_flows += 1;
                continue;
            }

            let f = self.flows.get(fid);
            self.demand_tslots += f.counters.demand;
            if f.state == QueueState::Unqueued && f.counters.demand > 0 {
                self.enqueue_request(fid, pacer, ctx, now);
            }
        }
    }
}

/// Bridges protocol-engine callbacks into scheduler state. Lives only for
/// the duration of one engine call.
struct SchedCb<'a, T, C: ClientContext> {
    sched: &'a mut Sched<T>,
    pacer: &'a Mutex<RequestPacer>,
    ctx: &'a mut C,
    now: u64,
}

impl<'a, T, C: ClientContext> ConnContext for SchedCb<'a, T, C> {
    fn handle_reset(&mut self) {
        self.sched.reset_flows(self.pacer, self.ctx, self.now);
    }

    fn handle_areq(&mut self, _pairs: &[(u16, u16)]) {
        // Only the arbiter receives AREQ.
        self.sched.stat.unexpected_areq += 1;
    }

    fn handle_alloc(&mut self, base_tslot: u32, dsts: &[u16], specs: &[u8]) {
        let sched = &mut *self.sched;

        sched.update_current_timeslot(self.pacer, self.ctx, self.now);

        let current = sched.horizon.current();
        let mut tslot = serial::expand_tslot20(base_tslot, current);
        if tslot > current && tslot - current > 1 << 18 {
            // A jump beyond a quarter of the 20-bit wrap space usually
            // means the arbiter restarted; trust it, but loudly.
            warn!(tslot, current, "suspicious base timeslot jump");
        }

        for &spec in specs {
            let dst_ind = (spec >> 4) as usize;

            if dst_ind == 0 {
                // Skip instruction
                tslot += 16 * (1 + (spec & 0xF) as u64);
                continue;
            }

            if dst_ind > dsts.len() {
                warn!(spec, n_dst = dsts.len(), "alloc spec with bad dst index");
                sched.stat.alloc_bad_dst += 1;
                return;
            }

            let dst_key = dsts[dst_ind - 1] as u64;
            let slot = tslot;
            tslot += 1;

            let current = sched.horizon.current();
            if slot <= current {
                sched.stat.alloc_too_late += 1;
                sched.out_of_bounds_alloc(dst_key, self.pacer, self.ctx, self.now);
            } else if slot >= current + FASTPASS_HORIZON as u64 {
                sched.stat.alloc_premature += 1;
                sched.out_of_bounds_alloc(dst_key, self.pacer, self.ctx, self.now);
            } else {
                sched
                    .horizon
                    .set(slot, dst_key)
                    .expect("slot bounds already checked");
            }
        }

        if sched.internal.qlen() != 0 {
            // Dequeue is live; it will re-arm the watchdog itself.
            return;
        }

        if sched.horizon.cur_is_marked() {
            self.ctx.unthrottle();
        } else {
            sched.set_watchdog(self.ctx);
        }
    }

    fn handle_ack(&mut self, pd: PacketDesc) {
        for areq in pd.areq.iter() {
            let Some(fid) = self.sched.flows.lookup(areq.src_dst_key) else {
                continue;
            };

            let f = self.sched.flows.get_mut(fid);
            match f.counters.ack(areq.tslots) {
                Ok(delta) => self.sched.acked_tslots += delta,
                Err(_) => {
                    // The arbiter thinks we asked for more than we ever
                    // demanded: states diverged, start over.
                    warn!(key = areq.src_dst_key, "ack beyond demand, forcing reset");
                    self.sched.stat.ack_beyond_demand += 1;
                    self.sched.pending_force_reset = true;
                }
            }
        }
    }

    fn handle_neg_ack(&mut self, pd: PacketDesc) {
        for areq in pd.areq.iter() {
            let Some(fid) = self.sched.flows.lookup(areq.src_dst_key) else {
                continue;
            };

            // No need to resend anything already acked by a later packet.
            if areq.tslots <= self.sched.flows.get(fid).counters.acked {
                continue;
            }

            self.sched
                .enqueue_retransmit(fid, self.pacer, self.ctx, self.now);
        }
    }

    fn trigger_request(&mut self, now: u64) {
        Sched::<T>::arm_pacer(self.pacer, self.ctx, now);
    }

    fn set_timer(&mut self, when: u64) {
        self.ctx.set_timer(TimerName::Retransmit, when);
    }

    fn cancel_timer(&mut self) {
        self.ctx.unset_timer(TimerName::Retransmit);
    }
}

impl<T> Client<T> {
    pub fn new(cfg: Config, now: u64) -> Result<Self, ConfigError> {
        cfg.validate()?;

        let mut conn = Conn::new(
            ConnRole::Endpoint,
            cfg.local_ip,
            cfg.controller_ip,
            FASTPASS_WND_LOG,
            cfg.reset_window_us as u64 * 1_000,
            cfg.send_timeout_us as u64 * 1_000,
        );
        conn.force_reset(now);

        let sched = Sched::new(&cfg, now);
        let pacer = Mutex::new(RequestPacer::new(
            cfg.req_cost_ns,
            cfg.req_bucket_ns,
            cfg.req_min_gap_ns,
            now,
        ));

        Ok(Self {
            cfg,
            conn,
            sched,
            pacer,
            destroyed: false,
        })
    }

    /// Applies a new configuration. Invalid parameters are rejected whole,
    /// leaving the previous configuration in force. A change to any
    /// connection parameter re-creates the connection (and propagates the
    /// new send timeout with it), then rebases all flows.
    pub fn reconfigure<C: ClientContext>(
        &mut self,
        cfg: Config,
        now: u64,
        ctx: &mut C,
    ) -> Result<(), ConfigError> {
        cfg.validate()?;

        let reconnect = cfg.affects_connection(&self.cfg);

        self.sched.packet_limit = cfg.packet_limit;
        self.sched.flow_packet_limit = cfg.flow_packet_limit;
        self.sched.data_rate = cfg.data_rate_bytes_per_sec;
        if cfg.tslot_nsec != self.cfg.tslot_nsec {
            self.sched.tslot_len = cfg.tslot_nsec;
            self.sched.tslot_start_time = now - now % cfg.tslot_nsec;
            self.sched.horizon = Horizon::new(now / cfg.tslot_nsec);
        }

        *self.pacer.lock().expect("pacer lock poisoned") = RequestPacer::new(
            cfg.req_cost_ns,
            cfg.req_bucket_ns,
            cfg.req_min_gap_ns,
            now,
        );

        if reconnect {
            self.conn = Conn::new(
                ConnRole::Endpoint,
                cfg.local_ip,
                cfg.controller_ip,
                FASTPASS_WND_LOG,
                cfg.reset_window_us as u64 * 1_000,
                cfg.send_timeout_us as u64 * 1_000,
            );
            self.conn.force_reset(now);
            self.sched.reset_flows(&self.pacer, ctx, now);
        }

        self.cfg = cfg;
        Ok(())
    }

    /// Marks the client destroyed: timers that fire afterwards observe the
    /// flag and do nothing.
    pub fn destroy(&mut self) {
        self.destroyed = true;
    }

    pub fn qlen(&self) -> u32 {
        self.sched.qlen
    }

    pub fn sched_stats(&self) -> &SchedStat {
        &self.sched.stat
    }

    pub fn proto_stats(&self) -> &ProtoStat {
        self.conn.stats()
    }

    pub fn counters(&self) -> (u64, u64, u64, u64) {
        (
            self.sched.demand_tslots,
            self.sched.requested_tslots,
            self.sched.alloc_tslots,
            self.sched.acked_tslots,
        )
    }

    pub fn current_timeslot(&self) -> u64 {
        self.sched.horizon.current()
    }

    /// Accepts one outgoing packet, classifying it and metering demand.
    /// Rejected packets are handed back with the drop reason.
    pub fn enqueue<C: ClientContext>(
        &mut self,
        info: PktInfo,
        pkt: T,
        now: u64,
        ctx: &mut C,
    ) -> Result<(), (DropReason, T)> {
        let sched = &mut self.sched;

        if sched.qlen >= sched.packet_limit {
            sched.stat.dropped_qdisc_limit += 1;
            return Err((DropReason::QdiscLimit, pkt));
        }

        match classify(&info) {
            Classification::Internal(reason) => {
                match reason {
                    InternalReason::HighPrio => sched.stat.non_ctrl_highprio_pkts += 1,
                    InternalReason::Ntp => sched.stat.ntp_pkts += 1,
                    InternalReason::Arp => sched.stat.arp_pkts += 1,
                    InternalReason::CannotClassify => sched.stat.classify_errors += 1,
                }

                sched.internal.push(info.len_bytes, pkt);
                sched.qlen += 1;
                ctx.unthrottle();
            }
            Classification::Key(key) => {
                sched.stat.data_pkts += 1;

                let fid = sched.flows.get_or_create(key);
                if sched.flows.get(fid).qlen() >= sched.flow_packet_limit {
                    sched.stat.dropped_flow_limit += 1;
                    return Err((DropReason::FlowLimit, pkt));
                }

                let cost = sched.l2t_ns(info.len_bytes) as i64;
                let tslot_len = sched.tslot_len as i64;

                let f = sched.flows.get_mut(fid);

                // Credit left over from a fully-allocated past is stale.
                if f.counters.demand == f.counters.alloc {
                    f.credit = 0;
                }

                f.credit -= cost;
                let need_slot = f.credit < 0;
                if need_slot {
                    f.credit += tslot_len;
                }

                f.push(info.len_bytes, pkt);
                sched.qlen += 1;

                if need_slot {
                    sched.flow_inc_demand(fid, &self.pacer, ctx, now);
                }
            }
        }

        Ok(())
    }

    /// Releases the next egress-ready packet, advancing the timeslot state
    /// as a side effect. Returns `None` (with the watchdog armed) when
    /// nothing may be sent yet.
    pub fn dequeue<C: ClientContext>(&mut self, now: u64, ctx: &mut C) -> Option<T> {
        if let Some((_, pkt)) = self.sched.internal.pop() {
            self.sched.qlen -= 1;
            return Some(pkt);
        }

        self.sched.update_current_timeslot(&self.pacer, ctx, now);

        if let Some((_, pkt)) = self.sched.internal.pop() {
            self.sched.qlen -= 1;
            return Some(pkt);
        }

        self.sched.set_watchdog(ctx);
        None
    }

    /// Feeds a received control frame to the protocol engine.
    pub fn handle_rx<C: ClientContext>(
        &mut self,
        frame: &[u8],
        saddr: u32,
        daddr: u32,
        now: u64,
        ctx: &mut C,
    ) -> RxResult {
        let result = {
            let mut cb = SchedCb {
                sched: &mut self.sched,
                pacer: &self.pacer,
                ctx,
                now,
            };
            self.conn.handle_rx_packet(frame, saddr, daddr, now, &mut cb)
        };

        self.check_pending_reset(now, ctx);
        result
    }

    pub fn handle_timer<C: ClientContext>(&mut self, timer: TimerName, now: u64, ctx: &mut C) {
        if self.destroyed {
            return;
        }

        match timer {
            TimerName::Request => self.send_request(now, ctx),
            TimerName::Retransmit => {
                let mut cb = SchedCb {
                    sched: &mut self.sched,
                    pacer: &self.pacer,
                    ctx,
                    now,
                };
                self.conn.handle_timeout(now, &mut cb);
            }
            TimerName::Watchdog => {
                // The slot we were waiting on is (about to be) current.
                ctx.unthrottle();
            }
        }
    }

    /// Assembles and transmits one request packet, draining up to
    /// `FASTPASS_PKT_MAX_AREQ` flows from the request queues.
    fn send_request<C: ClientContext>(&mut self, now: u64, ctx: &mut C) {
        {
            let mut cb = SchedCb {
                sched: &mut self.sched,
                pacer: &self.pacer,
                ctx,
                now,
            };
            self.conn.prepare_to_send(&mut cb);
        }
        self.check_pending_reset(now, ctx);

        let mut pd = PacketDesc::default();

        while pd.areq.len() < serial::FASTPASS_PKT_MAX_AREQ {
            let Some(fid) = self.sched.flowqueue_dequeue() else {
                break;
            };

            let f = self.sched.flows.get_mut(fid);
            let key = f.src_dst_key;
            let new_requested = f
                .counters
                .demand
                .min(f.counters.acked + FASTPASS_REQUEST_WINDOW - 1);

            if new_requested <= f.counters.acked {
                self.sched.stat.queued_flow_already_acked += 1;
                continue;
            }

            let delta = f.counters.request_to(new_requested);
            self.sched.requested_tslots += delta;

            pd.areq.push(AreqSpec {
                src_dst_key: key,
                tslots: new_requested,
            });
        }

        if pd.areq.is_empty() {
            self.sched.stat.request_with_empty_flowqueue += 1;
        }
        self.sched.stat.requests += 1;

        let seqno = {
            let mut cb = SchedCb {
                sched: &mut self.sched,
                pacer: &self.pacer,
                ctx,
                now,
            };
            self.conn.commit_packet(pd, now, &mut cb)
        };

        let mut buf = [0u8; serial::FASTPASS_ENDPOINT_MAX_PAYLOAD];
        let len = self
            .conn
            .encode_committed(seqno, &mut buf, 0)
            .expect("request within payload bound");
        ctx.send_frame(&buf[..len]);

        let more = !self.sched.flowqueue_is_empty();
        let next = self
            .pacer
            .lock()
            .expect("pacer lock poisoned")
            .on_request_sent(now, more);
        if let Some(when) = next {
            ctx.set_timer(TimerName::Request, when);
        }
    }

    /// A counter invariant was violated mid-callback; restart the protocol
    /// now that the engine borrow is released.
    fn check_pending_reset<C: ClientContext>(&mut self, now: u64, ctx: &mut C) {
        if !self.sched.pending_force_reset {
            return;
        }
        self.sched.pending_force_reset = false;

        self.sched.reset_flows(&self.pacer, ctx, now);
        self.conn.force_reset(now);
    }
}
