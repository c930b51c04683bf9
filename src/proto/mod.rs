//! The request/allocation protocol engine.
//!
//! A [`Conn`] is one half of an endpoint<->arbiter association. It assigns
//! sequence numbers, tracks in-flight packet descriptors in the outgoing
//! window, reconstructs truncated on-wire fields, suppresses duplicates in
//! the incoming window, and arbitrates reset contests. It performs no I/O
//! and reads no clocks: frames and timestamps come in through the public
//! methods, and everything going the other way is a [`ConnContext`] callback.

pub mod serial;

use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::window::{Window, WindowError};
use serial::{
    FASTPASS_PKT_MAX_ALLOC_TSLOTS, FASTPASS_PKT_MAX_AREQ, FASTPASS_PKT_MAX_DSTS, SerialError,
};

pub const FASTPASS_BAD_PKT_RESET_THRESHOLD: u32 = 10;
pub const FASTPASS_RESET_WINDOW_NS: u64 = 1_000_000_000;

/// Default log of the outgoing window size on the endpoint.
pub const FASTPASS_WND_LOG: u32 = 14;

const TO_CONTROLLER_SEQNO_OFFSET: u64 = 0;
const TO_ENDPOINT_SEQNO_OFFSET: u64 = 0xDEAD_BEEF;

/// An allocation request (or report) for a single destination.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct AreqSpec {
    pub src_dst_key: u64,
    pub tslots: u64,
}

/// The state encoded into one full packet, kept until the packet is acked,
/// nacked, or falls off the outgoing window.
#[derive(Clone, Debug, Default)]
pub struct PacketDesc {
    pub sent_timestamp: u64,

    pub seqno: u64,
    pub ack_seq: u64,
    pub ack_vec16: u16,
    pub ack_vec64: u64,
    pub send_ack: bool,

    pub send_reset: bool,
    pub reset_timestamp: u64,

    pub areq: SmallVec<[AreqSpec; FASTPASS_PKT_MAX_AREQ]>,

    /// Allocation payload, filled in on the arbiter only.
    pub base_tslot: u64,
    pub dsts: SmallVec<[u16; FASTPASS_PKT_MAX_DSTS]>,
    pub tslot_desc: SmallVec<[u8; FASTPASS_PKT_MAX_ALLOC_TSLOTS]>,
}

/// Callbacks from the engine into its user.
pub trait ConnContext {
    /// A reset was accepted; counters must be rebased.
    fn handle_reset(&mut self);

    /// An AREQ payload arrived: raw `(dst, count_low16)` pairs.
    fn handle_areq(&mut self, pairs: &[(u16, u16)]);

    /// An ALLOC payload arrived. `base_tslot` is the 20-bit wire value.
    fn handle_alloc(&mut self, base_tslot: u32, dsts: &[u16], specs: &[u8]);

    /// A sent packet was acknowledged. The descriptor is handed over.
    fn handle_ack(&mut self, pd: PacketDesc);

    /// A sent packet timed out or fell off the window. The descriptor is
    /// handed over; the user re-queues its requests.
    fn handle_neg_ack(&mut self, pd: PacketDesc);

    /// The engine wants a packet sent soon so state can piggy-back.
    fn trigger_request(&mut self, now: u64);

    /// Arm the retransmit timer for the given absolute time.
    fn set_timer(&mut self, when: u64);

    /// Cancel the retransmit timer.
    fn cancel_timer(&mut self);
}

/// Which side of the association this connection is.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnRole {
    Endpoint,
    Arbiter,
}

impl ConnRole {
    fn egress_offset(self) -> u64 {
        match self {
            ConnRole::Endpoint => TO_CONTROLLER_SEQNO_OFFSET,
            ConnRole::Arbiter => TO_ENDPOINT_SEQNO_OFFSET,
        }
    }

    fn ingress_offset(self) -> u64 {
        match self {
            ConnRole::Endpoint => TO_ENDPOINT_SEQNO_OFFSET,
            ConnRole::Arbiter => TO_CONTROLLER_SEQNO_OFFSET,
        }
    }
}

/// Outcome of receiving one packet.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RxResult {
    Processed,
    ProcessedOutOfOrder,
    Duplicate,
    OutOfWindow,
    OutOfSync,
    TooShort,
    WrongSrc,
    ChecksumError,
    Format(SerialError),
}

#[derive(Clone, Debug, Default)]
pub struct ProtoStat {
    // tx
    pub committed_pkts: u64,
    pub acked_packets: u64,
    pub timeout_pkts: u64,
    pub never_acked_pkts: u64,
    pub fall_off_outwnd: u64,
    pub timeout_handler_runs: u64,
    pub reprogrammed_timer: u64,
    pub too_early_ack: u64,
    pub ack_payloads: u64,
    pub informative_ack_payloads: u64,

    // rx
    pub rx_pkts: u64,
    pub rx_too_short: u64,
    pub rx_too_long: u64,
    pub rx_wrong_src: u64,
    pub rx_checksum_error: u64,
    pub rx_unknown_payload: u64,
    pub rx_incomplete_reset: u64,
    pub rx_incomplete_areq: u64,
    pub rx_incomplete_alloc: u64,
    pub rx_incomplete_ack: u64,
    pub rx_dup_pkt: u64,
    pub rx_out_of_order: u64,
    pub rx_out_of_sync: u64,
    pub inwnd_jumped: u64,
    pub seqno_before_inwnd: u64,

    // reset
    pub reset_payloads: u64,
    pub proto_resets: u64,
    pub redundant_reset: u64,
    pub reset_both_recent_last_reset_wins: u64,
    pub reset_both_recent_payload_wins: u64,
    pub reset_last_recent_payload_old: u64,
    pub reset_last_old_payload_recent: u64,
    pub reset_both_old: u64,
    pub reset_from_bad_pkts: u64,
    pub forced_reset: u64,
}

pub struct Conn {
    role: ConnRole,
    local_addr: u32,
    peer_addr: u32,

    last_reset_time: u64,
    next_seqno: u64,
    in_max_seqno: u64,
    in_sync: bool,
    echo_reset_pending: bool,

    rst_win_ns: u64,
    send_timeout_ns: u64,
    consecutive_bad_pkts: u32,

    outwnd: Window,
    descs: Box<[Option<PacketDesc>]>,
    timer_armed: bool,

    inwnd: Window,

    stat: ProtoStat,
}

impl Conn {
    /// `wnd_log` bounds the number of in-flight packets at `2^wnd_log`; it
    /// must not exceed the 14 bits of ack sequence carried on the wire.
    pub fn new(
        role: ConnRole,
        local_addr: u32,
        peer_addr: u32,
        wnd_log: u32,
        rst_win_ns: u64,
        send_timeout_ns: u64,
    ) -> Self {
        assert!(wnd_log <= FASTPASS_WND_LOG, "outgoing window wider than wire acks");
        assert!(send_timeout_ns > 0);

        let wnd_len = 1u64 << wnd_log;

        Self {
            role,
            local_addr,
            peer_addr,
            last_reset_time: 0,
            next_seqno: role.egress_offset(),
            in_max_seqno: role.ingress_offset().wrapping_sub(1),
            in_sync: false,
            echo_reset_pending: false,
            rst_win_ns,
            send_timeout_ns,
            consecutive_bad_pkts: 0,
            outwnd: Window::new(wnd_log, role.egress_offset().wrapping_sub(1)),
            descs: vec![None; wnd_len as usize].into_boxed_slice(),
            timer_armed: false,
            inwnd: Window::new(wnd_log, role.ingress_offset().wrapping_sub(1).wrapping_sub(wnd_len)),
            stat: ProtoStat::default(),
        }
    }

    pub fn stats(&self) -> &ProtoStat {
        &self.stat
    }

    pub fn in_sync(&self) -> bool {
        self.in_sync
    }

    pub fn last_reset_time(&self) -> u64 {
        self.last_reset_time
    }

    pub fn next_seqno(&self) -> u64 {
        self.next_seqno
    }

    pub fn in_max_seqno(&self) -> u64 {
        self.in_max_seqno
    }

    pub fn earliest_unacked(&self) -> Option<u64> {
        self.outwnd.earliest_marked()
    }

    pub fn tx_num_unacked(&self) -> u32 {
        self.outwnd.num_marked()
    }

    fn desc_slot(&self, seqno: u64) -> usize {
        (seqno & (self.outwnd.len() - 1)) as usize
    }

    /// Re-seeds counters and windows from a reset time. Outstanding packet
    /// descriptors are discarded; the user's reset handling restores demand.
    fn do_proto_reset(&mut self, time: u64) {
        let wnd_len = self.outwnd.len();

        self.last_reset_time = time;
        self.next_seqno = time.wrapping_add(self.role.egress_offset());
        self.in_max_seqno = time
            .wrapping_add(self.role.ingress_offset())
            .wrapping_sub(1);

        self.stat.never_acked_pkts += self.outwnd.num_marked() as u64;
        let log = 64 - (wnd_len - 1).leading_zeros();
        self.outwnd = Window::new(log, self.next_seqno.wrapping_sub(1));
        self.descs.iter_mut().for_each(|slot| *slot = None);
        self.inwnd = Window::new(log, self.in_max_seqno.wrapping_sub(wnd_len));

        self.consecutive_bad_pkts = 0;
        self.stat.proto_resets += 1;
    }

    /// Forces a reset initiated locally. The caller rebases application
    /// state itself, so no `handle_reset` callback is made; outgoing packets
    /// carry the RESET payload until the peer echoes it back.
    pub fn force_reset(&mut self, now: u64) {
        self.stat.forced_reset += 1;
        self.do_proto_reset(now);
        self.in_sync = false;
    }

    fn bad_packet<C: ConnContext>(&mut self, now: u64, ctx: &mut C) {
        self.consecutive_bad_pkts += 1;

        if self.consecutive_bad_pkts >= FASTPASS_BAD_PKT_RESET_THRESHOLD {
            warn!(
                count = self.consecutive_bad_pkts,
                "consecutive bad packets, forcing reset"
            );
            self.stat.reset_from_bad_pkts += 1;
            self.do_proto_reset(now);
            self.in_sync = false;
            ctx.handle_reset();
        }
    }

    /// Applies the reset-contest rules to a received RESET timestamp.
    fn reset_payload<C: ConnContext>(&mut self, ts: u64, now: u64, ctx: &mut C) {
        self.stat.reset_payloads += 1;

        let payload_recent = now.abs_diff(ts) <= self.rst_win_ns;
        let last_recent = now.abs_diff(self.last_reset_time) <= self.rst_win_ns;

        if !payload_recent {
            if last_recent {
                self.stat.reset_last_recent_payload_old += 1;
            } else {
                self.stat.reset_both_old += 1;
            }
            debug!(ts, now, "ignoring out-of-window reset");
            return;
        }

        if ts == self.last_reset_time {
            self.stat.redundant_reset += 1;
            if !self.in_sync {
                // The peer echoed our reset: handshake complete.
                self.in_sync = true;
            } else if now.abs_diff(self.last_reset_time) <= self.rst_win_ns {
                // The peer may still be waiting on our echo.
                self.echo_reset_pending = true;
            }
            return;
        }

        let accept = if !last_recent {
            self.stat.reset_last_old_payload_recent += 1;
            true
        } else if ts.wrapping_sub(self.last_reset_time) < 1 << 63 {
            self.stat.reset_both_recent_payload_wins += 1;
            true
        } else {
            self.stat.reset_both_recent_last_reset_wins += 1;
            false
        };

        if accept {
            self.do_proto_reset(ts);
            self.in_sync = true;
            self.echo_reset_pending = true;
            ctx.handle_reset();
        }
    }

    fn retimer<C: ConnContext>(&mut self, ctx: &mut C) {
        match self.outwnd.earliest_marked() {
            None => {
                if self.timer_armed {
                    ctx.cancel_timer();
                    self.timer_armed = false;
                }
            }
            Some(seq) => {
                let sent = self.descs[self.desc_slot(seq)]
                    .as_ref()
                    .map(|pd| pd.sent_timestamp)
                    .unwrap_or(0);
                ctx.set_timer(sent.wrapping_add(self.send_timeout_ns));
                self.stat.reprogrammed_timer += 1;
                self.timer_armed = true;
            }
        }
    }

    fn process_ack<C: ConnContext>(&mut self, full_ack: u64, vec: u64, ctx: &mut C) {
        if full_ack.wrapping_sub(self.next_seqno) < 1 << 63 {
            self.stat.too_early_ack += 1;
            return;
        }

        let mut any = false;
        for i in 0..64u64 {
            if vec & (1 << i) == 0 {
                continue;
            }

            let seq = full_ack.wrapping_sub(i);
            if self.outwnd.is_marked(seq) {
                self.outwnd.unmark(seq);
                let pd = self.descs[self.desc_slot(seq)]
                    .take()
                    .expect("marked outwnd slot without descriptor");
                self.stat.acked_packets += 1;
                any = true;
                ctx.handle_ack(pd);
            }
        }

        if any {
            self.retimer(ctx);
        }
    }

    /// Parses, validates and applies one received packet. `saddr`/`daddr`
    /// are the addresses the packet actually arrived with.
    pub fn handle_rx_packet<C: ConnContext>(
        &mut self,
        pkt: &[u8],
        saddr: u32,
        daddr: u32,
        now: u64,
        ctx: &mut C,
    ) -> RxResult {
        self.stat.rx_pkts += 1;

        if pkt.len() < serial::FASTPASS_PKT_HDR_LEN {
            self.stat.rx_too_short += 1;
            self.bad_packet(now, ctx);
            return RxResult::TooShort;
        }

        let max_payload = match self.role {
            // Endpoints accept what an arbiter may send and vice versa.
            ConnRole::Endpoint => serial::FASTPASS_ARBITER_MAX_PAYLOAD,
            ConnRole::Arbiter => serial::FASTPASS_ENDPOINT_MAX_PAYLOAD,
        };
        if pkt.len() > max_payload {
            self.stat.rx_too_long += 1;
            self.bad_packet(now, ctx);
            return RxResult::TooShort;
        }

        if saddr != self.peer_addr || daddr != self.local_addr {
            self.stat.rx_wrong_src += 1;
            return RxResult::WrongSrc;
        }

        if !serial::verify_checksum(pkt, saddr, daddr) {
            self.stat.rx_checksum_error += 1;
            self.bad_packet(now, ctx);
            return RxResult::ChecksumError;
        }

        let hdr = match serial::read_hdr(pkt) {
            Ok(hdr) => hdr,
            Err(err) => {
                self.stat.rx_too_short += 1;
                self.bad_packet(now, ctx);
                return RxResult::Format(err);
            }
        };

        // Gather sections before applying anything: a malformed tail must
        // not leave half the packet applied.
        let mut sections: SmallVec<[serial::Section; 4]> = SmallVec::new();
        {
            let mut rd = serial::PayloadReader::new(&pkt[serial::FASTPASS_PKT_HDR_LEN..]);
            loop {
                match rd.next_section() {
                    Ok(Some(section)) => sections.push(section),
                    Ok(None) => break,
                    Err(err) => {
                        match err {
                            SerialError::UnknownPayload => self.stat.rx_unknown_payload += 1,
                            SerialError::IncompleteReset => self.stat.rx_incomplete_reset += 1,
                            SerialError::IncompleteAreq => self.stat.rx_incomplete_areq += 1,
                            SerialError::IncompleteAlloc => self.stat.rx_incomplete_alloc += 1,
                            SerialError::IncompleteAck => self.stat.rx_incomplete_ack += 1,
                            _ => self.stat.rx_too_short += 1,
                        }
                        self.bad_packet(now, ctx);
                        return RxResult::Format(err);
                    }
                }
            }
        }

        // RESET is applied before anything else so the remaining fields are
        // interpreted against the re-seeded counters.
        let mut had_reset = false;
        for section in sections.iter() {
            if let serial::Section::Reset { timestamp } = section {
                had_reset = true;
                self.reset_payload(*timestamp, now, ctx);
            }
        }

        if !self.in_sync {
            self.stat.rx_out_of_sync += 1;
            return RxResult::OutOfSync;
        }

        let full_seq = serial::expand_seq16(hdr.seq, self.in_max_seqno);

        let out_of_order;
        if full_seq.wrapping_sub(self.in_max_seqno).wrapping_sub(1) < 1 << 63 {
            // Ahead of everything seen: slide the incoming window forward.
            if full_seq != self.in_max_seqno.wrapping_add(1) {
                self.stat.inwnd_jumped += 1;
            }
            self.inwnd
                .advance(full_seq.wrapping_sub(self.inwnd.len()), |_| {});
            self.in_max_seqno = full_seq;
            let newly = self.inwnd.mark(full_seq).expect("jumped seq in window");
            debug_assert!(newly);
            out_of_order = false;
        } else {
            match self.inwnd.mark(full_seq) {
                Err(WindowError::OutOfWindow) => {
                    self.stat.seqno_before_inwnd += 1;
                    return RxResult::OutOfWindow;
                }
                Ok(false) => {
                    self.stat.rx_dup_pkt += 1;
                    return RxResult::Duplicate;
                }
                Ok(true) => {
                    self.stat.rx_out_of_order += 1;
                    out_of_order = true;
                }
            }
        }

        if !had_reset {
            // The peer only stops carrying RESET once it is synced.
            self.echo_reset_pending = false;
        }

        // Acks carried by the header, then payload callbacks in order.
        let full_ack = serial::expand_ack14(hdr.ack_seq, self.next_seqno);
        self.process_ack(full_ack, hdr.ack_vec as u64, ctx);

        for section in sections.iter() {
            match section {
                serial::Section::Reset { .. } => (),
                serial::Section::Areq { pairs } => ctx.handle_areq(pairs),
                serial::Section::Alloc {
                    base_tslot,
                    dsts,
                    specs,
                } => ctx.handle_alloc(*base_tslot, dsts, specs),
                serial::Section::Ack { ack_seq, ack_vec } => {
                    self.stat.ack_payloads += 1;
                    let before = self.stat.acked_packets;
                    self.process_ack(*ack_seq, *ack_vec, ctx);
                    if self.stat.acked_packets != before {
                        self.stat.informative_ack_payloads += 1;
                    }
                }
            }
        }

        self.consecutive_bad_pkts = 0;

        if out_of_order {
            RxResult::ProcessedOutOfOrder
        } else {
            RxResult::Processed
        }
    }

    /// Frees the tail of the outgoing window so the next commit fits. Any
    /// still-unacked descriptor that falls off is surrendered through
    /// `handle_neg_ack`.
    pub fn prepare_to_send<C: ConnContext>(&mut self, ctx: &mut C) {
        let new_base = self.next_seqno.wrapping_sub(self.outwnd.len());
        if new_base.wrapping_sub(self.outwnd.base()) >= 1 << 63 {
            return;
        }

        let mut fallen: SmallVec<[PacketDesc; 4]> = SmallVec::new();
        let descs = &mut self.descs;
        let mask = self.outwnd.len() - 1;
        let stat = &mut self.stat;
        self.outwnd.advance(new_base, |seq| {
            stat.fall_off_outwnd += 1;
            if let Some(pd) = descs[(seq & mask) as usize].take() {
                fallen.push(pd);
            }
        });

        for pd in fallen {
            ctx.handle_neg_ack(pd);
        }
    }

    /// Assigns a sequence number and current ack state to `pd`, stores it in
    /// the outgoing window, and arms the retransmit timer if it was idle.
    /// Returns the sequence number to pass to [`Conn::encode_committed`].
    pub fn commit_packet<C: ConnContext>(&mut self, mut pd: PacketDesc, now: u64, ctx: &mut C) -> u64 {
        let seqno = self.next_seqno;
        self.next_seqno = self.next_seqno.wrapping_add(1);

        pd.seqno = seqno;
        pd.sent_timestamp = now;
        pd.ack_seq = self.in_max_seqno;
        pd.ack_vec16 = self.inwnd.ack_vec16(self.in_max_seqno);
        if pd.send_ack {
            pd.ack_vec64 = self.ack_vec64();
        }
        if !self.in_sync || self.echo_reset_pending {
            pd.send_reset = true;
        }
        if pd.send_reset {
            pd.reset_timestamp = self.last_reset_time;
            self.echo_reset_pending = false;
        }

        let was_empty = self.outwnd.is_empty();

        self.outwnd
            .mark(seqno)
            .expect("commit without prepare_to_send");
        self.descs[self.desc_slot(seqno)] = Some(pd);
        self.stat.committed_pkts += 1;

        if was_empty || !self.timer_armed {
            ctx.set_timer(now.wrapping_add(self.send_timeout_ns));
            self.timer_armed = true;
        }

        seqno
    }

    fn ack_vec64(&self) -> u64 {
        let mut vec = 0u64;
        for i in 0..64u64 {
            if self.inwnd.is_marked(self.in_max_seqno.wrapping_sub(i)) {
                vec |= 1 << i;
            }
        }
        vec
    }

    /// Encodes the committed descriptor for `seqno` into `data`.
    pub fn encode_committed(
        &self,
        seqno: u64,
        data: &mut [u8],
        min_size: usize,
    ) -> Result<usize, SerialError> {
        let pd = self.descs[self.desc_slot(seqno)]
            .as_ref()
            .expect("encoding an uncommitted packet");
        debug_assert_eq!(pd.seqno, seqno);

        serial::encode_packet(pd, data, self.local_addr, self.peer_addr, min_size)
    }

    /// Retransmit timer callback: surrenders every expired descriptor and
    /// re-arms for the next one.
    pub fn handle_timeout<C: ConnContext>(&mut self, now: u64, ctx: &mut C) {
        self.stat.timeout_handler_runs += 1;
        self.timer_armed = false;

        let mut expired: SmallVec<[PacketDesc; 4]> = SmallVec::new();

        loop {
            let Some(seq) = self.outwnd.earliest_marked() else {
                break;
            };

            let slot = self.desc_slot(seq);
            let sent = self.descs[slot]
                .as_ref()
                .map(|pd| pd.sent_timestamp)
                .expect("marked outwnd slot without descriptor");

            if now.wrapping_sub(sent) >= self.send_timeout_ns {
                self.outwnd.unmark(seq);
                self.stat.timeout_pkts += 1;
                expired.push(self.descs[slot].take().unwrap());
            } else {
                ctx.set_timer(sent.wrapping_add(self.send_timeout_ns));
                self.timer_armed = true;
                break;
            }
        }

        for pd in expired {
            ctx.handle_neg_ack(pd);
        }

        if self.outwnd.is_empty() {
            // Nothing left in flight; the timer stays idle until the next
            // commit. Nudge the user so dropped state gets re-requested.
            ctx.trigger_request(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    const EP_ADDR: u32 = 0x0A000002;
    const ARB_ADDR: u32 = 0x0A000001;
    const WND_LOG: u32 = 8;
    const RST_WIN: u64 = 1_000_000_000;
    const TIMEOUT: u64 = 5_000_000;

    #[derive(Debug, PartialEq)]
    enum Event {
        Reset,
        Areq(Vec<(u16, u16)>),
        Alloc(u32, Vec<u16>, Vec<u8>),
        Ack(u64),
        NegAck(u64),
        Trigger,
        SetTimer(u64),
        CancelTimer,
    }

    #[derive(Default)]
    struct MockCtx {
        events: Vec<Event>,
    }

    impl ConnContext for MockCtx {
        fn handle_reset(&mut self) {
            self.events.push(Event::Reset);
        }

        fn handle_areq(&mut self, pairs: &[(u16, u16)]) {
            self.events.push(Event::Areq(pairs.to_vec()));
        }

        fn handle_alloc(&mut self, base_tslot: u32, dsts: &[u16], specs: &[u8]) {
            self.events
                .push(Event::Alloc(base_tslot, dsts.to_vec(), specs.to_vec()));
        }

        fn handle_ack(&mut self, pd: PacketDesc) {
            self.events.push(Event::Ack(pd.seqno));
        }

        fn handle_neg_ack(&mut self, pd: PacketDesc) {
            self.events.push(Event::NegAck(pd.seqno));
        }

        fn trigger_request(&mut self, _now: u64) {
            self.events.push(Event::Trigger);
        }

        fn set_timer(&mut self, when: u64) {
            self.events.push(Event::SetTimer(when));
        }

        fn cancel_timer(&mut self) {
            self.events.push(Event::CancelTimer);
        }
    }

    impl MockCtx {
        fn acks(&self) -> Vec<u64> {
            self.events
                .iter()
                .filter_map(|ev| match ev {
                    Event::Ack(seq) => Some(*seq),
                    _ => None,
                })
                .collect()
        }
    }

    fn endpoint_conn() -> Conn {
        Conn::new(ConnRole::Endpoint, EP_ADDR, ARB_ADDR, WND_LOG, RST_WIN, TIMEOUT)
    }

    fn arbiter_conn() -> Conn {
        Conn::new(ConnRole::Arbiter, ARB_ADDR, EP_ADDR, WND_LOG, RST_WIN, TIMEOUT)
    }

    fn send(
        from: &mut Conn,
        from_ctx: &mut MockCtx,
        pd: PacketDesc,
        now: u64,
    ) -> (u64, Vec<u8>) {
        from.prepare_to_send(from_ctx);
        let seqno = from.commit_packet(pd, now, from_ctx);
        let mut buf = [0u8; serial::FASTPASS_ARBITER_MAX_PAYLOAD];
        let len = from.encode_committed(seqno, &mut buf, 0).unwrap();
        (seqno, buf[..len].to_vec())
    }

    fn deliver(to: &mut Conn, to_ctx: &mut MockCtx, frame: &[u8], now: u64) -> RxResult {
        let (saddr, daddr) = (to.peer_addr, to.local_addr);
        to.handle_rx_packet(frame, saddr, daddr, now, to_ctx)
    }

    /// Runs the reset handshake so both ends are in sync with reset time
    /// `t0` and returns the four parts.
    fn synced_pair(t0: u64) -> (Conn, MockCtx, Conn, MockCtx) {
        let mut ep = endpoint_conn();
        let mut arb = arbiter_conn();
        let mut ep_ctx = MockCtx::default();
        let mut arb_ctx = MockCtx::default();

        ep.force_reset(t0);

        let (_, frame) = send(&mut ep, &mut ep_ctx, PacketDesc::default(), t0 + 1);
        assert_eq!(deliver(&mut arb, &mut arb_ctx, &frame, t0 + 2), RxResult::Processed);
        assert!(arb.in_sync());
        assert_eq!(arb.last_reset_time(), t0);

        let (_, frame) = send(&mut arb, &mut arb_ctx, PacketDesc::default(), t0 + 3);
        assert_eq!(deliver(&mut ep, &mut ep_ctx, &frame, t0 + 4), RxResult::Processed);
        assert!(ep.in_sync());

        ep_ctx.events.clear();
        arb_ctx.events.clear();

        (ep, ep_ctx, arb, arb_ctx)
    }

    #[test]
    fn reset_handshake() {
        let (ep, _, arb, _) = synced_pair(1_000_000);

        assert_eq!(ep.last_reset_time(), arb.last_reset_time());
        assert_eq!(arb.stats().proto_resets, 1);
        assert_eq!(arb.stats().reset_payloads, 1);
    }

    #[test]
    fn areq_delivery() {
        let (mut ep, mut ep_ctx, mut arb, mut arb_ctx) = synced_pair(1_000_000);

        let pd = PacketDesc {
            areq: smallvec![AreqSpec {
                src_dst_key: 7,
                tslots: 42,
            }],
            ..Default::default()
        };

        let (_, frame) = send(&mut ep, &mut ep_ctx, pd, 1_000_100);
        deliver(&mut arb, &mut arb_ctx, &frame, 1_000_200);

        assert!(arb_ctx.events.contains(&Event::Areq(vec![(7, 42)])));
    }

    // Commit a run of packets, deliver all but the first to the peer, and
    // check the ack vector acks each of the delivered ones exactly once.
    #[test]
    fn ack_vector_collapse() {
        let (mut ep, mut ep_ctx, mut arb, mut arb_ctx) = synced_pair(100);

        let first_seqno = ep.next_seqno();

        let mut frames = Vec::new();
        for i in 0..8u64 {
            let (_, frame) = send(&mut ep, &mut ep_ctx, PacketDesc::default(), 200 + i);
            frames.push(frame);
        }

        // Packet 0 is lost; 1..8 arrive.
        for frame in frames.iter().skip(1) {
            assert_ne!(deliver(&mut arb, &mut arb_ctx, frame, 300), RxResult::Duplicate);
        }

        let (_, ack_frame) = send(&mut arb, &mut arb_ctx, PacketDesc::default(), 400);
        deliver(&mut ep, &mut ep_ctx, &ack_frame, 500);

        let mut acked = ep_ctx.acks();
        acked.sort_unstable();
        let want: Vec<u64> = (1..8).map(|i| first_seqno + i).collect();
        assert_eq!(acked, want);

        assert_eq!(ep.earliest_unacked(), Some(first_seqno));
        assert_eq!(ep.tx_num_unacked(), 1);
    }

    #[test]
    fn reset_contest_later_wins() {
        let t0 = 10_000_000_000;
        let (mut ep, mut ep_ctx, _, _) = synced_pair(t0);

        // A fresh arbiter resets half a window later: both recent, later wins.
        let t1 = t0 + RST_WIN / 2;
        let mut arb = arbiter_conn();
        let mut arb_ctx = MockCtx::default();
        arb.force_reset(t1);

        let (_, frame) = send(&mut arb, &mut arb_ctx, PacketDesc::default(), t1 + 1);
        deliver(&mut ep, &mut ep_ctx, &frame, t1 + 2);

        assert_eq!(ep.last_reset_time(), t1);
        assert!(ep_ctx.events.contains(&Event::Reset));
        assert_eq!(ep.stats().reset_both_recent_payload_wins, 1);
    }

    #[test]
    fn reset_out_of_window_rejected() {
        let t0 = 10_000_000_000;
        let (mut ep, mut ep_ctx, _, _) = synced_pair(t0);

        let t1 = t0 - RST_WIN - 1;
        let mut arb = arbiter_conn();
        let mut arb_ctx = MockCtx::default();
        arb.force_reset(t1);

        let (_, frame) = send(&mut arb, &mut arb_ctx, PacketDesc::default(), t0 + 10);
        deliver(&mut ep, &mut ep_ctx, &frame, t0 + 11);

        assert_eq!(ep.last_reset_time(), t0);
        assert!(!ep_ctx.events.contains(&Event::Reset));
        assert_eq!(ep.stats().reset_last_recent_payload_old, 1);
    }

    #[test]
    fn timeout_surrenders_descriptors() {
        let (mut ep, mut ep_ctx, _, _) = synced_pair(1_000);

        let pd = PacketDesc {
            areq: smallvec![AreqSpec {
                src_dst_key: 3,
                tslots: 5,
            }],
            ..Default::default()
        };
        let (seqno, _) = send(&mut ep, &mut ep_ctx, pd, 2_000);

        ep_ctx.events.clear();
        ep.handle_timeout(2_000 + TIMEOUT, &mut ep_ctx);

        assert_eq!(ep_ctx.events[0], Event::NegAck(seqno));
        assert_eq!(ep.stats().timeout_pkts, 1);
        assert_eq!(ep.tx_num_unacked(), 0);
    }

    #[test]
    fn early_timeout_rearms() {
        let (mut ep, mut ep_ctx, _, _) = synced_pair(1_000);

        send(&mut ep, &mut ep_ctx, PacketDesc::default(), 2_000);

        ep_ctx.events.clear();
        ep.handle_timeout(2_000 + TIMEOUT / 2, &mut ep_ctx);

        assert_eq!(ep_ctx.events, vec![Event::SetTimer(2_000 + TIMEOUT)]);
        assert_eq!(ep.tx_num_unacked(), 1);
    }

    #[test]
    fn duplicate_detection() {
        let (mut ep, mut ep_ctx, mut arb, mut arb_ctx) = synced_pair(1_000);

        let (_, frame) = send(&mut ep, &mut ep_ctx, PacketDesc::default(), 2_000);

        assert_eq!(deliver(&mut arb, &mut arb_ctx, &frame, 2_100), RxResult::Processed);
        assert_eq!(deliver(&mut arb, &mut arb_ctx, &frame, 2_200), RxResult::Duplicate);
        assert_eq!(arb.stats().rx_dup_pkt, 1);
    }

    #[test]
    fn checksum_failure_counts_toward_reset() {
        let (mut ep, mut ep_ctx, mut arb, mut arb_ctx) = synced_pair(1_000);

        let (_, mut frame) = send(&mut ep, &mut ep_ctx, PacketDesc::default(), 2_000);
        frame[5] ^= 0xFF;

        for _ in 0..FASTPASS_BAD_PKT_RESET_THRESHOLD {
            assert_eq!(
                deliver(&mut arb, &mut arb_ctx, &frame, 2_100),
                RxResult::ChecksumError
            );
        }

        assert_eq!(arb.stats().reset_from_bad_pkts, 1);
        assert!(arb_ctx.events.contains(&Event::Reset));
    }

    #[test]
    fn window_falloff_neg_acks() {
        let (mut ep, mut ep_ctx, _, _) = synced_pair(1_000);

        let first_seqno = ep.next_seqno();
        let wnd = 1u64 << WND_LOG;

        for i in 0..wnd + 1 {
            send(&mut ep, &mut ep_ctx, PacketDesc::default(), 2_000 + i);
        }

        assert!(ep_ctx.events.contains(&Event::NegAck(first_seqno)));
        assert_eq!(ep.stats().fall_off_outwnd, 1);
    }
}
