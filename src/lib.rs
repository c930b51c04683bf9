/*

Fastpass moves packet-timing decisions out of the network and into a central
arbiter. Endpoints do not decide when to transmit; they report how many
timeslot-sized chunks of traffic they have pending toward each destination,
and the arbiter replies with explicit per-timeslot allocations. If every
endpoint transmits only in its allotted timeslots, no link in the fabric is
ever oversubscribed.

# Control protocol

Endpoint and arbiter speak a small datagram protocol (IP protocol 222). Each
packet carries an 8-byte header followed by typed payload sections:

  RESET   re-synchronizes both ends' counters after loss of sync
  AREQ    (destination, cumulative demand count) pairs, endpoint -> arbiter
  ALLOC   (destination, timeslot) grants, arbiter -> endpoint
  ACK     extended acknowledgment state for piggy-back-only packets

The protocol is reliable without retransmitting payload bytes: counters are
cumulative, so a lost request is simply folded into the next one. The engine
tracks in-flight packets in a windowed structure; when a packet is acked its
descriptor is released, and when it times out or falls off the window the
descriptor is handed back to the user, who re-queues the affected flows.

# Endpoint scheduler

The endpoint side meters outgoing traffic into timeslot-sized chunks using a
signed byte credit per flow, paces its requests with a token bucket so that
several per-destination updates batch into one control packet, and keeps a
64-slot lookahead bitmap (the horizon) of granted timeslots. A watchdog timer
fires at the start of the next granted slot and releases one timeslot's worth
of queued packets.

# Arbiter

The arbiter ingests demand updates, runs an allocator once per logical
timeslot, and emits admitted-traffic records that the comm core packs into
ALLOC payloads. The allocator provided here emulates the fabric itself:
endpoint groups and routers with per-port queue banks and pluggable queue
managers (drop-tail, RED, DCTCP, HULL) process emulated packets, so the
admitted stream reflects the queueing, marking, and dropping behavior the
real network would have had.

Arbiter cores communicate exclusively through bounded rings of owned records
drawn from fixed-size pools; a full ring is an ordinary outcome, never a
blocking wait.

*/

pub mod arbiter;
pub mod client;
pub mod demand;
pub mod emu;
pub mod horizon;
pub mod pacer;
pub mod proto;
pub mod window;

/// IP protocol number carried by all control packets.
pub const IPPROTO_FASTPASS: u8 = 222;

/// Timeslots an endpoint can hold allocations for, ahead of the current one.
pub const FASTPASS_HORIZON: usize = 64;

/// Bound on `requested - acked` for any one flow.
pub const FASTPASS_REQUEST_WINDOW: u64 = 1 << 13;

/// A flow re-enters the request queue only while
/// `requested <= alloc + FASTPASS_REQUEST_LOW_WATERMARK`.
pub const FASTPASS_REQUEST_LOW_WATERMARK: u64 = 1 << 9;
