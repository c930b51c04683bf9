//! Token-bucket limiter for outbound request packets.
//!
//! Requests are deliberately not sent the instant demand appears: holding
//! the trigger back by a small gap lets several per-destination updates
//! batch into one control packet.

/// Sentinel for "no request scheduled".
pub const NO_NEXT_REQUEST: u64 = u64::MAX;

/// State is a single deficit timestamp `req_t`: the instant at which the
/// bucket would drain to empty. A full bucket corresponds to
/// `req_t == now - bucket_ns`.
#[derive(Debug)]
pub struct RequestPacer {
    cost_ns: u64,
    bucket_ns: u64,
    min_gap_ns: u64,

    req_t: u64,
    time_next_req: u64,
}

impl RequestPacer {
    pub fn new(cost_ns: u64, bucket_ns: u64, min_gap_ns: u64, now: u64) -> Self {
        assert!(cost_ns > 0);
        assert!(bucket_ns >= cost_ns, "bucket must hold at least one request");

        Self {
            cost_ns,
            bucket_ns,
            min_gap_ns,
            req_t: now.saturating_sub(bucket_ns),
            time_next_req: NO_NEXT_REQUEST,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.time_next_req != NO_NEXT_REQUEST
    }

    pub fn next_request_time(&self) -> Option<u64> {
        if self.is_armed() {
            Some(self.time_next_req)
        } else {
            None
        }
    }

    fn emission_time(&self, now: u64) -> u64 {
        (self.req_t + self.cost_ns).max(now + self.min_gap_ns)
    }

    /// Schedules the next request if none is scheduled yet. Returns the
    /// absolute emission time when newly armed, `None` if already armed.
    pub fn trigger(&mut self, now: u64) -> Option<u64> {
        if self.is_armed() {
            return None;
        }

        self.time_next_req = self.emission_time(now);
        Some(self.time_next_req)
    }

    /// Charges one request at `now` and, if more work is pending, schedules
    /// the next emission. Returns the new emission time, if any.
    pub fn on_request_sent(&mut self, now: u64, more_pending: bool) -> Option<u64> {
        self.req_t = self.req_t.max(now.saturating_sub(self.bucket_ns)) + self.cost_ns;

        if more_pending {
            self.time_next_req = self.emission_time(now);
            Some(self.time_next_req)
        } else {
            self.time_next_req = NO_NEXT_REQUEST;
            None
        }
    }

    /// Drops any scheduled emission without touching the bucket.
    pub fn cancel(&mut self) {
        self.time_next_req = NO_NEXT_REQUEST;
    }
}
