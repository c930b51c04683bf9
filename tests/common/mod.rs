use fastpass::client::{ClientContext, TimerName};

/// Captures the client's side effects: outbound frames, timer state, and
/// unthrottle nudges.
#[derive(Default)]
pub struct Host {
    pub frames: Vec<Vec<u8>>,
    pub request: Option<u64>,
    pub retransmit: Option<u64>,
    pub watchdog: Option<u64>,
    pub unthrottles: u32,
}

impl Host {
    fn slot(&mut self, timer: TimerName) -> &mut Option<u64> {
        match timer {
            TimerName::Request => &mut self.request,
            TimerName::Retransmit => &mut self.retransmit,
            TimerName::Watchdog => &mut self.watchdog,
        }
    }

    /// Takes every timer due at `now`, in a fixed order.
    pub fn due_timers(&mut self, now: u64) -> Vec<TimerName> {
        let mut due = Vec::new();
        for timer in [TimerName::Request, TimerName::Retransmit, TimerName::Watchdog] {
            let slot = self.slot(timer);
            if matches!(slot, Some(when) if *when <= now) {
                *slot = None;
                due.push(timer);
            }
        }
        due
    }
}

impl ClientContext for Host {
    fn send_frame(&mut self, frame: &[u8]) {
        self.frames.push(frame.to_vec());
    }

    fn set_timer(&mut self, timer: TimerName, when_ns: u64) {
        *self.slot(timer) = Some(when_ns);
    }

    fn unset_timer(&mut self, timer: TimerName) {
        *self.slot(timer) = None;
    }

    fn unthrottle(&mut self) {
        self.unthrottles += 1;
    }
}
