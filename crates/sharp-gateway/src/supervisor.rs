use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub schedule: Vec<Duration>,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            schedule: [1, 2, 5, 10, 30]
                .into_iter()
                .map(Duration::from_secs)
                .collect(),
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given 1-based attempt. Attempts past the end of the schedule hold its last value.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let index = attempt.saturating_sub(1) as usize;
        self.schedule
            .get(index)
            .or_else(|| self.schedule.last())
            .copied()
            .unwrap_or(Duration::from_secs(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    Scheduled { attempt: u32, delay: Duration },
    AlreadyScheduled,
    Suppressed,
    Exhausted { attempts: u32 },
}

#[derive(Debug)]
pub struct Supervisor {
    policy: ReconnectPolicy,
    attempts: u32,
    reconnect_at: Option<Instant>,
    suppressed: bool,
}

impl Supervisor {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            reconnect_at: None,
            suppressed: false,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reconnect_at(&self) -> Option<Instant> {
        self.reconnect_at
    }

    pub fn is_suppressed(&self) -> bool {
        self.suppressed
    }

    pub fn on_close(&mut self, now: Instant) -> ReconnectDecision {
        if self.suppressed {
            return ReconnectDecision::Suppressed;
        }
        if self.reconnect_at.is_some() {
            return ReconnectDecision::AlreadyScheduled;
        }
        if self.attempts >= self.policy.max_attempts {
            return ReconnectDecision::Exhausted {
                attempts: self.attempts,
            };
        }
        self.attempts += 1;
        let delay = self.policy.delay_for(self.attempts);
        self.reconnect_at = Some(now + delay);
        ReconnectDecision::Scheduled {
            attempt: self.attempts,
            delay,
        }
    }

    /// Consumes a due reconnect, if any.
    pub fn take_due(&mut self, now: Instant) -> bool {
        match self.reconnect_at {
            Some(at) if at <= now => {
                self.reconnect_at = None;
                true
            }
            _ => false,
        }
    }

    pub fn on_authenticated(&mut self) {
        self.attempts = 0;
    }

    pub fn on_explicit_connect(&mut self) {
        self.suppressed = false;
        self.attempts = 0;
        self.reconnect_at = None;
    }

    pub fn on_intentional_disconnect(&mut self) {
        self.suppressed = true;
        self.reconnect_at = None;
    }
}

/// Tracks the last inbound traffic on the current socket.
#[derive(Debug, Clone, Copy)]
pub struct Liveness {
    last_inbound: Instant,
    stale_after: Duration,
}

impl Liveness {
    pub fn new(now: Instant, stale_after: Duration) -> Self {
        Self {
            last_inbound: now,
            stale_after,
        }
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_inbound = now;
    }

    pub fn deadline(&self) -> Instant {
        self.last_inbound + self.stale_after
    }

    pub fn is_stale(&self, now: Instant) -> bool {
        now >= self.deadline()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct KeepaliveTimer {
    interval: Duration,
    next: Option<Instant>,
}

impl KeepaliveTimer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: None,
        }
    }

    pub fn start(&mut self, now: Instant) {
        self.next = Some(now + self.interval);
    }

    pub fn stop(&mut self) {
        self.next = None;
    }

    pub fn next(&self) -> Option<Instant> {
        self.next
    }

    /// Returns `true` once per elapsed interval and arms the next tick.
    pub fn poll_due(&mut self, now: Instant) -> bool {
        match self.next {
            Some(at) if at <= now => {
                self.next = Some(now + self.interval);
                true
            }
            _ => false,
        }
    }
}
