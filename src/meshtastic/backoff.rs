use std::time::Duration;

/// Doubling reconnect delay with a ceiling.
///
/// `next_delay` yields the floor first, then doubles on every call until it sticks at the cap:
/// `10s, 20s, 40s, 80s, 160s, 300s, 300s, …` with the defaults.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    floor: Duration,
    cap: Duration,
    current: Duration,
}

impl ReconnectBackoff {
    pub const DEFAULT_FLOOR: Duration = Duration::from_secs(10);
    pub const DEFAULT_CAP: Duration = Duration::from_secs(300);

    pub fn new(floor: Duration, cap: Duration) -> Self {
        let cap = cap.max(floor);
        Self {
            floor,
            cap,
            current: floor,
        }
    }

    /// Delay to wait before the upcoming attempt; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.cap);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.floor;
    }

    pub fn peek(&self) -> Duration {
        self.current
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new(Self::DEFAULT_FLOOR, Self::DEFAULT_CAP)
    }
}
