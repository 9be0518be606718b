// Command watchdog: if the client stops sending actions, the host must
// force the mobile base to a stop within a bounded window. The trip is
// edge-triggered so the forced-stop write goes out once per stall, not
// once per tick for as long as the stall lasts.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogState {
    Active,
    Tripped,
}

/// Tracks the age of the last accepted command against a timeout.
///
/// Tripping is never fatal: a fresh command re-arms the watchdog and
/// normal operation resumes silently.
#[derive(Debug)]
pub struct CommandWatchdog {
    timeout: Duration,
    last_command: Instant,
    state: WatchdogState,
}

impl CommandWatchdog {
    pub fn new(timeout: Duration) -> Self {
        Self::starting_at(timeout, Instant::now())
    }

    /// Start the stall clock at `now`; trips `timeout` later if no command
    /// ever arrives.
    pub fn starting_at(timeout: Duration, now: Instant) -> Self {
        Self {
            timeout,
            last_command: now,
            state: WatchdogState::Active,
        }
    }

    pub fn state(&self) -> WatchdogState {
        self.state
    }

    /// A command was accepted: reset the stall clock and re-arm.
    pub fn notify_command_received(&mut self, now: Instant) {
        self.last_command = now;
        self.state = WatchdogState::Active;
    }

    /// Called once per control-loop tick. Returns `true` exactly on the
    /// Active -> Tripped transition; repeated calls while still stalled
    /// return `false`.
    pub fn check(&mut self, now: Instant) -> bool {
        let stalled = now.duration_since(self.last_command) > self.timeout;
        match (self.state, stalled) {
            (WatchdogState::Active, true) => {
                self.state = WatchdogState::Tripped;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(500);

    #[test]
    fn trips_exactly_once_per_stall() {
        let start = Instant::now();
        let mut dog = CommandWatchdog::starting_at(TIMEOUT, start);

        assert!(!dog.check(start + Duration::from_millis(499)));
        assert!(!dog.check(start + Duration::from_millis(500))); // boundary: not yet exceeded
        assert!(dog.check(start + Duration::from_millis(501)));
        assert_eq!(dog.state(), WatchdogState::Tripped);

        // Still stalled: no duplicate trip signals.
        for ms in [600, 700, 5000] {
            assert!(!dog.check(start + Duration::from_millis(ms)));
        }
    }

    #[test]
    fn fresh_command_rearms_after_trip() {
        let start = Instant::now();
        let mut dog = CommandWatchdog::starting_at(TIMEOUT, start);
        assert!(dog.check(start + Duration::from_millis(600)));

        dog.notify_command_received(start + Duration::from_millis(700));
        assert_eq!(dog.state(), WatchdogState::Active);
        assert!(!dog.check(start + Duration::from_millis(800)));

        // And it can trip again on the next stall.
        assert!(dog.check(start + Duration::from_millis(1300)));
    }

    #[test]
    fn command_flow_keeps_it_quiet() {
        let start = Instant::now();
        let mut dog = CommandWatchdog::starting_at(TIMEOUT, start);
        let tick = Duration::from_millis(33);
        for i in 1..100u32 {
            let now = start + tick * i;
            dog.notify_command_received(now);
            assert!(!dog.check(now));
        }
    }

    #[test]
    fn trips_on_the_tick_where_the_gap_first_exceeds_timeout() {
        // 30 fps loop, 33 ms period, 500 ms timeout: with the last command
        // at t=0, tick 16 (t=528 ms) is the first to exceed the window.
        let start = Instant::now();
        let mut dog = CommandWatchdog::starting_at(TIMEOUT, start);
        dog.notify_command_received(start);

        let tick = Duration::from_millis(33);
        let mut tripped_at = None;
        for i in 1..=20u32 {
            if dog.check(start + tick * i) {
                assert!(tripped_at.is_none(), "second trip at tick {i}");
                tripped_at = Some(i);
            }
        }
        assert_eq!(tripped_at, Some(16));
    }
}
