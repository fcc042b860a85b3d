//! Per-node liveness tracking.
//!
//! A node is expected to pulse every `beat_interval`; a pulse may arrive
//! up to `beat_interval * multiplier` after the previous one before the
//! window counts as missed. One missed window moves the node to Suspect,
//! a second consecutive miss to Dead. Dead is terminal: the node is
//! assumed unreachable and is never drained or contacted again.

use std::time::{Duration, Instant};

pub const DEFAULT_BEAT_MULTIPLIER: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Registered, no pulse expected until the grace period ends
    Pending,
    Alive,
    /// One missed window; a late pulse recovers to Alive
    Suspect,
    Dead,
}

impl std::fmt::Display for Liveness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Liveness::Pending => write!(f, "pending"),
            Liveness::Alive => write!(f, "alive"),
            Liveness::Suspect => write!(f, "suspect"),
            Liveness::Dead => write!(f, "dead"),
        }
    }
}

/// Liveness state machine for a single node.
///
/// Pure and clock-agnostic: callers feed in `Instant`s, which keeps the
/// transitions deterministic under test. The fleet's watchdog tasks call
/// `check` on a periodic timer and report transitions upward.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    beat_interval: Duration,
    multiplier: u32,
    state: Liveness,
    /// When the current window expires
    deadline: Instant,
}

impl HeartbeatMonitor {
    /// `first_beat` is the time-to-first-pulse grace period starting at
    /// registration (`now`).
    pub fn new(beat_interval: Duration, first_beat: Duration, now: Instant) -> Self {
        Self {
            beat_interval,
            multiplier: DEFAULT_BEAT_MULTIPLIER,
            state: Liveness::Pending,
            deadline: now + first_beat,
        }
    }

    pub fn with_multiplier(mut self, multiplier: u32) -> Self {
        self.multiplier = multiplier.max(1);
        self
    }

    pub fn state(&self) -> Liveness {
        self.state
    }

    fn window(&self) -> Duration {
        self.beat_interval * self.multiplier
    }

    /// Force the terminal state, for nodes written off outside the
    /// pulse/check cycle (command-time transport failure).
    pub fn kill(&mut self) {
        self.state = Liveness::Dead;
    }

    /// Record a pulse. Recovers Suspect to Alive; ignored once Dead.
    pub fn pulse(&mut self, now: Instant) {
        if self.state == Liveness::Dead {
            return;
        }
        self.state = Liveness::Alive;
        self.deadline = now + self.window();
    }

    /// Advance the state machine to `now`, returning the transition that
    /// occurred, if any.
    pub fn check(&mut self, now: Instant) -> Option<Liveness> {
        match self.state {
            Liveness::Dead => None,
            Liveness::Pending | Liveness::Alive => {
                if now >= self.deadline {
                    self.state = Liveness::Suspect;
                    self.deadline = now + self.window();
                    Some(Liveness::Suspect)
                } else {
                    None
                }
            }
            Liveness::Suspect => {
                if now >= self.deadline {
                    self.state = Liveness::Dead;
                    Some(Liveness::Dead)
                } else {
                    None
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BEAT: Duration = Duration::from_millis(100);
    const GRACE: Duration = Duration::from_millis(250);

    fn monitor(now: Instant) -> HeartbeatMonitor {
        HeartbeatMonitor::new(BEAT, GRACE, now)
    }

    #[test]
    fn starts_pending() {
        let now = Instant::now();
        let m = monitor(now);
        assert_eq!(m.state(), Liveness::Pending);
    }

    #[test]
    fn first_pulse_within_grace_goes_alive() {
        let now = Instant::now();
        let mut m = monitor(now);
        m.pulse(now + Duration::from_millis(50));
        assert_eq!(m.state(), Liveness::Alive);
    }

    #[test]
    fn missed_grace_period_goes_suspect() {
        let now = Instant::now();
        let mut m = monitor(now);
        assert_eq!(m.check(now + Duration::from_millis(100)), None);
        assert_eq!(m.check(now + GRACE), Some(Liveness::Suspect));
    }

    #[test]
    fn two_missed_windows_go_dead() {
        let now = Instant::now();
        let mut m = monitor(now);
        m.pulse(now);
        // window is beat_interval * 2 = 200ms
        assert_eq!(m.check(now + Duration::from_millis(199)), None);
        assert_eq!(
            m.check(now + Duration::from_millis(200)),
            Some(Liveness::Suspect)
        );
        assert_eq!(m.check(now + Duration::from_millis(399)), None);
        assert_eq!(
            m.check(now + Duration::from_millis(400)),
            Some(Liveness::Dead)
        );
    }

    #[test]
    fn late_pulse_during_suspect_recovers() {
        let now = Instant::now();
        let mut m = monitor(now);
        m.pulse(now);
        assert_eq!(
            m.check(now + Duration::from_millis(200)),
            Some(Liveness::Suspect)
        );
        m.pulse(now + Duration::from_millis(250));
        assert_eq!(m.state(), Liveness::Alive);
        // the recovered window runs from the late pulse
        assert_eq!(m.check(now + Duration::from_millis(449)), None);
        assert_eq!(
            m.check(now + Duration::from_millis(450)),
            Some(Liveness::Suspect)
        );
    }

    #[test]
    fn dead_is_terminal() {
        let now = Instant::now();
        let mut m = monitor(now);
        m.pulse(now);
        m.check(now + Duration::from_millis(200));
        m.check(now + Duration::from_millis(400));
        assert_eq!(m.state(), Liveness::Dead);

        m.pulse(now + Duration::from_millis(500));
        assert_eq!(m.state(), Liveness::Dead);
        assert_eq!(m.check(now + Duration::from_secs(10)), None);
    }

    #[test]
    fn steady_pulsing_stays_alive() {
        let now = Instant::now();
        let mut m = monitor(now);
        for i in 0..20 {
            let t = now + BEAT * i;
            m.pulse(t);
            assert_eq!(m.check(t + Duration::from_millis(50)), None);
            assert_eq!(m.state(), Liveness::Alive);
        }
    }

    #[test]
    fn kill_is_immediate_and_terminal() {
        let now = Instant::now();
        let mut m = monitor(now);
        m.pulse(now);
        m.kill();
        assert_eq!(m.state(), Liveness::Dead);
        m.pulse(now + Duration::from_millis(10));
        assert_eq!(m.state(), Liveness::Dead);
        assert_eq!(m.check(now + Duration::from_secs(10)), None);
    }

    #[test]
    fn multiplier_widens_window() {
        let now = Instant::now();
        let mut m = HeartbeatMonitor::new(BEAT, GRACE, now).with_multiplier(5);
        m.pulse(now);
        assert_eq!(m.check(now + Duration::from_millis(499)), None);
        assert_eq!(
            m.check(now + Duration::from_millis(500)),
            Some(Liveness::Suspect)
        );
    }
}
