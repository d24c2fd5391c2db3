use crate::registry::HealthState;

/// Per-node health state machine with hysteresis.
///
/// A node moves one step down (`Healthy` → `Degraded` → `Unreachable`) only
/// after `failure_threshold` consecutive failed probes, and one step up only
/// after `recovery_threshold` consecutive successes. Any opposite outcome
/// resets the streak, so a flapping node does not oscillate.
#[derive(Debug, Clone)]
pub struct NodeHealthTracker {
    state: HealthState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    failure_threshold: u32,
    recovery_threshold: u32,
}

impl NodeHealthTracker {
    pub fn new(initial: HealthState, failure_threshold: u32, recovery_threshold: u32) -> Self {
        Self {
            state: initial,
            consecutive_failures: 0,
            consecutive_successes: 0,
            failure_threshold: failure_threshold.max(1),
            recovery_threshold: recovery_threshold.max(1),
        }
    }

    pub fn state(&self) -> HealthState {
        self.state
    }

    /// Feed one probe outcome. Returns the new state if it changed.
    pub fn record(&mut self, success: bool) -> Option<HealthState> {
        if success {
            self.consecutive_failures = 0;
            if self.state == HealthState::Healthy {
                return None;
            }
            self.consecutive_successes += 1;
            if self.consecutive_successes >= self.recovery_threshold {
                self.consecutive_successes = 0;
                self.state = self.state.promoted();
                return Some(self.state);
            }
        } else {
            self.consecutive_successes = 0;
            if self.state == HealthState::Unreachable {
                return None;
            }
            self.consecutive_failures += 1;
            if self.consecutive_failures >= self.failure_threshold {
                self.consecutive_failures = 0;
                self.state = self.state.demoted();
                return Some(self.state);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_steps_down_after_threshold() {
        let mut t = NodeHealthTracker::new(HealthState::Healthy, 3, 2);
        assert_eq!(t.record(false), None);
        assert_eq!(t.record(false), None);
        assert_eq!(t.record(false), Some(HealthState::Degraded));
        assert_eq!(t.record(false), None);
        assert_eq!(t.record(false), None);
        assert_eq!(t.record(false), Some(HealthState::Unreachable));
        assert_eq!(t.record(false), None);
        assert_eq!(t.state(), HealthState::Unreachable);
    }

    #[test]
    fn test_recovers_one_step_at_a_time() {
        let mut t = NodeHealthTracker::new(HealthState::Unreachable, 3, 2);
        assert_eq!(t.record(true), None);
        assert_eq!(t.record(true), Some(HealthState::Degraded));
        assert_eq!(t.record(true), None);
        assert_eq!(t.record(true), Some(HealthState::Healthy));
        assert_eq!(t.record(true), None);
    }

    #[test]
    fn test_flapping_node_does_not_oscillate() {
        let mut t = NodeHealthTracker::new(HealthState::Healthy, 2, 2);
        for _ in 0..10 {
            assert_eq!(t.record(false), None);
            assert_eq!(t.record(true), None);
        }
        assert_eq!(t.state(), HealthState::Healthy);
    }

    #[test]
    fn test_zero_thresholds_behave_as_one() {
        let mut t = NodeHealthTracker::new(HealthState::Healthy, 0, 0);
        assert_eq!(t.record(false), Some(HealthState::Degraded));
        assert_eq!(t.record(true), Some(HealthState::Healthy));
    }
}
