//! Per-client minimum interval between messages that may trigger an automatic answer.

use std::time::{Duration, Instant};

use dashmap::DashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FloodMode {
    Automatic,
    Manual,
}

impl FloodMode {
    pub fn for_manual_mode(manual_mode: bool) -> Self {
        if manual_mode {
            FloodMode::Manual
        } else {
            FloodMode::Automatic
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloodVerdict {
    Allowed,
    Limited { retry_after: Duration },
}

impl FloodVerdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, FloodVerdict::Allowed)
    }
}

/// The window is measured between consecutive messages: every message, allowed or not,
/// restarts it.
#[derive(Debug)]
pub struct FloodControl {
    automatic: Duration,
    manual: Duration,
    last_seen: DashMap<(String, FloodMode), Instant>,
}

impl FloodControl {
    pub fn new(automatic: Duration, manual: Duration) -> Self {
        Self {
            automatic,
            manual,
            last_seen: DashMap::new(),
        }
    }

    pub fn interval(&self, mode: FloodMode) -> Duration {
        match mode {
            FloodMode::Automatic => self.automatic,
            FloodMode::Manual => self.manual,
        }
    }

    pub fn check(&self, client_id: &str, mode: FloodMode) -> FloodVerdict {
        self.check_at(client_id, mode, Instant::now())
    }

    pub fn check_at(&self, client_id: &str, mode: FloodMode, now: Instant) -> FloodVerdict {
        let interval = self.interval(mode);
        if interval.is_zero() {
            return FloodVerdict::Allowed;
        }
        let previous = self.last_seen.insert((client_id.to_string(), mode), now);
        match previous {
            Some(previous) => {
                let elapsed = now.saturating_duration_since(previous);
                if elapsed < interval {
                    FloodVerdict::Limited {
                        retry_after: interval - elapsed,
                    }
                } else {
                    FloodVerdict::Allowed
                }
            }
            None => FloodVerdict::Allowed,
        }
    }

    /// Forgets windows that can no longer limit anything.
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        let before = self.last_seen.len();
        self.last_seen.retain(|(_, mode), seen| {
            now.saturating_duration_since(*seen) < self.interval(*mode)
        });
        before - self.last_seen.len()
    }

    pub fn len(&self) -> usize {
        self.last_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn control() -> FloodControl {
        FloodControl::new(Duration::from_millis(3000), Duration::from_millis(1000))
    }

    #[test]
    fn second_message_inside_window_is_limited() {
        let flood = control();
        let t0 = Instant::now();
        assert!(flood.check_at("c1", FloodMode::Automatic, t0).is_allowed());
        let verdict = flood.check_at("c1", FloodMode::Automatic, t0 + Duration::from_millis(500));
        assert_eq!(
            verdict,
            FloodVerdict::Limited {
                retry_after: Duration::from_millis(2500)
            }
        );
    }

    #[test]
    fn every_message_restarts_the_window() {
        let flood = control();
        let t0 = Instant::now();
        flood.check_at("c1", FloodMode::Automatic, t0);
        flood.check_at("c1", FloodMode::Automatic, t0 + Duration::from_millis(2000));
        // 3.5s after the first message but only 1.5s after the second.
        assert!(!flood
            .check_at("c1", FloodMode::Automatic, t0 + Duration::from_millis(3500))
            .is_allowed());
        assert!(flood
            .check_at("c1", FloodMode::Automatic, t0 + Duration::from_millis(7000))
            .is_allowed());
    }

    #[test]
    fn manual_mode_has_its_own_shorter_window() {
        let flood = control();
        let t0 = Instant::now();
        flood.check_at("c1", FloodMode::Manual, t0);
        assert!(flood
            .check_at("c1", FloodMode::Manual, t0 + Duration::from_millis(1200))
            .is_allowed());
        // Separate clients never interfere.
        assert!(flood
            .check_at("c2", FloodMode::Manual, t0 + Duration::from_millis(1201))
            .is_allowed());
        // Nor do the two modes of one client.
        assert!(flood
            .check_at("c1", FloodMode::Automatic, t0 + Duration::from_millis(1202))
            .is_allowed());
    }

    #[test]
    fn zero_interval_disables_limiting() {
        let flood = FloodControl::new(Duration::ZERO, Duration::ZERO);
        let t0 = Instant::now();
        assert!(flood.check_at("c1", FloodMode::Automatic, t0).is_allowed());
        assert!(flood.check_at("c1", FloodMode::Automatic, t0).is_allowed());
        assert!(flood.is_empty());
    }
}
