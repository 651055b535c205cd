//! A single rate window.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Smallest step past the edge of a sliding window.
const TICK: Duration = Duration::from_nanos(1);

/// How a window forgets old events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowMode {
    /// Counts events in the closed interval `[now - window, now]`.
    #[default]
    Sliding,
    /// Counts events since the start of the current fixed bucket. Buckets are
    /// aligned to when the limiter was configured, not to calendar time.
    Fixed,
}

/// `limit` events per `window_secs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSpec {
    pub window_secs: u64,
    pub limit: u32,
    #[serde(default)]
    pub mode: WindowMode,
}

impl WindowSpec {
    pub fn sliding(limit: u32, window: Duration) -> Self {
        Self {
            window_secs: window.as_secs(),
            limit,
            mode: WindowMode::Sliding,
        }
    }

    pub fn fixed(limit: u32, window: Duration) -> Self {
        Self {
            mode: WindowMode::Fixed,
            ..Self::sliding(limit, window)
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Consumption history for one window.
///
/// Holds at most `limit` timestamps: callers check [`RateWindow::wait_at`]
/// before [`RateWindow::record`].
#[derive(Debug, Clone)]
pub struct RateWindow {
    spec: WindowSpec,
    origin: Instant,
    events: VecDeque<Instant>,
}

impl RateWindow {
    pub fn new(spec: WindowSpec, origin: Instant) -> Self {
        Self {
            spec,
            origin,
            events: VecDeque::with_capacity(spec.limit as usize),
        }
    }

    pub fn spec(&self) -> &WindowSpec {
        &self.spec
    }

    fn bucket_start(&self, now: Instant) -> Instant {
        let window = self.spec.duration().as_nanos().max(1);
        let elapsed = now.saturating_duration_since(self.origin).as_nanos();
        let buckets = elapsed / window;
        let offset = u64::try_from(buckets * window).unwrap_or(u64::MAX);
        self.origin + Duration::from_nanos(offset)
    }

    fn evict(&mut self, now: Instant) {
        match self.spec.mode {
            WindowMode::Sliding => {
                let window = self.spec.duration();
                while self
                    .events
                    .front()
                    .is_some_and(|&at| now.saturating_duration_since(at) > window)
                {
                    self.events.pop_front();
                }
            }
            WindowMode::Fixed => {
                let start = self.bucket_start(now);
                while self.events.front().is_some_and(|&at| at < start) {
                    self.events.pop_front();
                }
            }
        }
    }

    /// Events currently counted against the window.
    pub fn used(&mut self, now: Instant) -> usize {
        self.evict(now);
        self.events.len()
    }

    /// `None` if one more event fits at `now`; otherwise how long until it does.
    pub fn wait_at(&mut self, now: Instant) -> Option<Duration> {
        self.evict(now);
        let limit = self.spec.limit as usize;
        if self.events.len() < limit {
            return None;
        }

        let frees_at = match self.spec.mode {
            WindowMode::Sliding => {
                // Enough events have to age out to leave one free slot. An
                // event exactly `window` old still counts.
                let pivot = self.events.len() - limit;
                self.events[pivot] + self.spec.duration() + TICK
            }
            WindowMode::Fixed => self.bucket_start(now) + self.spec.duration(),
        };
        Some(frees_at.saturating_duration_since(now))
    }

    pub fn record(&mut self, now: Instant) {
        self.events.push_back(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: Duration = Duration::from_secs(1);

    #[test]
    fn sliding_window_frees_oldest_event_first() {
        let t0 = Instant::now();
        let mut window = RateWindow::new(WindowSpec::sliding(2, 10 * SEC), t0);

        assert_eq!(window.wait_at(t0), None);
        window.record(t0);
        assert_eq!(window.wait_at(t0 + 3 * SEC), None);
        window.record(t0 + 3 * SEC);

        assert_eq!(window.wait_at(t0 + 4 * SEC), Some(6 * SEC + TICK));
        assert_eq!(window.wait_at(t0 + 10 * SEC + TICK), None);
        assert_eq!(window.used(t0 + 10 * SEC + TICK), 1);
        assert_eq!(window.used(t0 + 13 * SEC), 1);
        assert_eq!(window.used(t0 + 13 * SEC + TICK), 0);
    }

    #[test]
    fn event_exactly_one_window_old_still_counts() {
        let t0 = Instant::now();
        let mut window = RateWindow::new(WindowSpec::sliding(1, 10 * SEC), t0);
        window.record(t0);

        assert_eq!(window.wait_at(t0 + 10 * SEC), Some(TICK));
        assert_eq!(window.used(t0 + 10 * SEC), 1);
        assert_eq!(window.wait_at(t0 + 10 * SEC + TICK), None);
    }

    #[test]
    fn sliding_window_has_no_boundary_burst() {
        let t0 = Instant::now();
        let mut window = RateWindow::new(WindowSpec::sliding(3, 60 * SEC), t0);
        for s in [57, 58, 59] {
            let at = t0 + s * SEC;
            assert!(window.wait_at(at).is_none());
            window.record(at);
        }
        // A fixed window aligned at t0 would reset at 60s; a sliding one does not.
        assert_eq!(window.wait_at(t0 + 61 * SEC), Some(56 * SEC + TICK));
    }

    #[test]
    fn fixed_window_resets_at_bucket_boundary() {
        let t0 = Instant::now();
        let mut window = RateWindow::new(WindowSpec::fixed(2, 10 * SEC), t0);
        window.record(t0 + 8 * SEC);
        window.record(t0 + 9 * SEC);

        assert_eq!(window.wait_at(t0 + 9 * SEC), Some(SEC));
        assert_eq!(window.wait_at(t0 + 10 * SEC), None);
        assert_eq!(window.used(t0 + 10 * SEC), 0);
    }

    #[test]
    fn spec_deserializes_with_default_mode() {
        let spec: WindowSpec = toml::from_str("window_secs = 10800\nlimit = 150").unwrap();
        assert_eq!(spec, WindowSpec::sliding(150, Duration::from_secs(10800)));
    }
}
