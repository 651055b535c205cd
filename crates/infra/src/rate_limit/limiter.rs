//! Per-model rate limiter with fallback chains.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};

use super::window::{RateWindow, WindowMode, WindowSpec};

/// Budget for one upstream model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelLimit {
    pub windows: Vec<WindowSpec>,
    /// Model to try when every window here is saturated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
}

impl ModelLimit {
    pub fn new(windows: Vec<WindowSpec>) -> Self {
        Self {
            windows,
            fallback: None,
        }
    }

    pub fn sliding(limit: u32, window: Duration) -> Self {
        Self::new(vec![WindowSpec::sliding(limit, window)])
    }

    pub fn with_window(mut self, window: WindowSpec) -> Self {
        self.windows.push(window);
        self
    }

    pub fn with_fallback(mut self, model: impl Into<String>) -> Self {
        self.fallback = Some(model.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    #[error("no rate limit configured for model {0}")]
    UnknownModel(String),
    #[error("invalid rate limit configuration: {0}")]
    InvalidConfig(String),
    #[error("rate limit for {model} needs a {wait:?} wait, over the allowed maximum")]
    WaitExceeded { model: String, wait: Duration },
    #[error("rate limit wait cancelled by shutdown")]
    Cancelled,
}

/// Answer to a non-blocking acquire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquisition {
    /// A call slot was taken from `model` (the requested one or a fallback).
    Granted { model: String },
    /// Every model in the chain is saturated; the earliest one frees up after `wait`.
    Denied { wait: Duration },
}

impl Acquisition {
    pub fn granted(&self) -> bool {
        matches!(self, Acquisition::Granted { .. })
    }

    pub fn wait_hint(&self) -> Duration {
        match self {
            Acquisition::Granted { .. } => Duration::ZERO,
            Acquisition::Denied { wait } => *wait,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WindowUsage {
    pub window_secs: u64,
    pub limit: u32,
    pub mode: WindowMode,
    pub used: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelUsage {
    pub model: String,
    pub fallback: Option<String>,
    pub windows: Vec<WindowUsage>,
}

#[derive(Debug)]
struct ModelState {
    limit: ModelLimit,
    windows: Mutex<Vec<RateWindow>>,
}

impl ModelState {
    fn new(limit: ModelLimit, origin: Instant) -> Self {
        let windows = limit
            .windows
            .iter()
            .map(|spec| RateWindow::new(*spec, origin))
            .collect();
        Self {
            limit,
            windows: Mutex::new(windows),
        }
    }

    /// Check every window and record in all of them, or in none.
    fn try_take(&self, now: Instant) -> Option<Duration> {
        let mut windows = self.windows.lock().expect("rate window lock poisoned");
        let wait = windows.iter_mut().filter_map(|w| w.wait_at(now)).max();
        if wait.is_none() {
            for window in windows.iter_mut() {
                window.record(now);
            }
        }
        wait
    }
}

type Table = HashMap<String, Arc<ModelState>>;

/// Shared, thread-safe rate limiter.
///
/// Cheap to share behind an `Arc`; concurrent callers for the same model
/// serialize on that model's lock only.
#[derive(Debug)]
pub struct RateLimiter {
    table: RwLock<Arc<Table>>,
}

impl RateLimiter {
    pub fn new(limits: BTreeMap<String, ModelLimit>) -> Result<Self, RateLimitError> {
        validate_limits(&limits)?;
        Ok(Self {
            table: RwLock::new(Arc::new(build_table(limits))),
        })
    }

    fn table(&self) -> Arc<Table> {
        self.table.read().expect("rate table lock poisoned").clone()
    }

    pub fn knows(&self, model: &str) -> bool {
        self.table().contains_key(model)
    }

    /// Replace the configuration. All consumption history is dropped.
    pub fn reconfigure(&self, limits: BTreeMap<String, ModelLimit>) -> Result<(), RateLimitError> {
        validate_limits(&limits)?;
        let models = limits.len();
        *self.table.write().expect("rate table lock poisoned") = Arc::new(build_table(limits));
        info!(models, "rate limits reconfigured");
        Ok(())
    }

    pub fn try_acquire(&self, model: &str) -> Result<Acquisition, RateLimitError> {
        self.try_acquire_at(model, Instant::now())
    }

    /// Take one slot from `model` or, failing that, from its fallback chain.
    pub fn try_acquire_at(&self, model: &str, now: Instant) -> Result<Acquisition, RateLimitError> {
        let table = self.table();
        let mut current = model;
        let mut visited = HashSet::new();
        let mut shortest: Option<Duration> = None;

        loop {
            let state = table
                .get(current)
                .ok_or_else(|| RateLimitError::UnknownModel(current.to_string()))?;

            match state.try_take(now) {
                None => {
                    if current != model {
                        info!(requested = model, model = current, "rate limit fallback");
                    }
                    return Ok(Acquisition::Granted {
                        model: current.to_string(),
                    });
                }
                Some(wait) => {
                    shortest = Some(shortest.map_or(wait, |s| s.min(wait)));
                }
            }

            visited.insert(current);
            match state.limit.fallback.as_deref() {
                Some(next) if !visited.contains(next) => current = next,
                _ => break,
            }
        }

        Ok(Acquisition::Denied {
            wait: shortest.unwrap_or_default(),
        })
    }

    /// Wait until a slot is granted for `model` or its fallbacks.
    ///
    /// Gives up with [`RateLimitError::WaitExceeded`] as soon as the total
    /// wait would pass `max_wait`, and with [`RateLimitError::Cancelled`] once
    /// `shutdown` flips to `true`. Returns the model actually granted.
    pub async fn acquire(
        &self,
        model: &str,
        max_wait: Option<Duration>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<String, RateLimitError> {
        let started = Instant::now();
        loop {
            if *shutdown.borrow() {
                return Err(RateLimitError::Cancelled);
            }

            let wait = match self.try_acquire(model)? {
                Acquisition::Granted { model } => return Ok(model),
                Acquisition::Denied { wait } => wait,
            };

            if let Some(max_wait) = max_wait
                && started.elapsed() + wait > max_wait
            {
                return Err(RateLimitError::WaitExceeded {
                    model: model.to_string(),
                    wait,
                });
            }

            debug!(model, ?wait, "rate limited; waiting");
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        tokio::time::sleep(wait).await;
                    }
                }
            }
        }
    }

    /// Current usage of every window, sorted by model.
    pub fn snapshot(&self) -> Vec<ModelUsage> {
        let now = Instant::now();
        let table = self.table();
        let mut usage: Vec<ModelUsage> = table
            .iter()
            .map(|(model, state)| {
                let mut windows = state.windows.lock().expect("rate window lock poisoned");
                ModelUsage {
                    model: model.clone(),
                    fallback: state.limit.fallback.clone(),
                    windows: windows
                        .iter_mut()
                        .map(|w| WindowUsage {
                            window_secs: w.spec().window_secs,
                            limit: w.spec().limit,
                            mode: w.spec().mode,
                            used: w.used(now),
                        })
                        .collect(),
                }
            })
            .collect();
        usage.sort_by(|a, b| a.model.cmp(&b.model));
        usage
    }
}

fn build_table(limits: BTreeMap<String, ModelLimit>) -> Table {
    let origin = Instant::now();
    limits
        .into_iter()
        .map(|(model, limit)| (model, Arc::new(ModelState::new(limit, origin))))
        .collect()
}

/// Reject empty or zero windows, unknown fallback targets, and fallback cycles.
pub fn validate_limits(limits: &BTreeMap<String, ModelLimit>) -> Result<(), RateLimitError> {
    for (model, limit) in limits {
        if limit.windows.is_empty() {
            return Err(RateLimitError::InvalidConfig(format!(
                "model {model} has no windows"
            )));
        }
        if let Some(w) = limit.windows.iter().find(|w| w.limit == 0 || w.window_secs == 0) {
            return Err(RateLimitError::InvalidConfig(format!(
                "model {model} has an empty window ({} per {}s)",
                w.limit, w.window_secs
            )));
        }
        if let Some(fallback) = &limit.fallback
            && !limits.contains_key(fallback)
        {
            return Err(RateLimitError::InvalidConfig(format!(
                "model {model} falls back to unknown model {fallback}"
            )));
        }
    }

    for start in limits.keys() {
        let mut seen = HashSet::from([start.as_str()]);
        let mut current = start.as_str();
        while let Some(next) = limits.get(current).and_then(|l| l.fallback.as_deref()) {
            if !seen.insert(next) {
                return Err(RateLimitError::InvalidConfig(format!(
                    "fallback chain from {start} loops back to {next}"
                )));
            }
            current = next;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SEC: Duration = Duration::from_secs(1);
    const NS: Duration = Duration::from_nanos(1);

    fn limiter(entries: &[(&str, ModelLimit)]) -> RateLimiter {
        RateLimiter::new(
            entries
                .iter()
                .map(|(m, l)| (m.to_string(), l.clone()))
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn tightest_window_binds() {
        let limit = ModelLimit::sliding(5, 60 * SEC).with_window(WindowSpec::sliding(2, 10 * SEC));
        let limiter = limiter(&[("m", limit)]);
        let t0 = Instant::now();

        assert!(limiter.try_acquire_at("m", t0).unwrap().granted());
        assert!(limiter.try_acquire_at("m", t0 + SEC).unwrap().granted());
        assert_eq!(
            limiter.try_acquire_at("m", t0 + 2 * SEC).unwrap(),
            Acquisition::Denied { wait: 8 * SEC + NS }
        );
        // The grant at t0 is exactly one window old here and still counts.
        assert!(!limiter.try_acquire_at("m", t0 + 10 * SEC).unwrap().granted());

        for s in [11, 12, 22] {
            assert!(limiter.try_acquire_at("m", t0 + s * SEC).unwrap().granted());
        }
        // 5 per minute is now the binding window.
        assert_eq!(
            limiter.try_acquire_at("m", t0 + 30 * SEC).unwrap().wait_hint(),
            30 * SEC + NS
        );
    }

    #[test]
    fn denied_call_records_nothing() {
        let limit = ModelLimit::sliding(10, 60 * SEC).with_window(WindowSpec::sliding(1, 10 * SEC));
        let limiter = limiter(&[("m", limit)]);
        let t0 = Instant::now();

        assert!(limiter.try_acquire_at("m", t0).unwrap().granted());
        for s in 1..10 {
            assert!(!limiter.try_acquire_at("m", t0 + s * SEC).unwrap().granted());
        }
        let usage = limiter.snapshot();
        assert_eq!(usage[0].windows[0].used, 1);
    }

    #[test]
    fn falls_back_when_primary_is_exhausted() {
        let limiter = limiter(&[
            ("primary", ModelLimit::sliding(1, 60 * SEC).with_fallback("secondary")),
            ("secondary", ModelLimit::sliding(1, 30 * SEC)),
        ]);
        let t0 = Instant::now();

        assert_eq!(
            limiter.try_acquire_at("primary", t0).unwrap(),
            Acquisition::Granted { model: "primary".into() }
        );
        assert_eq!(
            limiter.try_acquire_at("primary", t0).unwrap(),
            Acquisition::Granted { model: "secondary".into() }
        );
        // Both saturated: the hint is the sooner of the two.
        assert_eq!(
            limiter.try_acquire_at("primary", t0).unwrap(),
            Acquisition::Denied { wait: 30 * SEC + NS }
        );
    }

    #[test]
    fn unknown_model_is_an_error() {
        let limiter = limiter(&[("m", ModelLimit::sliding(1, SEC))]);
        assert_eq!(
            limiter.try_acquire("other"),
            Err(RateLimitError::UnknownModel("other".into()))
        );
    }

    #[test]
    fn validation_rejects_bad_configs() {
        let zero = BTreeMap::from([("m".to_string(), ModelLimit::sliding(0, SEC))]);
        assert!(matches!(validate_limits(&zero), Err(RateLimitError::InvalidConfig(_))));

        let dangling =
            BTreeMap::from([("m".to_string(), ModelLimit::sliding(1, SEC).with_fallback("x"))]);
        assert!(matches!(validate_limits(&dangling), Err(RateLimitError::InvalidConfig(_))));

        let cycle = BTreeMap::from([
            ("a".to_string(), ModelLimit::sliding(1, SEC).with_fallback("b")),
            ("b".to_string(), ModelLimit::sliding(1, SEC).with_fallback("a")),
        ]);
        assert!(matches!(validate_limits(&cycle), Err(RateLimitError::InvalidConfig(_))));
    }

    #[test]
    fn reconfigure_clears_history() {
        let limiter = limiter(&[("m", ModelLimit::sliding(1, 3600 * SEC))]);
        assert!(limiter.try_acquire("m").unwrap().granted());
        assert!(!limiter.try_acquire("m").unwrap().granted());

        limiter
            .reconfigure(BTreeMap::from([("m".to_string(), ModelLimit::sliding(1, 3600 * SEC))]))
            .unwrap();
        assert!(limiter.try_acquire("m").unwrap().granted());
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_for_the_window() {
        let limiter = limiter(&[("m", ModelLimit::sliding(1, 10 * SEC))]);
        let (_tx, mut rx) = watch::channel(false);
        let t0 = Instant::now();

        limiter.acquire("m", None, &mut rx).await.unwrap();
        limiter.acquire("m", None, &mut rx).await.unwrap();

        // The timer wheel rounds the wake-up to the next millisecond.
        let elapsed = t0.elapsed();
        assert!(elapsed > 10 * SEC && elapsed < 10 * SEC + Duration::from_millis(5), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_respects_max_wait() {
        let limiter = limiter(&[("m", ModelLimit::sliding(1, 3600 * SEC))]);
        let (_tx, mut rx) = watch::channel(false);
        limiter.acquire("m", None, &mut rx).await.unwrap();

        let err = limiter.acquire("m", Some(60 * SEC), &mut rx).await.unwrap_err();
        assert_eq!(
            err,
            RateLimitError::WaitExceeded {
                model: "m".into(),
                wait: 3600 * SEC + NS
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_a_pending_wait() {
        let limiter = Arc::new(limiter(&[("m", ModelLimit::sliding(1, 3600 * SEC))]));
        let (tx, mut rx) = watch::channel(false);
        limiter.acquire("m", None, &mut rx).await.unwrap();

        let waiter = {
            let limiter = limiter.clone();
            let mut rx = rx.clone();
            tokio::spawn(async move { limiter.acquire("m", None, &mut rx).await })
        };
        tokio::time::sleep(SEC).await;
        tx.send(true).unwrap();

        assert_eq!(waiter.await.unwrap(), Err(RateLimitError::Cancelled));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_never_overshoot() {
        let limiter = Arc::new(limiter(&[("m", ModelLimit::sliding(25, 3600 * SEC))]));
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let limiter = limiter.clone();
            tasks.push(tokio::spawn(async move {
                let mut granted = 0;
                for _ in 0..10 {
                    if limiter.try_acquire("m").unwrap().granted() {
                        granted += 1;
                    }
                    tokio::task::yield_now().await;
                }
                granted
            }));
        }

        let mut total = 0;
        for task in tasks {
            total += task.await.unwrap();
        }
        assert_eq!(total, 25);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn grants_never_exceed_limit_in_any_window(
            limit in 1u32..6,
            window_secs in 1u64..30,
            gaps in proptest::collection::vec(0u64..4000, 1..120),
        ) {
            let limiter = RateLimiter::new(BTreeMap::from([(
                "m".to_string(),
                ModelLimit::sliding(limit, Duration::from_secs(window_secs)),
            )])).unwrap();
            let t0 = Instant::now();
            let window = Duration::from_secs(window_secs);

            let mut at = Duration::ZERO;
            let mut grants: Vec<Duration> = Vec::new();
            for gap in gaps {
                at += Duration::from_millis(gap);
                if limiter.try_acquire_at("m", t0 + at).unwrap().granted() {
                    grants.push(at);
                }
            }

            for (i, &end) in grants.iter().enumerate() {
                let in_window = grants[..=i]
                    .iter()
                    .filter(|&&g| end - g <= window)
                    .count();
                prop_assert!(in_window <= limit as usize);
            }
        }
    }
}
