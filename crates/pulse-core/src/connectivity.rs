//! Backend health classification.
//!
//! [`ConnectivityMonitor`] is the single source of truth for "is it wise to talk
//! to the backend right now". It never retries anything itself: callers report
//! outcomes, the monitor classifies them into a [`ConnectivityState`] and
//! computes jittered backoff durations on request.
//!
//! State rules:
//! - `report_ok` always moves to `Online` and clears the failure streak
//! - `report_fail` moves to `Offline` when nothing has succeeded for
//!   `offline_after_ms` or the streak reaches `failure_ceiling`, else `Degraded`
//! - `report_network_lost` forces `Offline` without touching the streak

use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::ConnectivityConfig;

/// Backend health as seen by this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectivityState {
    /// Last interaction succeeded.
    #[default]
    Online,
    /// Recent failures; reduce request frequency.
    Degraded,
    /// Backend considered unreachable; skip optional work.
    Offline,
}

impl ConnectivityState {
    /// Wire/log name of the state.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "ONLINE",
            Self::Degraded => "DEGRADED",
            Self::Offline => "OFFLINE",
        }
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of the monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectivitySnapshot {
    /// Current state.
    pub state: ConnectivityState,
    /// Current (decayed) failure streak.
    pub fail_streak: u32,
    /// Cause passed to the most recent `report_fail`.
    pub last_cause: Option<String>,
}

#[derive(Debug)]
struct MonitorState {
    fail_streak: u32,
    last_ok_at: Instant,
    last_fail_at: Option<Instant>,
    last_cause: Option<String>,
}

/// Three-state connectivity machine plus backoff calculator.
///
/// Shared by reference (`Arc<ConnectivityMonitor>`) between the delivery
/// coordinator, the stream supervisor and any UI observer.
pub struct ConnectivityMonitor {
    config: ConnectivityConfig,
    inner: Mutex<MonitorState>,
    state_tx: watch::Sender<ConnectivityState>,
}

impl fmt::Debug for ConnectivityMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectivityMonitor")
            .field("state", &self.state())
            .field("fail_streak", &self.fail_streak())
            .finish_non_exhaustive()
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(ConnectivityConfig::default())
    }
}

impl ConnectivityMonitor {
    /// Create a monitor in the `Online` state; the success clock starts now.
    #[must_use]
    pub fn new(config: ConnectivityConfig) -> Self {
        Self::new_at(config, Instant::now())
    }

    /// Create a monitor whose success clock starts at `now`.
    #[must_use]
    pub fn new_at(config: ConnectivityConfig, now: Instant) -> Self {
        let (state_tx, _) = watch::channel(ConnectivityState::Online);
        Self {
            config,
            inner: Mutex::new(MonitorState {
                fail_streak: 0,
                last_ok_at: now,
                last_fail_at: None,
                last_cause: None,
            }),
            state_tx,
        }
    }

    /// Thresholds in use.
    #[must_use]
    pub const fn config(&self) -> &ConnectivityConfig {
        &self.config
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectivityState {
        *self.state_tx.borrow()
    }

    /// Current failure streak.
    #[must_use]
    pub fn fail_streak(&self) -> u32 {
        self.inner.lock().fail_streak
    }

    /// Current state, streak and last failure cause.
    #[must_use]
    pub fn snapshot(&self) -> ConnectivitySnapshot {
        let inner = self.inner.lock();
        ConnectivitySnapshot {
            state: self.state(),
            fail_streak: inner.fail_streak,
            last_cause: inner.last_cause.clone(),
        }
    }

    /// Subscribe to state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.state_tx.subscribe()
    }

    /// Record a success.
    pub fn report_ok(&self) {
        self.report_ok_at(Instant::now());
    }

    /// Record a success observed at `now`.
    pub fn report_ok_at(&self, now: Instant) {
        {
            let mut inner = self.inner.lock();
            inner.last_ok_at = now;
            inner.fail_streak = 0;
        }
        self.transition(ConnectivityState::Online, "ok");
    }

    /// Record a failure with a short cause label (`"timeout"`, `"status:503"`, ...).
    pub fn report_fail(&self, cause: &str) {
        self.report_fail_at(cause, Instant::now());
    }

    /// Record a failure observed at `now`.
    pub fn report_fail_at(&self, cause: &str, now: Instant) {
        let next = {
            let mut inner = self.inner.lock();
            if let Some(prev) = inner.last_fail_at {
                if now.saturating_duration_since(prev) > self.config.decay_window() {
                    inner.fail_streak = inner.fail_streak.saturating_sub(1);
                }
            }
            inner.fail_streak = inner
                .fail_streak
                .saturating_add(1)
                .min(self.config.max_fail_streak);
            inner.last_fail_at = Some(now);
            inner.last_cause = Some(cause.to_string());

            let since_ok = now.saturating_duration_since(inner.last_ok_at);
            if since_ok >= self.config.offline_after()
                || inner.fail_streak >= self.config.failure_ceiling
            {
                ConnectivityState::Offline
            } else {
                ConnectivityState::Degraded
            }
        };
        self.transition(next, cause);
    }

    /// The host reports no network at all: go `Offline` immediately.
    pub fn report_network_lost(&self) {
        self.inner.lock().last_cause = Some("network_lost".to_string());
        self.transition(ConnectivityState::Offline, "network_lost");
    }

    /// True iff the backend is considered unreachable.
    #[must_use]
    pub fn should_pause_heavy_work(&self) -> bool {
        self.state() == ConnectivityState::Offline
    }

    /// True iff the backend is degraded.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.state() == ConnectivityState::Degraded
    }

    /// Jittered exponential backoff in milliseconds for the current streak.
    ///
    /// Always in `1..=cap`. Must be called fresh each time the caller waits.
    #[must_use]
    pub fn next_backoff_ms(&self, base_ms: u64, cap_ms: u64) -> u64 {
        let (lo, hi) = (self.config.jitter_min, self.config.jitter_max);
        let jitter = if lo < hi {
            rand::rng().random_range(lo..=hi)
        } else {
            lo
        };
        self.backoff_with_jitter_ms(base_ms, cap_ms, jitter)
    }

    /// [`Self::next_backoff_ms`] as a Duration.
    #[must_use]
    pub fn next_backoff(&self, base_ms: u64, cap_ms: u64) -> Duration {
        Duration::from_millis(self.next_backoff_ms(base_ms, cap_ms))
    }

    /// Backoff for the current streak with an explicit jitter multiplier.
    #[must_use]
    pub fn backoff_with_jitter_ms(&self, base_ms: u64, cap_ms: u64, jitter: f64) -> u64 {
        let streak = self.fail_streak();
        compute_backoff_ms(
            base_ms,
            cap_ms,
            streak.min(self.config.backoff_max_exponent),
            jitter,
        )
    }

    fn transition(&self, next: ConnectivityState, cause: &str) {
        let prev = self.state();
        let changed = self.state_tx.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed {
            let fail_streak = self.fail_streak();
            match next {
                ConnectivityState::Online => {
                    tracing::info!(from = %prev, to = %next, "connectivity restored");
                }
                ConnectivityState::Degraded => {
                    tracing::warn!(from = %prev, to = %next, fail_streak, cause, "connectivity degraded");
                }
                ConnectivityState::Offline => {
                    tracing::warn!(from = %prev, to = %next, fail_streak, cause, "backend unreachable");
                }
            }
        }
    }
}

/// `min(cap, base * 2^exp) * jitter`, rounded and clamped to `1..=cap`.
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn compute_backoff_ms(base_ms: u64, cap_ms: u64, exp: u32, jitter: f64) -> u64 {
    let cap_ms = cap_ms.max(1);
    let raw = base_ms.saturating_mul(1u64 << exp.min(30)).min(cap_ms);
    let jittered = (raw as f64 * jitter.max(0.0)).round() as u64;
    jittered.clamp(1, cap_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn starts_online() {
        let monitor = ConnectivityMonitor::default();
        assert_eq!(monitor.state(), ConnectivityState::Online);
        assert!(!monitor.should_pause_heavy_work());
        assert!(!monitor.is_degraded());
    }

    #[test]
    fn single_failure_degrades() {
        let t0 = Instant::now();
        let monitor = ConnectivityMonitor::new_at(ConnectivityConfig::default(), t0);
        monitor.report_fail_at("timeout", t0 + secs(1));
        assert_eq!(monitor.state(), ConnectivityState::Degraded);
        assert!(monitor.is_degraded());
        assert_eq!(monitor.snapshot().last_cause.as_deref(), Some("timeout"));
    }

    #[test]
    fn ok_always_returns_online() {
        let t0 = Instant::now();
        let monitor = ConnectivityMonitor::new_at(ConnectivityConfig::default(), t0);
        for i in 1..=7 {
            monitor.report_fail_at("timeout", t0 + secs(i));
        }
        assert_eq!(monitor.state(), ConnectivityState::Offline);
        monitor.report_ok_at(t0 + secs(8));
        assert_eq!(monitor.state(), ConnectivityState::Online);
        assert_eq!(monitor.fail_streak(), 0);
    }

    #[test]
    fn streak_ceiling_forces_offline() {
        let t0 = Instant::now();
        let monitor = ConnectivityMonitor::new_at(ConnectivityConfig::default(), t0);
        let mut states = Vec::new();
        for i in 1..=6 {
            monitor.report_fail_at("status:0", t0 + secs(i));
            states.push(monitor.state());
        }
        assert_eq!(
            states,
            vec![
                ConnectivityState::Degraded,
                ConnectivityState::Degraded,
                ConnectivityState::Degraded,
                ConnectivityState::Degraded,
                ConnectivityState::Degraded,
                ConnectivityState::Offline,
            ]
        );
    }

    #[test]
    fn long_time_without_success_forces_offline() {
        let t0 = Instant::now();
        let monitor = ConnectivityMonitor::new_at(ConnectivityConfig::default(), t0);
        monitor.report_fail_at("timeout", t0 + secs(24));
        assert_eq!(monitor.state(), ConnectivityState::Degraded);
        monitor.report_fail_at("timeout", t0 + secs(25));
        assert_eq!(monitor.state(), ConnectivityState::Offline);
        assert_eq!(monitor.fail_streak(), 2);
    }

    #[test]
    fn fail_never_moves_toward_online() {
        let t0 = Instant::now();
        let monitor = ConnectivityMonitor::new_at(ConnectivityConfig::default(), t0);
        for i in 1..=6 {
            monitor.report_fail_at("timeout", t0 + secs(i));
        }
        assert_eq!(monitor.state(), ConnectivityState::Offline);
        // Well-spaced failure decays the streak but must not leave Offline.
        monitor.report_fail_at("timeout", t0 + secs(60));
        assert_eq!(monitor.state(), ConnectivityState::Offline);
    }

    #[test]
    fn streak_decays_after_quiet_window() {
        let t0 = Instant::now();
        let monitor = ConnectivityMonitor::new_at(ConnectivityConfig::default(), t0);
        monitor.report_fail_at("timeout", t0 + secs(2));
        monitor.report_fail_at("timeout", t0 + secs(4));
        monitor.report_fail_at("timeout", t0 + secs(6));
        assert_eq!(monitor.fail_streak(), 3);

        // 10s after the third failure: decay to 2, then count to 3.
        monitor.report_fail_at("timeout", t0 + secs(16));
        assert_eq!(monitor.fail_streak(), 3);
        assert_eq!(monitor.state(), ConnectivityState::Degraded);
    }

    #[test]
    fn streak_is_capped() {
        let t0 = Instant::now();
        let monitor = ConnectivityMonitor::new_at(ConnectivityConfig::default(), t0);
        for i in 0..80 {
            monitor.report_fail_at("timeout", t0 + Duration::from_millis(i * 10));
        }
        assert_eq!(monitor.fail_streak(), 50);
    }

    #[test]
    fn network_lost_bypasses_streak() {
        let monitor = ConnectivityMonitor::default();
        monitor.report_network_lost();
        assert_eq!(monitor.state(), ConnectivityState::Offline);
        assert_eq!(monitor.fail_streak(), 0);
        assert!(monitor.should_pause_heavy_work());
    }

    #[test]
    fn subscribers_see_transitions() {
        let t0 = Instant::now();
        let monitor = ConnectivityMonitor::new_at(ConnectivityConfig::default(), t0);
        let mut rx = monitor.subscribe();
        monitor.report_fail_at("timeout", t0 + secs(1));
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), ConnectivityState::Degraded);

        // Same state again is not a change.
        monitor.report_fail_at("timeout", t0 + secs(2));
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn backoff_grows_with_streak_and_respects_cap() {
        let t0 = Instant::now();
        let monitor = ConnectivityMonitor::new_at(ConnectivityConfig::default(), t0);
        let mut previous = monitor.backoff_with_jitter_ms(250, 30_000, 1.0);
        assert_eq!(previous, 250);
        for i in 1..=12 {
            monitor.report_fail_at("timeout", t0 + Duration::from_millis(i * 100));
            let expected = monitor.backoff_with_jitter_ms(250, 30_000, 1.0);
            assert!(expected >= previous, "streak {i}: {expected} < {previous}");
            assert!(expected <= 30_000);
            previous = expected;
        }
        assert_eq!(previous, 30_000);
    }

    #[test]
    fn backoff_exponent_is_bounded() {
        let t0 = Instant::now();
        let monitor = ConnectivityMonitor::new_at(ConnectivityConfig::default(), t0);
        for i in 1..=20 {
            monitor.report_fail_at("timeout", t0 + Duration::from_millis(i * 100));
        }
        // 10 * 2^8 regardless of a larger streak.
        assert_eq!(monitor.backoff_with_jitter_ms(10, 1_000_000, 1.0), 2_560);
    }

    #[test]
    fn jittered_backoff_stays_in_band() {
        let monitor = ConnectivityMonitor::default();
        for _ in 0..200 {
            let ms = monitor.next_backoff_ms(1_000, 30_000);
            assert!((600..=1_400).contains(&ms), "{ms}");
        }
    }

    #[test]
    fn backoff_is_strictly_positive_and_capped() {
        assert_eq!(compute_backoff_ms(0, 100, 3, 1.0), 1);
        assert_eq!(compute_backoff_ms(1, 0, 3, 1.4), 1);
        assert_eq!(compute_backoff_ms(100, 120, 0, 1.4), 120);
        assert_eq!(compute_backoff_ms(u64::MAX, 5_000, 8, 0.6), 3_000);
    }

    #[test]
    fn state_display() {
        assert_eq!(ConnectivityState::Online.to_string(), "ONLINE");
        assert_eq!(ConnectivityState::Degraded.to_string(), "DEGRADED");
        assert_eq!(ConnectivityState::Offline.to_string(), "OFFLINE");
    }
}
