//! Tunable thresholds for the connectivity, delivery and streaming layers.
//!
//! Every field has a default and every section is `#[serde(default)]`, so a
//! configuration file only needs to name the values it overrides.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{ConfigError, ConfigResult};

/// Period for a repeating timer. Zero is raised to one millisecond.
const fn tick_period(ms: u64) -> Duration {
    Duration::from_millis(if ms == 0 { 1 } else { ms })
}

// ─────────────────────────────────────────────────────────────────────────────
// BackoffBand
// ─────────────────────────────────────────────────────────────────────────────

/// Base and cap handed to the connectivity backoff calculator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffBand {
    /// Base delay (milliseconds) multiplied by `2^streak`.
    pub base_ms: u64,
    /// Upper bound (milliseconds) after jitter.
    pub cap_ms: u64,
}

impl BackoffBand {
    /// Create a band.
    #[must_use]
    pub const fn new(base_ms: u64, cap_ms: u64) -> Self {
        Self { base_ms, cap_ms }
    }

    fn validate(&self, name: &str, errors: &mut Vec<String>) {
        if self.base_ms == 0 {
            errors.push(format!("{name}.base_ms must be > 0"));
        }
        if self.cap_ms < self.base_ms {
            errors.push(format!("{name}.cap_ms must be >= {name}.base_ms"));
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ConnectivityConfig
// ─────────────────────────────────────────────────────────────────────────────

/// Thresholds for the connectivity state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
    /// Time without any success after which a failure forces `Offline`.
    ///
    /// Default: 25000ms.
    pub offline_after_ms: u64,

    /// Failures further apart than this decay the streak by one before counting.
    ///
    /// Default: 8000ms.
    pub decay_window_ms: u64,

    /// Failure streak at which the backend is considered unreachable.
    ///
    /// Default: 6.
    pub failure_ceiling: u32,

    /// Hard upper bound for the stored failure streak.
    ///
    /// Default: 50.
    pub max_fail_streak: u32,

    /// Largest exponent used by the backoff calculator (`base * 2^exp`).
    ///
    /// Default: 8.
    pub backoff_max_exponent: u32,

    /// Lower bound of the multiplicative jitter band.
    ///
    /// Default: 0.6.
    pub jitter_min: f64,

    /// Upper bound of the multiplicative jitter band.
    ///
    /// Default: 1.4.
    pub jitter_max: f64,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            offline_after_ms: 25_000,
            decay_window_ms: 8_000,
            failure_ceiling: 6,
            max_fail_streak: 50,
            backoff_max_exponent: 8,
            jitter_min: 0.6,
            jitter_max: 1.4,
        }
    }
}

impl ConnectivityConfig {
    /// Create a config with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: set the offline threshold.
    #[must_use]
    pub const fn with_offline_after_ms(mut self, ms: u64) -> Self {
        self.offline_after_ms = ms;
        self
    }

    /// Builder: set the streak decay window.
    #[must_use]
    pub const fn with_decay_window_ms(mut self, ms: u64) -> Self {
        self.decay_window_ms = ms;
        self
    }

    /// Builder: set the failure ceiling.
    #[must_use]
    pub const fn with_failure_ceiling(mut self, ceiling: u32) -> Self {
        self.failure_ceiling = ceiling;
        self
    }

    /// Offline threshold as a Duration.
    #[must_use]
    pub const fn offline_after(&self) -> Duration {
        Duration::from_millis(self.offline_after_ms)
    }

    /// Decay window as a Duration.
    #[must_use]
    pub const fn decay_window(&self) -> Duration {
        Duration::from_millis(self.decay_window_ms)
    }

    fn validate(&self, errors: &mut Vec<String>) {
        if self.failure_ceiling == 0 {
            errors.push("connectivity.failure_ceiling must be > 0".to_string());
        }
        if self.max_fail_streak < self.failure_ceiling {
            errors.push("connectivity.max_fail_streak must be >= failure_ceiling".to_string());
        }
        if self.backoff_max_exponent > 30 {
            errors.push("connectivity.backoff_max_exponent must be <= 30".to_string());
        }
        if !(self.jitter_min > 0.0 && self.jitter_min <= self.jitter_max) {
            errors.push("connectivity.jitter_min must be > 0 and <= jitter_max".to_string());
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// QueueConfig
// ─────────────────────────────────────────────────────────────────────────────

/// Persistent event queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of retained events; the oldest are evicted first.
    ///
    /// Default: 120.
    pub capacity: usize,

    /// Storage key holding the persisted list.
    pub storage_key: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 120,
            storage_key: "sb_pending_events_v1".to_string(),
        }
    }
}

impl QueueConfig {
    /// Builder: set the capacity.
    #[must_use]
    pub const fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// DeliveryConfig
// ─────────────────────────────────────────────────────────────────────────────

/// Handshake, immediate-send and flush settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Minimum spacing between two handshakes.
    ///
    /// Default: 7000ms.
    pub handshake_interval_ms: u64,

    /// Events sent per flush round.
    ///
    /// Default: 8.
    pub batch_size: usize,

    /// Rounds per flush.
    ///
    /// Default: 8.
    pub max_rounds: usize,

    /// Absolute minimum length of any auth-pause window.
    ///
    /// Default: 800ms.
    pub min_pause_ms: u64,

    /// Minimum pause after an auth-invalid response.
    ///
    /// Default: 1600ms.
    pub auth_pause_floor_ms: u64,

    /// Minimum pause after an overloaded response. Never below `auth_pause_floor_ms`.
    ///
    /// Default: 2200ms.
    pub overload_pause_floor_ms: u64,

    /// Backoff band after an auth-invalid immediate send.
    pub track_auth_backoff: BackoffBand,

    /// Backoff band after an overloaded immediate send.
    pub track_overload_backoff: BackoffBand,

    /// Backoff band after an auth-invalid response during flush or handshake.
    pub flush_auth_backoff: BackoffBand,

    /// Backoff band after an overloaded response during flush or handshake.
    pub flush_overload_backoff: BackoffBand,

    /// Timeout for event submission.
    ///
    /// Default: 5200ms.
    pub send_timeout_ms: u64,

    /// Timeout for identity issuance and refresh.
    ///
    /// Default: 6500ms.
    pub identity_timeout_ms: u64,

    /// Cache lifetime for the identity refresh response.
    ///
    /// Default: 10000ms.
    pub refresh_cache_ttl_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            handshake_interval_ms: 7_000,
            batch_size: 8,
            max_rounds: 8,
            min_pause_ms: 800,
            auth_pause_floor_ms: 1_600,
            overload_pause_floor_ms: 2_200,
            track_auth_backoff: BackoffBand::new(1_500, 22_000),
            track_overload_backoff: BackoffBand::new(2_000, 30_000),
            flush_auth_backoff: BackoffBand::new(1_600, 22_000),
            flush_overload_backoff: BackoffBand::new(2_200, 30_000),
            send_timeout_ms: 5_200,
            identity_timeout_ms: 6_500,
            refresh_cache_ttl_ms: 10_000,
        }
    }
}

impl DeliveryConfig {
    /// Builder: set the handshake throttle interval.
    #[must_use]
    pub const fn with_handshake_interval_ms(mut self, ms: u64) -> Self {
        self.handshake_interval_ms = ms;
        self
    }

    /// Builder: set batch size and round count.
    #[must_use]
    pub const fn with_batches(mut self, batch_size: usize, max_rounds: usize) -> Self {
        self.batch_size = batch_size;
        self.max_rounds = max_rounds;
        self
    }

    /// Handshake throttle as a Duration.
    #[must_use]
    pub const fn handshake_interval(&self) -> Duration {
        Duration::from_millis(self.handshake_interval_ms)
    }

    /// Event submission timeout as a Duration.
    #[must_use]
    pub const fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    /// Identity call timeout as a Duration.
    #[must_use]
    pub const fn identity_timeout(&self) -> Duration {
        Duration::from_millis(self.identity_timeout_ms)
    }

    fn validate(&self, errors: &mut Vec<String>) {
        if self.batch_size == 0 {
            errors.push("delivery.batch_size must be > 0".to_string());
        }
        if self.max_rounds == 0 {
            errors.push("delivery.max_rounds must be > 0".to_string());
        }
        if self.overload_pause_floor_ms < self.auth_pause_floor_ms {
            errors.push(
                "delivery.overload_pause_floor_ms must be >= auth_pause_floor_ms".to_string(),
            );
        }
        self.track_auth_backoff
            .validate("delivery.track_auth_backoff", errors);
        self.track_overload_backoff
            .validate("delivery.track_overload_backoff", errors);
        self.flush_auth_backoff
            .validate("delivery.flush_auth_backoff", errors);
        self.flush_overload_backoff
            .validate("delivery.flush_overload_backoff", errors);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// StreamConfig
// ─────────────────────────────────────────────────────────────────────────────

/// Realtime subscription supervision settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Interval of the online-count polling fallback.
    ///
    /// Default: 12000ms.
    pub poll_interval_ms: u64,

    /// Timeout of one online-count poll.
    ///
    /// Default: 4500ms.
    pub poll_timeout_ms: u64,

    /// Watchdog tick interval.
    ///
    /// Default: 1500ms.
    pub watchdog_interval_ms: u64,

    /// Silence tolerated while the page is visible.
    ///
    /// Default: 70000ms.
    pub silence_foreground_ms: u64,

    /// Silence tolerated while the page is hidden (timers are throttled).
    ///
    /// Default: 140000ms.
    pub silence_background_ms: u64,

    /// Timeout for opening the subscription.
    ///
    /// Default: 8000ms.
    pub open_timeout_ms: u64,

    /// Backoff band for reconnect scheduling.
    pub reconnect_backoff: BackoffBand,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 12_000,
            poll_timeout_ms: 4_500,
            watchdog_interval_ms: 1_500,
            silence_foreground_ms: 70_000,
            silence_background_ms: 140_000,
            open_timeout_ms: 8_000,
            reconnect_backoff: BackoffBand::new(350, 30_000),
        }
    }
}

impl StreamConfig {
    /// Builder: set foreground and background silence thresholds.
    #[must_use]
    pub const fn with_silence_ms(mut self, foreground_ms: u64, background_ms: u64) -> Self {
        self.silence_foreground_ms = foreground_ms;
        self.silence_background_ms = background_ms;
        self
    }

    /// Poll interval as a Duration, never zero.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        tick_period(self.poll_interval_ms)
    }

    /// Poll timeout as a Duration.
    #[must_use]
    pub const fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    /// Watchdog interval as a Duration, never zero.
    #[must_use]
    pub const fn watchdog_interval(&self) -> Duration {
        tick_period(self.watchdog_interval_ms)
    }

    /// Open timeout as a Duration.
    #[must_use]
    pub const fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    /// Silence threshold for the given page visibility.
    #[must_use]
    pub const fn silence_threshold(&self, page_visible: bool) -> Duration {
        if page_visible {
            Duration::from_millis(self.silence_foreground_ms)
        } else {
            Duration::from_millis(self.silence_background_ms)
        }
    }

    fn validate(&self, errors: &mut Vec<String>) {
        if self.watchdog_interval_ms == 0 {
            errors.push("stream.watchdog_interval_ms must be > 0".to_string());
        }
        if self.poll_interval_ms == 0 {
            errors.push("stream.poll_interval_ms must be > 0".to_string());
        }
        if self.silence_background_ms < self.silence_foreground_ms {
            errors.push(
                "stream.silence_background_ms must be >= silence_foreground_ms".to_string(),
            );
        }
        if self.silence_foreground_ms <= self.watchdog_interval_ms {
            errors.push("stream.silence_foreground_ms must be > watchdog_interval_ms".to_string());
        }
        self.reconnect_backoff
            .validate("stream.reconnect_backoff", errors);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// RefreshConfig
// ─────────────────────────────────────────────────────────────────────────────

/// Periodic profile/insights/total pulls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    /// Profile refresh interval. Default: 30000ms.
    pub profile_interval_ms: u64,
    /// Insights refresh interval. Default: 25000ms.
    pub insights_interval_ms: u64,
    /// Total refresh interval. Default: 20000ms.
    pub total_interval_ms: u64,
    /// Timeout for one pull. Default: 6500ms.
    pub timeout_ms: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            profile_interval_ms: 30_000,
            insights_interval_ms: 25_000,
            total_interval_ms: 20_000,
            timeout_ms: 6_500,
        }
    }
}

impl RefreshConfig {
    /// Profile refresh interval, never zero.
    #[must_use]
    pub const fn profile_interval(&self) -> Duration {
        tick_period(self.profile_interval_ms)
    }

    /// Insights refresh interval, never zero.
    #[must_use]
    pub const fn insights_interval(&self) -> Duration {
        tick_period(self.insights_interval_ms)
    }

    /// Total refresh interval, never zero.
    #[must_use]
    pub const fn total_interval(&self) -> Duration {
        tick_period(self.total_interval_ms)
    }

    /// Pull timeout as a Duration.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    fn validate(&self, errors: &mut Vec<String>) {
        if self.profile_interval_ms == 0
            || self.insights_interval_ms == 0
            || self.total_interval_ms == 0
        {
            errors.push("refresh intervals must be > 0".to_string());
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// PulseConfig
// ─────────────────────────────────────────────────────────────────────────────

/// Top-level configuration for a pulse client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PulseConfig {
    /// Backend base URL (no trailing slash required).
    pub api_base: String,
    /// Connectivity state machine thresholds.
    pub connectivity: ConnectivityConfig,
    /// Event queue settings.
    pub queue: QueueConfig,
    /// Delivery coordinator settings.
    pub delivery: DeliveryConfig,
    /// Stream supervisor settings.
    pub stream: StreamConfig,
    /// Heavy refresh settings.
    pub refresh: RefreshConfig,
}

impl Default for PulseConfig {
    fn default() -> Self {
        Self {
            api_base: "http://localhost:8080".to_string(),
            connectivity: ConnectivityConfig::default(),
            queue: QueueConfig::default(),
            delivery: DeliveryConfig::default(),
            stream: StreamConfig::default(),
            refresh: RefreshConfig::default(),
        }
    }
}

impl PulseConfig {
    /// Create a config with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: set the backend base URL.
    #[must_use]
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    /// Parse and validate a JSON document.
    ///
    /// # Errors
    /// Returns `ConfigError::Json` on malformed input and `ConfigError::Invalid`
    /// when validation fails.
    pub fn from_json_str(raw: &str) -> ConfigResult<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate().map_err(ConfigError::Invalid)?;
        Ok(config)
    }

    /// Parse and validate a TOML document.
    ///
    /// # Errors
    /// Returns `ConfigError::Toml` on malformed input and `ConfigError::Invalid`
    /// when validation fails.
    pub fn from_toml_str(raw: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate().map_err(ConfigError::Invalid)?;
        Ok(config)
    }

    /// Validate configuration, returning errors for invalid values.
    ///
    /// # Errors
    ///
    /// Returns error strings for any invalid configuration values.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.api_base.trim().is_empty() {
            errors.push("api_base must not be empty".to_string());
        }
        if self.queue.capacity == 0 {
            errors.push("queue.capacity must be > 0".to_string());
        }
        self.connectivity.validate(&mut errors);
        self.delivery.validate(&mut errors);
        self.stream.validate(&mut errors);
        self.refresh.validate(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(PulseConfig::default().validate().is_ok());
    }

    #[test]
    fn overload_floor_not_below_auth_floor() {
        let config = DeliveryConfig::default();
        assert!(config.overload_pause_floor_ms >= config.auth_pause_floor_ms);
        assert!(config.overload_pause_floor_ms >= 2_000);
    }

    #[test]
    fn silence_threshold_doubles_in_background() {
        let config = StreamConfig::default();
        assert_eq!(config.silence_threshold(true), Duration::from_secs(70));
        assert_eq!(config.silence_threshold(false), Duration::from_secs(140));
    }

    #[test]
    fn zero_periods_become_one_millisecond() {
        let mut stream = StreamConfig::default();
        stream.poll_interval_ms = 0;
        stream.watchdog_interval_ms = 0;
        assert_eq!(stream.poll_interval(), Duration::from_millis(1));
        assert_eq!(stream.watchdog_interval(), Duration::from_millis(1));

        let refresh = RefreshConfig {
            profile_interval_ms: 0,
            ..RefreshConfig::default()
        };
        assert_eq!(refresh.profile_interval(), Duration::from_millis(1));
        assert_eq!(refresh.insights_interval(), Duration::from_secs(25));
    }

    #[test]
    fn validate_collects_every_error() {
        let mut config = PulseConfig::default();
        config.queue.capacity = 0;
        config.delivery.batch_size = 0;
        config.stream.silence_background_ms = 1_000;

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3, "{errors:?}");
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = PulseConfig::from_json_str(
            r#"{"api_base": "https://api.example.com", "queue": {"capacity": 10}}"#,
        )
        .expect("valid config");
        assert_eq!(config.api_base, "https://api.example.com");
        assert_eq!(config.queue.capacity, 10);
        assert_eq!(config.queue.storage_key, "sb_pending_events_v1");
        assert_eq!(config.delivery.batch_size, 8);
    }

    #[test]
    fn toml_overrides_nested_sections() {
        let raw = r#"
            api_base = "https://api.example.com"

            [connectivity]
            failure_ceiling = 4

            [stream.reconnect_backoff]
            base_ms = 500
            cap_ms = 10000
        "#;
        let config = PulseConfig::from_toml_str(raw).expect("valid toml");
        assert_eq!(config.connectivity.failure_ceiling, 4);
        assert_eq!(config.stream.reconnect_backoff, BackoffBand::new(500, 10_000));
    }

    #[test]
    fn invalid_toml_is_rejected_after_parse() {
        let raw = r#"
            [delivery]
            overload_pause_floor_ms = 100
        "#;
        let err = PulseConfig::from_toml_str(raw).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
