//! Periodic pulls of the heavier read endpoints.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pulse_core::{ConnectivityMonitor, DeliveryOutcome, IdentityToken, RefreshConfig};
use pulse_store::IdentityStore;
use pulse_transport::{ApiClient, HttpResponse};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::Observers;
use crate::push::count_field;

/// One periodically refreshed resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pull {
    /// Visitor profile (visit tracking).
    Profile,
    /// Aggregated insights.
    Insights,
    /// Total visits.
    Total,
}

impl Pull {
    /// Every pull, in start order.
    pub const ALL: [Self; 3] = [Self::Profile, Self::Insights, Self::Total];

    /// Lower-case name for logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Profile => "profile",
            Self::Insights => "insights",
            Self::Total => "total",
        }
    }

    const fn interval(self, config: &RefreshConfig) -> Duration {
        match self {
            Self::Profile => config.profile_interval(),
            Self::Insights => config.insights_interval(),
            Self::Total => config.total_interval(),
        }
    }
}

struct Shared {
    monitor: Arc<ConnectivityMonitor>,
    identities: IdentityStore,
    api: Arc<ApiClient>,
    config: RefreshConfig,
    observers: Arc<Observers>,
}

impl Shared {
    async fn pull(&self, pull: Pull, subject: &str) {
        let token = self.identities.signed(subject);
        let credential = token.as_ref().map(IdentityToken::expose);
        let response = match (pull, credential) {
            (Pull::Total, credential) => self.api.fetch_total(subject, credential).await,
            (Pull::Profile, Some(credential)) => self.api.fetch_profile(subject, credential).await,
            (Pull::Insights, Some(credential)) => {
                self.api.fetch_insights(subject, credential).await
            }
            (_, None) => {
                debug!(pull = pull.as_str(), "pull skipped without signed identity");
                return;
            }
        };
        self.absorb(pull, subject, &response);
    }

    fn absorb(&self, pull: Pull, subject: &str, response: &HttpResponse) {
        match response.outcome() {
            DeliveryOutcome::Success => {
                self.monitor.report_ok();
                self.identities
                    .adopt_if_signed(subject, response.visitor_id.as_deref());
            }
            DeliveryOutcome::Transport | DeliveryOutcome::Overloaded => {
                self.monitor.report_fail(pull.as_str());
                return;
            }
            other => {
                debug!(pull = pull.as_str(), outcome = %other, "pull rejected");
                return;
            }
        }

        let Some(body) = response.body.as_json() else {
            return;
        };
        match pull {
            Pull::Profile if body.is_object() => self.observers.set_profile(body.clone()),
            Pull::Insights if body.is_object() => self.observers.set_insights(body.clone()),
            Pull::Total => {
                if let Some(total) = count_field(body, "total") {
                    self.observers.set_total(total);
                }
            }
            _ => debug!(pull = pull.as_str(), "unexpected pull payload"),
        }
    }
}

/// Whether a tick should be skipped given connectivity.
///
/// OFFLINE skips every tick, DEGRADED every other one.
#[must_use]
pub fn should_skip_tick(monitor: &ConnectivityMonitor, tick: u64) -> bool {
    monitor.should_pause_heavy_work() || (monitor.is_degraded() && tick % 2 == 0)
}

async fn pull_loop(shared: Arc<Shared>, pull: Pull, subject: String) {
    let mut ticker = tokio::time::interval(pull.interval(&shared.config));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut tick: u64 = 0;
    loop {
        ticker.tick().await;
        tick = tick.wrapping_add(1);
        if should_skip_tick(&shared.monitor, tick) {
            debug!(pull = pull.as_str(), state = %shared.monitor.state(), "pull skipped");
            continue;
        }
        shared.pull(pull, &subject).await;
    }
}

/// Pulls profile, insights and total on their own intervals and publishes
/// them into the shared [`Observers`].
pub struct HeavyRefresher {
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for HeavyRefresher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeavyRefresher")
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl HeavyRefresher {
    /// Create a stopped refresher.
    #[must_use]
    pub fn new(
        monitor: Arc<ConnectivityMonitor>,
        identities: IdentityStore,
        api: Arc<ApiClient>,
        config: RefreshConfig,
        observers: Arc<Observers>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                monitor,
                identities,
                api,
                config,
                observers,
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Whether the pull loops are running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.tasks.lock().is_empty()
    }

    /// Start every pull loop. The first pull of each runs immediately.
    pub fn start(&self, subject: &str) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        for pull in Pull::ALL {
            tasks.push(tokio::spawn(pull_loop(
                Arc::clone(&self.shared),
                pull,
                subject.to_string(),
            )));
        }
        info!(subject, "heavy refresher started");
    }

    /// Abort every pull loop.
    pub fn stop(&self) {
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        if tasks.is_empty() {
            return;
        }
        for task in tasks {
            task.abort();
        }
        info!("heavy refresher stopped");
    }

    /// Run one pull now, outside the schedule.
    pub async fn pull_now(&self, pull: Pull, subject: &str) {
        self.shared.pull(pull, subject).await;
    }
}

impl Drop for HeavyRefresher {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_core::PulseConfig;
    use pulse_testkit::{Fixture, SUBJECT};
    use serde_json::json;

    fn refresher(fx: &Fixture) -> HeavyRefresher {
        HeavyRefresher::new(
            Arc::clone(&fx.monitor),
            fx.identities.clone(),
            Arc::clone(&fx.api),
            fx.config.refresh.clone(),
            Arc::new(Observers::new()),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn skip_rule_follows_connectivity() {
        let fx = Fixture::new();
        assert!(!should_skip_tick(&fx.monitor, 1));
        assert!(!should_skip_tick(&fx.monitor, 2));

        fx.monitor.report_fail("x");
        assert!(!should_skip_tick(&fx.monitor, 1));
        assert!(should_skip_tick(&fx.monitor, 2));

        fx.monitor.report_network_lost();
        assert!(should_skip_tick(&fx.monitor, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn pulls_publish_payloads() {
        let fx = Fixture::new();
        fx.with_signed_identity().healthy_backend();
        let refresher = refresher(&fx);

        for pull in Pull::ALL {
            refresher.pull_now(pull, SUBJECT).await;
        }

        let observers = &refresher.shared.observers;
        assert_eq!(observers.profile(), Some(json!({"visits": 3})));
        assert_eq!(observers.insights(), Some(json!({"streak": 2})));
        assert_eq!(observers.total(), Some(120));
    }

    #[tokio::test(start_paused = true)]
    async fn identity_pulls_need_a_signed_token() {
        let fx = Fixture::new();
        fx.healthy_backend();
        let refresher = refresher(&fx);

        refresher.pull_now(Pull::Profile, SUBJECT).await;
        refresher.pull_now(Pull::Total, SUBJECT).await;

        assert!(fx.transport.requests_to("track").is_empty());
        assert_eq!(fx.transport.requests_to("total").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn overloaded_pull_reports_failure() {
        let fx = Fixture::new();
        fx.with_signed_identity();
        fx.transport.respond_status("insights/me", 503);
        let refresher = refresher(&fx);

        refresher.pull_now(Pull::Insights, SUBJECT).await;

        assert_eq!(fx.monitor.fail_streak(), 1);
        assert_eq!(refresher.shared.observers.insights(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn loops_stop_pulling_while_offline() {
        let fx = Fixture::new();
        fx.with_signed_identity().healthy_backend();
        let refresher = refresher(&fx);

        refresher.start(SUBJECT);
        refresher.start(SUBJECT);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(fx.transport.request_count(), 3);

        fx.monitor.report_network_lost();
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(fx.transport.request_count(), 3);

        refresher.stop();
        assert!(!refresher.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn restart_mid_pull_issues_fresh_pulls() {
        let fx = Fixture::new();
        fx.with_signed_identity().healthy_backend();
        fx.transport
            .respond_once("total", HttpResponse::json(200, json!({"total": 121})))
            .respond_once("total", HttpResponse::json(200, json!({"total": 122})));
        fx.transport.set_latency(Duration::from_secs(2));
        let refresher = refresher(&fx);

        refresher.start(SUBJECT);
        tokio::time::sleep(Duration::from_millis(500)).await;
        refresher.stop();
        refresher.start(SUBJECT);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(refresher.shared.observers.total(), Some(121));

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(refresher.shared.observers.total(), Some(122));
        assert_eq!(fx.transport.requests_to("total").len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_intervals_do_not_stop_the_loops() {
        let mut config = PulseConfig::default();
        config.refresh.total_interval_ms = 0;
        let fx = Fixture::with_config(config);
        fx.with_signed_identity().healthy_backend();
        let refresher = refresher(&fx);

        refresher.start(SUBJECT);
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert!(refresher.is_running());
        assert_eq!(refresher.shared.observers.total(), Some(120));
    }
}
