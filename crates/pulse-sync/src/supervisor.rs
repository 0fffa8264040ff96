//! Realtime subscription supervision.
//!
//! [`StreamSupervisor`] keeps one push subscription open per subject and
//! keeps the UI-facing [`Observers`] current:
//!
//! - open attempts go through the connectivity monitor and the identity store
//! - every inbound frame marks the stream alive
//! - a watchdog catches dead networks, missing connections and silent streams
//! - reconnects are scheduled with jittered backoff, one timer at a time
//! - an online-count poll keeps running next to the stream as a fallback and
//!   as the recovery check while OFFLINE
//!
//! Each open attempt gets a generation number; callbacks from a superseded
//! attempt are ignored.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pulse_core::{ConnectivityMonitor, DeliveryOutcome, IdentityToken, StreamConfig};
use pulse_store::IdentityStore;
use pulse_transport::{ApiClient, PushConnection, PushFrame};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, trace, warn};

use crate::push::count_field;
use crate::{HostSignals, InboundPush, Observers, StreamPhase};

/// Counters for one supervisor lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SupervisorStats {
    /// Open attempts started.
    pub open_attempts: u64,
    /// Reconnect timers armed.
    pub reconnects_scheduled: u64,
    /// Streams torn down by the silence check.
    pub silent_resets: u64,
    /// Frames received.
    pub frames_received: u64,
}

#[derive(Debug, Default)]
struct SupervisorState {
    subject: Option<String>,
    generation: u64,
    connecting: bool,
    last_seen_alive_at: Option<Instant>,
    connection: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
    poller: Option<JoinHandle<()>>,
    watchdog: Option<JoinHandle<()>>,
    stats: SupervisorStats,
}

impl SupervisorState {
    /// Drop the current connection and invalidate its callbacks.
    fn teardown(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        if let Some(connection) = self.connection.take() {
            connection.abort();
        }
        self.connecting = false;
        self.last_seen_alive_at = None;
    }
}

/// Aborts the stream reader when the connection task ends or is aborted.
struct ReaderGuard(JoinHandle<pulse_transport::TransportResult<()>>);

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct Shared {
    monitor: Arc<ConnectivityMonitor>,
    identities: IdentityStore,
    api: Arc<ApiClient>,
    config: StreamConfig,
    host: HostSignals,
    observers: Arc<Observers>,
    state: Mutex<SupervisorState>,
}

/// Keeps the push subscription alive and the observers current.
pub struct StreamSupervisor {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for StreamSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("StreamSupervisor")
            .field("subject", &state.subject)
            .field("generation", &state.generation)
            .field("connecting", &state.connecting)
            .field("stats", &state.stats)
            .finish_non_exhaustive()
    }
}

impl StreamSupervisor {
    /// Create a stopped supervisor.
    #[must_use]
    pub fn new(
        monitor: Arc<ConnectivityMonitor>,
        identities: IdentityStore,
        api: Arc<ApiClient>,
        config: StreamConfig,
        host: HostSignals,
        observers: Arc<Observers>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                monitor,
                identities,
                api,
                config,
                host,
                observers,
                state: Mutex::new(SupervisorState::default()),
            }),
        }
    }

    /// Observable state.
    #[must_use]
    pub fn observers(&self) -> &Arc<Observers> {
        &self.shared.observers
    }

    /// Whether `start` was called and `stop` was not.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.state.lock().subject.is_some()
    }

    /// Whether a reconnect timer is armed.
    #[must_use]
    pub fn is_reconnect_pending(&self) -> bool {
        self.shared.state.lock().reconnect.is_some()
    }

    /// Counters since construction.
    #[must_use]
    pub fn stats(&self) -> SupervisorStats {
        self.shared.state.lock().stats
    }

    /// Start polling, open the subscription and arm the watchdog.
    ///
    /// Calling it again while running does nothing.
    #[instrument(skip(self))]
    pub fn start(&self, subject: &str) {
        let shared = &self.shared;
        {
            let mut state = shared.state.lock();
            if state.subject.is_some() {
                debug!("stream supervisor already running");
                return;
            }
            state.subject = Some(subject.to_string());
            state.poller = Some(tokio::spawn(poll_loop(
                Arc::clone(shared),
                subject.to_string(),
            )));
            state.watchdog = Some(tokio::spawn(watchdog_loop(Arc::clone(shared))));
        }
        info!("stream supervisor started");
        shared.attempt_open();
    }

    /// Stop everything: polling, watchdog, reconnect timer and connection.
    pub fn stop(&self) {
        let mut state = self.shared.state.lock();
        let was_running = state.subject.take().is_some();
        state.teardown();
        for handle in [
            state.reconnect.take(),
            state.poller.take(),
            state.watchdog.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
        self.shared.observers.set_alive(false);
        self.shared.observers.set_phase(StreamPhase::Stopped);
        drop(state);

        if was_running {
            info!("stream supervisor stopped");
        }
    }
}

impl Drop for StreamSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn attempt_open(self: &Arc<Self>) {
        let mut state = self.state.lock();
        let Some(subject) = state.subject.clone() else {
            return;
        };

        if self.monitor.should_pause_heavy_work() {
            drop(state);
            self.observers.set_alive(false);
            debug!("backend offline, open deferred");
            self.schedule_reconnect();
            return;
        }

        let Some(token) = self.identities.signed(&subject) else {
            state.teardown();
            self.observers.set_alive(false);
            self.observers.set_phase(StreamPhase::Idle);
            debug!("waiting for a signed identity before opening stream");
            return;
        };

        state.teardown();
        state.connecting = true;
        state.stats.open_attempts += 1;
        let generation = state.generation;
        self.observers.set_phase(StreamPhase::Connecting);

        let shared = Arc::clone(self);
        state.connection = Some(tokio::spawn(async move {
            shared.run_connection(generation, subject, token).await;
        }));
        debug!(generation, "stream open attempt started");
    }

    async fn run_connection(self: Arc<Self>, generation: u64, subject: String, token: IdentityToken) {
        let opened = self
            .api
            .open_stream(&subject, token.expose(), self.config.open_timeout())
            .await;
        let connection = match opened {
            Ok(connection) => connection,
            Err(e) => {
                self.on_stream_error(generation, &subject, &e.to_string());
                return;
            }
        };

        if !self.mark_open(generation) {
            connection.close();
            return;
        }

        let PushConnection {
            mut frames,
            join_handle,
        } = connection;
        let mut reader = ReaderGuard(join_handle);

        while let Some(frame) = frames.recv().await {
            self.on_frame(generation, &subject, &frame);
        }

        let reason = match (&mut reader.0).await {
            Ok(Ok(())) => "stream ended by server".to_string(),
            Ok(Err(e)) => e.to_string(),
            Err(e) => e.to_string(),
        };
        self.on_stream_error(generation, &subject, &reason);
    }

    fn mark_open(&self, generation: u64) -> bool {
        {
            let mut state = self.state.lock();
            if state.generation != generation || state.subject.is_none() {
                return false;
            }
            state.connecting = false;
            state.last_seen_alive_at = Some(Instant::now());
            self.observers.set_alive(true);
            self.observers.set_phase(StreamPhase::Alive);
        }
        self.monitor.report_ok();
        info!(generation, "push stream open");
        true
    }

    fn on_frame(&self, generation: u64, subject: &str, frame: &PushFrame) {
        let inbound = InboundPush::parse(frame);
        {
            let mut state = self.state.lock();
            if state.generation != generation {
                return;
            }
            state.last_seen_alive_at = Some(Instant::now());
            state.stats.frames_received += 1;
            self.observers.set_alive(true);
            self.observers.set_phase(StreamPhase::Alive);
        }
        self.monitor.report_ok();

        if let Some(renewed) = inbound.renewed_identity.as_deref() {
            self.identities.adopt_if_signed(subject, Some(renewed));
        }
        trace!(message = ?inbound.message, "push frame");
        self.observers.apply(&inbound.message);
    }

    fn on_stream_error(self: &Arc<Self>, generation: u64, subject: &str, reason: &str) {
        {
            let mut state = self.state.lock();
            if state.generation != generation || state.subject.is_none() {
                return;
            }
            // Running inside the connection task: detach instead of aborting.
            state.connection = None;
            state.teardown();
            self.observers.set_alive(false);
            self.observers.set_phase(StreamPhase::Errored);
        }
        self.monitor.report_fail("stream_error");
        warn!(reason, "push stream failed");

        if self.identities.has_signed(subject) {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(self: &Arc<Self>) -> bool {
        let mut state = self.state.lock();
        if state.subject.is_none() || state.reconnect.is_some() {
            return false;
        }
        let band = self.config.reconnect_backoff;
        let delay = self.monitor.next_backoff(band.base_ms, band.cap_ms);
        state.stats.reconnects_scheduled += 1;

        let shared = Arc::clone(self);
        state.reconnect = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            shared.state.lock().reconnect = None;
            shared.attempt_open();
        }));
        debug!(
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "reconnect scheduled"
        );
        true
    }

    fn watchdog_tick(self: &Arc<Self>) {
        let now = Instant::now();

        if !self.host.network_online() {
            self.monitor.report_network_lost();
            let mut state = self.state.lock();
            if state.subject.is_none() {
                return;
            }
            if self.observers.alive() || state.connecting || state.connection.is_some() {
                state.teardown();
                self.observers.set_alive(false);
                self.observers.set_phase(StreamPhase::Errored);
                drop(state);
                warn!("host reports no network, stream dropped");
            }
            return;
        }

        let mut state = self.state.lock();
        let Some(subject) = state.subject.clone() else {
            return;
        };

        if self.observers.alive() {
            let threshold = self.config.silence_threshold(self.host.page_visible());
            let silent_for = state
                .last_seen_alive_at
                .map_or(Duration::ZERO, |seen| now.saturating_duration_since(seen));
            if silent_for > threshold {
                state.teardown();
                state.stats.silent_resets += 1;
                self.observers.set_alive(false);
                self.observers.set_phase(StreamPhase::Silent);
                drop(state);

                self.monitor.report_fail("stream_silent");
                warn!(
                    silent_ms = u64::try_from(silent_for.as_millis()).unwrap_or(u64::MAX),
                    threshold_ms = u64::try_from(threshold.as_millis()).unwrap_or(u64::MAX),
                    "push stream silent, resetting"
                );
                self.schedule_reconnect();
            }
            return;
        }

        if state.connecting || state.reconnect.is_some() {
            return;
        }
        drop(state);

        if self.monitor.should_pause_heavy_work() || !self.identities.has_signed(&subject) {
            return;
        }
        self.schedule_reconnect();
    }

    async fn poll_online(&self, subject: &str) {
        let token = self.identities.signed(subject);
        let response = self
            .api
            .fetch_online(subject, token.as_ref().map(IdentityToken::expose))
            .await;

        match response.outcome() {
            DeliveryOutcome::Success => {
                self.monitor.report_ok();
                self.identities
                    .adopt_if_signed(subject, response.visitor_id.as_deref());
                if let Some(count) = response
                    .body
                    .as_json()
                    .and_then(|body| count_field(body, "online"))
                {
                    self.observers.set_online_now(count);
                }
            }
            DeliveryOutcome::Transport | DeliveryOutcome::Overloaded => {
                self.monitor.report_fail("online_poll");
            }
            other => debug!(outcome = %other, "online poll rejected"),
        }
    }
}

async fn watchdog_loop(shared: Arc<Shared>) {
    let period = shared.config.watchdog_interval();
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        shared.watchdog_tick();
    }
}

/// Online-count poll. Not gated by OFFLINE: a success here is what brings
/// the monitor back online.
async fn poll_loop(shared: Arc<Shared>, subject: String) {
    let mut ticker = tokio::time::interval(shared.config.poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut tick: u64 = 0;
    loop {
        ticker.tick().await;
        tick = tick.wrapping_add(1);
        if shared.monitor.is_degraded() && tick % 2 == 0 {
            debug!("online poll skipped while degraded");
            continue;
        }
        shared.poll_online(&subject).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_core::ConnectivityState;
    use pulse_testkit::{Fixture, SUBJECT};
    use serde_json::json;

    fn supervisor(fx: &Fixture, host: HostSignals) -> StreamSupervisor {
        StreamSupervisor::new(
            Arc::clone(&fx.monitor),
            fx.identities.clone(),
            Arc::clone(&fx.api),
            fx.config.stream.clone(),
            host,
            Arc::new(Observers::new()),
        )
    }

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_idempotent_and_stop_is_terminal() {
        let fx = Fixture::new();
        fx.with_signed_identity().healthy_backend();
        let sup = supervisor(&fx, HostSignals::new());

        sup.start(SUBJECT);
        sup.start(SUBJECT);
        settle().await;

        assert_eq!(fx.transport.stream_open_count(), 1);
        assert_eq!(sup.stats().open_attempts, 1);
        assert!(sup.observers().alive());

        sup.stop();
        sup.stop();
        settle().await;
        assert!(!sup.is_running());
        assert!(!sup.observers().alive());
        assert_eq!(sup.observers().phase(), StreamPhase::Stopped);
        assert_eq!(fx.transport.open_stream_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_identity_without_retrying() {
        let fx = Fixture::new();
        fx.healthy_backend();
        let sup = supervisor(&fx, HostSignals::new());

        sup.start(SUBJECT);
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(fx.transport.stream_open_count(), 0);
        assert!(!sup.is_reconnect_pending());
        assert_eq!(sup.observers().phase(), StreamPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn frames_update_observers_and_renew_identity() {
        let fx = Fixture::new();
        fx.with_signed_identity().healthy_backend();
        let sup = supervisor(&fx, HostSignals::new());
        sup.start(SUBJECT);
        settle().await;

        let stream = fx.transport.latest_stream().unwrap();
        stream.named(
            "hello",
            json!({"visitorId": "tok.renewed000000000", "online": 9}),
        );
        stream.named("total", json!({"total": 77}));
        stream.named("decision", json!({"mode": "FOCUS", "allowShare": true}));
        settle().await;

        let observers = sup.observers();
        assert_eq!(observers.online_now(), 9);
        assert_eq!(observers.total(), Some(77));
        assert!(observers.decision().allow_share);
        assert_eq!(fx.identities.visitor_id(SUBJECT), "tok.renewed000000000");
        assert_eq!(sup.stats().frames_received, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stream_error_schedules_one_reconnect() {
        let fx = Fixture::new();
        fx.with_signed_identity().healthy_backend();
        let sup = supervisor(&fx, HostSignals::new());
        sup.start(SUBJECT);
        settle().await;

        fx.transport.latest_stream().unwrap().fail("connection reset");
        settle().await;

        assert!(!sup.observers().alive());
        assert_eq!(sup.observers().phase(), StreamPhase::Errored);
        assert!(sup.is_reconnect_pending());
        assert_eq!(sup.stats().reconnects_scheduled, 1);

        // streak 1 -> 700ms * 1.4 at most
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        settle().await;
        assert_eq!(fx.transport.stream_open_count(), 2);
        assert!(sup.observers().alive());
    }

    #[tokio::test(start_paused = true)]
    async fn offline_defers_open_and_poll_recovers() {
        let fx = Fixture::new();
        fx.with_signed_identity().healthy_backend();
        fx.monitor.report_network_lost();
        assert_eq!(fx.monitor.state(), ConnectivityState::Offline);
        let sup = supervisor(&fx, HostSignals::new());

        sup.start(SUBJECT);
        settle().await;

        // The immediate poll succeeds and brings the monitor back online.
        assert_eq!(fx.monitor.state(), ConnectivityState::Online);
        assert_eq!(sup.observers().online_now(), 4);
        assert!(sup.is_reconnect_pending());

        tokio::time::sleep(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(fx.transport.stream_open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_network_forces_not_alive() {
        let fx = Fixture::new();
        fx.with_signed_identity().healthy_backend();
        let host = HostSignals::new();
        let sup = supervisor(&fx, host.clone());
        sup.start(SUBJECT);
        settle().await;
        assert!(sup.observers().alive());

        host.set_network_online(false);
        tokio::time::sleep(Duration::from_millis(1_600)).await;
        settle().await;

        assert!(!sup.observers().alive());
        assert_eq!(fx.monitor.state(), ConnectivityState::Offline);
        assert_eq!(fx.transport.open_stream_count(), 0);
    }
}
