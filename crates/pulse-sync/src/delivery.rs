//! Enqueue-first event delivery.
//!
//! [`DeliveryCoordinator`] owns the path from "the app produced an event" to
//! "the backend acknowledged it":
//!
//! - every event is persisted before any send is attempted
//! - one immediate send per tracked event, unless the backend is offline or an
//!   auth-pause window is active
//! - a bounded, oldest-first flush of whatever is still queued
//! - an identity handshake (issue, refresh) that precedes each flush
//!
//! Backend distress (401/403, 429/5xx) opens an auth-pause window during
//! which no delivery is attempted. Windows only ever extend.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use pulse_core::{
    BackoffBand, ConnectivityMonitor, DeliveryConfig, DeliveryOutcome, EventPayload,
    IdentityToken, QueuedEvent,
};
use pulse_store::{IdentityStore, PersistentEventQueue};
use pulse_transport::{ApiClient, HttpResponse};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::{SyncError, SyncResult};

/// Why a handshake or flush did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Backend is OFFLINE.
    Offline,
    /// An auth-pause window is active.
    AuthPaused,
    /// Another handshake or flush is already running.
    InProgress,
    /// The previous handshake is too recent.
    Throttled,
}

/// What one flush did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Set when the flush did not run at all.
    pub skipped: Option<SkipReason>,
    /// Rounds that sent at least one event.
    pub rounds: usize,
    /// Send attempts made.
    pub attempts: usize,
    /// Events acknowledged and removed.
    pub delivered: usize,
    /// Events whose attempt counter was bumped.
    pub failed: usize,
    /// Outcome that aborted the flush early.
    pub stopped_by: Option<DeliveryOutcome>,
}

impl FlushReport {
    const fn skipped(reason: SkipReason) -> Self {
        Self {
            skipped: Some(reason),
            rounds: 0,
            attempts: 0,
            delivered: 0,
            failed: 0,
            stopped_by: None,
        }
    }
}

/// What one handshake did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// Did not run.
    Skipped(SkipReason),
    /// Identity issuance or refresh failed.
    Failed(DeliveryOutcome),
    /// The refresh was rejected; an auth-pause window is now active.
    AuthPaused,
    /// Identity is current; carries the flush report when a flush followed.
    Completed(Option<FlushReport>),
}

/// Result of [`DeliveryCoordinator::track_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackReceipt {
    /// Id of the queued event.
    pub event_id: String,
    /// Outcome of the immediate send, or `Deferred` when none was attempted.
    pub outcome: DeliveryOutcome,
}

/// A short-lived code that lets another device adopt this identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkCode {
    /// Subject the code was issued for.
    #[serde(default)]
    pub page: String,
    /// The code to type on the other device.
    pub code: String,
    /// Seconds until the code expires.
    #[serde(default)]
    pub ttl_sec: u64,
}

#[derive(Debug, Default)]
struct Timing {
    auth_paused_until: Option<Instant>,
    last_handshake_at: Option<Instant>,
}

/// Clears a re-entrancy flag on drop.
struct FlagGuard<'a>(&'a AtomicBool);

impl<'a> FlagGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Durable, connectivity-aware event delivery.
pub struct DeliveryCoordinator {
    monitor: Arc<ConnectivityMonitor>,
    queue: Arc<PersistentEventQueue>,
    identities: IdentityStore,
    api: Arc<ApiClient>,
    config: DeliveryConfig,
    timing: Mutex<Timing>,
    handshaking: AtomicBool,
    flushing: AtomicBool,
}

impl std::fmt::Debug for DeliveryCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryCoordinator")
            .field("queued", &self.queue.len())
            .field("auth_paused", &self.is_auth_paused())
            .field("handshaking", &self.handshaking.load(Ordering::Relaxed))
            .field("flushing", &self.flushing.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl DeliveryCoordinator {
    /// Wire a coordinator over shared components.
    #[must_use]
    pub fn new(
        monitor: Arc<ConnectivityMonitor>,
        queue: Arc<PersistentEventQueue>,
        identities: IdentityStore,
        api: Arc<ApiClient>,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            monitor,
            queue,
            identities,
            api,
            config,
            timing: Mutex::new(Timing::default()),
            handshaking: AtomicBool::new(false),
            flushing: AtomicBool::new(false),
        }
    }

    /// The queue this coordinator drains.
    #[must_use]
    pub fn queue(&self) -> &PersistentEventQueue {
        &self.queue
    }

    /// Whether an auth-pause window is active.
    #[must_use]
    pub fn is_auth_paused(&self) -> bool {
        self.timing
            .lock()
            .auth_paused_until
            .is_some_and(|until| Instant::now() < until)
    }

    /// Time left in the current auth-pause window.
    #[must_use]
    pub fn auth_pause_remaining(&self) -> Duration {
        self.timing
            .lock()
            .auth_paused_until
            .map_or(Duration::ZERO, |until| {
                until.saturating_duration_since(Instant::now())
            })
    }

    /// Queue an event and try to deliver it right away.
    ///
    /// The event is persisted first; whatever happens afterwards it stays
    /// queued until the backend acknowledges it.
    #[instrument(skip(self, payload), fields(kind = %payload.kind))]
    pub async fn track_event(&self, subject: &str, payload: EventPayload) -> TrackReceipt {
        let client = self.identities.client_meta();
        let event = QueuedEvent::new(subject, payload, &client);
        let event_id = event.id.clone();

        if let Err(e) = self.queue.enqueue(event.clone()) {
            warn!(event_id = %event_id, error = %e, "event kept in memory only");
        }

        if self.monitor.should_pause_heavy_work() || self.is_auth_paused() {
            debug!(event_id = %event_id, "immediate send deferred");
            return TrackReceipt {
                event_id,
                outcome: DeliveryOutcome::Deferred,
            };
        }

        let outcome = self.send_one(subject, &event).await;
        match outcome {
            DeliveryOutcome::Success => {
                self.commit(&[event_id.clone()], &[]);
                self.monitor.report_ok();
            }
            DeliveryOutcome::AuthRejected => {
                self.monitor.report_fail("event_auth_rejected");
                self.pause_auth(self.config.track_auth_backoff);
                let handshake = self.handshake_and_flush(subject).await;
                debug!(?handshake, "handshake after rejected event");
            }
            DeliveryOutcome::Overloaded => {
                self.monitor.report_fail("event_overloaded");
                self.pause_overload(self.config.track_overload_backoff);
            }
            DeliveryOutcome::Transport => {
                self.monitor.report_fail("event_transport");
            }
            DeliveryOutcome::NoSignedIdentity
            | DeliveryOutcome::Rejected(_)
            | DeliveryOutcome::Deferred => {}
        }

        debug!(event_id = %event_id, %outcome, "immediate send finished");
        TrackReceipt { event_id, outcome }
    }

    /// Make sure a signed identity exists and is fresh, then flush the queue.
    ///
    /// Skipped while OFFLINE, while another handshake runs, and when the
    /// previous handshake started less than the configured interval ago.
    #[instrument(skip(self))]
    pub async fn handshake_and_flush(&self, subject: &str) -> HandshakeOutcome {
        self.run_handshake(subject, true).await
    }

    /// Drain the queue in bounded rounds, oldest first.
    ///
    /// If the flush leaves an auth-pause window open, an identity handshake
    /// follows.
    #[instrument(skip(self))]
    pub async fn flush_queue(&self, subject: &str) -> FlushReport {
        let report = self.drain(subject).await;
        if report.skipped.is_none() && self.is_auth_paused() {
            let follow_up = self.run_handshake(subject, false).await;
            debug!(?follow_up, "follow-up handshake after flush");
        }
        report
    }

    /// Request a device-link code for the current identity.
    ///
    /// # Errors
    /// Fails without a signed identity, on any non-success answer, or when
    /// the answer carries no code.
    #[instrument(skip(self))]
    pub async fn link_issue(&self, subject: &str) -> SyncResult<LinkCode> {
        let token = self
            .identities
            .signed(subject)
            .ok_or_else(|| SyncError::NoSignedIdentity {
                subject: subject.to_string(),
            })?;

        let response = self.api.link_issue(subject, token.expose()).await;
        self.check_response("link_issue", &response)?;
        self.identities
            .adopt_if_signed(subject, response.visitor_id.as_deref());

        response
            .decode::<LinkCode>()
            .filter(|link| !link.code.trim().is_empty())
            .ok_or(SyncError::MalformedResponse("link code"))
    }

    /// Exchange a device-link code for a signed identity and adopt it.
    ///
    /// # Errors
    /// Fails for an empty code, on any non-success answer, when the answer
    /// carries no signed identity, or when it cannot be stored.
    #[instrument(skip(self, code))]
    pub async fn link_consume(&self, subject: &str, code: &str) -> SyncResult<IdentityToken> {
        let code = code.trim();
        if code.is_empty() {
            return Err(SyncError::EmptyLinkCode);
        }

        let response = self.api.link_consume(subject, code).await;
        self.check_response("link_consume", &response)?;

        let token = response
            .visitor_id
            .as_deref()
            .and_then(IdentityToken::parse)
            .ok_or(SyncError::MalformedResponse("link consume"))?;
        self.identities.set(subject, token.expose())?;
        info!(fingerprint = %token.fingerprint(), "linked identity adopted");
        Ok(token)
    }

    fn check_response(&self, call: &'static str, response: &HttpResponse) -> SyncResult<()> {
        let outcome = response.outcome();
        if outcome.is_success() {
            self.monitor.report_ok();
            return Ok(());
        }
        if matches!(
            outcome,
            DeliveryOutcome::Transport | DeliveryOutcome::Overloaded
        ) {
            self.monitor.report_fail(call);
        }
        Err(SyncError::Backend {
            call,
            outcome,
            status: response.status,
        })
    }

    async fn run_handshake(&self, subject: &str, then_flush: bool) -> HandshakeOutcome {
        if self.monitor.should_pause_heavy_work() {
            return HandshakeOutcome::Skipped(SkipReason::Offline);
        }
        let Some(_guard) = FlagGuard::acquire(&self.handshaking) else {
            return HandshakeOutcome::Skipped(SkipReason::InProgress);
        };
        if !self.claim_handshake_slot() {
            return HandshakeOutcome::Skipped(SkipReason::Throttled);
        }

        let token = match self.ensure_identity(subject).await {
            Ok(token) => token,
            Err(outcome) => return HandshakeOutcome::Failed(outcome),
        };

        let response = self.api.refresh_identity(subject, token.expose()).await;
        let outcome = response.outcome();
        match outcome {
            DeliveryOutcome::Transport => {
                self.monitor.report_fail("refresh_transport");
                return HandshakeOutcome::Failed(outcome);
            }
            DeliveryOutcome::Overloaded => {
                self.monitor.report_fail("refresh_overloaded");
                self.pause_overload(self.config.flush_overload_backoff);
                return HandshakeOutcome::Failed(outcome);
            }
            _ => {}
        }

        self.monitor.report_ok();
        self.identities
            .adopt_if_signed(subject, response.visitor_id.as_deref());

        if outcome == DeliveryOutcome::AuthRejected {
            self.pause_auth(self.config.flush_auth_backoff);
            return HandshakeOutcome::AuthPaused;
        }
        if !then_flush {
            return HandshakeOutcome::Completed(None);
        }
        HandshakeOutcome::Completed(Some(self.drain(subject).await))
    }

    fn claim_handshake_slot(&self) -> bool {
        let now = Instant::now();
        let interval = self.config.handshake_interval();
        let mut timing = self.timing.lock();
        if timing
            .last_handshake_at
            .is_some_and(|last| now.saturating_duration_since(last) < interval)
        {
            return false;
        }
        timing.last_handshake_at = Some(now);
        true
    }

    async fn ensure_identity(&self, subject: &str) -> Result<IdentityToken, DeliveryOutcome> {
        if let Some(token) = self.identities.signed(subject) {
            return Ok(token);
        }

        let response = self.api.issue_identity(subject).await;
        let outcome = response.outcome();
        if !outcome.is_success() {
            self.monitor.report_fail("issue_failed");
            return Err(outcome);
        }
        self.monitor.report_ok();

        let Some(token) = response.visitor_id.as_deref().and_then(IdentityToken::parse) else {
            warn!("issued identity is not signed");
            return Err(DeliveryOutcome::NoSignedIdentity);
        };
        if let Err(e) = self.identities.set(subject, token.expose()) {
            warn!(error = %e, "failed to persist issued identity");
        }
        info!(fingerprint = %token.fingerprint(), "identity issued");
        Ok(token)
    }

    async fn drain(&self, subject: &str) -> FlushReport {
        if self.monitor.should_pause_heavy_work() {
            return FlushReport::skipped(SkipReason::Offline);
        }
        if self.is_auth_paused() {
            return FlushReport::skipped(SkipReason::AuthPaused);
        }
        let Some(_guard) = FlagGuard::acquire(&self.flushing) else {
            return FlushReport::skipped(SkipReason::InProgress);
        };

        let mut report = FlushReport::default();
        for _ in 0..self.config.max_rounds {
            if self.must_hold() {
                break;
            }
            let batch = self.queue.peek_batch(self.config.batch_size);
            if batch.is_empty() {
                break;
            }

            let mut delivered = Vec::new();
            let mut failed = Vec::new();
            let mut stopped_by = None;

            for event in &batch {
                if self.must_hold() {
                    break;
                }
                let outcome = self.send_one(subject, event).await;
                if outcome == DeliveryOutcome::NoSignedIdentity {
                    stopped_by = Some(outcome);
                    break;
                }
                report.attempts += 1;
                match outcome {
                    DeliveryOutcome::Success => delivered.push(event.id.clone()),
                    DeliveryOutcome::Rejected(status) => {
                        debug!(event_id = %event.id, status, "event rejected, kept queued");
                        failed.push(event.id.clone());
                    }
                    DeliveryOutcome::Transport
                    | DeliveryOutcome::AuthRejected
                    | DeliveryOutcome::Overloaded => failed.push(event.id.clone()),
                    DeliveryOutcome::NoSignedIdentity | DeliveryOutcome::Deferred => {}
                }
                if outcome.is_distress() {
                    self.pause_for_flush(outcome);
                }
                if outcome.stops_round() {
                    stopped_by = Some(outcome);
                    break;
                }
            }

            if !delivered.is_empty() || !failed.is_empty() {
                report.rounds += 1;
            }
            report.delivered += delivered.len();
            report.failed += failed.len();
            self.commit(&delivered, &failed);

            if !delivered.is_empty() {
                self.monitor.report_ok();
            }
            if let Some(outcome) = stopped_by {
                if outcome != DeliveryOutcome::NoSignedIdentity {
                    self.monitor.report_fail(&format!("flush_{}", outcome.label()));
                }
                report.stopped_by = Some(outcome);
                break;
            }
        }

        if report.attempts > 0 {
            info!(
                rounds = report.rounds,
                delivered = report.delivered,
                failed = report.failed,
                remaining = self.queue.len(),
                stopped_by = ?report.stopped_by,
                "queue flushed"
            );
        }
        report
    }

    fn must_hold(&self) -> bool {
        self.monitor.should_pause_heavy_work() || self.is_auth_paused()
    }

    async fn send_one(&self, subject: &str, event: &QueuedEvent) -> DeliveryOutcome {
        let Some(token) = self.identities.signed(subject) else {
            return DeliveryOutcome::NoSignedIdentity;
        };
        let response = self.api.send_event(event, token.expose()).await;
        self.identities
            .adopt_if_signed(subject, response.visitor_id.as_deref());
        response.outcome()
    }

    fn commit(&self, delivered: &[String], failed: &[String]) {
        if let Err(e) = self.queue.remove_by_ids(delivered) {
            warn!(error = %e, "failed to persist delivered events");
        }
        if let Err(e) = self.queue.bump_attempts(failed) {
            warn!(error = %e, "failed to persist attempt counters");
        }
    }

    fn pause_for_flush(&self, outcome: DeliveryOutcome) -> Duration {
        if outcome == DeliveryOutcome::AuthRejected {
            self.pause_auth(self.config.flush_auth_backoff)
        } else {
            self.pause_overload(self.config.flush_overload_backoff)
        }
    }

    fn pause_auth(&self, band: BackoffBand) -> Duration {
        self.pause(self.config.auth_pause_floor_ms, band, "auth")
    }

    fn pause_overload(&self, band: BackoffBand) -> Duration {
        self.pause(self.config.overload_pause_floor_ms, band, "overload")
    }

    fn pause(&self, floor_ms: u64, band: BackoffBand, cause: &'static str) -> Duration {
        let backoff_ms = self.monitor.next_backoff_ms(band.base_ms, band.cap_ms);
        let pause = Duration::from_millis(backoff_ms.max(floor_ms).max(self.config.min_pause_ms));
        let until = Instant::now() + pause;

        let mut timing = self.timing.lock();
        let extended = timing
            .auth_paused_until
            .map_or(until, |current| current.max(until));
        timing.auth_paused_until = Some(extended);
        drop(timing);

        warn!(
            cause,
            pause_ms = u64::try_from(pause.as_millis()).unwrap_or(u64::MAX),
            "delivery paused"
        );
        pause
    }
}
