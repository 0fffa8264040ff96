//! Observable client state shared by the stream supervisor and the refresher.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use tokio::sync::watch;

use crate::{Decision, PushMessage};

/// Lifecycle of the realtime subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StreamPhase {
    /// Not started, or waiting for a signed identity.
    #[default]
    Idle,
    /// Open attempt in flight.
    Connecting,
    /// Open and receiving.
    Alive,
    /// Torn down by the watchdog after a silence.
    Silent,
    /// Failed to open or dropped by the server.
    Errored,
    /// Stopped by the owner.
    Stopped,
}

impl StreamPhase {
    /// Lower-case name for logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Alive => "alive",
            Self::Silent => "silent",
            Self::Errored => "errored",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for StreamPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Watch channels for everything the UI may render.
///
/// Senders only notify on an actual change.
#[derive(Debug)]
pub struct Observers {
    alive: watch::Sender<bool>,
    phase: watch::Sender<StreamPhase>,
    online_now: watch::Sender<u64>,
    total: watch::Sender<Option<u64>>,
    profile: watch::Sender<Option<Value>>,
    insights: watch::Sender<Option<Value>>,
    decision: watch::Sender<Decision>,
}

impl Default for Observers {
    fn default() -> Self {
        Self::new()
    }
}

fn replace_if_changed<T: PartialEq>(tx: &watch::Sender<T>, value: T) {
    tx.send_if_modified(|current| {
        if *current == value {
            false
        } else {
            *current = value;
            true
        }
    });
}

impl Observers {
    /// Fresh observers: not alive, idle, zero online, nothing loaded.
    #[must_use]
    pub fn new() -> Self {
        Self {
            alive: watch::channel(false).0,
            phase: watch::channel(StreamPhase::Idle).0,
            online_now: watch::channel(0).0,
            total: watch::channel(None).0,
            profile: watch::channel(None).0,
            insights: watch::channel(None).0,
            decision: watch::channel(Decision::default()).0,
        }
    }

    /// Whether the subscription is considered alive.
    #[must_use]
    pub fn alive(&self) -> bool {
        *self.alive.borrow()
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> StreamPhase {
        *self.phase.borrow()
    }

    /// Latest online-now count.
    #[must_use]
    pub fn online_now(&self) -> u64 {
        *self.online_now.borrow()
    }

    /// Latest total visits.
    #[must_use]
    pub fn total(&self) -> Option<u64> {
        *self.total.borrow()
    }

    /// Latest profile.
    #[must_use]
    pub fn profile(&self) -> Option<Value> {
        self.profile.borrow().clone()
    }

    /// Latest insights.
    #[must_use]
    pub fn insights(&self) -> Option<Value> {
        self.insights.borrow().clone()
    }

    /// Latest pacing decision.
    #[must_use]
    pub fn decision(&self) -> Decision {
        self.decision.borrow().clone()
    }

    /// Subscribe to liveness.
    #[must_use]
    pub fn watch_alive(&self) -> watch::Receiver<bool> {
        self.alive.subscribe()
    }

    /// Subscribe to the phase.
    #[must_use]
    pub fn watch_phase(&self) -> watch::Receiver<StreamPhase> {
        self.phase.subscribe()
    }

    /// Subscribe to the online-now count.
    #[must_use]
    pub fn watch_online_now(&self) -> watch::Receiver<u64> {
        self.online_now.subscribe()
    }

    /// Subscribe to total visits.
    #[must_use]
    pub fn watch_total(&self) -> watch::Receiver<Option<u64>> {
        self.total.subscribe()
    }

    /// Subscribe to the profile.
    #[must_use]
    pub fn watch_profile(&self) -> watch::Receiver<Option<Value>> {
        self.profile.subscribe()
    }

    /// Subscribe to insights.
    #[must_use]
    pub fn watch_insights(&self) -> watch::Receiver<Option<Value>> {
        self.insights.subscribe()
    }

    /// Subscribe to pacing decisions.
    #[must_use]
    pub fn watch_decision(&self) -> watch::Receiver<Decision> {
        self.decision.subscribe()
    }

    pub(crate) fn set_alive(&self, alive: bool) {
        replace_if_changed(&self.alive, alive);
    }

    pub(crate) fn set_phase(&self, phase: StreamPhase) {
        replace_if_changed(&self.phase, phase);
    }

    pub(crate) fn set_online_now(&self, count: u64) {
        replace_if_changed(&self.online_now, count);
    }

    pub(crate) fn set_total(&self, total: u64) {
        replace_if_changed(&self.total, Some(total));
    }

    pub(crate) fn set_profile(&self, profile: Value) {
        replace_if_changed(&self.profile, Some(profile));
    }

    pub(crate) fn set_insights(&self, insights: Value) {
        replace_if_changed(&self.insights, Some(insights));
    }

    /// Publish the data carried by a push message.
    pub(crate) fn apply(&self, message: &PushMessage) {
        match message {
            PushMessage::Hello {
                online: Some(count),
            }
            | PushMessage::Online(count) => self.set_online_now(*count),
            PushMessage::Total(total) => self.set_total(*total),
            PushMessage::Profile(profile) => self.set_profile(profile.clone()),
            PushMessage::Insights(insights) => self.set_insights(insights.clone()),
            PushMessage::Decision(decision) => {
                replace_if_changed(&self.decision, decision.clone());
            }
            PushMessage::Hello { online: None }
            | PushMessage::Heartbeat
            | PushMessage::Unrecognized => {}
        }
    }
}

/// Host environment signals: network reachability and page visibility.
///
/// Clones share state; the embedding app flips them, the supervisor reads them.
#[derive(Debug, Clone)]
pub struct HostSignals {
    inner: Arc<HostInner>,
}

#[derive(Debug)]
struct HostInner {
    network_online: AtomicBool,
    page_visible: AtomicBool,
}

impl Default for HostSignals {
    fn default() -> Self {
        Self::new()
    }
}

impl HostSignals {
    /// Network up, page visible.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HostInner {
                network_online: AtomicBool::new(true),
                page_visible: AtomicBool::new(true),
            }),
        }
    }

    /// Whether the host reports any network.
    #[must_use]
    pub fn network_online(&self) -> bool {
        self.inner.network_online.load(Ordering::Acquire)
    }

    /// Whether the page is in the foreground.
    #[must_use]
    pub fn page_visible(&self) -> bool {
        self.inner.page_visible.load(Ordering::Acquire)
    }

    /// Record network reachability.
    pub fn set_network_online(&self, online: bool) {
        self.inner.network_online.store(online, Ordering::Release);
    }

    /// Record page visibility.
    pub fn set_page_visible(&self, visible: bool) {
        self.inner.page_visible.store(visible, Ordering::Release);
    }
}
