//! Wired-up client parts over a [`FakeTransport`] and in-memory storage.

use std::sync::Arc;

use pulse_core::{
    ClientMeta, ConnectivityMonitor, DEFAULT_SUBJECT, EventKind, EventPayload, PulseConfig,
    QueuedEvent,
};
use pulse_store::{IdentityStore, JsonStore, MemoryStorage, PersistentEventQueue, Storage};
use pulse_transport::{ApiClient, HttpResponse};
use serde_json::json;

use crate::FakeTransport;

/// A signed identity token.
pub const SIGNED_TOKEN: &str = "tok.abc1234567890123";

/// Subject used by fixtures.
pub const SUBJECT: &str = DEFAULT_SUBJECT;

/// Every shared client part, wired the way the runtime wires them.
#[derive(Debug, Clone)]
pub struct Fixture {
    /// Client configuration (pointed at a fake base URL).
    pub config: PulseConfig,
    /// Scripted backend.
    pub transport: FakeTransport,
    /// Raw storage.
    pub storage: Arc<MemoryStorage>,
    /// Typed store over `storage`.
    pub store: JsonStore,
    /// Identity persistence.
    pub identities: IdentityStore,
    /// Durable event queue.
    pub queue: Arc<PersistentEventQueue>,
    /// Connectivity monitor.
    pub monitor: Arc<ConnectivityMonitor>,
    /// API client over `transport`.
    pub api: Arc<ApiClient>,
}

impl Fixture {
    /// Fixture with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(PulseConfig::default())
    }

    /// Fixture with `config`; the API base is replaced by a fake host.
    ///
    /// # Panics
    /// Panics if the fake base URL cannot be parsed.
    #[must_use]
    pub fn with_config(config: PulseConfig) -> Self {
        let config = config.with_api_base("http://pulse.test");
        let transport = FakeTransport::new();
        let storage = Arc::new(MemoryStorage::new());
        Self::assemble(config, transport, storage)
    }

    /// A second client over the same storage and backend, as after a restart.
    #[must_use]
    pub fn restarted(&self) -> Self {
        self.store.flush_pending();
        Self::assemble(
            self.config.clone(),
            self.transport.clone(),
            Arc::clone(&self.storage),
        )
    }

    fn assemble(config: PulseConfig, transport: FakeTransport, storage: Arc<MemoryStorage>) -> Self {
        let store = JsonStore::new(Arc::clone(&storage) as Arc<dyn Storage>);
        let identities = IdentityStore::new(store.clone());
        let queue = Arc::new(PersistentEventQueue::open(store.clone(), &config.queue));
        let monitor = Arc::new(ConnectivityMonitor::new(config.connectivity.clone()));
        let api = Arc::new(
            ApiClient::from_config(Arc::new(transport.clone()), &config)
                .expect("fake api base is a valid URL"),
        );
        Self {
            config,
            transport,
            storage,
            store,
            identities,
            queue,
            monitor,
            api,
        }
    }

    /// Store [`SIGNED_TOKEN`] for [`SUBJECT`].
    ///
    /// # Panics
    /// Panics if the in-memory store rejects the write.
    pub fn with_signed_identity(&self) -> &Self {
        self.identities
            .set(SUBJECT, SIGNED_TOKEN)
            .expect("memory storage write");
        self
    }

    /// Script a healthy backend: identity issue and refresh, events, reads.
    pub fn healthy_backend(&self) -> &Self {
        self.transport
            .respond(
                "issue",
                HttpResponse::json(200, json!({"vid": SIGNED_TOKEN, "exp": 0})),
            )
            .respond(
                "me",
                HttpResponse::json(200, json!({"level": 1})).with_visitor_id(SIGNED_TOKEN),
            )
            .respond("event", HttpResponse::json(201, json!({"ok": true})))
            .respond("online", HttpResponse::json(200, json!({"online": 4})))
            .respond("total", HttpResponse::json(200, json!({"total": 120})))
            .respond("track", HttpResponse::json(200, json!({"visits": 3})))
            .respond("insights/me", HttpResponse::json(200, json!({"streak": 2})));
        self
    }
}

impl Default for Fixture {
    fn default() -> Self {
        Self::new()
    }
}

/// A queued event with a fixed id.
#[must_use]
pub fn queued_event(id: &str, kind: EventKind) -> QueuedEvent {
    QueuedEvent::with_id(
        id,
        SUBJECT,
        EventPayload::new(kind),
        &ClientMeta::default(),
        chrono::Utc::now(),
    )
}
