//! Backend API client: endpoint calls under a per-call fetch policy.
//!
//! The policy decides the timeout, whether identical in-flight requests share
//! one network call, how long 2xx responses are served from cache and whether
//! a cached response may stand in for a transport failure.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use pulse_core::{PulseConfig, QueuedEvent, credential_fingerprint};
use tokio::time::Instant;
use tracing::{debug, instrument};

use crate::{
    Endpoints, HttpRequest, HttpResponse, PushConnection, Transport, TransportResult,
};

/// No call is given less time than this.
pub const MIN_TIMEOUT: Duration = Duration::from_millis(900);

/// How a single call is executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchPolicy {
    /// Deadline (raised to at least [`MIN_TIMEOUT`]).
    pub timeout: Duration,
    /// Share one network call between identical concurrent requests.
    pub dedupe: bool,
    /// Serve 2xx responses from cache for this long. Zero disables caching.
    pub cache_ttl: Duration,
    /// On status 0, return the cached response regardless of age.
    pub allow_stale_on_error: bool,
    /// Add the credential fingerprint to the cache/dedupe key.
    pub include_identity_in_key: bool,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(6_500),
            dedupe: false,
            cache_ttl: Duration::ZERO,
            allow_stale_on_error: false,
            include_identity_in_key: true,
        }
    }
}

impl FetchPolicy {
    /// Builder: set the timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Builder: enable in-flight de-duplication.
    #[must_use]
    pub const fn with_dedupe(mut self) -> Self {
        self.dedupe = true;
        self
    }

    /// Builder: cache 2xx responses for `ttl`, optionally serving them on error.
    #[must_use]
    pub const fn with_cache(mut self, ttl: Duration, allow_stale_on_error: bool) -> Self {
        self.cache_ttl = ttl;
        self.allow_stale_on_error = allow_stale_on_error;
        self
    }

    /// Builder: keep the credential out of the key.
    #[must_use]
    pub const fn without_identity_in_key(mut self) -> Self {
        self.include_identity_in_key = false;
        self
    }

    fn effective_timeout(&self) -> Duration {
        self.timeout.max(MIN_TIMEOUT)
    }
}

/// Policies for each kind of call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiPolicies {
    /// Identity issuance.
    pub issue: FetchPolicy,
    /// Identity refresh.
    pub refresh: FetchPolicy,
    /// Event submission.
    pub send: FetchPolicy,
    /// Online-count poll.
    pub poll: FetchPolicy,
    /// Profile/insights/total pulls.
    pub pull: FetchPolicy,
    /// Device linking.
    pub link: FetchPolicy,
}

impl ApiPolicies {
    /// Derive policies from the client configuration.
    #[must_use]
    pub fn from_config(config: &PulseConfig) -> Self {
        let identity_timeout = config.delivery.identity_timeout();
        Self {
            issue: FetchPolicy::default()
                .with_timeout(identity_timeout)
                .with_dedupe()
                .without_identity_in_key(),
            refresh: FetchPolicy::default()
                .with_timeout(identity_timeout)
                .with_dedupe()
                .with_cache(
                    Duration::from_millis(config.delivery.refresh_cache_ttl_ms),
                    true,
                ),
            send: FetchPolicy::default().with_timeout(config.delivery.send_timeout()),
            poll: FetchPolicy::default()
                .with_timeout(config.stream.poll_timeout())
                .with_dedupe(),
            pull: FetchPolicy::default()
                .with_timeout(config.refresh.timeout())
                .with_dedupe(),
            link: FetchPolicy::default()
                .with_timeout(identity_timeout)
                .without_identity_in_key(),
        }
    }
}

impl Default for ApiPolicies {
    fn default() -> Self {
        Self::from_config(&PulseConfig::default())
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    stored_at: Instant,
    response: HttpResponse,
}

type InflightCall = Shared<BoxFuture<'static, HttpResponse>>;
type InflightMap = Arc<Mutex<HashMap<String, InflightCall>>>;

fn evict_inflight(inflight: &InflightMap, key: &str, call: &InflightCall) {
    let mut inflight = inflight.lock();
    if inflight.get(key).is_some_and(|current| current.ptr_eq(call)) {
        inflight.remove(key);
    }
}

/// De-duplication entry owned by the caller that started the call.
struct InflightSlot {
    inflight: InflightMap,
    key: String,
    call: InflightCall,
}

impl Drop for InflightSlot {
    fn drop(&mut self) {
        evict_inflight(&self.inflight, &self.key, &self.call);
    }
}

/// Typed access to every backend endpoint.
pub struct ApiClient {
    transport: Arc<dyn Transport>,
    endpoints: Endpoints,
    policies: ApiPolicies,
    cache: Arc<Mutex<HashMap<String, CacheEntry>>>,
    inflight: InflightMap,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("endpoints", &self.endpoints)
            .field("cached", &self.cache.lock().len())
            .field("inflight", &self.inflight.lock().len())
            .finish_non_exhaustive()
    }
}

impl ApiClient {
    /// Create a client.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, endpoints: Endpoints, policies: ApiPolicies) -> Self {
        Self {
            transport,
            endpoints,
            policies,
            cache: Arc::new(Mutex::new(HashMap::new())),
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Create a client from configuration.
    ///
    /// # Errors
    /// Returns an error if `config.api_base` is not an absolute URL.
    pub fn from_config(transport: Arc<dyn Transport>, config: &PulseConfig) -> TransportResult<Self> {
        let endpoints = Endpoints::new(&config.api_base)?;
        Ok(Self::new(
            transport,
            endpoints,
            ApiPolicies::from_config(config),
        ))
    }

    /// Endpoint table.
    #[must_use]
    pub const fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    /// Number of cached responses.
    #[must_use]
    pub fn cached_len(&self) -> usize {
        self.cache.lock().len()
    }

    /// Drop every cached response.
    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }

    fn cache_key(request: &HttpRequest, policy: &FetchPolicy) -> String {
        let base = format!("{}::{}", request.method.as_str(), request.url);
        match (&request.credential, policy.include_identity_in_key) {
            (Some(credential), true) => {
                format!("{base}::vid={}", credential_fingerprint(credential))
            }
            _ => base,
        }
    }

    /// Execute `request` under `policy`.
    pub async fn fetch(&self, mut request: HttpRequest, policy: &FetchPolicy) -> HttpResponse {
        let key = Self::cache_key(&request, policy);
        let timeout = policy.effective_timeout();
        request.timeout = timeout;
        let ttl = policy.cache_ttl;

        if !ttl.is_zero() {
            if let Some(entry) = self.cache.lock().get(&key) {
                if entry.stored_at.elapsed() <= ttl {
                    debug!(key = %key, "serving cached response");
                    return entry.response.clone();
                }
            }
        }

        if policy.dedupe {
            let existing = self.inflight.lock().get(&key).cloned();
            if let Some(call) = existing {
                if call.peek().is_none() {
                    debug!(key = %key, "joining in-flight request");
                    return call.await;
                }
                debug!(key = %key, "dropping settled in-flight entry");
                evict_inflight(&self.inflight, &key, &call);
            }
        }

        let transport = Arc::clone(&self.transport);
        let cache = Arc::clone(&self.cache);
        let allow_stale = policy.allow_stale_on_error;
        let call_key = key.clone();
        let call = async move {
            let response = tokio::time::timeout(timeout, transport.send(request))
                .await
                .unwrap_or_else(|_| HttpResponse::transport_failure("timeout"));

            if ttl.is_zero() {
                return response;
            }
            if response.is_success() {
                cache.lock().insert(
                    call_key,
                    CacheEntry {
                        stored_at: Instant::now(),
                        response: response.clone(),
                    },
                );
            } else if response.status == 0 && allow_stale {
                if let Some(entry) = cache.lock().get(&call_key) {
                    debug!(key = %call_key, "transport failed, serving stale response");
                    return entry.response.clone();
                }
            }
            response
        }
        .boxed()
        .shared();

        // The slot is released when this caller finishes or is dropped.
        let _slot = policy.dedupe.then(|| {
            self.inflight.lock().insert(key.clone(), call.clone());
            InflightSlot {
                inflight: Arc::clone(&self.inflight),
                key,
                call: call.clone(),
            }
        });
        call.await
    }

    /// Ask the backend for a new identity. No credential is sent.
    ///
    /// The token comes from the visitor header, or the body `vid` field.
    #[instrument(skip(self))]
    pub async fn issue_identity(&self, subject: &str) -> HttpResponse {
        let request = HttpRequest::get(self.endpoints.issue(subject));
        let mut response = self.fetch(request, &self.policies.issue).await;
        fill_visitor_id_from_body(&mut response);
        response
    }

    /// Lightweight identity refresh (`me`).
    #[instrument(skip(self, credential))]
    pub async fn refresh_identity(&self, subject: &str, credential: &str) -> HttpResponse {
        let request = HttpRequest::get(self.endpoints.me(subject)).with_credential(Some(credential));
        self.fetch(request, &self.policies.refresh).await
    }

    /// Submit one queued event.
    #[instrument(skip(self, event, credential), fields(event_id = %event.id, kind = %event.kind))]
    pub async fn send_event(&self, event: &QueuedEvent, credential: &str) -> HttpResponse {
        let request = HttpRequest::post(self.endpoints.event())
            .with_credential(Some(credential))
            .with_json(event.wire_body());
        self.fetch(request, &self.policies.send).await
    }

    /// Online-now count.
    pub async fn fetch_online(&self, subject: &str, credential: Option<&str>) -> HttpResponse {
        let request = HttpRequest::get(self.endpoints.online(subject)).with_credential(credential);
        self.fetch(request, &self.policies.poll).await
    }

    /// Visitor profile (visit tracking).
    pub async fn fetch_profile(&self, subject: &str, credential: &str) -> HttpResponse {
        let request =
            HttpRequest::get(self.endpoints.track(subject)).with_credential(Some(credential));
        self.fetch(request, &self.policies.pull).await
    }

    /// Aggregated insights.
    pub async fn fetch_insights(&self, subject: &str, credential: &str) -> HttpResponse {
        let request =
            HttpRequest::get(self.endpoints.insights(subject)).with_credential(Some(credential));
        self.fetch(request, &self.policies.pull).await
    }

    /// Total visits.
    pub async fn fetch_total(&self, subject: &str, credential: Option<&str>) -> HttpResponse {
        let request = HttpRequest::get(self.endpoints.total(subject)).with_credential(credential);
        self.fetch(request, &self.policies.pull).await
    }

    /// Request a short device-link code for the current identity.
    #[instrument(skip(self, credential))]
    pub async fn link_issue(&self, subject: &str, credential: &str) -> HttpResponse {
        let request =
            HttpRequest::post(self.endpoints.link_issue(subject)).with_credential(Some(credential));
        self.fetch(request, &self.policies.link).await
    }

    /// Exchange a device-link code for a signed identity. No credential is sent.
    #[instrument(skip(self, code))]
    pub async fn link_consume(&self, subject: &str, code: &str) -> HttpResponse {
        let request = HttpRequest::post(self.endpoints.link_consume(subject, code.trim()));
        let mut response = self.fetch(request, &self.policies.link).await;
        fill_visitor_id_from_body(&mut response);
        response
    }

    /// Open the push subscription for `subject`.
    ///
    /// # Errors
    /// Returns the transport's error when the stream cannot be opened.
    pub async fn open_stream(
        &self,
        subject: &str,
        credential: &str,
        timeout: Duration,
    ) -> TransportResult<PushConnection> {
        let url = self.endpoints.stream(subject, credential);
        self.transport.open_stream(&url, timeout).await
    }
}

fn fill_visitor_id_from_body(response: &mut HttpResponse) {
    if response.visitor_id.is_some() {
        return;
    }
    let from_body = response
        .body
        .as_json()
        .and_then(|body| body.get("vid"))
        .and_then(serde_json::Value::as_str)
        .map(str::trim)
        .filter(|vid| !vid.is_empty())
        .map(ToString::to_string);
    response.visitor_id = from_body;
}
