//! Scripted in-memory [`Transport`].
//!
//! Requests are routed by endpoint name (the path below `/api/public/visits/`,
//! e.g. `"me"`, `"event"`, `"insights/me"`). Each route answers with queued
//! one-shot responses first, then its sticky response; unrouted requests get a
//! transport failure. Every request is recorded.
//!
//! Push streams open successfully by default and hand the test a
//! [`PushHandle`] to drive the connection.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pulse_transport::{
    HttpRequest, HttpResponse, PUSH_CHANNEL_CAPACITY, PushConnection, PushFrame, Transport,
    TransportError, TransportResult,
};
use tokio::sync::{mpsc, oneshot};

const VISITS_PREFIX: &str = "/api/public/visits/";

/// Endpoint name of a URL, or its full path when outside the visits API.
#[must_use]
pub fn endpoint_of(url: &str) -> String {
    let path = url::Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.to_string());
    path.find(VISITS_PREFIX).map_or(path.clone(), |idx| {
        path[idx + VISITS_PREFIX.len()..].to_string()
    })
}

#[derive(Debug, Default)]
struct Route {
    once: VecDeque<HttpResponse>,
    sticky: Option<HttpResponse>,
}

#[derive(Debug, Default)]
struct State {
    routes: HashMap<String, Route>,
    requests: Vec<HttpRequest>,
    stream_urls: Vec<String>,
    streams: Vec<PushHandle>,
    stream_failures: VecDeque<TransportError>,
    latency: Duration,
}

/// Scripted transport; clones share state.
#[derive(Debug, Clone, Default)]
pub struct FakeTransport {
    state: Arc<Mutex<State>>,
}

impl FakeTransport {
    /// Transport with no routes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every request to `endpoint` with `response` (after queued ones).
    pub fn respond(&self, endpoint: &str, response: HttpResponse) -> &Self {
        self.state
            .lock()
            .routes
            .entry(endpoint.to_string())
            .or_default()
            .sticky = Some(response);
        self
    }

    /// Answer the next request to `endpoint` with `response`.
    pub fn respond_once(&self, endpoint: &str, response: HttpResponse) -> &Self {
        self.state
            .lock()
            .routes
            .entry(endpoint.to_string())
            .or_default()
            .once
            .push_back(response);
        self
    }

    /// Shorthand: sticky response with a status and empty JSON object body.
    pub fn respond_status(&self, endpoint: &str, status: u16) -> &Self {
        self.respond(endpoint, HttpResponse::json(status, serde_json::json!({})))
    }

    /// Delay every response by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    /// Every request seen so far.
    #[must_use]
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.state.lock().requests.clone()
    }

    /// Total requests seen so far.
    #[must_use]
    pub fn request_count(&self) -> usize {
        self.state.lock().requests.len()
    }

    /// Requests to one endpoint.
    #[must_use]
    pub fn requests_to(&self, endpoint: &str) -> Vec<HttpRequest> {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|r| endpoint_of(&r.url) == endpoint)
            .cloned()
            .collect()
    }

    /// Endpoint names in request order.
    #[must_use]
    pub fn endpoint_log(&self) -> Vec<String> {
        self.state
            .lock()
            .requests
            .iter()
            .map(|r| endpoint_of(&r.url))
            .collect()
    }

    /// Forget recorded requests.
    pub fn clear_requests(&self) {
        self.state.lock().requests.clear();
    }

    /// Make the next stream open fail with `error`.
    pub fn fail_next_stream(&self, error: TransportError) {
        self.state.lock().stream_failures.push_back(error);
    }

    /// URLs of every stream open attempt.
    #[must_use]
    pub fn stream_urls(&self) -> Vec<String> {
        self.state.lock().stream_urls.clone()
    }

    /// Number of stream open attempts.
    #[must_use]
    pub fn stream_open_count(&self) -> usize {
        self.state.lock().stream_urls.len()
    }

    /// Handle of the most recently opened stream.
    #[must_use]
    pub fn latest_stream(&self) -> Option<PushHandle> {
        self.state.lock().streams.last().cloned()
    }

    /// Handles of every successfully opened stream.
    #[must_use]
    pub fn streams(&self) -> Vec<PushHandle> {
        self.state.lock().streams.clone()
    }

    /// Streams whose receiving side is still held by the client.
    #[must_use]
    pub fn open_stream_count(&self) -> usize {
        self.state
            .lock()
            .streams
            .iter()
            .filter(|s| s.is_client_attached())
            .count()
    }

    fn next_response(&self, endpoint: &str) -> HttpResponse {
        let mut state = self.state.lock();
        let Some(route) = state.routes.get_mut(endpoint) else {
            return HttpResponse::transport_failure(format!("no route for {endpoint}"));
        };
        route
            .once
            .pop_front()
            .or_else(|| route.sticky.clone())
            .unwrap_or_else(|| HttpResponse::transport_failure(format!("no route for {endpoint}")))
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(&self, request: HttpRequest) -> HttpResponse {
        let endpoint = endpoint_of(&request.url);
        let latency = {
            let mut state = self.state.lock();
            state.requests.push(request);
            state.latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.next_response(&endpoint)
    }

    async fn open_stream(&self, url: &str, _timeout: Duration) -> TransportResult<PushConnection> {
        let mut state = self.state.lock();
        state.stream_urls.push(url.to_string());
        if let Some(error) = state.stream_failures.pop_front() {
            return Err(error);
        }

        let (frame_tx, frames) = mpsc::channel(PUSH_CHANNEL_CAPACITY);
        let (end_tx, end_rx) = oneshot::channel::<TransportResult<()>>();
        let handle = PushHandle {
            url: url.to_string(),
            inner: Arc::new(Mutex::new(HandleInner {
                frame_tx: Some(frame_tx),
                end_tx: Some(end_tx),
            })),
        };
        state.streams.push(handle);

        let join_handle = tokio::spawn(async move { end_rx.await.unwrap_or(Ok(())) });
        Ok(PushConnection {
            frames,
            join_handle,
        })
    }
}

#[derive(Debug)]
struct HandleInner {
    frame_tx: Option<mpsc::Sender<PushFrame>>,
    end_tx: Option<oneshot::Sender<TransportResult<()>>>,
}

/// Test-side end of a fake push connection.
#[derive(Debug, Clone)]
pub struct PushHandle {
    url: String,
    inner: Arc<Mutex<HandleInner>>,
}

impl PushHandle {
    /// URL the client opened.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Deliver a frame. Returns false once the client dropped the connection.
    pub fn send(&self, frame: PushFrame) -> bool {
        self.inner
            .lock()
            .frame_tx
            .as_ref()
            .is_some_and(|tx| tx.try_send(frame).is_ok())
    }

    /// Deliver a named message.
    pub fn named(&self, event: &str, data: serde_json::Value) -> bool {
        self.send(PushFrame::Message {
            event: Some(event.to_string()),
            data: data.to_string(),
        })
    }

    /// Deliver a default (unnamed) message.
    pub fn default_message(&self, data: serde_json::Value) -> bool {
        self.send(PushFrame::Message {
            event: None,
            data: data.to_string(),
        })
    }

    /// Deliver a raw named message, e.g. malformed JSON.
    pub fn raw(&self, event: Option<&str>, data: &str) -> bool {
        self.send(PushFrame::Message {
            event: event.map(ToString::to_string),
            data: data.to_string(),
        })
    }

    /// End the stream from the server side with `result`.
    pub fn close_with(&self, result: TransportResult<()>) {
        let mut inner = self.inner.lock();
        inner.frame_tx = None;
        if let Some(end_tx) = inner.end_tx.take() {
            let _ = end_tx.send(result);
        }
    }

    /// End the stream with a transport error.
    pub fn fail(&self, message: &str) {
        self.close_with(Err(TransportError::Sse(message.to_string())));
    }

    /// True while the client still holds the receiving side.
    #[must_use]
    pub fn is_client_attached(&self) -> bool {
        self.inner
            .lock()
            .frame_tx
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }
}
