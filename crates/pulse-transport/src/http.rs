//! `reqwest`-backed [`Transport`].

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CACHE_CONTROL, CONTENT_TYPE};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    HttpMethod, HttpRequest, HttpResponse, PUSH_CHANNEL_CAPACITY, PushConnection, PushFrame,
    ResponseBody, SseParser, Transport, TransportError, TransportResult, VISITOR_HEADER,
};

/// HTTP transport for requests and SSE subscriptions.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Create a transport with a default client.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new() -> TransportResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("pulse/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    /// Use a preconfigured client.
    #[must_use]
    pub const fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn execute(&self, request: &HttpRequest) -> reqwest::Result<HttpResponse> {
        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(&request.url),
            HttpMethod::Post => self.client.post(&request.url),
        }
        .header(CACHE_CONTROL, "no-store")
        .timeout(request.timeout);

        if let Some(credential) = &request.credential {
            builder = builder.header(VISITOR_HEADER, credential);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let visitor_id = response
            .headers()
            .get(VISITOR_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(ToString::to_string);

        if status == 204 {
            return Ok(HttpResponse {
                status,
                visitor_id,
                body: ResponseBody::Empty,
                error: None,
            });
        }

        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.to_ascii_lowercase().contains("application/json"));
        let raw = response.text().await?;
        let body = if raw.is_empty() {
            ResponseBody::Empty
        } else if is_json {
            serde_json::from_str(&raw).map_or(ResponseBody::Empty, ResponseBody::Json)
        } else {
            ResponseBody::Text(raw)
        };

        Ok(HttpResponse {
            status,
            visitor_id,
            body,
            error: None,
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: HttpRequest) -> HttpResponse {
        match self.execute(&request).await {
            Ok(response) => {
                debug!(
                    method = request.method.as_str(),
                    url = %request.url,
                    status = response.status,
                    "request completed"
                );
                response
            }
            Err(e) => {
                let kind = if e.is_timeout() { "timeout" } else { "network" };
                debug!(
                    method = request.method.as_str(),
                    url = %request.url,
                    kind,
                    error = %e,
                    "request failed without response"
                );
                HttpResponse::transport_failure(format!("{kind}: {e}"))
            }
        }
    }

    async fn open_stream(&self, url: &str, timeout: Duration) -> TransportResult<PushConnection> {
        let request = self
            .client
            .get(url)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-store")
            .send();

        let response = tokio::time::timeout(timeout, request)
            .await
            .map_err(|_| TransportError::Timeout(timeout))??;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(TransportError::Status { status, message });
        }

        info!(status = response.status().as_u16(), "push stream opened");

        let (frame_tx, frames) = mpsc::channel(PUSH_CHANNEL_CAPACITY);
        let join_handle = tokio::spawn(async move { read_stream(response, frame_tx).await });

        Ok(PushConnection {
            frames,
            join_handle,
        })
    }
}

/// Pump the response body through the SSE parser until it ends or the
/// receiver goes away.
async fn read_stream(
    response: reqwest::Response,
    frame_tx: mpsc::Sender<PushFrame>,
) -> TransportResult<()> {
    let mut stream = response.bytes_stream();
    let mut parser = SseParser::new();

    while let Some(chunk_result) = stream.next().await {
        let chunk: Bytes = match chunk_result {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(error = %e, "push stream read failed");
                return Err(e.into());
            }
        };

        for frame in parser.feed(&chunk)? {
            if frame_tx.send(frame).await.is_err() {
                debug!("push receiver dropped, stopping reader");
                return Ok(());
            }
        }
    }

    info!("push stream ended by server");
    Ok(())
}
