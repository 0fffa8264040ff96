//! Transport-neutral request and response types.

use std::time::Duration;

use pulse_core::{DeliveryOutcome, STATUS_TRANSPORT};
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Request/response header carrying the visitor identity.
pub const VISITOR_HEADER: &str = "X-Visitor-Id";

/// HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    /// GET.
    Get,
    /// POST.
    Post,
}

impl HttpMethod {
    /// Upper-case method name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
        }
    }
}

/// One request to the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    /// Method.
    pub method: HttpMethod,
    /// Absolute URL.
    pub url: String,
    /// Identity sent in [`VISITOR_HEADER`]; `None` for anonymous calls.
    pub credential: Option<String>,
    /// JSON body.
    pub body: Option<Value>,
    /// Hard deadline; expiry resolves to status 0.
    pub timeout: Duration,
}

impl HttpRequest {
    /// GET with a default 6.5s timeout.
    #[must_use]
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            credential: None,
            body: None,
            timeout: Duration::from_millis(6_500),
        }
    }

    /// POST with a default 6.5s timeout.
    #[must_use]
    pub fn post(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Post,
            ..Self::get(url)
        }
    }

    /// Builder: attach a credential. Blank values are dropped.
    #[must_use]
    pub fn with_credential(mut self, credential: Option<&str>) -> Self {
        self.credential = credential
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(ToString::to_string);
        self
    }

    /// Builder: attach a JSON body.
    #[must_use]
    pub fn with_json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Builder: set the timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Decoded response body.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum ResponseBody {
    /// No body (204, transport failure, unreadable body).
    #[default]
    Empty,
    /// JSON body.
    Json(Value),
    /// Any other body.
    Text(String),
}

impl ResponseBody {
    /// The JSON value, if the body was JSON.
    #[must_use]
    pub const fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }
}

/// Outcome of one request. Never an error: no response means status 0.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HttpResponse {
    /// HTTP status, or 0 when nothing came back.
    pub status: u16,
    /// Renewed identity from [`VISITOR_HEADER`], if present.
    pub visitor_id: Option<String>,
    /// Body.
    pub body: ResponseBody,
    /// Client-side failure description for status 0.
    pub error: Option<String>,
}

impl HttpResponse {
    /// Response with a status and body.
    #[must_use]
    pub const fn new(status: u16, body: ResponseBody) -> Self {
        Self {
            status,
            visitor_id: None,
            body,
            error: None,
        }
    }

    /// Response with a JSON body.
    #[must_use]
    pub const fn json(status: u16, body: Value) -> Self {
        Self::new(status, ResponseBody::Json(body))
    }

    /// No response at all.
    #[must_use]
    pub fn transport_failure(error: impl Into<String>) -> Self {
        Self {
            status: STATUS_TRANSPORT,
            visitor_id: None,
            body: ResponseBody::Empty,
            error: Some(error.into()),
        }
    }

    /// Builder: set the renewed identity.
    #[must_use]
    pub fn with_visitor_id(mut self, visitor_id: impl Into<String>) -> Self {
        self.visitor_id = Some(visitor_id.into());
        self
    }

    /// 2xx.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    /// Status classification.
    #[must_use]
    pub const fn outcome(&self) -> DeliveryOutcome {
        DeliveryOutcome::from_status(self.status)
    }

    /// Decode the JSON body into `T`.
    #[must_use]
    pub fn decode<T: DeserializeOwned>(&self) -> Option<T> {
        self.body
            .as_json()
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }
}
