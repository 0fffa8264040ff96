//! Pulse transport - how the visits client reaches its backend.
//!
//! - [`Transport`]: the injected request sender / push-stream opener
//! - [`HttpTransport`]: `reqwest` implementation with SSE framing
//! - [`Endpoints`]: URL table for every backend call
//! - [`ApiClient`]: typed calls under a [`FetchPolicy`] (timeout floor,
//!   in-flight de-duplication, 2xx cache, stale-on-error)

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod api;
mod endpoints;
mod error;
mod http;
mod request;
mod sse;
mod transport;

pub use api::*;
pub use endpoints::*;
pub use error::*;
pub use http::*;
pub use request::*;
pub use sse::*;
pub use transport::*;
