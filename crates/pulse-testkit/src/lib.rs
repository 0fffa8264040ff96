//! Test support for pulse clients.
//!
//! - [`FakeTransport`]: scripted backend with per-endpoint responses and
//!   test-driven push streams ([`PushHandle`])
//! - [`Fixture`]: the shared client parts wired over in-memory storage
//! - [`LogCapture`]: JSON log capture for asserting on tracing output

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::missing_panics_doc)]

mod fixtures;
mod log_capture;
mod transport;

pub use fixtures::*;
pub use log_capture::*;
pub use transport::*;
