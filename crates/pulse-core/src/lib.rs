//! Pulse core - connectivity classification and event model for the visits client.
//!
//! This crate holds the pieces every other pulse crate reads before doing
//! network work:
//!
//! - **Connectivity**: a three-state health machine (`Online`/`Degraded`/`Offline`)
//!   driven by reported successes and failures, plus the jittered backoff calculator
//! - **Events**: the outbound event model persisted by the delivery queue
//! - **Identity**: structural validation of backend-issued signed identity tokens
//! - **Outcomes**: classification of backend responses into delivery outcomes
//! - **Configuration**: tunable thresholds for every component
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use pulse_core::{ConnectivityConfig, ConnectivityMonitor};
//!
//! let monitor = ConnectivityMonitor::new(ConnectivityConfig::default());
//! monitor.report_fail("timeout");
//! if !monitor.should_pause_heavy_work() {
//!     let wait = monitor.next_backoff(1_200, 18_000);
//!     // sleep for `wait`, then retry
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod config;
mod connectivity;
mod error;
mod event;
mod identity;
mod outcome;

pub use config::*;
pub use connectivity::*;
pub use error::*;
pub use event::*;
pub use identity::*;
pub use outcome::*;

/// Subject used when a caller does not name one.
pub const DEFAULT_SUBJECT: &str = "visits";

/// Normalize a subject key: trimmed, lower-cased, falling back to [`DEFAULT_SUBJECT`].
#[must_use]
pub fn normalize_subject(subject: &str) -> String {
    let trimmed = subject.trim().to_lowercase();
    if trimmed.is_empty() {
        DEFAULT_SUBJECT.to_string()
    } else {
        trimmed
    }
}
