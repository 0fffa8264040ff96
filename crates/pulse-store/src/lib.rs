//! Pulse store - durable persistence for the visits client.
//!
//! - [`Storage`]: synchronous key/value collaborator, with [`MemoryStorage`]
//!   and the atomic-rename [`FileStorage`]
//! - [`JsonStore`]: JSON mirror plus a per-key write coalescer
//! - [`PersistentEventQueue`]: the outbound event queue
//! - [`IdentityStore`]: per-subject visitor identity and client metadata

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod error;
mod identity_store;
mod json_store;
mod queue;
mod storage;

pub use error::*;
pub use identity_store::*;
pub use json_store::*;
pub use queue::*;
pub use storage::*;
