//! Pulse sync - the moving parts of the visits client.
//!
//! - [`DeliveryCoordinator`]: identity handshake, event tracking and the
//!   batched queue flush, with auth and overload pauses
//! - [`StreamSupervisor`]: one realtime subscription, its watchdog, the
//!   reconnect scheduler and the online-count poll
//! - [`HeavyRefresher`]: periodic profile, insights and total pulls
//! - [`Observers`]: watch channels the UI renders from
//!
//! Every component shares one [`pulse_core::ConnectivityMonitor`] and backs
//! off through it.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod delivery;
mod error;
mod observers;
mod push;
mod refresher;
mod supervisor;

pub use delivery::*;
pub use error::*;
pub use observers::*;
pub use push::*;
pub use refresher::*;
pub use supervisor::*;
