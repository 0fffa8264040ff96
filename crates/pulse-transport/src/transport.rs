//! The transport seam between the client core and the network.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::{HttpRequest, HttpResponse, PushFrame, TransportResult};

/// Buffered frames per push connection.
pub const PUSH_CHANNEL_CAPACITY: usize = 256;

/// An open push subscription.
///
/// Frames arrive on `frames`; the channel closes when the stream ends or
/// fails, and `join_handle` then resolves with the reason.
#[derive(Debug)]
pub struct PushConnection {
    /// Received frames.
    pub frames: mpsc::Receiver<PushFrame>,
    /// Reader task.
    pub join_handle: JoinHandle<TransportResult<()>>,
}

impl PushConnection {
    /// Stop the reader task.
    pub fn close(self) {
        self.join_handle.abort();
    }
}

/// Request sender and connection opener.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform one request. Timeouts and network errors yield status 0.
    async fn send(&self, request: HttpRequest) -> HttpResponse;

    /// Open a server-push subscription at `url`.
    ///
    /// The credential travels in the URL; there is no header channel.
    async fn open_stream(&self, url: &str, timeout: Duration) -> TransportResult<PushConnection>;
}
