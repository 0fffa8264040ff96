//! Error types for caller-initiated sync operations.
//!
//! Delivery itself never fails with these: it reports a
//! [`DeliveryOutcome`] and keeps the event queued. Only the explicit
//! device-linking calls surface errors.

use pulse_core::DeliveryOutcome;
use pulse_store::StoreError;

/// Sync operation errors.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The call needs a signed identity and none is stored.
    #[error("no signed identity for subject {subject}")]
    NoSignedIdentity {
        /// Subject that was asked for.
        subject: String,
    },

    /// The backend answered with a non-success status (0 when nothing came back).
    #[error("backend call {call} failed: {outcome} (status {status})")]
    Backend {
        /// Which call failed.
        call: &'static str,
        /// Classification of the answer.
        outcome: DeliveryOutcome,
        /// Raw status.
        status: u16,
    },

    /// A success response did not carry the expected payload.
    #[error("malformed {0} response")]
    MalformedResponse(&'static str),

    /// The link code was empty.
    #[error("link code must not be empty")]
    EmptyLinkCode,

    /// Persisting local state failed.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;
