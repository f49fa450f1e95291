//! Error types for geotorget-sync.

use std::path::PathBuf;

use thiserror::Error;

use geotorget_core::{OrderId, StoreError};

/// Failure reported by a [`RemoteOrderClient`](crate::client::RemoteOrderClient).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// Network fault, timeout, or 5xx. Retryable.
    #[error("transient remote failure: {0}")]
    Transient(String),

    /// Client-side request fault such as a missing remote file. Never retried.
    #[error("remote rejected request{}: {}", http_suffix(.status), .message)]
    Permanent { status: Option<u16>, message: String },

    /// Access denied. Never retried.
    #[error("access denied by remote (HTTP {status})")]
    Unauthorized { status: u16 },

    /// The order id is unknown to the remote system.
    #[error("{what} not found on remote")]
    NotFound { what: String },

    /// The remote answered with a listing this engine cannot use.
    #[error("invalid order listing: {0}")]
    InvalidListing(String),
}

impl RemoteError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Transient(_))
    }
}

/// All errors that can abort a sync or update check.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("order {order_id} not found or has no delivery ready")]
    NotFound { order_id: OrderId },

    #[error("access to order {order_id} denied by remote")]
    Unauthorized { order_id: OrderId },

    /// Listing fetch failed after retries, or the listing was unusable.
    #[error("remote error for order {order_id}: {source}")]
    Remote {
        order_id: OrderId,
        #[source]
        source: RemoteError,
    },

    /// Subscription enumeration failed.
    #[error("could not list subscribed orders: {0}")]
    Subscriptions(#[source] RemoteError),

    /// The output root cannot be written (disk full, permissions).
    #[error("I/O error at {path}: {source}")]
    LocalIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("manifest store error: {0}")]
    Store(#[from] StoreError),

    #[error("order {order_id} lists no files")]
    EmptyOrder { order_id: OrderId },

    #[error("cancelled")]
    Cancelled,
}

impl SyncError {
    /// Map a remote failure on `order_id`'s listing to the sync taxonomy.
    pub fn from_remote(order_id: OrderId, err: RemoteError) -> Self {
        match err {
            RemoteError::NotFound { .. } => SyncError::NotFound { order_id },
            RemoteError::Unauthorized { .. } => SyncError::Unauthorized { order_id },
            other => SyncError::Remote {
                order_id,
                source: other,
            },
        }
    }

    /// Whether the failure is a fault of the local environment.
    pub fn is_local_fault(&self) -> bool {
        matches!(
            self,
            SyncError::LocalIo { .. } | SyncError::Store(StoreError::Io { .. })
        )
    }
}

fn http_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" with HTTP {s}")).unwrap_or_default()
}

/// Convenience constructor for [`SyncError::LocalIo`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SyncError {
    SyncError::LocalIo {
        path: path.into(),
        source,
    }
}
