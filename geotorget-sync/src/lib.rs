//! # geotorget-sync
//!
//! Network client, bounded-parallel downloader and order synchronization.
//!
//! Build an [`OrderSynchronizer`] around a [`RemoteOrderClient`] and a
//! [`ManifestStore`](geotorget_core::ManifestStore), then call
//! [`OrderSynchronizer::sync_order`] or [`pipeline::run`]. Use
//! [`UpdateChecker`] to find orders with a newer remote release.

pub mod checksum;
pub mod client;
pub mod error;
pub mod pipeline;
mod retry;
pub mod scheduler;
pub mod staleness;
pub mod synchronizer;

pub use client::{ByteStream, FileBody, HttpOrderClient, RemoteOrderClient};
pub use error::{RemoteError, SyncError};
pub use scheduler::{
    DownloadOutcome, DownloadScheduler, FailureKind, FileFailure, FileReport, ProgressCallback,
    ProgressEvent, ScheduleResult, SchedulerOptions,
};
pub use staleness::{CheckEntry, UpdateChecker, UpdateReport, UpdateStatus};
pub use synchronizer::{
    CommitStatus, OrderRun, OrderSyncEntry, OrderSyncReport, OrderSynchronizer, SyncOptions,
    SyncPhase, SyncPlan,
};
