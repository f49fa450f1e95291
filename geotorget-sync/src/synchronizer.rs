//! Order Synchronizer: reconcile local order directories with the remote.
//!
//! ## `sync_order` phases
//!
//! 1. `Start`
//! 2. `FetchingManifest`: listing fetch, retried on transient errors.
//! 3. `SchedulingDownloads`: skip files already complete on disk.
//! 4. `AwaitingResults`: the Download Scheduler runs the remainder.
//! 5. `Committing`: only when every file is complete; the Manifest Store
//!    writes metadata, snapshot and finally the `SyncRecord` marker.
//! 6. `Done`, or `Failed` on `NotFound`, `Unauthorized` or a local fault.
//!
//! A partial run keeps completed files and leaves the previous `SyncRecord`
//! alone, so the next run fetches exactly the missing files.

use std::fmt;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use geotorget_core::{
    EngineConfig, ManifestStore, Order, OrderFile, OrderId, OrderMetadata, ReleaseId,
    RetrySettings, SyncRecord,
};

use crate::checksum::file_sha256_async;
use crate::client::RemoteOrderClient;
use crate::error::{io_err, SyncError};
use crate::retry::{with_retry, RetryError};
use crate::scheduler::{
    DownloadScheduler, FileReport, ProgressCallback, SchedulerOptions, DEFAULT_CHUNK_TIMEOUT,
};

// ---------------------------------------------------------------------------
// Options and reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Default worker count when a caller does not pass one.
    pub parallelism: usize,
    pub retry: RetrySettings,
    pub chunk_timeout: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            parallelism: geotorget_core::config::DEFAULT_PARALLELISM,
            retry: RetrySettings::default(),
            chunk_timeout: DEFAULT_CHUNK_TIMEOUT,
        }
    }
}

impl From<&EngineConfig> for SyncOptions {
    fn from(config: &EngineConfig) -> Self {
        Self {
            parallelism: config.effective_parallelism(),
            retry: config.retry,
            chunk_timeout: Duration::from_secs(config.request_timeout_secs.max(1)),
        }
    }
}

/// Per-invocation state of one order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Start,
    FetchingManifest,
    SchedulingDownloads,
    AwaitingResults,
    Committing,
    Done,
    Failed,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncPhase::Start => "start",
            SyncPhase::FetchingManifest => "fetching_manifest",
            SyncPhase::SchedulingDownloads => "scheduling_downloads",
            SyncPhase::AwaitingResults => "awaiting_results",
            SyncPhase::Committing => "committing",
            SyncPhase::Done => "done",
            SyncPhase::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// What a sync would do, computed without writing anything.
#[derive(Debug, Clone)]
pub struct SyncPlan {
    pub order: Order,
    pub to_download: Vec<OrderFile>,
    /// Files already complete on disk.
    pub skipped: Vec<String>,
}

/// Fate of the `SyncRecord` for one `sync_order` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStatus {
    /// A new record was written.
    Committed,
    /// Nothing changed; the existing record was left byte-identical.
    Unchanged,
    /// Some files failed; the previous record (if any) is untouched.
    NotCommitted,
    /// The caller cancelled before the commit.
    Cancelled,
}

impl fmt::Display for CommitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommitStatus::Committed => write!(f, "committed"),
            CommitStatus::Unchanged => write!(f, "unchanged"),
            CommitStatus::NotCommitted => write!(f, "partial"),
            CommitStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Structured outcome of `sync_order`: succeeded, failed and skipped files
/// plus the commit status.
#[derive(Debug, Clone)]
pub struct OrderSyncReport {
    pub order_id: OrderId,
    pub release_id: ReleaseId,
    /// Files handed to the scheduler, in listing order.
    pub files: Vec<FileReport>,
    pub skipped: Vec<String>,
    pub commit: CommitStatus,
}

impl OrderSyncReport {
    pub fn is_success(&self) -> bool {
        matches!(self.commit, CommitStatus::Committed | CommitStatus::Unchanged)
    }

    pub fn downloaded(&self) -> usize {
        self.files
            .iter()
            .filter(|f| f.outcome == crate::scheduler::DownloadOutcome::Complete)
            .count()
    }
}

/// Result for one order of a multi-order run.
#[derive(Debug)]
pub struct OrderRun<T> {
    pub order_id: OrderId,
    pub result: Result<T, SyncError>,
}

pub type OrderSyncEntry = OrderRun<OrderSyncReport>;

// ---------------------------------------------------------------------------
// OrderSynchronizer
// ---------------------------------------------------------------------------

/// Owns everything one sync invocation needs, including its cancellation token.
pub struct OrderSynchronizer {
    client: Arc<dyn RemoteOrderClient>,
    store: ManifestStore,
    options: SyncOptions,
    cancel: CancellationToken,
    progress: Option<ProgressCallback>,
}

impl OrderSynchronizer {
    pub fn new(client: Arc<dyn RemoteOrderClient>, store: ManifestStore, options: SyncOptions) -> Self {
        Self {
            client,
            store,
            options,
            cancel: CancellationToken::new(),
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that cancels every operation of this synchronizer.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn store(&self) -> &ManifestStore {
        &self.store
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// Current listing, with transient failures retried.
    pub async fn fetch_order(&self, order_id: &OrderId) -> Result<Order, SyncError> {
        with_retry(&self.options.retry, &self.cancel, "order listing", || {
            self.client.fetch_manifest(order_id)
        })
        .await
        .map_err(|e| match e {
            RetryError::Cancelled => SyncError::Cancelled,
            RetryError::Remote(err) => SyncError::from_remote(*order_id, err),
        })
    }

    /// Subscribed order ids, sorted.
    pub async fn subscribed_orders(&self) -> Result<Vec<OrderId>, SyncError> {
        with_retry(&self.options.retry, &self.cancel, "subscriptions", || {
            self.client.list_subscribed_orders()
        })
        .await
        .map_err(|e| match e {
            RetryError::Cancelled => SyncError::Cancelled,
            RetryError::Remote(err) => SyncError::Subscriptions(err),
        })
    }

    /// Fetch the listing and split it into files to download and files to skip.
    pub async fn plan_order(&self, order_id: &OrderId) -> Result<SyncPlan, SyncError> {
        let order = self.fetch_order(order_id).await?;
        if order.files.is_empty() {
            return Err(SyncError::EmptyOrder {
                order_id: *order_id,
            });
        }

        let dir = self.store.order_dir(order_id);
        let mut to_download = Vec::new();
        let mut skipped = Vec::new();
        for file in &order.files {
            if is_complete_locally(file, &dir).await? {
                skipped.push(file.name.clone());
            } else {
                to_download.push(file.clone());
            }
        }

        Ok(SyncPlan {
            order,
            to_download,
            skipped,
        })
    }

    /// Synchronize one order with at most `parallelism` concurrent downloads.
    ///
    /// Per-file failures are reported in the returned report; `Err` is for
    /// `NotFound`, `Unauthorized`, local faults, an empty listing, and
    /// cancellation before any download started.
    pub async fn sync_order(
        &self,
        order_id: &OrderId,
        parallelism: usize,
    ) -> Result<OrderSyncReport, SyncError> {
        let started_at = Utc::now();
        phase(order_id, SyncPhase::Start);
        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        phase(order_id, SyncPhase::FetchingManifest);
        let plan = self.plan_order(order_id).await.map_err(|e| failed(order_id, e))?;
        let SyncPlan {
            order,
            to_download,
            skipped,
        } = plan;

        phase(order_id, SyncPhase::SchedulingDownloads);
        tracing::info!(
            %order_id,
            release = %order.release_id,
            download = to_download.len(),
            skip = skipped.len(),
            parallelism,
            "syncing order"
        );
        let scheduler = DownloadScheduler::new(
            Arc::clone(&self.client),
            SchedulerOptions {
                parallelism: parallelism.max(1),
                retry: self.options.retry,
                chunk_timeout: self.options.chunk_timeout,
            },
        )
        .with_progress(self.progress.clone());

        phase(order_id, SyncPhase::AwaitingResults);
        let dir = self.store.order_dir(order_id);
        let result = scheduler
            .run(*order_id, &dir, to_download, &self.cancel)
            .await
            .map_err(|e| failed(order_id, e))?;

        let commit = if result.any_cancelled() || self.cancel.is_cancelled() {
            tracing::info!(%order_id, "sync cancelled, record not updated");
            CommitStatus::Cancelled
        } else if !result.all_complete() {
            for (name, failure) in result.failed() {
                tracing::warn!(%order_id, file = name, kind = %failure.kind, error = %failure.message, "file not synced");
            }
            CommitStatus::NotCommitted
        } else {
            phase(order_id, SyncPhase::Committing);
            self.commit(&order, &dir, started_at, result.reports.is_empty())
                .await
                .map_err(|e| failed(order_id, e))?
        };

        phase(order_id, SyncPhase::Done);
        Ok(OrderSyncReport {
            order_id: *order_id,
            release_id: order.release_id,
            files: result.reports,
            skipped,
            commit,
        })
    }

    /// Sync every subscribed order, one order at a time.
    ///
    /// Stops early on cancellation or a local fault; every other per-order
    /// error is recorded and the next order is attempted.
    pub async fn sync_all_subscribed(
        &self,
        parallelism: usize,
    ) -> Result<Vec<OrderSyncEntry>, SyncError> {
        let orders = self.subscribed_orders().await?;
        tracing::info!(orders = orders.len(), "syncing subscribed orders");

        let mut entries = Vec::with_capacity(orders.len());
        for order_id in orders {
            if self.cancel.is_cancelled() {
                break;
            }
            let result = self.sync_order(&order_id, parallelism).await;
            let stop = match &result {
                Err(e) => e.is_local_fault() || matches!(e, SyncError::Cancelled),
                Ok(report) => report.commit == CommitStatus::Cancelled,
            };
            entries.push(OrderRun { order_id, result });
            if stop {
                break;
            }
        }
        Ok(entries)
    }

    async fn commit(
        &self,
        order: &Order,
        dir: &Path,
        synced_at: DateTime<Utc>,
        nothing_downloaded: bool,
    ) -> Result<CommitStatus, SyncError> {
        let mut total_bytes = 0;
        for file in &order.files {
            let path = file.final_path(dir);
            let meta = tokio::fs::metadata(&path)
                .await
                .map_err(|e| io_err(&path, e))?;
            total_bytes += meta.len();
        }

        let record = SyncRecord {
            order_id: order.order_id,
            release_id_at_sync: order.release_id.clone(),
            synced_at,
            file_count: order.files.len(),
            total_bytes,
        };

        if nothing_downloaded {
            if let Some(existing) = self.store.load(&order.order_id)? {
                let same = existing.release_id_at_sync == record.release_id_at_sync
                    && existing.file_count == record.file_count
                    && existing.total_bytes == record.total_bytes;
                if same {
                    tracing::info!(order_id = %order.order_id, "order already current");
                    return Ok(CommitStatus::Unchanged);
                }
            }
        }

        let metadata = OrderMetadata::from_record(&record, order.files.clone());
        let uttag = (!order.delivers_uttag()).then_some(&order.listing);
        self.store.save(&order.order_id, &record, &metadata, uttag)?;
        tracing::info!(
            order_id = %order.order_id,
            release = %record.release_id_at_sync,
            files = record.file_count,
            bytes = record.total_bytes,
            "order committed"
        );
        Ok(CommitStatus::Committed)
    }
}

fn phase(order_id: &OrderId, phase: SyncPhase) {
    tracing::debug!(%order_id, %phase, "sync phase");
}

fn failed(order_id: &OrderId, err: SyncError) -> SyncError {
    tracing::debug!(%order_id, phase = %SyncPhase::Failed, error = %err, "sync phase");
    err
}

/// Whether `file` already sits complete at its final path.
///
/// Size, checksum and the remote `updated` stamp are each checked when the
/// listing provides them.
async fn is_complete_locally(file: &OrderFile, dir: &Path) -> Result<bool, SyncError> {
    let path = file.final_path(dir);
    let meta = match tokio::fs::metadata(&path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(io_err(&path, e)),
    };
    if !meta.is_file() {
        return Ok(false);
    }

    if let Some(size) = file.expected_size {
        if meta.len() != size {
            return Ok(false);
        }
    }

    if let Some(updated) = file.updated_at() {
        let modified: DateTime<Utc> = meta.modified().map_err(|e| io_err(&path, e))?.into();
        if modified < updated {
            return Ok(false);
        }
    }

    if let Some(expected) = &file.checksum {
        let digest = file_sha256_async(path.clone())
            .await
            .map_err(|e| io_err(&path, e))?;
        if &digest != expected {
            return Ok(false);
        }
    }

    Ok(true)
}
