//! Download Scheduler: bounded-parallel file downloads for one order.
//!
//! ## Per-file protocol
//!
//! 1. Wait for a worker slot. Slots are handed out in submission order.
//! 2. Stream the body into `<name>.part`, resuming an existing part file
//!    with a range request when possible. A part file older than the
//!    listing's `updated` stamp is discarded first.
//! 3. Validate the part file: size against the listing, SHA-256 when the
//!    listing carries one.
//! 4. Rename to `<name>` (atomic on POSIX).
//!
//! Transient failures are retried with exponential backoff while the slot is
//! held. Per-file failures are returned as data in [`ScheduleResult`]; only a
//! local I/O fault fails the whole run.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use geotorget_core::{DownloadState, OrderFile, OrderId, RetrySettings};

use crate::checksum::file_sha256_async;
use crate::client::RemoteOrderClient;
use crate::error::{io_err, RemoteError, SyncError};

/// Longest wait for response headers or the next body chunk before the
/// attempt counts as stalled.
pub const DEFAULT_CHUNK_TIMEOUT: Duration = Duration::from_secs(300);

/// Receives every [`ProgressEvent`]. Invoked concurrently from worker tasks.
pub type ProgressCallback = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

/// Emitted on every received chunk and every state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub order_id: OrderId,
    pub file_name: String,
    pub bytes_done: u64,
    pub bytes_total: Option<u64>,
    pub state: DownloadState,
    /// 1-based attempt number; 0 before the first attempt starts.
    pub attempt: u32,
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Transient,
    Permanent,
    Unauthorized,
    /// Downloaded bytes failed size or checksum validation.
    Corrupt,
}

impl FailureKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, FailureKind::Transient | FailureKind::Corrupt)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Transient => write!(f, "transient"),
            FailureKind::Permanent => write!(f, "permanent"),
            FailureKind::Unauthorized => write!(f, "unauthorized"),
            FailureKind::Corrupt => write!(f, "corrupt"),
        }
    }
}

/// Why a file ended in `failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl FileFailure {
    fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            message: message.into(),
        }
    }

    fn corrupt(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Corrupt,
            message: message.into(),
        }
    }
}

impl From<RemoteError> for FileFailure {
    fn from(err: RemoteError) -> Self {
        let kind = match &err {
            RemoteError::Transient(_) => FailureKind::Transient,
            RemoteError::Unauthorized { .. } => FailureKind::Unauthorized,
            RemoteError::Permanent { .. }
            | RemoteError::NotFound { .. }
            | RemoteError::InvalidListing(_) => FailureKind::Permanent,
        };
        Self {
            kind,
            message: err.to_string(),
        }
    }
}

/// Terminal state of one file for one scheduler run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Complete,
    Failed(FileFailure),
    Cancelled,
}

impl DownloadOutcome {
    pub fn state(&self) -> DownloadState {
        match self {
            DownloadOutcome::Complete => DownloadState::Complete,
            DownloadOutcome::Failed(_) => DownloadState::Failed,
            DownloadOutcome::Cancelled => DownloadState::Cancelled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReport {
    pub name: String,
    pub outcome: DownloadOutcome,
    /// Attempts actually started; 0 when the file never got a slot.
    pub attempts: u32,
    /// Size of the final file when complete, else 0.
    pub bytes: u64,
}

/// Per-file outcomes in submission order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleResult {
    pub reports: Vec<FileReport>,
}

impl ScheduleResult {
    pub fn get(&self, name: &str) -> Option<&FileReport> {
        self.reports.iter().find(|r| r.name == name)
    }

    pub fn all_complete(&self) -> bool {
        self.reports
            .iter()
            .all(|r| r.outcome == DownloadOutcome::Complete)
    }

    pub fn any_cancelled(&self) -> bool {
        self.reports
            .iter()
            .any(|r| r.outcome == DownloadOutcome::Cancelled)
    }

    pub fn failed(&self) -> impl Iterator<Item = (&str, &FileFailure)> {
        self.reports.iter().filter_map(|r| match &r.outcome {
            DownloadOutcome::Failed(failure) => Some((r.name.as_str(), failure)),
            _ => None,
        })
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub parallelism: usize,
    pub retry: RetrySettings,
    pub chunk_timeout: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            parallelism: geotorget_core::config::DEFAULT_PARALLELISM,
            retry: RetrySettings::default(),
            chunk_timeout: DEFAULT_CHUNK_TIMEOUT,
        }
    }
}

pub struct DownloadScheduler {
    client: Arc<dyn RemoteOrderClient>,
    options: SchedulerOptions,
    progress: Option<ProgressCallback>,
}

impl DownloadScheduler {
    pub fn new(client: Arc<dyn RemoteOrderClient>, options: SchedulerOptions) -> Self {
        Self {
            client,
            options,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: Option<ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    /// Download `files` into `order_dir` with at most `parallelism` in flight.
    ///
    /// Duplicate names are scheduled once. Returns `Err` only for local I/O
    /// faults; in that case sibling downloads are cancelled and their part
    /// files removed before returning.
    pub async fn run(
        &self,
        order_id: OrderId,
        order_dir: &Path,
        files: Vec<OrderFile>,
        cancel: &CancellationToken,
    ) -> Result<ScheduleResult, SyncError> {
        tokio::fs::create_dir_all(order_dir)
            .await
            .map_err(|e| io_err(order_dir, e))?;

        let reporter = Reporter {
            order_id,
            progress: self.progress.clone(),
        };
        let run_token = cancel.child_token();
        let semaphore = Arc::new(Semaphore::new(self.options.parallelism.max(1)));

        let mut seen = HashSet::new();
        let files: Vec<OrderFile> = files
            .into_iter()
            .filter(|f| {
                let fresh = seen.insert(f.name.clone());
                if !fresh {
                    tracing::warn!(%order_id, file = %f.name, "duplicate file submission ignored");
                }
                fresh
            })
            .collect();

        for file in &files {
            reporter.emit(&file.name, 0, file.expected_size, DownloadState::Pending, 0);
        }

        let mut admitted = Vec::with_capacity(files.len());
        for file in files {
            // Semaphore waiters are served FIFO, so admission follows submission order.
            let permit = tokio::select! {
                biased;
                _ = run_token.cancelled() => None,
                permit = Arc::clone(&semaphore).acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                admitted.push(Admission::NotStarted(file));
                continue;
            };

            let name = file.name.clone();
            let task = DownloadTask {
                file,
                order_dir: order_dir.to_path_buf(),
                client: Arc::clone(&self.client),
                options: self.options.clone(),
                reporter: reporter.clone(),
                cancel: run_token.clone(),
            };
            let handle = tokio::spawn(async move {
                let _permit = permit;
                task.run().await
            });
            admitted.push(Admission::Started(name, handle));
        }

        let mut reports = Vec::with_capacity(admitted.len());
        let mut fault: Option<LocalFault> = None;
        for admission in admitted {
            match admission {
                Admission::NotStarted(file) => {
                    reporter.emit(&file.name, 0, file.expected_size, DownloadState::Cancelled, 0);
                    reports.push(FileReport {
                        name: file.name,
                        outcome: DownloadOutcome::Cancelled,
                        attempts: 0,
                        bytes: 0,
                    });
                }
                Admission::Started(name, handle) => match handle.await {
                    Ok(Ok(report)) => reports.push(report),
                    Ok(Err(local)) => {
                        fault.get_or_insert(local);
                    }
                    Err(join_err) => reports.push(FileReport {
                        name,
                        outcome: DownloadOutcome::Failed(FileFailure {
                            kind: FailureKind::Permanent,
                            message: format!("download task aborted: {join_err}"),
                        }),
                        attempts: 1,
                        bytes: 0,
                    }),
                },
            }
        }

        if let Some(LocalFault { path, source }) = fault {
            return Err(io_err(path, source));
        }
        Ok(ScheduleResult { reports })
    }
}

enum Admission {
    NotStarted(OrderFile),
    Started(String, JoinHandle<Result<FileReport, LocalFault>>),
}

#[derive(Debug)]
struct LocalFault {
    path: PathBuf,
    source: std::io::Error,
}

enum AttemptError {
    Remote(FileFailure),
    Cancelled,
    Local(LocalFault),
}

fn local(path: &Path, source: std::io::Error) -> AttemptError {
    AttemptError::Local(LocalFault {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Clone)]
struct Reporter {
    order_id: OrderId,
    progress: Option<ProgressCallback>,
}

impl Reporter {
    fn emit(
        &self,
        file_name: &str,
        bytes_done: u64,
        bytes_total: Option<u64>,
        state: DownloadState,
        attempt: u32,
    ) {
        if let Some(progress) = &self.progress {
            progress(&ProgressEvent {
                order_id: self.order_id,
                file_name: file_name.to_owned(),
                bytes_done,
                bytes_total,
                state,
                attempt,
            });
        }
    }
}

// ---------------------------------------------------------------------------
// DownloadTask
// ---------------------------------------------------------------------------

/// One file's attempts within a run. Owned by the spawned worker.
struct DownloadTask {
    file: OrderFile,
    order_dir: PathBuf,
    client: Arc<dyn RemoteOrderClient>,
    options: SchedulerOptions,
    reporter: Reporter,
    cancel: CancellationToken,
}

impl DownloadTask {
    async fn run(self) -> Result<FileReport, LocalFault> {
        let part = self.file.part_path(&self.order_dir);
        let max_attempts = self.options.retry.max_attempts.max(1);
        let mut attempts = 0;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(self.cancelled(attempts, &part).await);
            }
            attempts += 1;

            let failure = match self.attempt(attempts).await {
                Ok(bytes) => {
                    self.reporter.emit(
                        &self.file.name,
                        bytes,
                        Some(bytes),
                        DownloadState::Complete,
                        attempts,
                    );
                    tracing::info!(file = %self.file.name, bytes, attempts, "downloaded");
                    return Ok(FileReport {
                        name: self.file.name.clone(),
                        outcome: DownloadOutcome::Complete,
                        attempts,
                        bytes,
                    });
                }
                Err(AttemptError::Cancelled) => return Ok(self.cancelled(attempts, &part).await),
                Err(AttemptError::Local(fault)) => {
                    remove_part(&part).await;
                    self.cancel.cancel();
                    tracing::error!(
                        file = %self.file.name,
                        path = %fault.path.display(),
                        error = %fault.source,
                        "local write fault, cancelling run"
                    );
                    return Err(fault);
                }
                Err(AttemptError::Remote(failure)) => failure,
            };

            if failure.kind == FailureKind::Corrupt {
                remove_part(&part).await;
            }

            if failure.kind.is_retryable() && attempts < max_attempts {
                let delay = self.options.retry.backoff(attempts);
                tracing::warn!(
                    file = %self.file.name,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %failure.message,
                    "download attempt failed, retrying"
                );
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Ok(self.cancelled(attempts, &part).await),
                    _ = tokio::time::sleep(delay) => continue,
                }
            }

            remove_part(&part).await;
            self.reporter.emit(
                &self.file.name,
                0,
                self.file.expected_size,
                DownloadState::Failed,
                attempts,
            );
            tracing::warn!(
                file = %self.file.name,
                attempts,
                kind = %failure.kind,
                error = %failure.message,
                "download failed"
            );
            return Ok(FileReport {
                name: self.file.name.clone(),
                outcome: DownloadOutcome::Failed(failure),
                attempts,
                bytes: 0,
            });
        }
    }

    /// One attempt: stream into the part file, validate, rename.
    async fn attempt(&self, attempt: u32) -> Result<u64, AttemptError> {
        let part = self.file.part_path(&self.order_dir);
        let expected = self.file.expected_size;

        let existing = match tokio::fs::metadata(&part).await {
            Ok(meta) if self.part_predates_release(&meta) => {
                tracing::debug!(file = %self.file.name, "part file predates remote release, discarding");
                remove_part(&part).await;
                0
            }
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => 0,
            Err(e) => return Err(local(&part, e)),
        };
        let resume_from = match expected {
            Some(size) if existing > size => 0,
            _ => existing,
        };

        self.reporter.emit(
            &self.file.name,
            resume_from,
            expected,
            DownloadState::Downloading,
            attempt,
        );

        // A part file left by a killed run may already hold every byte.
        if resume_from > 0 && expected == Some(resume_from) {
            return self.finish(&part).await;
        }

        let body = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(AttemptError::Cancelled),
            body = tokio::time::timeout(
                self.options.chunk_timeout,
                self.client.fetch_file(&self.file, resume_from),
            ) => match body {
                Ok(body) => body.map_err(|e| AttemptError::Remote(e.into()))?,
                Err(_) => {
                    return Err(AttemptError::Remote(FileFailure::transient(format!(
                        "no response within {}s",
                        self.options.chunk_timeout.as_secs()
                    ))))
                }
            },
        };

        let opened = if body.offset == 0 {
            if resume_from > 0 {
                tracing::debug!(file = %self.file.name, resume_from, "remote ignored range, restarting");
            }
            File::create(&part).await
        } else if body.offset == resume_from {
            OpenOptions::new().append(true).open(&part).await
        } else {
            remove_part(&part).await;
            return Err(AttemptError::Remote(FileFailure::transient(format!(
                "remote resumed at byte {} instead of {resume_from}",
                body.offset
            ))));
        };
        let mut out = opened.map_err(|e| local(&part, e))?;

        let total = body.total.or(expected);
        let mut done = body.offset;
        let mut stream = body.stream;
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(AttemptError::Cancelled),
                next = tokio::time::timeout(self.options.chunk_timeout, stream.next()) => next,
            };
            let chunk = match next {
                Err(_) => {
                    return Err(AttemptError::Remote(FileFailure::transient(format!(
                        "no data received for {}s",
                        self.options.chunk_timeout.as_secs()
                    ))))
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => return Err(AttemptError::Remote(e.into())),
                Ok(Some(Ok(chunk))) => chunk,
            };
            out.write_all(&chunk).await.map_err(|e| local(&part, e))?;
            done += chunk.len() as u64;
            self.reporter.emit(
                &self.file.name,
                done,
                total,
                DownloadState::Downloading,
                attempt,
            );
        }

        out.flush().await.map_err(|e| local(&part, e))?;
        out.sync_all().await.map_err(|e| local(&part, e))?;
        drop(out);

        // Keep the part file: the next attempt resumes from here.
        if let Some(total) = body.total {
            if done < total {
                return Err(AttemptError::Remote(FileFailure::transient(format!(
                    "stream ended after {done} of {total} bytes"
                ))));
            }
        }

        self.finish(&part).await
    }

    /// Validate the part file and move it to its final name.
    async fn finish(&self, part: &Path) -> Result<u64, AttemptError> {
        let actual = tokio::fs::metadata(part)
            .await
            .map_err(|e| local(part, e))?
            .len();

        if let Some(expected) = self.file.expected_size {
            if actual != expected {
                return Err(AttemptError::Remote(FileFailure::corrupt(format!(
                    "size mismatch: expected {expected} bytes, got {actual}"
                ))));
            }
        }

        if let Some(expected) = &self.file.checksum {
            let digest = file_sha256_async(part.to_path_buf())
                .await
                .map_err(|e| local(part, e))?;
            if &digest != expected {
                return Err(AttemptError::Remote(FileFailure::corrupt(format!(
                    "checksum mismatch: expected {expected}, got {digest}"
                ))));
            }
        }

        let final_path = self.file.final_path(&self.order_dir);
        tokio::fs::rename(part, &final_path)
            .await
            .map_err(|e| local(&final_path, e))?;
        Ok(actual)
    }

    /// A part file older than the listing's `updated` stamp holds bytes of
    /// an earlier release and must not be resumed.
    fn part_predates_release(&self, meta: &std::fs::Metadata) -> bool {
        let Some(updated) = self.file.updated_at() else {
            return false;
        };
        match meta.modified() {
            Ok(modified) => DateTime::<Utc>::from(modified) < updated,
            Err(_) => true,
        }
    }

    async fn cancelled(&self, attempts: u32, part: &Path) -> FileReport {
        remove_part(part).await;
        self.reporter.emit(
            &self.file.name,
            0,
            self.file.expected_size,
            DownloadState::Cancelled,
            attempts,
        );
        tracing::debug!(file = %self.file.name, "download cancelled");
        FileReport {
            name: self.file.name.clone(),
            outcome: DownloadOutcome::Cancelled,
            attempts,
            bytes: 0,
        }
    }
}

async fn remove_part(part: &Path) {
    match tokio::fs::remove_file(part).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %part.display(), error = %e, "failed to remove part file"),
    }
}
