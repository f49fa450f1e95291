//! Update Checker: compares committed releases with the remote.
//!
//! Classification for one order:
//! 1. `UnknownLocally` when the store has no committed `SyncRecord` (no
//!    network request is made)
//! 2. `Unchanged` when the remote release id equals `release_id_at_sync`
//! 3. `Stale` otherwise
//!
//! Release ids are opaque and only compared by equality.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use geotorget_core::{CheckScope, ManifestStore, Order, OrderFile, OrderId, ReleaseId, RetrySettings};

use crate::client::RemoteOrderClient;
use crate::retry::{with_retry, RetryError};
use crate::SyncError;

/// Result of checking one order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateStatus {
    Unchanged,
    Stale {
        remote_release_id: ReleaseId,
        /// New or changed files, in listing order. Informational.
        changed_files: Vec<String>,
    },
    UnknownLocally,
}

/// One row of a batch check.
#[derive(Debug)]
pub struct CheckEntry {
    pub order_id: OrderId,
    pub result: Result<UpdateStatus, SyncError>,
}

/// Batch check result, sorted by order id.
#[derive(Debug, Default)]
pub struct UpdateReport {
    pub entries: Vec<CheckEntry>,
}

impl UpdateReport {
    pub fn stale(&self) -> impl Iterator<Item = &OrderId> {
        self.entries.iter().filter_map(|e| match e.result {
            Ok(UpdateStatus::Stale { .. }) => Some(&e.order_id),
            _ => None,
        })
    }

    pub fn errors(&self) -> impl Iterator<Item = (&OrderId, &SyncError)> {
        self.entries
            .iter()
            .filter_map(|e| e.result.as_ref().err().map(|err| (&e.order_id, err)))
    }
}

pub struct UpdateChecker {
    client: Arc<dyn RemoteOrderClient>,
    store: ManifestStore,
    scope: CheckScope,
    retry: RetrySettings,
    cancel: CancellationToken,
}

impl UpdateChecker {
    pub fn new(client: Arc<dyn RemoteOrderClient>, store: ManifestStore) -> Self {
        Self {
            client,
            store,
            scope: CheckScope::default(),
            retry: RetrySettings::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_scope(mut self, scope: CheckScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_retry(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub async fn check(&self, order_id: &OrderId) -> Result<UpdateStatus, SyncError> {
        let Some(record) = self.store.load(order_id)? else {
            tracing::debug!(%order_id, "no committed sync record");
            return Ok(UpdateStatus::UnknownLocally);
        };

        let order = self.fetch_order(order_id).await?;
        if order.release_id == record.release_id_at_sync {
            tracing::debug!(%order_id, release = %order.release_id, "order is current");
            return Ok(UpdateStatus::Unchanged);
        }

        let local_files = self
            .store
            .load_metadata(order_id)?
            .map(|m| m.files)
            .unwrap_or_default();
        let changed_files = changed_files(&local_files, &order.files);
        tracing::info!(
            %order_id,
            local = %record.release_id_at_sync,
            remote = %order.release_id,
            changed = changed_files.len(),
            "order has a newer release"
        );
        Ok(UpdateStatus::Stale {
            remote_release_id: order.release_id,
            changed_files,
        })
    }

    /// Check every subscribed and/or local order, depending on the scope.
    ///
    /// Only subscription enumeration, local directory scan, and cancellation
    /// abort the batch; per-order failures are recorded in the report.
    pub async fn check_all(&self) -> Result<UpdateReport, SyncError> {
        let subscribed = with_retry(&self.retry, &self.cancel, "subscriptions", || {
            self.client.list_subscribed_orders()
        })
        .await
        .map_err(|e| match e {
            RetryError::Cancelled => SyncError::Cancelled,
            RetryError::Remote(err) => SyncError::Subscriptions(err),
        })?;
        let local = self.store.list_local_orders()?;

        let targets = select_targets(self.scope, &subscribed, &local);
        tracing::info!(
            subscribed = subscribed.len(),
            local = local.len(),
            targets = targets.len(),
            scope = ?self.scope,
            "checking orders for updates"
        );

        let mut entries = Vec::with_capacity(targets.len());
        for order_id in targets {
            if self.cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            let result = self.check(&order_id).await;
            if let Err(SyncError::Cancelled) = result {
                return Err(SyncError::Cancelled);
            }
            entries.push(CheckEntry { order_id, result });
        }
        Ok(UpdateReport { entries })
    }

    async fn fetch_order(&self, order_id: &OrderId) -> Result<Order, SyncError> {
        with_retry(&self.retry, &self.cancel, "order listing", || {
            self.client.fetch_manifest(order_id)
        })
        .await
        .map_err(|e| match e {
            RetryError::Cancelled => SyncError::Cancelled,
            RetryError::Remote(err) => SyncError::from_remote(*order_id, err),
        })
    }
}

fn select_targets(scope: CheckScope, subscribed: &[OrderId], local: &[OrderId]) -> BTreeSet<OrderId> {
    let subscribed: BTreeSet<OrderId> = subscribed.iter().copied().collect();
    let local: BTreeSet<OrderId> = local.iter().copied().collect();
    match scope {
        CheckScope::Union => subscribed.union(&local).copied().collect(),
        CheckScope::Intersect => subscribed.intersection(&local).copied().collect(),
    }
}

/// Remote files that are new or whose size, stamp or checksum moved.
fn changed_files(local: &[OrderFile], remote: &[OrderFile]) -> Vec<String> {
    remote
        .iter()
        .filter(|r| match local.iter().find(|l| l.name == r.name) {
            None => true,
            Some(l) => {
                l.expected_size != r.expected_size
                    || l.updated != r.updated
                    || l.checksum != r.checksum
            }
        })
        .map(|f| f.name.clone())
        .collect()
}

/// `a.gpkg, b.gpkg, c.gpkg, +2 more`
pub fn preview_names(names: &[String]) -> String {
    let mut shown: Vec<String> = names.iter().take(3).cloned().collect();
    if names.len() > shown.len() {
        shown.push(format!("+{} more", names.len() - shown.len()));
    }
    shown.join(", ")
}

/// Format age from a chrono timestamp (`synced_at`).
pub fn format_datetime_age(timestamp: DateTime<Utc>) -> String {
    let age = Utc::now().signed_duration_since(timestamp).num_seconds().max(0) as u64;
    format_seconds(age)
}

fn format_seconds(seconds: u64) -> String {
    if seconds < 60 {
        return format!("{seconds}s");
    }
    if seconds < 60 * 60 {
        return format!("{}m", seconds / 60);
    }
    if seconds < 60 * 60 * 24 {
        return format!("{}h", seconds / (60 * 60));
    }
    format!("{}d", seconds / (60 * 60 * 24))
}
