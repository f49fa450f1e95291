//! Shared sync pipeline entrypoint used by the CLI.

use geotorget_core::OrderId;

use crate::synchronizer::{OrderRun, OrderSyncEntry, OrderSynchronizer, SyncPlan};
use crate::SyncError;

/// Scope for a sync pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncScope {
    /// Sync every subscribed order.
    All,
    /// Sync a single order.
    Order(OrderId),
}

/// What a pipeline run produced.
#[derive(Debug)]
pub enum RunOutput {
    Synced(Vec<OrderSyncEntry>),
    /// `--dry-run`: nothing was written.
    Planned(Vec<OrderRun<SyncPlan>>),
}

impl RunOutput {
    /// Whether every order ended committed, unchanged, or (dry run) planned.
    pub fn is_success(&self) -> bool {
        match self {
            RunOutput::Synced(entries) => entries
                .iter()
                .all(|e| e.result.as_ref().map(|r| r.is_success()).unwrap_or(false)),
            RunOutput::Planned(entries) => entries.iter().all(|e| e.result.is_ok()),
        }
    }
}

/// Run the sync pipeline for a scope.
///
/// A single-order scope propagates that order's hard failure as `Err`; the
/// `All` scope only fails when subscriptions cannot be listed.
pub async fn run(
    sync: &OrderSynchronizer,
    scope: SyncScope,
    parallelism: usize,
    dry_run: bool,
) -> Result<RunOutput, SyncError> {
    match (scope, dry_run) {
        (SyncScope::Order(order_id), false) => {
            let report = sync.sync_order(&order_id, parallelism).await?;
            Ok(RunOutput::Synced(vec![OrderRun {
                order_id,
                result: Ok(report),
            }]))
        }
        (SyncScope::All, false) => Ok(RunOutput::Synced(sync.sync_all_subscribed(parallelism).await?)),
        (SyncScope::Order(order_id), true) => {
            let plan = sync.plan_order(&order_id).await?;
            Ok(RunOutput::Planned(vec![OrderRun {
                order_id,
                result: Ok(plan),
            }]))
        }
        (SyncScope::All, true) => {
            let mut plans = Vec::new();
            for order_id in sync.subscribed_orders().await? {
                let result = sync.plan_order(&order_id).await;
                if let Err(SyncError::Cancelled) = result {
                    return Err(SyncError::Cancelled);
                }
                plans.push(OrderRun { order_id, result });
            }
            Ok(RunOutput::Planned(plans))
        }
    }
}
