//! `geotorget check`: find orders with a newer remote release.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};
use tokio_util::sync::CancellationToken;

use geotorget_core::{ManifestStore, OrderId};
use geotorget_sync::{staleness::preview_names, CheckEntry, SyncError, UpdateChecker, UpdateStatus};

use super::{cancel_on_ctrl_c, http_client, load_config};

/// Arguments for `geotorget check`.
#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Order id to check; omit to check every subscribed and local order.
    pub order_id: Option<OrderId>,

    /// Output root directory (default from config).
    #[arg(long, short)]
    pub output: Option<PathBuf>,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl CheckArgs {
    pub async fn run(self) -> Result<()> {
        let cfg = load_config(self.output)?;
        let cancel = CancellationToken::new();
        cancel_on_ctrl_c(cancel.clone());
        tracing::debug!(scope = ?cfg.check_scope, "checking for updates");

        let checker = UpdateChecker::new(http_client(&cfg)?, ManifestStore::new(&cfg.output_root))
            .with_scope(cfg.check_scope)
            .with_retry(cfg.retry)
            .with_cancellation(cancel);

        let entries = match self.order_id {
            Some(order_id) => {
                let status = checker
                    .check(&order_id)
                    .await
                    .with_context(|| format!("update check failed for order {order_id}"))?;
                vec![CheckEntry {
                    order_id,
                    result: Ok(status),
                }]
            }
            None => checker.check_all().await.context("update check failed")?.entries,
        };

        if self.json {
            let rows: Vec<CheckJson> = entries.iter().map(CheckJson::from).collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
        } else if entries.is_empty() {
            println!("No orders to check.");
        } else {
            print_table(&entries);
        }

        let failed = entries.iter().filter(|e| e.result.is_err()).count();
        if failed > 0 {
            bail!("{failed} order(s) could not be checked");
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct CheckJson {
    order_id: String,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    remote_release_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    changed_files: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl From<&CheckEntry> for CheckJson {
    fn from(entry: &CheckEntry) -> Self {
        let mut row = CheckJson {
            order_id: entry.order_id.to_string(),
            status: status_key(&entry.result),
            remote_release_id: None,
            changed_files: Vec::new(),
            error: None,
        };
        match &entry.result {
            Ok(UpdateStatus::Stale {
                remote_release_id,
                changed_files,
            }) => {
                row.remote_release_id = Some(remote_release_id.to_string());
                row.changed_files = changed_files.clone();
            }
            Ok(_) => {}
            Err(err) => row.error = Some(err.to_string()),
        }
        row
    }
}

fn status_key(result: &Result<UpdateStatus, SyncError>) -> &'static str {
    match result {
        Ok(UpdateStatus::Unchanged) => "unchanged",
        Ok(UpdateStatus::Stale { .. }) => "stale",
        Ok(UpdateStatus::UnknownLocally) => "unknown_locally",
        Err(_) => "error",
    }
}

#[derive(Tabled)]
struct CheckRow {
    #[tabled(rename = "order")]
    order: String,
    #[tabled(rename = "status")]
    status: String,
    #[tabled(rename = "detail")]
    detail: String,
}

fn print_table(entries: &[CheckEntry]) {
    let rows: Vec<CheckRow> = entries
        .iter()
        .map(|e| {
            let (status, detail) = match &e.result {
                Ok(UpdateStatus::Unchanged) => ("up to date".to_string(), String::new()),
                Ok(UpdateStatus::Stale {
                    remote_release_id,
                    changed_files,
                }) => (
                    "update available".to_string(),
                    if changed_files.is_empty() {
                        format!("release {remote_release_id}")
                    } else {
                        format!("release {remote_release_id}: {}", preview_names(changed_files))
                    },
                ),
                Ok(UpdateStatus::UnknownLocally) => {
                    ("unknown locally".to_string(), "never synced".to_string())
                }
                Err(err) => ("error".to_string(), err.to_string()),
            };
            CheckRow {
                order: e.order_id.to_string(),
                status,
                detail,
            }
        })
        .collect();

    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");

    let stale = entries
        .iter()
        .filter(|e| matches!(e.result, Ok(UpdateStatus::Stale { .. })))
        .count();
    if stale > 0 {
        println!(
            "{} {stale} order(s) have updates. Run `geotorget sync <ORDER_ID>`.",
            "!".yellow()
        );
    } else {
        println!("{} No updates found.", "✓".green());
    }
}
