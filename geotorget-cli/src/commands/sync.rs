//! `geotorget sync`: download orders into the output root.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tabled::{settings::Style, Table, Tabled};

use geotorget_core::{DownloadState, ManifestStore, OrderId};
use geotorget_sync::{
    pipeline::{self, RunOutput, SyncScope},
    CommitStatus, DownloadOutcome, OrderRun, OrderSyncReport, OrderSynchronizer, ProgressCallback,
    ProgressEvent, SyncOptions, SyncPlan,
};

use super::{cancel_on_ctrl_c, format_bytes, http_client, load_config};

/// Arguments for `geotorget sync`.
#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Order id (UUID) to sync; omit when using `--all`.
    #[arg(required_unless_present = "all")]
    pub order_id: Option<OrderId>,

    /// Sync every subscribed order.
    #[arg(long, conflicts_with = "order_id")]
    pub all: bool,

    /// Output root directory (default from config, then ~/Downloads/geotorget).
    #[arg(long, short)]
    pub output: Option<PathBuf>,

    /// Concurrent downloads within an order.
    #[arg(long, short)]
    pub parallel: Option<usize>,

    /// Show what would be downloaded without writing anything.
    #[arg(long)]
    pub dry_run: bool,
}

impl SyncArgs {
    pub async fn run(self) -> Result<()> {
        let cfg = load_config(self.output)?;
        let parallelism = self.parallel.unwrap_or(cfg.parallelism).max(1);
        let bars = Arc::new(ProgressBars::default());
        tracing::debug!(
            output_root = %cfg.output_root.display(),
            parallelism,
            dry_run = self.dry_run,
            "starting sync"
        );

        let sync = OrderSynchronizer::new(
            http_client(&cfg)?,
            ManifestStore::new(&cfg.output_root),
            SyncOptions::from(&cfg),
        )
        .with_progress(bars.callback());
        cancel_on_ctrl_c(sync.cancellation_token());

        let scope = match self.order_id {
            Some(order_id) => SyncScope::Order(order_id),
            None => SyncScope::All,
        };
        let output = pipeline::run(&sync, scope.clone(), parallelism, self.dry_run)
            .await
            .with_context(|| match scope {
                SyncScope::Order(order_id) => format!("sync failed for order {order_id}"),
                SyncScope::All => "sync --all failed".to_string(),
            });
        bars.clear();
        let output = output?;

        match &output {
            RunOutput::Planned(plans) => {
                if plans.is_empty() {
                    println!("No subscribed orders.");
                }
                for plan in plans {
                    print_plan(plan);
                }
            }
            RunOutput::Synced(entries) => {
                if entries.is_empty() {
                    println!("No subscribed orders.");
                }
                for entry in entries {
                    print_entry(entry);
                }
                println!("Output: {}", cfg.output_root.display());
            }
        }

        if !output.is_success() {
            bail!("one or more orders did not sync completely");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Progress bars
// ---------------------------------------------------------------------------

/// One bar per in-flight file, fed by the scheduler's progress events.
#[derive(Default)]
struct ProgressBars {
    multi: MultiProgress,
    bars: Mutex<HashMap<(OrderId, String), ProgressBar>>,
}

impl ProgressBars {
    fn callback(self: &Arc<Self>) -> ProgressCallback {
        let this = Arc::clone(self);
        Arc::new(move |event: &ProgressEvent| this.update(event))
    }

    fn update(&self, event: &ProgressEvent) {
        let Ok(mut bars) = self.bars.lock() else {
            return;
        };
        let key = (event.order_id, event.file_name.clone());
        match event.state {
            DownloadState::Pending => {}
            DownloadState::Downloading => {
                let bar = bars
                    .entry(key)
                    .or_insert_with(|| self.new_bar(&event.file_name, event.bytes_total));
                if let Some(total) = event.bytes_total {
                    bar.set_length(total);
                }
                bar.set_position(event.bytes_done);
            }
            DownloadState::Complete => {
                if let Some(bar) = bars.remove(&key) {
                    bar.finish_and_clear();
                }
            }
            DownloadState::Failed | DownloadState::Cancelled => {
                if let Some(bar) = bars.remove(&key) {
                    bar.abandon_with_message(format!("{} ({})", event.file_name, event.state));
                }
            }
        }
    }

    fn new_bar(&self, name: &str, total: Option<u64>) -> ProgressBar {
        let bar = self.multi.add(ProgressBar::new(total.unwrap_or(0)));
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} {msg:30} [{bar:30.cyan/blue}] {bytes}/{total_bytes} {bytes_per_sec}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
        );
        bar.set_message(name.to_owned());
        bar
    }

    fn clear(&self) {
        if let Ok(mut bars) = self.bars.lock() {
            for (_, bar) in bars.drain() {
                bar.finish_and_clear();
            }
        }
        let _ = self.multi.clear();
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

#[derive(Tabled)]
struct FileRow {
    #[tabled(rename = "file")]
    file: String,
    #[tabled(rename = "result")]
    result: String,
    #[tabled(rename = "attempts")]
    attempts: u32,
    #[tabled(rename = "size")]
    size: String,
    #[tabled(rename = "detail")]
    detail: String,
}

fn print_entry(entry: &OrderRun<OrderSyncReport>) {
    let report = match &entry.result {
        Ok(report) => report,
        Err(err) => {
            println!("{} order {}: {err}", "✗".red(), entry.order_id);
            return;
        }
    };

    let marker = match report.commit {
        CommitStatus::Committed | CommitStatus::Unchanged => "✓".green(),
        CommitStatus::NotCommitted => "✗".red(),
        CommitStatus::Cancelled => "!".yellow(),
    };
    println!(
        "{marker} order {} ({}): {} downloaded, {} skipped, {}",
        report.order_id,
        report.release_id,
        report.downloaded(),
        report.skipped.len(),
        report.commit
    );

    if report.files.is_empty() {
        return;
    }
    let rows: Vec<FileRow> = report
        .files
        .iter()
        .map(|f| {
            let (result, detail) = match &f.outcome {
                DownloadOutcome::Complete => ("complete".to_string(), String::new()),
                DownloadOutcome::Failed(failure) => {
                    (format!("failed ({})", failure.kind), failure.message.clone())
                }
                DownloadOutcome::Cancelled => ("cancelled".to_string(), String::new()),
            };
            FileRow {
                file: f.name.clone(),
                result,
                attempts: f.attempts,
                size: if f.bytes > 0 {
                    format_bytes(f.bytes)
                } else {
                    "-".to_string()
                },
                detail,
            }
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
}

fn print_plan(entry: &OrderRun<SyncPlan>) {
    let plan = match &entry.result {
        Ok(plan) => plan,
        Err(err) => {
            println!("[dry-run] {} order {}: {err}", "✗".red(), entry.order_id);
            return;
        }
    };
    println!(
        "[dry-run] order {} ({}): {} to download, {} already complete, {} advertised",
        entry.order_id,
        plan.order.release_id,
        plan.to_download.len(),
        plan.skipped.len(),
        format_bytes(plan.order.advertised_bytes())
    );
    for file in &plan.to_download {
        let size = file
            .expected_size
            .map(format_bytes)
            .unwrap_or_else(|| "size unknown".to_string());
        println!("  ~  {} ({size})", file.name);
    }
    for name in &plan.skipped {
        println!("  ·  {name}");
    }
}
