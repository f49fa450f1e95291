//! `geotorget status`: local orders and their last sync.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use geotorget_core::{ManifestStore, SyncRecord};
use geotorget_sync::staleness::format_datetime_age;

use super::{format_bytes, load_config};

/// Arguments for `geotorget status`.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Output root directory (default from config).
    #[arg(long, short)]
    pub output: Option<PathBuf>,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl StatusArgs {
    pub fn run(self) -> Result<()> {
        let cfg = load_config(self.output)?;
        let store = ManifestStore::new(&cfg.output_root);
        let ids = store
            .list_local_orders()
            .with_context(|| format!("failed to scan {}", cfg.output_root.display()))?;

        let mut orders = Vec::with_capacity(ids.len());
        for id in ids {
            let state = match store.load(&id) {
                Ok(Some(record)) => OrderState::Synced(record),
                Ok(None) => OrderState::NeverSynced,
                Err(err) => OrderState::Unreadable(err.to_string()),
            };
            orders.push((id, state));
        }

        if self.json {
            let report = StatusJson {
                output_root: cfg.output_root.display().to_string(),
                orders: orders.iter().map(|(id, state)| OrderJson::new(id, state)).collect(),
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
            return Ok(());
        }

        if orders.is_empty() {
            println!(
                "No orders under {}. Run `geotorget sync <ORDER_ID>` first.",
                cfg.output_root.display()
            );
            return Ok(());
        }
        print_table(&orders);
        Ok(())
    }
}

enum OrderState {
    Synced(SyncRecord),
    NeverSynced,
    Unreadable(String),
}

#[derive(Serialize)]
struct StatusJson {
    output_root: String,
    orders: Vec<OrderJson>,
}

#[derive(Serialize)]
struct OrderJson {
    order_id: String,
    synced: bool,
    release_id: Option<String>,
    synced_at: Option<String>,
    file_count: Option<usize>,
    total_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl OrderJson {
    fn new(id: &geotorget_core::OrderId, state: &OrderState) -> Self {
        let mut row = OrderJson {
            order_id: id.to_string(),
            synced: false,
            release_id: None,
            synced_at: None,
            file_count: None,
            total_bytes: None,
            error: None,
        };
        match state {
            OrderState::Synced(record) => {
                row.synced = true;
                row.release_id = Some(record.release_id_at_sync.to_string());
                row.synced_at = Some(record.synced_at.to_rfc3339());
                row.file_count = Some(record.file_count);
                row.total_bytes = Some(record.total_bytes);
            }
            OrderState::NeverSynced => {}
            OrderState::Unreadable(err) => row.error = Some(err.clone()),
        }
        row
    }
}

#[derive(Tabled)]
struct StatusRow {
    #[tabled(rename = "order")]
    order: String,
    #[tabled(rename = "state")]
    state: String,
    #[tabled(rename = "release")]
    release: String,
    #[tabled(rename = "last sync")]
    last_sync: String,
    #[tabled(rename = "files")]
    files: String,
    #[tabled(rename = "size")]
    size: String,
}

fn print_table(orders: &[(geotorget_core::OrderId, OrderState)]) {
    let rows: Vec<StatusRow> = orders
        .iter()
        .map(|(id, state)| match state {
            OrderState::Synced(record) => StatusRow {
                order: id.to_string(),
                state: "synced".to_string(),
                release: record.release_id_at_sync.to_string(),
                last_sync: format!("{} ago", format_datetime_age(record.synced_at)),
                files: record.file_count.to_string(),
                size: format_bytes(record.total_bytes),
            },
            OrderState::NeverSynced => StatusRow {
                order: id.to_string(),
                state: "never synced".to_string(),
                release: "-".to_string(),
                last_sync: "-".to_string(),
                files: "-".to_string(),
                size: "-".to_string(),
            },
            OrderState::Unreadable(err) => StatusRow {
                order: id.to_string(),
                state: "unreadable".to_string(),
                release: err.clone(),
                last_sync: "-".to_string(),
                files: "-".to_string(),
                size: "-".to_string(),
            },
        })
        .collect();

    let synced = orders
        .iter()
        .filter(|(_, s)| matches!(s, OrderState::Synced(_)))
        .count();

    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
    println!(
        "{} {synced} of {} order(s) synced",
        if synced == orders.len() {
            "✓".green()
        } else {
            "!".yellow()
        },
        orders.len()
    );
}
