pub mod check;
pub mod config;
pub mod status;
pub mod sync;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use geotorget_core::EngineConfig;
use geotorget_sync::{HttpOrderClient, RemoteOrderClient};

/// Effective configuration, with `--output` taking precedence.
pub(crate) fn load_config(output: Option<PathBuf>) -> Result<EngineConfig> {
    let mut cfg = geotorget_core::config::load().context("failed to load ~/.geotorget/config.yaml")?;
    if let Some(dir) = output {
        cfg.output_root = dir;
    }
    Ok(cfg)
}

pub(crate) fn http_client(cfg: &EngineConfig) -> Result<Arc<dyn RemoteOrderClient>> {
    let client = HttpOrderClient::new(cfg).context("failed to set up HTTP client")?;
    Ok(Arc::new(client))
}

/// Cancel `token` on the first Ctrl-C.
pub(crate) fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("interrupted, cancelling...");
            token.cancel();
        }
    });
}

/// `1536` → `1.5 KB`
pub(crate) fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
