//! Manifest Store: durable per-order state under the output root.
//!
//! # Storage layout
//!
//! ```text
//! <output_root>/
//!   <order_id>/
//!     order_metadata.json   (local record, read by the dashboard)
//!     uttag.json            (verbatim remote listing snapshot)
//!     sync_record.json      (commit marker, renamed into place last)
//!     <file>...             (downloaded artifacts)
//! ```
//!
//! # Commit protocol
//!
//! [`ManifestStore::save`] serializes every document to a `.tmp` sibling
//! first, then renames them in a fixed order with the marker last. A reader
//! that finds `sync_record.json` therefore always finds the metadata it
//! describes. An interrupted commit leaves the previous marker (or none) in
//! place, so [`ManifestStore::load`] keeps reporting the previous state.

use std::fs::File;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{io_err, StoreError};
use crate::types::{
    OrderId, OrderMetadata, SyncRecord, ORDER_METADATA_FILE, SYNC_RECORD_FILE, UTTAG_FILE,
};

/// File-system resident record of what has been synced per order.
///
/// This is the only component that writes `order_metadata.json`,
/// `uttag.json` or `sync_record.json`.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    root: PathBuf,
}

impl ManifestStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<output_root>/<order_id>/`: pure, no I/O.
    pub fn order_dir(&self, order_id: &OrderId) -> PathBuf {
        self.root.join(order_id.to_string())
    }

    /// `<output_root>/<order_id>/sync_record.json`: pure, no I/O.
    pub fn record_path(&self, order_id: &OrderId) -> PathBuf {
        self.order_dir(order_id).join(SYNC_RECORD_FILE)
    }

    /// `<output_root>/<order_id>/order_metadata.json`: pure, no I/O.
    pub fn metadata_path(&self, order_id: &OrderId) -> PathBuf {
        self.order_dir(order_id).join(ORDER_METADATA_FILE)
    }

    /// `<output_root>/<order_id>/uttag.json`: pure, no I/O.
    pub fn uttag_path(&self, order_id: &OrderId) -> PathBuf {
        self.order_dir(order_id).join(UTTAG_FILE)
    }

    /// Create the order directory if needed and return it.
    pub fn ensure_order_dir(&self, order_id: &OrderId) -> Result<PathBuf, StoreError> {
        let dir = self.order_dir(order_id);
        std::fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        Ok(dir)
    }

    // -----------------------------------------------------------------------
    // Load
    // -----------------------------------------------------------------------

    /// Load the committed [`SyncRecord`] for an order.
    ///
    /// Returns `Ok(None)` when the marker is absent, even if metadata files
    /// from an interrupted commit are present.
    pub fn load(&self, order_id: &OrderId) -> Result<Option<SyncRecord>, StoreError> {
        read_json(&self.record_path(order_id))
    }

    /// Load `order_metadata.json`, but only when it belongs to the committed
    /// `SyncRecord`. Metadata from another commit reads as `None`.
    pub fn load_metadata(&self, order_id: &OrderId) -> Result<Option<OrderMetadata>, StoreError> {
        let Some(record) = self.load(order_id)? else {
            return Ok(None);
        };
        let metadata: Option<OrderMetadata> = read_json(&self.metadata_path(order_id))?;
        Ok(metadata.filter(|m| {
            let matches = m.release_id == record.release_id_at_sync && m.download_date == record.synced_at;
            if !matches {
                tracing::warn!(
                    %order_id,
                    record = %record.release_id_at_sync,
                    metadata = %m.release_id,
                    "order metadata does not match sync record, ignoring"
                );
            }
            matches
        }))
    }

    /// Enumerate orders present under the output root by directory scan.
    ///
    /// Directories whose name is not a UUID are ignored. Sorted by order id.
    pub fn list_local_orders(&self) -> Result<Vec<OrderId>, StoreError> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(io_err(&self.root, e)),
        };

        let mut ids: Vec<OrderId> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter_map(|e| e.file_name().to_str().and_then(|n| n.parse().ok()))
            .collect();
        ids.sort();
        Ok(ids)
    }

    // -----------------------------------------------------------------------
    // Save (atomic)
    // -----------------------------------------------------------------------

    /// Commit a sync for `order_id`.
    ///
    /// `uttag` is `None` when the order delivers its own `uttag.json`; the
    /// downloaded file is then left as-is.
    pub fn save(
        &self,
        order_id: &OrderId,
        record: &SyncRecord,
        metadata: &OrderMetadata,
        uttag: Option<&serde_json::Value>,
    ) -> Result<(), StoreError> {
        let dir = self.ensure_order_dir(order_id)?;

        let mut staged: Vec<(PathBuf, PathBuf)> = Vec::with_capacity(3);
        let staging = (|| -> Result<(), StoreError> {
            if let Some(listing) = uttag {
                staged.push(stage_json(&dir, UTTAG_FILE, listing)?);
            }
            staged.push(stage_json(&dir, ORDER_METADATA_FILE, metadata)?);
            staged.push(stage_json(&dir, SYNC_RECORD_FILE, record)?);
            Ok(())
        })();
        if let Err(e) = staging {
            for (tmp, _) in &staged {
                let _ = std::fs::remove_file(tmp);
            }
            return Err(e);
        }

        // Old marker goes first; an interrupted re-commit reads as never synced.
        let marker = self.record_path(order_id);
        match std::fs::remove_file(&marker) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                for (tmp, _) in &staged {
                    let _ = std::fs::remove_file(tmp);
                }
                return Err(io_err(&marker, e));
            }
        }

        let mut pending = staged.iter();
        while let Some((tmp, path)) = pending.next() {
            if let Err(e) = std::fs::rename(tmp, path) {
                let _ = std::fs::remove_file(tmp);
                for (rest, _) in pending.by_ref() {
                    let _ = std::fs::remove_file(rest);
                }
                return Err(io_err(path, e));
            }
        }

        tracing::debug!(
            order_id = %order_id,
            release = %record.release_id_at_sync,
            "committed sync record"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_err(path, e)),
    };
    serde_json::from_str(&contents)
        .map(Some)
        .map_err(|e| StoreError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

/// Serialize `value` to `<dir>/<name>.tmp` and flush it to disk.
/// Returns `(tmp, final)`.
fn stage_json<T: Serialize + ?Sized>(
    dir: &Path,
    name: &str,
    value: &T,
) -> Result<(PathBuf, PathBuf), StoreError> {
    let path = dir.join(name);
    let tmp = dir.join(format!("{name}.tmp"));
    let json = serde_json::to_vec_pretty(value)?;

    let write = || -> std::io::Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(&json)?;
        file.sync_all()
    };
    if let Err(e) = write() {
        let _ = std::fs::remove_file(&tmp);
        return Err(io_err(&tmp, e));
    }
    Ok((tmp, path))
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
