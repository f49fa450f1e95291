//! Domain types for Geotorget orders.
//!
//! Everything persisted to disk round-trips through serde + serde_json.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::ListingError;

/// Name of the local order record consumed by the dashboard.
pub const ORDER_METADATA_FILE: &str = "order_metadata.json";
/// Name of the verbatim remote listing snapshot.
pub const UTTAG_FILE: &str = "uttag.json";
/// Name of the commit marker. Its presence is what makes an order "synced".
pub const SYNC_RECORD_FILE: &str = "sync_record.json";
/// Suffix of in-progress downloads.
pub const PART_SUFFIX: &str = ".part";

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// UUID identity of a remote order.
///
/// Displays in hyphenated lower-case form, which is also the name of the
/// order's directory under the output root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(pub Uuid);

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

impl FromStr for OrderId {
    type Err = ListingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| ListingError::InvalidOrderId(s.to_owned()))
    }
}

impl From<Uuid> for OrderId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Opaque token identifying the data release an order currently serves.
///
/// Only ever compared by equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReleaseId(pub String);

impl fmt::Display for ReleaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for ReleaseId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for ReleaseId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Lifecycle of a single file within one sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DownloadState {
    #[default]
    Pending,
    Downloading,
    Complete,
    Failed,
    Cancelled,
}

impl DownloadState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for DownloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloadState::Pending => write!(f, "pending"),
            DownloadState::Downloading => write!(f, "downloading"),
            DownloadState::Complete => write!(f, "complete"),
            DownloadState::Failed => write!(f, "failed"),
            DownloadState::Cancelled => write!(f, "cancelled"),
        }
    }
}

// ---------------------------------------------------------------------------
// Domain structs
// ---------------------------------------------------------------------------

/// One downloadable artifact within an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderFile {
    pub name: String,
    pub remote_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_size: Option<u64>,
    /// Lower-case SHA-256 hex digest, when the remote publishes one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// Remote "last updated" stamp; opaque apart from ordering against file mtimes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_size: Option<String>,
}

impl OrderFile {
    /// Final on-disk location of this file inside `order_dir`.
    pub fn final_path(&self, order_dir: &Path) -> PathBuf {
        order_dir.join(&self.name)
    }

    /// Temporary location used while the file is being streamed.
    pub fn part_path(&self, order_dir: &Path) -> PathBuf {
        order_dir.join(format!("{}{PART_SUFFIX}", self.name))
    }

    /// Parsed `updated` stamp, if present and well-formed.
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        let raw = self.updated.as_deref()?;
        parse_remote_timestamp(raw)
    }
}

/// One remote dataset order as described by its current listing.
#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub order_id: OrderId,
    pub release_id: ReleaseId,
    pub files: Vec<OrderFile>,
    /// The remote listing exactly as received.
    pub listing: serde_json::Value,
}

impl Order {
    /// Build an [`Order`] from the JSON array returned by `GET /{order_id}/files`.
    pub fn from_listing(order_id: OrderId, listing: serde_json::Value) -> Result<Self, ListingError> {
        let entries: Vec<ListingEntry> =
            serde_json::from_value(listing.clone()).map_err(ListingError::Malformed)?;

        let mut seen = HashSet::new();
        let mut files = Vec::with_capacity(entries.len());
        for entry in entries {
            validate_file_name(&entry.title)?;
            if !seen.insert(entry.title.clone()) {
                return Err(ListingError::DuplicateFileName(entry.title));
            }
            files.push(OrderFile {
                name: entry.title,
                remote_url: entry.href,
                expected_size: entry.length,
                checksum: entry
                    .checksum
                    .map(|c| c.trim().to_ascii_lowercase())
                    .filter(|c| !c.is_empty()),
                updated: entry.updated,
                display_size: entry.display_size,
            });
        }

        let release_id = derive_release_id(&files);
        Ok(Self {
            order_id,
            release_id,
            files,
            listing,
        })
    }

    /// `<output_root>/<order_id>/`
    pub fn local_path(&self, output_root: &Path) -> PathBuf {
        output_root.join(self.order_id.to_string())
    }

    /// Sum of the sizes the remote advertises. Files without a size count as zero.
    pub fn advertised_bytes(&self) -> u64 {
        self.files.iter().filter_map(|f| f.expected_size).sum()
    }

    /// Whether the order itself delivers a file that collides with the listing snapshot.
    pub fn delivers_uttag(&self) -> bool {
        self.files.iter().any(|f| f.name == UTTAG_FILE)
    }
}

/// Commit marker persisted per order once every file is complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub order_id: OrderId,
    pub release_id_at_sync: ReleaseId,
    pub synced_at: DateTime<Utc>,
    pub file_count: usize,
    pub total_bytes: u64,
}

/// The `order_metadata.json` document read by the dashboard generator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderMetadata {
    pub order_id: OrderId,
    /// Same instant as [`SyncRecord::synced_at`].
    pub download_date: DateTime<Utc>,
    pub release_id: ReleaseId,
    pub file_count: usize,
    pub total_bytes: u64,
    #[serde(default)]
    pub files: Vec<OrderFile>,
}

impl OrderMetadata {
    pub fn from_record(record: &SyncRecord, files: Vec<OrderFile>) -> Self {
        Self {
            order_id: record.order_id,
            download_date: record.synced_at,
            release_id: record.release_id_at_sync.clone(),
            file_count: record.file_count,
            total_bytes: record.total_bytes,
            files,
        }
    }
}

// ---------------------------------------------------------------------------
// Listing wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ListingEntry {
    title: String,
    href: String,
    #[serde(default)]
    length: Option<u64>,
    #[serde(default, rename = "displaySize")]
    display_size: Option<String>,
    #[serde(default)]
    updated: Option<String>,
    #[serde(default, alias = "sha256")]
    checksum: Option<String>,
}

fn validate_file_name(name: &str) -> Result<(), ListingError> {
    let unsafe_name = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
        || name.ends_with(PART_SUFFIX)
        || name.ends_with(".tmp")
        || name == ORDER_METADATA_FILE
        || name == SYNC_RECORD_FILE;
    if unsafe_name {
        return Err(ListingError::UnsafeFileName(name.to_owned()));
    }
    Ok(())
}

/// Greatest `updated` stamp when any file has one, else a digest of the
/// sorted `(name, size)` pairs.
pub fn derive_release_id(files: &[OrderFile]) -> ReleaseId {
    if let Some(latest) = files.iter().filter_map(|f| f.updated.as_deref()).max() {
        return ReleaseId(latest.to_owned());
    }

    let mut pairs: Vec<(&str, Option<u64>)> = files
        .iter()
        .map(|f| (f.name.as_str(), f.expected_size))
        .collect();
    pairs.sort();

    let mut h = Sha256::new();
    for (name, size) in pairs {
        h.update(name.as_bytes());
        h.update([0]);
        h.update(size.map(|s| s.to_string()).unwrap_or_default().as_bytes());
        h.update([b'\n']);
    }
    ReleaseId(format!("sha256:{}", hex::encode(h.finalize())))
}

/// Parse the remote's ISO-8601 stamps. Naive stamps are taken as UTC.
pub fn parse_remote_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
