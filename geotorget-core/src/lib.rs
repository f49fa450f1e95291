//! Geotorget core library: order domain types, configuration, and the
//! Manifest Store.
//!
//! - [`types`]: order, file and sync-record types
//! - [`error`]: [`StoreError`], [`ListingError`]
//! - [`config`]: `~/.geotorget/config.yaml` loading
//! - [`manifest`]: durable per-order state under the output root

pub mod config;
pub mod error;
pub mod manifest;
pub mod types;

pub use config::{CheckScope, EngineConfig, RetrySettings};
pub use error::{ListingError, StoreError};
pub use manifest::ManifestStore;
pub use types::{
    DownloadState, Order, OrderFile, OrderId, OrderMetadata, ReleaseId, SyncRecord,
    ORDER_METADATA_FILE, PART_SUFFIX, SYNC_RECORD_FILE, UTTAG_FILE,
};
