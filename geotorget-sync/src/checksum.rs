//! SHA-256 helpers for downloaded files.
//!
//! Checksums are best effort: the Geotorget listing usually carries none, so
//! size is the floor for validation and a digest is only compared when the
//! remote published one.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

/// Buffer size for hashing (64KB).
const BUFFER_SIZE: usize = 64 * 1024;

/// Lower-case SHA-256 hex digest of the file at `path`.
pub fn file_sha256(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// [`file_sha256`] on the blocking pool.
pub async fn file_sha256_async(path: PathBuf) -> std::io::Result<String> {
    tokio::task::spawn_blocking(move || file_sha256(&path))
        .await
        .map_err(std::io::Error::other)?
}
