//! Versioned on-disk snapshots
//!
//! Every file the engine writes is a bincode `Envelope` carrying a format tag
//! and a version number ahead of the payload. Writes go to a uniquely named
//! temp file in the same directory, are synced, then renamed over the target,
//! so a crash mid-write leaves the previous file intact.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ContextError, Result};
use crate::store::StoreSnapshot;

/// Format version written by this build
pub const CURRENT_VERSION: u32 = 1;

/// Format tag of the node store snapshot
pub const STORE_FORMAT: &str = "context-engine/store";

/// Format tag of the cache disk tier
pub const CACHE_FORMAT: &str = "context-engine/cache";

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    format: String,
    version: u32,
    payload: T,
}

#[derive(Deserialize)]
struct Header {
    format: String,
    version: u32,
}

/// Write `bytes` to `path` through a synced temp file and a rename
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let temp = temp_path(path);
    let written = (|| -> std::io::Result<()> {
        let mut file = File::create(&temp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&temp, path)
    })();

    if let Err(e) = written {
        let _ = fs::remove_file(&temp);
        return Err(e.into());
    }
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "snapshot".to_string());
    path.with_file_name(format!(".{name}.{}.tmp", uuid::Uuid::new_v4()))
}

/// Serialize `payload` under a format tag and write it atomically
pub fn write_versioned<T: Serialize>(path: &Path, format: &str, payload: &T) -> Result<()> {
    let envelope = Envelope {
        format: format.to_string(),
        version: CURRENT_VERSION,
        payload,
    };
    let bytes = bincode::serialize(&envelope)?;
    write_atomic(path, &bytes)
}

/// Read a versioned file; `Ok(None)` if it does not exist
pub fn read_versioned<T: DeserializeOwned>(path: &Path, format: &str) -> Result<Option<T>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            log::debug!("No snapshot at {}", path.display());
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };

    // the header is a prefix of the envelope, so it decodes on its own
    let header: Header = bincode::deserialize(&bytes)?;
    if header.format != format {
        return Err(ContextError::serialization(format!(
            "{} holds '{}', expected '{}'",
            path.display(),
            header.format,
            format
        )));
    }
    if header.version != CURRENT_VERSION {
        return Err(ContextError::serialization(format!(
            "unsupported {} version {} (current: {})",
            format, header.version, CURRENT_VERSION
        )));
    }

    let envelope: Envelope<T> = bincode::deserialize(&bytes)?;
    Ok(Some(envelope.payload))
}

/// Persist the node store graph
pub fn save_store(path: &Path, snapshot: &StoreSnapshot) -> Result<()> {
    write_versioned(path, STORE_FORMAT, snapshot)?;
    log::info!(
        "Saved snapshot of {} nodes and {} edges to {}",
        snapshot.nodes.len(),
        snapshot.edges.len(),
        path.display()
    );
    Ok(())
}

/// Load a node store graph saved by [`save_store`]
pub fn load_store(path: &Path) -> Result<Option<StoreSnapshot>> {
    let snapshot = read_versioned::<StoreSnapshot>(path, STORE_FORMAT)?;
    if let Some(snapshot) = &snapshot {
        log::info!(
            "Loaded snapshot of {} nodes and {} edges from {}",
            snapshot.nodes.len(),
            snapshot.edges.len(),
            path.display()
        );
    }
    Ok(snapshot)
}
