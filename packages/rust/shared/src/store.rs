//! JSON file helpers for the filesystem-backed stores (manifests, directory
//! cache, checkpoint).
//!
//! Writes go to a sibling temp file and are renamed into place, so a reader
//! never observes a half-written file and concurrent writers of equivalent
//! content are harmless (last rename wins).

use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::error::{RecordFlowError, Result};

/// Read and parse a JSON file. Returns `Ok(None)` if the file does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(RecordFlowError::io(path, e)),
    };

    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| RecordFlowError::parse(format!("{}: {e}", path.display())))
}

/// Serialize `value` as pretty JSON and atomically replace `path` with it.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| RecordFlowError::io(parent, e))?;
    }

    let json = serde_json::to_vec_pretty(value)
        .map_err(|e| RecordFlowError::Storage(format!("serialize {}: {e}", path.display())))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{file_name}.{}.tmp", Uuid::now_v7()));

    std::fs::write(&tmp, json).map_err(|e| RecordFlowError::io(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        RecordFlowError::io(path, e)
    })
}
