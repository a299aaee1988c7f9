//! Shared filesystem helpers for the store crates.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use switchboard_core::error::HostError;

/// Write a pretty-printed JSON file atomically: serialise to a sibling temp
/// file, then rename over the target.
pub async fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), HostError> {
    let json = serde_json::to_string_pretty(value)?;
    atomic_write(path, json.as_bytes()).await
}

/// Write bytes atomically via temp file + rename.
pub async fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), HostError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Read and parse a JSON file. `Ok(None)` when the file does not exist.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, HostError> {
    match tokio::fs::read_to_string(path).await {
        Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Append one JSONL line (entry + LF) to a file, creating it if needed.
/// Returns the number of bytes written.
pub async fn append_line<T: Serialize>(path: &Path, entry: &T) -> Result<u64, HostError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut line = serde_json::to_string(entry)?;
    line.push('\n');
    let bytes = line.into_bytes();
    use tokio::io::AsyncWriteExt;
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(&bytes).await?;
    Ok(bytes.len() as u64)
}

/// Segment file name for a timestamp: ISO-8601 with colons replaced by `-`,
/// e.g. `2026-08-02T14-03-59Z.jsonl`.
pub fn segment_file_name(at: DateTime<Utc>) -> String {
    format!("{}.jsonl", at.format("%Y-%m-%dT%H-%M-%SZ"))
}
