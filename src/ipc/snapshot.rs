use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::debug;

use super::FileError;

/// Replaces `dir/name` with the serialized value. The payload goes to a hidden sibling
/// first and is renamed over the target, so readers see either the old or the new file.
pub fn write_atomic<T: Serialize>(dir: &Path, name: &str, value: &T) -> Result<PathBuf, FileError> {
    let payload = serde_json::to_vec(value)?;
    write_bytes_atomic(dir, name, &payload)
}

pub fn write_bytes_atomic(dir: &Path, name: &str, payload: &[u8]) -> Result<PathBuf, FileError> {
    let target = dir.join(name);
    let temp = dir.join(format!(".{}.tmp", name));

    {
        let mut file = fs::File::create(&temp).map_err(|e| FileError::io(&temp, e))?;
        file.write_all(payload).map_err(|e| FileError::io(&temp, e))?;
        file.sync_all().map_err(|e| FileError::io(&temp, e))?;
    }
    fs::rename(&temp, &target).map_err(|e| FileError::io(&target, e))?;

    Ok(target)
}

/// Reads and decodes a snapshot. Missing, empty, half-written or foreign content all
/// yield `None`; the next poll simply tries again.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let bytes = fs::read(path).ok()?;
    if bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return None;
    }
    match serde_json::from_slice(&bytes) {
        Ok(value) => Some(value),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Snapshot not decodable this cycle");
            None
        }
    }
}

/// Last modification time in unix seconds.
pub fn modified_secs(path: &Path) -> Option<i64> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    let secs = modified.duration_since(UNIX_EPOCH).ok()?.as_secs();
    i64::try_from(secs).ok()
}
