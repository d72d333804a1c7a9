//! Atomic file boundary helpers (spec §5, §6).
//!
//! Every file write that crosses the process boundary (sentinel control
//! files, state snapshots) is a write-temp + rename, so external watchers
//! never observe a partially written file. Corrupt files encountered on
//! read are archived with a `.corrupt.<timestamp>` suffix and replaced by
//! an empty-but-valid structure (spec §6, §7).

use std::path::{Path, PathBuf};

use crate::error::CoreResult;

/// Write `bytes` to `path` atomically via a sibling temp file + rename.
pub fn atomic_write(path: impl AsRef<Path>, bytes: &[u8]) -> CoreResult<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = tmp_path(path);
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "tmp".to_string());
    path.with_file_name(format!(".{file_name}.tmp-{}", std::process::id()))
}

/// Move a corrupt file aside as `<name>.corrupt.<unix_ts>` so the caller can
/// replace it with a fresh empty structure. Best-effort: if even this fails
/// (e.g. permissions), the caller proceeds with an in-memory empty value.
pub fn archive_corrupt(path: impl AsRef<Path>) -> CoreResult<()> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(());
    }
    let ts = chrono::Utc::now().timestamp();
    let archived = path.with_extension(format!("corrupt.{ts}"));
    std::fs::rename(path, archived)?;
    Ok(())
}

/// Read and clear a single-object control file (`workflow_command`,
/// `workflow_request`): parses the JSON object if present, then atomically
/// removes the file so the write is treated as consumed exactly once.
pub fn take_control_object<T: serde::de::DeserializeOwned>(
    path: impl AsRef<Path>,
) -> CoreResult<Option<T>> {
    let path = path.as_ref();
    match std::fs::read(path) {
        Ok(bytes) => {
            let value: T = serde_json::from_slice(&bytes)?;
            let _ = std::fs::remove_file(path);
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn atomic_write_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f.json");
        atomic_write(&path, b"{\"a\":1}").unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes, b"{\"a\":1}");
    }

    #[test]
    fn take_control_object_clears_after_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("workflow_command.json");
        atomic_write(&path, br#"{"command":"stop"}"#).unwrap();

        #[derive(serde::Deserialize)]
        struct Cmd {
            command: String,
        }
        let cmd: Option<Cmd> = take_control_object(&path).unwrap();
        assert_eq!(cmd.unwrap().command, "stop");
        assert!(!path.exists());

        let again: Option<Cmd> = take_control_object(&path).unwrap();
        assert!(again.is_none());
    }
}
