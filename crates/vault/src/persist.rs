// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Atomic vault persistence (spec §4.2): write-new, link-to-`.old`,
//! rename-new-over-current. Grounded on the teacher's WAL rotation
//! discipline (`storage::wal`'s corrupt-file `.bak`/`.bak.2`/`.bak.3`
//! rotation) but simpler: the vault has no append log, only a full-state
//! snapshot, so there is exactly one prior generation to keep.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("I/O error persisting {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
}

fn io_err(path: &Path, source: std::io::Error) -> PersistError {
    PersistError::Io { path: path.to_path_buf(), source }
}

/// Writes `bytes` to `path` using the vault's atomic-replace protocol:
/// `<path>.new` is written and fsynced, the current file (if any) is hard-
/// linked to `<path>.old`, then `<path>.new` is renamed over `path`.
///
/// On any I/O failure the caller is expected to treat this as disk-full and
/// auto-drain the node via the controller uplink (spec §4.2); this function
/// only reports the error, it does not drain.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), PersistError> {
    let new_path = path.with_extension("new");
    let old_path = path.with_extension("old");

    {
        let mut file = File::create(&new_path).map_err(|e| io_err(&new_path, e))?;
        file.write_all(bytes).map_err(|e| io_err(&new_path, e))?;
        file.sync_all().map_err(|e| io_err(&new_path, e))?;
    }

    if path.exists() {
        let _ = fs::remove_file(&old_path);
        fs::hard_link(path, &old_path).map_err(|e| io_err(&old_path, e))?;
    }

    fs::rename(&new_path, path).map_err(|e| io_err(path, e))?;
    Ok(())
}

/// Reads the current vault file, falling back to `.old` if the primary is
/// missing or unreadable (a crash between rename and next write can leave
/// only `.old` as a confirmed-good generation).
pub fn read_with_fallback(path: &Path) -> Result<Option<Vec<u8>>, PersistError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let old_path = path.with_extension("old");
            match fs::read(&old_path) {
                Ok(bytes) => Ok(Some(bytes)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(io_err(&old_path, e)),
            }
        }
        Err(e) => Err(io_err(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn atomic_write_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cred_state");

        atomic_write(&path, b"generation-1").unwrap();
        assert_eq!(read_with_fallback(&path).unwrap(), Some(b"generation-1".to_vec()));
    }

    #[test]
    fn second_write_leaves_previous_generation_in_dot_old() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cred_state");

        atomic_write(&path, b"generation-1").unwrap();
        atomic_write(&path, b"generation-2").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"generation-2");
        assert_eq!(fs::read(path.with_extension("old")).unwrap(), b"generation-1");
    }

    #[test]
    fn missing_current_falls_back_to_dot_old() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cred_state");

        atomic_write(&path, b"generation-1").unwrap();
        atomic_write(&path, b"generation-2").unwrap();
        fs::remove_file(&path).unwrap();

        assert_eq!(read_with_fallback(&path).unwrap(), Some(b"generation-1".to_vec()));
    }

    #[test]
    fn no_file_at_all_returns_none() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cred_state");
        assert_eq!(read_with_fallback(&path).unwrap(), None);
    }
}
