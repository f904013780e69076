//! Materialization of embedded native binaries.
//!
//! Extraction must tolerate racing processes that start concurrently and
//! target the same version-qualified path: bytes are written to a uniquely
//! named temp file and renamed into place, so a partially written module is
//! never visible under the final name. When the final path already holds a
//! non-empty file, another process won the race and extraction is skipped.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::Result;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Write `bytes` to `final_path` unless a complete extraction already exists.
/// Filesystem failures are retried once after re-checking for a race winner,
/// then escalated to the caller.
pub(crate) fn materialize(final_path: &Path, bytes: &[u8]) -> Result<()> {
    let mut last_err = None;
    for attempt in 0..2 {
        if already_present(final_path) {
            tracing::debug!(path = %final_path.display(), "extraction skipped, already present");
            return Ok(());
        }
        match extract_once(final_path, bytes) {
            Ok(()) => {
                tracing::debug!(path = %final_path.display(), len = bytes.len(), "extracted module");
                return Ok(());
            }
            Err(e) => {
                if attempt == 0 {
                    tracing::warn!(path = %final_path.display(), error = %e, "extraction failed, retrying once");
                }
                last_err = Some(e);
            }
        }
    }
    // Both attempts failed and nobody else completed the file.
    Err(last_err.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::Other, "extraction failed").into()
    }))
}

/// A non-empty file at the final path counts as a completed extraction.
fn already_present(path: &Path) -> bool {
    fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
}

fn extract_once(final_path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = final_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let temp = unique_temp_path(final_path);

    if let Err(e) = fs::write(&temp, bytes) {
        let _ = fs::remove_file(&temp);
        return Err(e.into());
    }
    if let Err(e) = fs::rename(&temp, final_path) {
        // On platforms where rename refuses to replace, a race winner's file
        // is already in place; the re-check on the next attempt handles it.
        let _ = fs::remove_file(&temp);
        return Err(e.into());
    }
    Ok(())
}

/// A temp name unique across processes and threads: pid, a process-local
/// counter, and wall-clock nanos.
fn unique_temp_path(final_path: &Path) -> PathBuf {
    let name = final_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "module".to_string());
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    let seq = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    final_path.with_file_name(format!(
        ".{}.{}.{}.{}.tmp",
        name,
        std::process::id(),
        seq,
        nanos
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha256};

    #[test]
    fn test_materialize_writes_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("sub").join("libengine.so");

        materialize(&target, b"payload-bytes").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"payload-bytes");
    }

    #[test]
    fn test_materialize_skips_existing() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("libengine.so");
        fs::write(&target, b"winner").unwrap();

        materialize(&target, b"loser").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"winner");
    }

    #[test]
    fn test_materialize_replaces_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("libengine.so");
        fs::write(&target, b"").unwrap();

        materialize(&target, b"real-bytes").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"real-bytes");
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("libengine.so");

        materialize(&target, b"x").unwrap();

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["libengine.so".to_string()]);
    }

    #[test]
    fn test_concurrent_extraction_is_intact() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("libengine.so");
        let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
        let expected = Sha256::digest(&payload);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let target = target.clone();
                let payload = payload.clone();
                std::thread::spawn(move || materialize(&target, &payload))
            })
            .collect();
        for h in handles {
            h.join().unwrap().unwrap();
        }

        let on_disk = fs::read(&target).unwrap();
        assert_eq!(Sha256::digest(&on_disk), expected);
    }

    #[test]
    fn test_unique_temp_paths_differ() {
        let target = Path::new("/tmp/libengine.so");
        let a = unique_temp_path(target);
        let b = unique_temp_path(target);
        assert_ne!(a, b);
        assert!(a.file_name().unwrap().to_string_lossy().ends_with(".tmp"));
    }
}
