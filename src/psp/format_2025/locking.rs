//! Lock file management for concurrent workenv initialization
//!
//! No two writers may initialize the same workenv at once. The lock is an
//! exclusively-created file carrying the owner's PID; staleness is decided by
//! a liveness check on that PID.

use crate::exceptions::{FlavorError, Result};
use log::{debug, info};
use std::fs;
use std::io::Write;

use super::paths::WorkenvPaths;

/// Check if a process with the given PID is still running
#[cfg(target_os = "linux")]
pub fn is_process_running(pid: u32) -> bool {
    std::path::Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(all(unix, not(target_os = "linux")))]
pub fn is_process_running(pid: u32) -> bool {
    // kill -0 semantics without libc: probe via the ps shim
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[cfg(not(unix))]
pub fn is_process_running(_pid: u32) -> bool {
    // Conservative on platforms without a cheap liveness probe
    false
}

/// Try to acquire the exclusive extraction lock
///
/// Returns `true` on acquisition, `false` when a live process holds it.
/// Stale locks from dead processes are cleared; an uncleared stale lock is
/// fatal.
pub fn try_acquire_lock(paths: &WorkenvPaths) -> Result<bool> {
    let extract_dir = paths.extract();
    fs::create_dir_all(&extract_dir)?;

    let lock_path = paths.lock_file();
    let pid = std::process::id();

    if lock_path.exists() {
        debug!("Lock file exists, checking liveness");

        match fs::read_to_string(&lock_path) {
            Ok(contents) => match contents.trim().parse::<u32>() {
                Ok(old_pid) if is_process_running(old_pid) => {
                    debug!("Lock held by active process (PID: {old_pid})");
                    return Ok(false);
                }
                Ok(old_pid) => {
                    info!("Removing stale lock from dead process (PID: {old_pid})");
                    fs::remove_file(&lock_path).map_err(|e| {
                        FlavorError::LockError(format!("Cannot clear stale lock: {e}"))
                    })?;
                }
                Err(_) => {
                    info!("Removing lock file with unparseable PID");
                    fs::remove_file(&lock_path).map_err(|e| {
                        FlavorError::LockError(format!("Cannot clear invalid lock: {e}"))
                    })?;
                }
            },
            Err(e) => {
                info!("Removing unreadable lock file ({e})");
                fs::remove_file(&lock_path).map_err(|e| {
                    FlavorError::LockError(format!("Cannot clear unreadable lock: {e}"))
                })?;
            }
        }
    }

    match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&lock_path)
    {
        Ok(mut file) => {
            writeln!(file, "{pid}")?;
            debug!("Acquired extraction lock (PID: {pid})");
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            debug!("Lost the race for the lock file");
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

/// Release the extraction lock
pub fn release_lock(paths: &WorkenvPaths) {
    let lock_path = paths.lock_file();
    if let Err(e) = fs::remove_file(&lock_path) {
        debug!("Failed to remove lock file: {e}");
    } else {
        debug!("Released extraction lock");
    }
}

/// Wait for another process to finish extraction
pub fn wait_for_extraction(paths: &WorkenvPaths, timeout_secs: u64) -> Result<()> {
    use std::thread;
    use std::time::Duration;

    let lock_path = paths.lock_file();
    let max_attempts = timeout_secs * 10; // check every 100ms

    for attempt in 0..max_attempts {
        if !lock_path.exists() {
            debug!("Extraction lock released");
            // Small grace period for final renames to land
            thread::sleep(Duration::from_millis(100));
            return Ok(());
        }

        if attempt % 10 == 0 {
            debug!(
                "Waiting for extraction to complete... ({}/{}s)",
                attempt / 10,
                timeout_secs
            );
        }

        thread::sleep(Duration::from_millis(100));
    }

    Err(FlavorError::LockError(
        "Timeout waiting for cache extraction to complete".to_string(),
    ))
}

/// Mark cache extraction as complete
pub fn mark_extraction_complete(paths: &WorkenvPaths) -> Result<()> {
    fs::create_dir_all(paths.extract())?;
    let mut file = fs::File::create(paths.complete_file())?;
    writeln!(file, "{}", std::process::id())?;
    debug!("Marked extraction as complete");
    Ok(())
}

/// Check if cache extraction is complete
pub fn is_extraction_complete(paths: &WorkenvPaths) -> bool {
    paths.complete_file().exists()
}

/// Clean up temp extraction directories left by dead processes
pub fn cleanup_stale_extractions(paths: &WorkenvPaths) -> Result<()> {
    let tmp_dir = paths.tmp();
    if !tmp_dir.exists() {
        return Ok(());
    }

    for entry in fs::read_dir(&tmp_dir)?.flatten() {
        let Ok(file_name) = entry.file_name().into_string() else {
            continue;
        };
        let Ok(pid) = file_name.parse::<u32>() else {
            continue;
        };
        if !is_process_running(pid) {
            let stale_dir = entry.path();
            info!("Cleaning up stale extraction directory from dead process (PID: {pid})");
            if let Err(e) = fs::remove_dir_all(&stale_dir) {
                debug!("Failed to remove stale directory {stale_dir:?}: {e}");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths() -> (tempfile::TempDir, WorkenvPaths) {
        let dir = tempfile::tempdir().unwrap();
        let p = WorkenvPaths::new(dir.path().to_path_buf(), "locktest", "1.0");
        (dir, p)
    }

    #[test]
    fn test_acquire_and_release() {
        let (_dir, paths) = paths();
        assert!(try_acquire_lock(&paths).unwrap());
        assert!(paths.lock_file().exists());

        release_lock(&paths);
        assert!(!paths.lock_file().exists());
    }

    #[test]
    fn test_own_live_lock_blocks_reacquisition() {
        let (_dir, paths) = paths();
        assert!(try_acquire_lock(&paths).unwrap());
        // Our own PID is alive, so the lock reads as held
        assert!(!try_acquire_lock(&paths).unwrap());
        release_lock(&paths);
    }

    #[test]
    fn test_stale_lock_is_cleared() {
        let (_dir, paths) = paths();
        fs::create_dir_all(paths.extract()).unwrap();
        // PIDs near u32::MAX exceed any real pid_max
        fs::write(paths.lock_file(), format!("{}\n", u32::MAX - 1)).unwrap();

        assert!(try_acquire_lock(&paths).unwrap());
        release_lock(&paths);
    }

    #[test]
    fn test_garbage_lock_is_cleared() {
        let (_dir, paths) = paths();
        fs::create_dir_all(paths.extract()).unwrap();
        fs::write(paths.lock_file(), "not-a-pid\n").unwrap();

        assert!(try_acquire_lock(&paths).unwrap());
        release_lock(&paths);
    }

    #[test]
    fn test_completion_marker() {
        let (_dir, paths) = paths();
        assert!(!is_extraction_complete(&paths));
        mark_extraction_complete(&paths).unwrap();
        assert!(is_extraction_complete(&paths));
    }

    #[test]
    fn test_stale_temp_dir_reaped() {
        let (_dir, paths) = paths();
        let dead = paths.temp_extraction(u32::MAX - 2);
        fs::create_dir_all(&dead).unwrap();
        fs::write(dead.join("leftover"), b"x").unwrap();

        cleanup_stale_extractions(&paths).unwrap();
        assert!(!dead.exists());
    }
}
