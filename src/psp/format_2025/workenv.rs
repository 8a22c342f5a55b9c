//! Work environment cache management
//!
//! Expanding slots on every invocation is expensive; the cache makes
//! re-invocations of the same `{name, version}` O(startup). Initialization
//! is exclusive via the PID lock; extraction goes through a per-process temp
//! directory and lands in the workenv by rename.

use log::{debug, info, warn};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use super::environment::compose_environment;
use super::execution::{execute_setup_commands, substitute_placeholders};
use super::locking::{
    cleanup_stale_extractions, is_extraction_complete, mark_extraction_complete, release_lock,
    try_acquire_lock, wait_for_extraction,
};
use super::metadata::Metadata;
use super::paths::WorkenvPaths;
use super::reader::Reader;
use crate::exceptions::{FlavorError, Result};
use crate::utils::get_cache_dir;

/// Resolve the workenv paths for a package identity
///
/// An explicit workdir wins, then `FLAVOR_WORKENV`; otherwise the workenv
/// lives at `{cache}/workenv/{name}_{version}`.
pub fn resolve_paths(metadata: &Metadata, explicit: Option<&Path>) -> WorkenvPaths {
    if let Some(workdir) = explicit {
        return WorkenvPaths::with_explicit_workenv(workdir);
    }

    if let Ok(custom) = env::var("FLAVOR_WORKENV") {
        info!("Using custom work environment from FLAVOR_WORKENV: {custom}");
        return WorkenvPaths::with_explicit_workenv(Path::new(&custom));
    }

    WorkenvPaths::new(
        get_cache_dir(),
        &metadata.package.name,
        &metadata.package.version,
    )
}

/// Evaluate cache validity for reuse
///
/// Valid iff extraction completed, the stored package checksum matches, and
/// the metadata-declared marker file holds the expected content. A package
/// without a `cache_validation` declaration is never reused.
pub fn check_cache_validity(
    paths: &WorkenvPaths,
    metadata: &Metadata,
    trailer_checksum: u32,
) -> bool {
    if !is_extraction_complete(paths) {
        debug!("No extraction completion marker");
        return false;
    }

    match fs::read_to_string(paths.checksum_file()) {
        Ok(stored) => {
            let current = format!("{trailer_checksum:08x}");
            if stored.trim() != current {
                debug!(
                    "Package checksum changed: cached {}, current {}",
                    stored.trim(),
                    current
                );
                return false;
            }
        }
        Err(_) => {
            debug!("No cached package checksum");
            return false;
        }
    }

    let Some(validation) = &metadata.cache_validation else {
        debug!("Package declares no cache_validation, cache always invalidated");
        return false;
    };

    let workenv = paths.workenv();
    let check_file = substitute_placeholders(&validation.check_file, &workenv, metadata);
    let check_path = PathBuf::from(&check_file);

    match fs::read_to_string(&check_path) {
        Ok(actual) => {
            let expected =
                substitute_placeholders(&validation.expected_content, &workenv, metadata);
            if actual.trim() == expected.trim() {
                true
            } else {
                debug!(
                    "Cache marker content mismatch: expected '{}', got '{}'",
                    expected.trim(),
                    actual.trim()
                );
                false
            }
        }
        Err(_) => {
            debug!("Cache validation file not found: {check_file}");
            false
        }
    }
}

/// Ensure the workenv for this reader's package is populated, and return it
///
/// Serialized across processes by the lock file; concurrent readers after a
/// successful initialization need no coordination.
pub fn setup_workenv(
    reader: &mut Reader,
    package_path: &Path,
    workdir: Option<&Path>,
) -> Result<PathBuf> {
    let metadata = reader.read_metadata()?.clone();
    let trailer_checksum = reader.read_index()?.index_checksum;
    let paths = resolve_paths(&metadata, workdir);
    let workenv = paths.workenv();

    fs::create_dir_all(&workenv)?;
    #[cfg(unix)]
    {
        use super::defaults::DEFAULT_DIR_PERMS;
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&workenv, fs::Permissions::from_mode(DEFAULT_DIR_PERMS))?;
    }

    if let Err(e) = cleanup_stale_extractions(&paths) {
        debug!("Failed to clean up stale extractions: {e}");
    }

    let use_cache = env::var("FLAVOR_WORKENV_CACHE")
        .map(|v| v.to_lowercase() != "false" && v != "0")
        .unwrap_or(true);

    if use_cache && check_cache_validity(&paths, &metadata, trailer_checksum) {
        info!("Cache is valid, skipping extraction");
        return Ok(workenv);
    }
    if !use_cache {
        info!("FLAVOR_WORKENV_CACHE disabled, forcing fresh extraction");
    }

    if try_acquire_lock(&paths)? {
        let result = initialize_workenv(reader, &metadata, &paths, package_path, trailer_checksum);
        release_lock(&paths);
        result?;
    } else {
        info!("Another process is initializing this workenv, waiting");
        wait_for_extraction(&paths, super::defaults::DEFAULT_EXTRACTION_WAIT_SECS)?;

        if !check_cache_validity(&paths, &metadata, trailer_checksum)
            && !is_extraction_complete(&paths)
        {
            return Err(FlavorError::LockError(
                "Workenv initialization by another process did not complete".into(),
            ));
        }
    }

    Ok(workenv)
}

/// Extract, run setup, and apply lifecycle cleanup (lock must be held)
fn initialize_workenv(
    reader: &mut Reader,
    metadata: &Metadata,
    paths: &WorkenvPaths,
    package_path: &Path,
    trailer_checksum: u32,
) -> Result<()> {
    let workenv = paths.workenv();
    let temp_dir = paths.temp_extraction(std::process::id());
    fs::create_dir_all(&temp_dir)?;

    info!("Extracting slots (cache invalid)");

    let extraction = (|| -> Result<Vec<PathBuf>> {
        let slot_count = reader.read_index()?.slot_count as usize;
        let mut extracted = Vec::with_capacity(slot_count);
        for slot_index in 0..slot_count {
            let path = reader.extract_slot(slot_index, &temp_dir)?;
            extracted.push(path);
        }

        if !metadata.setup_commands.is_empty() {
            info!("Running {} setup command(s)", metadata.setup_commands.len());
            let base: HashMap<String, String> = env::vars().collect();
            let setup_env = compose_environment(base, metadata, &temp_dir, package_path);
            execute_setup_commands(metadata, &temp_dir, &setup_env)?;
        }

        Ok(extracted)
    })();

    let extracted = match extraction {
        Ok(paths) => paths,
        Err(e) => {
            warn!("Workenv initialization failed, removing temp directory");
            let _ = fs::remove_dir_all(&temp_dir);
            return Err(e);
        }
    };

    apply_lifecycle_cleanup(metadata, &extracted);

    promote_temp_contents(&temp_dir, &workenv)?;
    let _ = fs::remove_dir_all(&temp_dir);

    save_package_metadata(paths, metadata)?;
    save_package_checksum(paths, trailer_checksum)?;
    mark_extraction_complete(paths)?;

    Ok(())
}

/// Post-pass over extracted slots by declared lifecycle
///
/// `init` artifacts are removed once setup has run; `temp` artifacts are
/// flagged for post-session cleanup; everything else persists.
fn apply_lifecycle_cleanup(metadata: &Metadata, extracted: &[PathBuf]) {
    for (index, path) in extracted.iter().enumerate() {
        let lifecycle = metadata
            .slots
            .get(index)
            .map(|s| s.lifecycle.as_str())
            .unwrap_or("runtime");

        match lifecycle {
            "init" => {
                debug!("Removing 'init' lifecycle slot {index}: {path:?}");
                if path.is_dir() {
                    if let Err(e) = fs::remove_dir_all(path) {
                        warn!("Failed to remove init directory {path:?}: {e}");
                    }
                } else if path.exists() {
                    if let Err(e) = fs::remove_file(path) {
                        warn!("Failed to remove init file {path:?}: {e}");
                    }
                }
            }
            "temp" => {
                debug!("Slot {index} marked 'temp', cleaned after the session");
            }
            _ => {}
        }
    }
}

/// Move every top-level entry from the temp dir into the workenv
fn promote_temp_contents(temp_dir: &Path, workenv: &Path) -> Result<()> {
    for entry in fs::read_dir(temp_dir)? {
        let entry = entry?;
        let source = entry.path();
        let dest = workenv.join(entry.file_name());

        if dest.exists() {
            if dest.is_dir() {
                fs::remove_dir_all(&dest)?;
            } else {
                fs::remove_file(&dest)?;
            }
        }

        debug!("Promoting {source:?} -> {dest:?}");
        if let Err(e) = fs::rename(&source, &dest) {
            // Cross-filesystem temp dirs fall back to copy
            warn!("Rename failed ({e}), falling back to copy");
            if source.is_dir() {
                copy_dir_all(&source, &dest)?;
                fs::remove_dir_all(&source)?;
            } else {
                fs::copy(&source, &dest)?;
                fs::remove_file(&source)?;
            }
        }
    }
    Ok(())
}

fn copy_dir_all(source: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)?;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let from = entry.path();
        let to = dest.join(entry.file_name());
        if from.is_dir() {
            copy_dir_all(&from, &to)?;
        } else {
            fs::copy(&from, &to)?;
        }
    }
    Ok(())
}

/// Save the decoded metadata document into the sidecar for inspection
fn save_package_metadata(paths: &WorkenvPaths, metadata: &Metadata) -> Result<()> {
    let dir = paths.package_metadata();
    fs::create_dir_all(&dir)?;
    let json = serde_json::to_string_pretty(metadata)?;
    fs::write(paths.psp_metadata_file(), json)?;
    Ok(())
}

/// Save the trailer checksum of the package that populated this cache
fn save_package_checksum(paths: &WorkenvPaths, checksum: u32) -> Result<()> {
    fs::create_dir_all(paths.instance())?;
    fs::write(paths.checksum_file(), format!("{checksum:08x}"))?;
    debug!("Saved package checksum {checksum:08x}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::builder::{PackageBuilder, SlotSpec};
    use super::super::constants::OP_GZIP;
    use super::super::metadata::SetupCommand;
    use super::*;

    // Tests in this module mutate FLAVOR_CACHE; serialize them
    static ENV_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());

    struct CacheGuard {
        old: Option<String>,
        _lock: std::sync::MutexGuard<'static, ()>,
    }

    impl CacheGuard {
        #[allow(unsafe_code)]
        fn set(dir: &Path) -> Self {
            let lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
            let old = env::var("FLAVOR_CACHE").ok();
            unsafe { env::set_var("FLAVOR_CACHE", dir) };
            CacheGuard { old, _lock: lock }
        }
    }

    impl Drop for CacheGuard {
        #[allow(unsafe_code)]
        fn drop(&mut self) {
            match &self.old {
                Some(value) => unsafe { env::set_var("FLAVOR_CACHE", value) },
                None => unsafe { env::remove_var("FLAVOR_CACHE") },
            }
        }
    }

    fn build_package(dir: &Path, with_marker: bool) -> PathBuf {
        let out = dir.join("demo.psp");
        let mut builder = PackageBuilder::new("demo", "1.0.0")
            .command("{workenv}/payload")
            .launcher_bytes(b"#!/bin/sh\nexit 0\n".to_vec())
            .add_slot(SlotSpec::from_bytes(
                "payload",
                b"hello world".to_vec(),
                vec![OP_GZIP],
            ))
            .key_seed("workenv-test");

        if with_marker {
            builder = builder
                .cache_validation("{workenv}/.initialized", "{version}")
                .setup_command(SetupCommand::WriteFile {
                    path: "{workenv}/.initialized".to_string(),
                    content: "{version}".to_string(),
                });
        }

        builder.build(&out).unwrap();
        out
    }

    #[test]
    fn test_first_run_extracts_and_second_reuses() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("cache");
        let _guard = CacheGuard::set(&cache);

        let package = build_package(dir.path(), true);

        let mut reader = Reader::open(&package).unwrap();
        let workenv = setup_workenv(&mut reader, &package, None).unwrap();

        assert_eq!(
            fs::read(workenv.join("payload")).unwrap(),
            b"hello world"
        );
        assert_eq!(
            fs::read_to_string(workenv.join(".initialized")).unwrap(),
            "1.0.0"
        );

        // Tag the workenv, then re-run: a reused cache keeps the tag
        fs::write(workenv.join("tag.txt"), b"untouched").unwrap();
        let mut reader2 = Reader::open(&package).unwrap();
        let workenv2 = setup_workenv(&mut reader2, &package, None).unwrap();
        assert_eq!(workenv2, workenv);
        assert_eq!(fs::read(workenv.join("tag.txt")).unwrap(), b"untouched");
    }

    #[test]
    fn test_no_cache_validation_means_always_extract() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("cache");
        let _guard = CacheGuard::set(&cache);

        let package = build_package(dir.path(), false);

        let mut reader = Reader::open(&package).unwrap();
        let workenv = setup_workenv(&mut reader, &package, None).unwrap();

        // Second run re-extracts the payload; the payload file is replaced
        let mut reader2 = Reader::open(&package).unwrap();
        setup_workenv(&mut reader2, &package, None).unwrap();
        assert_eq!(fs::read(workenv.join("payload")).unwrap(), b"hello world");
    }

    #[test]
    fn test_cache_invalidated_by_marker_content() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("cache");
        let _guard = CacheGuard::set(&cache);

        let package = build_package(dir.path(), true);

        let mut reader = Reader::open(&package).unwrap();
        let workenv = setup_workenv(&mut reader, &package, None).unwrap();

        let metadata = reader.read_metadata().unwrap().clone();
        let checksum = reader.read_index().unwrap().index_checksum;
        let paths = resolve_paths(&metadata, None);

        assert!(check_cache_validity(&paths, &metadata, checksum));

        // Wrong content invalidates
        fs::write(workenv.join(".initialized"), "9.9.9").unwrap();
        assert!(!check_cache_validity(&paths, &metadata, checksum));

        // Missing marker invalidates
        fs::remove_file(workenv.join(".initialized")).unwrap();
        assert!(!check_cache_validity(&paths, &metadata, checksum));
    }

    #[test]
    fn test_init_lifecycle_slot_removed() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("cache");
        let _guard = CacheGuard::set(&cache);

        let out = dir.path().join("init.psp");
        PackageBuilder::new("init-demo", "1.0.0")
            .command("true")
            .launcher_bytes(b"#!/bin/sh\nexit 0\n".to_vec())
            .add_slot(SlotSpec::from_bytes(
                "seed-data",
                b"only needed during setup".to_vec(),
                vec![OP_GZIP],
            ).lifecycle("init"))
            .add_slot(SlotSpec::from_bytes(
                "payload",
                b"persists".to_vec(),
                vec![OP_GZIP],
            ))
            .key_seed("init-test")
            .build(&out)
            .unwrap();

        let mut reader = Reader::open(&out).unwrap();
        let workenv = setup_workenv(&mut reader, &out, None).unwrap();

        assert!(!workenv.join("seed-data").exists());
        assert_eq!(fs::read(workenv.join("payload")).unwrap(), b"persists");
    }
}
