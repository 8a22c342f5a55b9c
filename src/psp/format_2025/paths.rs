//! Path management for the PSPF/2025 workenv structure
//!
//! A workenv is owned by the package identity `{name}_{version}` under the
//! cache root. Bookkeeping lives in a hidden sidecar directory next to it.

use super::defaults::{
    DEFAULT_COMPLETE_FILE, DEFAULT_EXTRACT_DIR, DEFAULT_INSTANCE_DIR, DEFAULT_LOCK_FILE,
    DEFAULT_PACKAGE_CHECKSUM_FILE, DEFAULT_PACKAGE_DIR, DEFAULT_PSP_METADATA_FILE,
    DEFAULT_PSPF_HIDDEN_PREFIX, DEFAULT_PSPF_SUFFIX, DEFAULT_TMP_DIR, DEFAULT_WORKENV_DIR,
};
use std::path::{Path, PathBuf};

/// Manages all paths for a workenv and its sidecar metadata
#[derive(Debug, Clone)]
pub struct WorkenvPaths {
    cache_dir: PathBuf,
    workenv_name: String,
}

impl WorkenvPaths {
    /// Derive paths for a package identity under a cache root
    pub fn new(cache_dir: PathBuf, package_name: &str, package_version: &str) -> Self {
        Self {
            cache_dir,
            workenv_name: format!("{package_name}_{package_version}"),
        }
    }

    /// Paths rooted at an explicit workenv directory (FLAVOR_WORKENV override)
    pub fn with_explicit_workenv(workenv: &Path) -> Self {
        let name = workenv
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "workenv".to_string());
        let cache_dir = workenv
            .parent()
            .and_then(|p| p.parent())
            .map(|p| p.to_path_buf())
            .unwrap_or_else(std::env::temp_dir);
        Self {
            cache_dir,
            workenv_name: name,
        }
    }

    // ==================== Content paths ====================

    /// The workenv directory itself (where slots expand)
    pub fn workenv(&self) -> PathBuf {
        self.cache_dir
            .join(DEFAULT_WORKENV_DIR)
            .join(&self.workenv_name)
    }

    // ==================== Sidecar metadata paths ====================

    /// The hidden sidecar directory (`.{name}_{version}.pspf`)
    pub fn metadata(&self) -> PathBuf {
        self.cache_dir.join(DEFAULT_WORKENV_DIR).join(format!(
            "{}{}{}",
            DEFAULT_PSPF_HIDDEN_PREFIX, self.workenv_name, DEFAULT_PSPF_SUFFIX
        ))
    }

    /// Persistent instance bookkeeping
    pub fn instance(&self) -> PathBuf {
        self.metadata().join(DEFAULT_INSTANCE_DIR)
    }

    /// Package metadata directory (replaced each extraction)
    pub fn package_metadata(&self) -> PathBuf {
        self.metadata().join(DEFAULT_PACKAGE_DIR)
    }

    /// Temporary extraction root
    pub fn tmp(&self) -> PathBuf {
        self.metadata().join(DEFAULT_TMP_DIR)
    }

    /// Per-PID temp extraction directory
    pub fn temp_extraction(&self, pid: u32) -> PathBuf {
        self.tmp().join(pid.to_string())
    }

    // ==================== Instance paths ====================

    /// Extraction bookkeeping directory
    pub fn extract(&self) -> PathBuf {
        self.instance().join(DEFAULT_EXTRACT_DIR)
    }

    /// The PID lock file guarding extraction
    pub fn lock_file(&self) -> PathBuf {
        self.extract().join(DEFAULT_LOCK_FILE)
    }

    /// Completion marker written after a successful extraction
    pub fn complete_file(&self) -> PathBuf {
        self.extract().join(DEFAULT_COMPLETE_FILE)
    }

    /// Trailer checksum of the package that populated the cache
    pub fn checksum_file(&self) -> PathBuf {
        self.instance().join(DEFAULT_PACKAGE_CHECKSUM_FILE)
    }

    /// Decoded metadata document saved for inspection
    pub fn psp_metadata_file(&self) -> PathBuf {
        self.package_metadata().join(DEFAULT_PSP_METADATA_FILE)
    }

    // ==================== Utility ====================

    /// The `{name}_{version}` identity string
    pub fn name(&self) -> &str {
        &self.workenv_name
    }

    pub fn workenv_exists(&self) -> bool {
        self.workenv().exists()
    }
}
