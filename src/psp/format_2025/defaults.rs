// src/psp/format_2025/defaults.rs
// Centralized default values and process-wide configuration

// =================================
// File permissions defaults
// =================================
pub const DEFAULT_FILE_PERMS: u32 = 0o600; // Read/write for owner only
pub const DEFAULT_PUBLIC_KEY_PERMS: u32 = 0o644; // World-readable public half
pub const DEFAULT_DIR_PERMS: u32 = 0o700; // Read/write/execute for owner only

// =================================
// Compression defaults
// =================================
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 6;
pub const MIN_COMPRESSION_LEVEL: u32 = 1;
pub const MAX_COMPRESSION_LEVEL: u32 = 9;

// =================================
// Backend selection
// =================================
/// Files larger than one page get the mmap backend under `auto`
pub const AUTO_MMAP_THRESHOLD: u64 = 4096;

// =================================
// Path constants
// =================================
pub const DEFAULT_PSPF_HIDDEN_PREFIX: &str = ".";
pub const DEFAULT_PSPF_SUFFIX: &str = ".pspf";
pub const DEFAULT_INSTANCE_DIR: &str = "instance";
pub const DEFAULT_PACKAGE_DIR: &str = "package";
pub const DEFAULT_TMP_DIR: &str = "tmp";
pub const DEFAULT_EXTRACT_DIR: &str = "extract";
pub const DEFAULT_LOCK_FILE: &str = "lock";
pub const DEFAULT_COMPLETE_FILE: &str = "complete";
pub const DEFAULT_PACKAGE_CHECKSUM_FILE: &str = "package.checksum";
pub const DEFAULT_PSP_METADATA_FILE: &str = "psp.json";
pub const DEFAULT_WORKENV_DIR: &str = "workenv";

// =================================
// Workenv defaults
// =================================
pub const DEFAULT_EXTRACTION_WAIT_SECS: u64 = 60;

/// Variables removed by default isolation unless the package opts out
pub const DEFAULT_ISOLATION_UNSET: &[&str] = &[
    "PYTHONPATH",
    "UV_PROJECT_ENVIRONMENT",
    "PYTHONHOME",
    "UV_CACHE_DIR",
    "VIRTUAL_ENV",
];

// =================================
// Validation configuration
// =================================
pub const DEFAULT_VALIDATION_LEVEL: &str = "standard";

/// ValidationLevel represents different levels of security validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationLevel {
    /// Full security checks, fail on any issue (most secure)
    Strict,
    /// Normal validation, warnings for minor issues (default)
    Standard,
    /// Skip signature checks, warn on checksum mismatches
    Relaxed,
    /// Only critical checks, continue on most warnings
    Minimal,
    /// Skip all validation (testing only, NOT RECOMMENDED)
    None,
}

impl ValidationLevel {
    /// Parse validation level from string (case insensitive)
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "strict" => Some(Self::Strict),
            "standard" => Some(Self::Standard),
            "relaxed" => Some(Self::Relaxed),
            "minimal" => Some(Self::Minimal),
            "none" => Some(Self::None),
            _ => None,
        }
    }

    /// Convert validation level to string
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationLevel::Strict => "strict",
            ValidationLevel::Standard => "standard",
            ValidationLevel::Relaxed => "relaxed",
            ValidationLevel::Minimal => "minimal",
            ValidationLevel::None => "none",
        }
    }

    /// Whether signature verification runs at this level
    pub fn checks_signature(&self) -> bool {
        matches!(self, ValidationLevel::Strict | ValidationLevel::Standard)
    }

    /// Whether slot checksums are verified at this level
    pub fn checks_slot_checksums(&self) -> bool {
        matches!(
            self,
            ValidationLevel::Strict | ValidationLevel::Standard | ValidationLevel::Relaxed
        )
    }

    /// Whether a failed check is fatal at this level
    pub fn fails_hard(&self) -> bool {
        matches!(self, ValidationLevel::Strict)
    }
}

/// Get the current validation level from environment or default
///
/// Read once per integrity check so a process can change policy between
/// invocations for testing.
pub fn get_validation_level() -> ValidationLevel {
    use std::env;

    if let Ok(val) = env::var("FLAVOR_VALIDATION") {
        if let Some(level) = ValidationLevel::parse(&val) {
            return level;
        }
        log::warn!("Unrecognized FLAVOR_VALIDATION value '{val}', using default");
    }

    ValidationLevel::parse(DEFAULT_VALIDATION_LEVEL).unwrap_or(ValidationLevel::Standard)
}

#[cfg(test)]
mod tests {
    use super::ValidationLevel;

    #[test]
    fn test_parse_levels() {
        assert_eq!(
            ValidationLevel::parse("STRICT"),
            Some(ValidationLevel::Strict)
        );
        assert_eq!(
            ValidationLevel::parse("standard"),
            Some(ValidationLevel::Standard)
        );
        assert_eq!(ValidationLevel::parse("bogus"), None);
    }

    #[test]
    fn test_level_policies() {
        assert!(ValidationLevel::Strict.checks_signature());
        assert!(ValidationLevel::Strict.fails_hard());
        assert!(ValidationLevel::Standard.checks_signature());
        assert!(!ValidationLevel::Standard.fails_hard());
        assert!(!ValidationLevel::Relaxed.checks_signature());
        assert!(ValidationLevel::Relaxed.checks_slot_checksums());
        assert!(!ValidationLevel::Minimal.checks_slot_checksums());
    }
}
