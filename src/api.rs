//! High-level API for flavorpack operations

use crate::exceptions::{FlavorError, Result};
use crate::psp::{self, PackageFormat};
use std::path::Path;

/// Options for building a package
#[derive(Debug, Default)]
pub struct BuildOptions {
    /// Path to launcher binary
    pub launcher_bin: Option<std::path::PathBuf>,
    /// Path to private key file (PEM format)
    pub private_key_path: Option<std::path::PathBuf>,
    /// Path to public key file (PEM format)
    pub public_key_path: Option<std::path::PathBuf>,
    /// Seed for deterministic key generation
    pub key_seed: Option<String>,
    /// Zero timestamps and fix ordering for reproducible output
    pub deterministic: bool,
}

/// Options for launching a package
#[derive(Debug, Default)]
pub struct LaunchOptions {
    /// Working directory override for extraction
    pub workdir: Option<String>,
}

/// Result of package verification
#[derive(Debug)]
pub struct VerifyResult {
    pub format: String,
    pub version: String,
    pub valid: bool,
    pub signature_valid: bool,
    pub slot_count: usize,
    pub package_name: String,
    pub package_version: String,
}

/// Build a PSPF package from a manifest file
pub fn build_package(
    manifest_path: &Path,
    output_path: &Path,
    options: BuildOptions,
) -> Result<()> {
    let manifest = psp::format_2025::manifest::read_manifest(manifest_path)?;
    let base_dir = manifest_path.parent().unwrap_or_else(|| Path::new("."));

    let key_config = psp::format_2025::keys::KeyConfig {
        seed: options.key_seed.clone(),
        private_key_path: options.private_key_path.clone(),
        public_key_path: options.public_key_path.clone(),
        ..Default::default()
    };

    let launcher_path = match options.launcher_bin {
        Some(ref path) => path.clone(),
        None => match std::env::var("FLAVOR_LAUNCHER_BIN") {
            Ok(path) => std::path::PathBuf::from(path),
            Err(_) => {
                return Err(FlavorError::BuildError(
                    "Launcher binary path must be specified via --launcher-bin or \
                     FLAVOR_LAUNCHER_BIN environment variable"
                        .to_string(),
                ));
            }
        },
    };

    let builder =
        psp::format_2025::manifest::builder_from_manifest(&manifest, base_dir, key_config)?
            .launcher_file(&launcher_path)
            .deterministic(options.deterministic);

    builder.build(output_path)?;
    Ok(())
}

/// Launch a PSPF package
pub fn launch_package(package_path: &Path, args: &[String], options: LaunchOptions) -> Result<i32> {
    let format = psp::detect_format(package_path)?;

    match format {
        PackageFormat::PSPF2025 => psp::format_2025::launch(package_path, args, &options),
    }
}

/// Verify a PSPF package at the process-configured validation level
pub fn verify_package(package_path: &Path) -> Result<VerifyResult> {
    let format = psp::detect_format(package_path)?;

    match format {
        PackageFormat::PSPF2025 => {
            let mut reader = psp::format_2025::Reader::open(package_path)?;
            let report = reader.verify_integrity()?;
            let index = reader.read_index()?.clone();
            let metadata = reader.read_metadata()?;

            Ok(VerifyResult {
                format: metadata.format.clone(),
                version: format!("{:#010x}", index.format_version),
                valid: report.valid,
                signature_valid: report.signature_valid,
                slot_count: index.slot_count as usize,
                package_name: metadata.package.name.clone(),
                package_version: metadata.package.version.clone(),
            })
        }
    }
}
