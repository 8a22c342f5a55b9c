//! PSPF/2025 package builder
//!
//! A fluent builder gathers metadata, slots, key configuration, and options,
//! then assembles the container: launcher | metadata | slots | slot table |
//! trailer, written through a temp path and an atomic rename.

mod metadata;
mod slot_processor;

pub use slot_processor::{SlotSource, SlotSpec};

use log::{debug, info, trace};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::constants::{MAGIC_TRAILER_SIZE, SLOT_ALIGNMENT, SLOT_DESCRIPTOR_SIZE};
use super::defaults::DEFAULT_COMPRESSION_LEVEL;
use super::index::{Index, Trailer};
use super::keys::{KeyConfig, resolve_keys};
use super::metadata::{CacheValidationInfo, RuntimeInfo, SetupCommand, compress_metadata, to_canonical_json};
use super::pe_utils::process_launcher;
use super::slots::align_offset;
use crate::exceptions::{FlavorError, Result};

/// Where the launcher prefix comes from
#[derive(Debug, Clone)]
enum LauncherSource {
    Bytes(Vec<u8>),
    File(PathBuf),
}

/// Summary of a completed build
#[derive(Debug, Clone)]
pub struct BuildReport {
    pub output_path: PathBuf,
    pub package_size: u64,
    pub slot_count: usize,
}

/// Fluent builder for PSPF/2025 packages
#[derive(Debug)]
pub struct PackageBuilder {
    name: String,
    version: String,
    description: Option<String>,
    command: String,
    primary_slot: usize,
    environment: BTreeMap<String, String>,
    launcher: Option<LauncherSource>,
    slots: Vec<SlotSpec>,
    key_config: KeyConfig,
    compression_level: u32,
    deterministic: bool,
    cache_validation: Option<CacheValidationInfo>,
    setup_commands: Vec<SetupCommand>,
    runtime: Option<RuntimeInfo>,
}

impl PackageBuilder {
    /// Start a builder for the given package identity
    pub fn new(name: &str, version: &str) -> Self {
        PackageBuilder {
            name: name.to_string(),
            version: version.to_string(),
            description: None,
            command: String::new(),
            primary_slot: 0,
            environment: BTreeMap::new(),
            launcher: None,
            slots: Vec::new(),
            key_config: KeyConfig::default(),
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            deterministic: false,
            cache_validation: None,
            setup_commands: Vec::new(),
            runtime: None,
        }
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    /// The payload command executed after extraction
    pub fn command(mut self, command: &str) -> Self {
        self.command = command.to_string();
        self
    }

    pub fn primary_slot(mut self, index: usize) -> Self {
        self.primary_slot = index;
        self
    }

    /// Add an execution-environment override exported to the payload
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.environment.insert(key.to_string(), value.to_string());
        self
    }

    /// Launcher binary provided as bytes
    pub fn launcher_bytes(mut self, data: Vec<u8>) -> Self {
        self.launcher = Some(LauncherSource::Bytes(data));
        self
    }

    /// Launcher binary read from a file at build time
    pub fn launcher_file(mut self, path: &Path) -> Self {
        self.launcher = Some(LauncherSource::File(path.to_path_buf()));
        self
    }

    pub fn add_slot(mut self, spec: SlotSpec) -> Self {
        self.slots.push(spec);
        self
    }

    pub fn keys(mut self, config: KeyConfig) -> Self {
        self.key_config = config;
        self
    }

    /// Deterministic key derivation from a seed string
    pub fn key_seed(mut self, seed: &str) -> Self {
        self.key_config.seed = Some(seed.to_string());
        self
    }

    /// Compression level in [1, 9] for level-honoring codecs
    pub fn compression_level(mut self, level: u32) -> Self {
        self.compression_level = level;
        self
    }

    /// Zero timestamps and fix ordering for byte-identical rebuilds
    pub fn deterministic(mut self, deterministic: bool) -> Self {
        self.deterministic = deterministic;
        self
    }

    pub fn cache_validation(mut self, check_file: &str, expected_content: &str) -> Self {
        self.cache_validation = Some(CacheValidationInfo {
            check_file: check_file.to_string(),
            expected_content: expected_content.to_string(),
        });
        self
    }

    pub fn setup_command(mut self, command: SetupCommand) -> Self {
        self.setup_commands.push(command);
        self
    }

    pub fn runtime(mut self, runtime: RuntimeInfo) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Assemble and atomically write the package file
    pub fn build(self, output_path: &Path) -> Result<BuildReport> {
        info!(
            "Building PSPF/2025 package {} v{} -> {}",
            self.name,
            self.version,
            output_path.display()
        );

        if self.command.is_empty() {
            return Err(FlavorError::BuildError(
                "Execution command is required".into(),
            ));
        }
        if !self.slots.is_empty() && self.primary_slot >= self.slots.len() {
            return Err(FlavorError::BuildError(format!(
                "primary_slot {} out of range for {} slot(s)",
                self.primary_slot,
                self.slots.len()
            )));
        }

        // Keys first so a bad key config fails before any I/O
        let (signing_key, verifying_key) = resolve_keys(&self.key_config)?;

        let launcher_raw = match &self.launcher {
            Some(LauncherSource::Bytes(data)) => data.clone(),
            Some(LauncherSource::File(path)) => std::fs::read(path).map_err(|e| {
                FlavorError::BuildError(format!(
                    "Failed to read launcher '{}': {e}",
                    path.display()
                ))
            })?,
            None => {
                return Err(FlavorError::BuildError(
                    "Launcher binary is required".into(),
                ));
            }
        };
        let launcher_data = process_launcher(launcher_raw)?;
        let launcher_size = launcher_data.len() as u64;
        debug!("Launcher region: {launcher_size} bytes");

        // Encode every slot and record checksums
        let processed =
            slot_processor::process_slots(&self.slots, self.compression_level, self.deterministic)?;

        // Canonical metadata, deterministic gzip, then the seal over the
        // compressed region bytes
        let metadata_doc = metadata::create_metadata(
            &self.name,
            &self.version,
            self.description.clone(),
            &self.command,
            self.primary_slot,
            self.environment.clone(),
            processed.iter().map(|p| p.metadata.clone()).collect(),
            self.cache_validation.clone(),
            self.setup_commands.clone(),
            self.runtime.clone(),
            self.deterministic,
        );
        let metadata_json = to_canonical_json(&metadata_doc)?;
        let compressed_metadata = compress_metadata(&metadata_json)?;
        let signature = super::crypto::sign_metadata(&signing_key, &compressed_metadata);

        // Layout: launcher | metadata | slots (8-aligned) | table | trailer
        let metadata_offset = launcher_size;
        let metadata_size = compressed_metadata.len() as u64;

        let mut descriptors = Vec::with_capacity(processed.len());
        let mut cursor = metadata_offset + metadata_size;
        for slot in &processed {
            cursor = align_offset(cursor, SLOT_ALIGNMENT);
            let mut descriptor = slot.descriptor;
            descriptor.offset = cursor;
            cursor += slot.encoded.len() as u64;
            descriptors.push(descriptor);
        }

        let slot_table_offset = align_offset(cursor, SLOT_ALIGNMENT);
        let slot_table_size = (descriptors.len() * SLOT_DESCRIPTOR_SIZE) as u64;
        let package_size = slot_table_offset + slot_table_size + MAGIC_TRAILER_SIZE as u64;

        let mut index = Index::new();
        index.package_size = package_size;
        index.launcher_size = launcher_size;
        index.metadata_offset = metadata_offset;
        index.metadata_size = metadata_size;
        index.slot_table_offset = slot_table_offset;
        index.slot_table_size = slot_table_size;
        index.slot_count = descriptors.len() as u32;

        let mut trailer = Trailer::new(index);
        trailer.public_key.copy_from_slice(verifying_key.as_bytes());
        trailer.set_signature(&signature);

        write_package(
            output_path,
            &launcher_data,
            &compressed_metadata,
            &processed,
            &descriptors,
            slot_table_offset,
            &trailer,
        )?;

        info!(
            "Built {}: {} bytes, {} slot(s)",
            output_path.display(),
            package_size,
            descriptors.len()
        );

        Ok(BuildReport {
            output_path: output_path.to_path_buf(),
            package_size,
            slot_count: descriptors.len(),
        })
    }
}

/// Stream every region to a temp file, then rename into place
fn write_package(
    output_path: &Path,
    launcher: &[u8],
    compressed_metadata: &[u8],
    processed: &[slot_processor::ProcessedSlot],
    descriptors: &[super::slots::SlotDescriptor],
    slot_table_offset: u64,
    trailer: &Trailer,
) -> Result<()> {
    let parent = output_path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;

    {
        let out = tmp.as_file_mut();
        let mut position: u64 = 0;

        out.write_all(launcher)?;
        position += launcher.len() as u64;

        out.write_all(compressed_metadata)?;
        position += compressed_metadata.len() as u64;

        for (slot, descriptor) in processed.iter().zip(descriptors) {
            let aligned = align_offset(position, SLOT_ALIGNMENT);
            if aligned > position {
                out.write_all(&vec![0u8; (aligned - position) as usize])?;
                position = aligned;
            }
            debug_assert_eq!(position, descriptor.offset);
            out.write_all(&slot.encoded)?;
            position += slot.encoded.len() as u64;
        }

        let aligned = align_offset(position, SLOT_ALIGNMENT);
        if aligned > position {
            out.write_all(&vec![0u8; (aligned - position) as usize])?;
            position = aligned;
        }
        debug_assert_eq!(position, slot_table_offset);

        for descriptor in descriptors {
            out.write_all(&descriptor.pack())?;
            trace!("Wrote descriptor for slot {}", descriptor.id);
        }

        out.write_all(&trailer.pack())?;
        out.flush()?;
    }

    tmp.persist(output_path)
        .map_err(|e| FlavorError::IoError(e.error))?;

    // The package file doubles as an executable
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(output_path)?.permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(output_path, perms)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::backends::BackendMode;
    use super::super::constants::{OP_GZIP, OP_TAR};
    use super::super::defaults::ValidationLevel;
    use super::super::reader::Reader;
    use super::*;

    fn fake_launcher() -> Vec<u8> {
        b"#!/bin/sh\nexit 0\n".to_vec()
    }

    fn build_demo(dir: &Path) -> PathBuf {
        let out = dir.join("demo.psp");
        PackageBuilder::new("demo", "1.0.0")
            .command("{workenv}/payload")
            .launcher_bytes(fake_launcher())
            .add_slot(SlotSpec::from_bytes(
                "payload",
                b"hello world".to_vec(),
                vec![OP_GZIP],
            ))
            .key_seed("test-seed-123")
            .build(&out)
            .unwrap();
        out
    }

    #[test]
    fn test_build_then_verify_happy_path() {
        let dir = tempfile::tempdir().unwrap();
        let package = build_demo(dir.path());

        let mut reader = Reader::open(&package).unwrap();
        assert!(reader.verify_magic_trailer().unwrap());
        assert!(reader.verify_all_checksums().unwrap());

        let report = reader.verify_integrity_at(ValidationLevel::Strict).unwrap();
        assert!(report.valid);
        assert!(report.signature_valid);
        assert!(!report.tamper_detected);

        let extract_dir = dir.path().join("out");
        let path = reader.extract_slot(0, &extract_dir).unwrap();
        assert_eq!(path, extract_dir.join("payload"));
        assert_eq!(std::fs::read(&path).unwrap(), b"hello world");
    }

    #[test]
    fn test_invariants_hold() {
        let dir = tempfile::tempdir().unwrap();
        let package = build_demo(dir.path());

        let mut reader = Reader::open(&package).unwrap();
        let index = reader.read_index().unwrap().clone();
        assert_eq!(index.metadata_offset, index.launcher_size);
        assert_eq!(
            index.slot_table_offset + index.slot_table_size + MAGIC_TRAILER_SIZE as u64,
            index.package_size
        );

        for descriptor in reader.read_slot_descriptors().unwrap() {
            assert_eq!(descriptor.offset % SLOT_ALIGNMENT, 0);
            assert!(descriptor.offset >= index.metadata_offset + index.metadata_size);
            assert!(descriptor.offset + descriptor.size <= index.slot_table_offset);
        }
    }

    #[test]
    fn test_empty_package_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("empty.psp");
        PackageBuilder::new("empty", "0.1.0")
            .command("true")
            .launcher_bytes(fake_launcher())
            .key_seed("s")
            .build(&out)
            .unwrap();

        let mut reader = Reader::open(&out).unwrap();
        assert!(reader.verify_magic_trailer().unwrap());
        assert_eq!(reader.read_index().unwrap().slot_count, 0);
        assert!(reader.read_slot_descriptors().unwrap().is_empty());
        assert!(reader.verify_all_checksums().unwrap());
        let metadata = reader.read_metadata().unwrap();
        assert!(metadata.slots.is_empty());
    }

    #[test]
    fn test_tamper_detection_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let package = build_demo(dir.path());

        // Flip a byte inside the metadata region
        let mut bytes = std::fs::read(&package).unwrap();
        let mut probe = Reader::open(&package).unwrap();
        let index = probe.read_index().unwrap().clone();
        drop(probe);
        let target = index.metadata_offset as usize + 5;
        bytes[target] ^= 0xFF;
        std::fs::write(&package, &bytes).unwrap();

        let mut reader = Reader::with_backend(&package, BackendMode::File).unwrap();
        let strict = reader.verify_integrity_at(ValidationLevel::Strict).unwrap();
        assert!(!strict.valid);
        assert!(!strict.signature_valid);
        assert!(strict.tamper_detected);

        let standard = reader
            .verify_integrity_at(ValidationLevel::Standard)
            .unwrap();
        assert!(standard.valid);
        assert!(!standard.signature_valid);

        let none = reader.verify_integrity_at(ValidationLevel::None).unwrap();
        assert!(none.valid);
        assert!(none.signature_valid);
    }

    #[test]
    fn test_reproducible_builds() {
        let dir = tempfile::tempdir().unwrap();

        let build = |path: &Path| {
            PackageBuilder::new("repro", "2.0.0")
                .command("{workenv}/payload")
                .launcher_bytes(fake_launcher())
                .add_slot(SlotSpec::from_bytes(
                    "payload",
                    b"identical input".to_vec(),
                    vec![OP_GZIP],
                ))
                .key_seed("repro-42")
                .deterministic(true)
                .build(path)
                .unwrap()
        };

        let a = dir.path().join("a.psp");
        let b = dir.path().join("b.psp");
        build(&a);
        build(&b);

        assert_eq!(std::fs::read(&a).unwrap(), std::fs::read(&b).unwrap());
    }

    #[test]
    fn test_tar_directory_slot_extracts() {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("tree");
        std::fs::create_dir_all(tree.join("nested")).unwrap();
        std::fs::write(tree.join("top.txt"), b"top").unwrap();
        std::fs::write(tree.join("nested/deep.txt"), b"deep").unwrap();

        let out = dir.path().join("tree.psp");
        PackageBuilder::new("tree", "1.0.0")
            .command("true")
            .launcher_bytes(fake_launcher())
            .add_slot(SlotSpec::from_directory(
                "content",
                tree,
                vec![OP_TAR, OP_GZIP],
            ))
            .key_seed("s")
            .build(&out)
            .unwrap();

        let mut reader = Reader::open(&out).unwrap();
        let extract_dir = dir.path().join("x");
        let path = reader.extract_slot(0, &extract_dir).unwrap();
        assert_eq!(path, extract_dir.join("content"));
        assert_eq!(std::fs::read(path.join("top.txt")).unwrap(), b"top");
        assert_eq!(
            std::fs::read(path.join("nested/deep.txt")).unwrap(),
            b"deep"
        );
    }

    #[test]
    fn test_missing_launcher_is_build_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = PackageBuilder::new("x", "1")
            .command("true")
            .build(&dir.path().join("x.psp"))
            .unwrap_err();
        assert!(err.to_string().contains("Launcher"));
    }

    #[test]
    fn test_bad_primary_slot_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = PackageBuilder::new("x", "1")
            .command("true")
            .launcher_bytes(fake_launcher())
            .add_slot(SlotSpec::from_bytes("only", vec![1], vec![]))
            .primary_slot(3)
            .build(&dir.path().join("x.psp"))
            .unwrap_err();
        assert!(err.to_string().contains("primary_slot"));
    }
}
