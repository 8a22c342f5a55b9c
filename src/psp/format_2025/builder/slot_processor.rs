//! Slot processing for the package builder
//!
//! Turns slot specifications into encoded payloads, descriptors, and the
//! per-slot metadata entries mirrored into the document.

use log::{debug, trace};
use std::path::PathBuf;

use super::super::checksums::{checksum64, sha256_hex};
use super::super::constants::OP_TAR;
use super::super::metadata::SlotMetadata;
use super::super::operations::{operations_to_string, pack_operations};
use super::super::pipeline::apply_chain;
use super::super::slots::SlotDescriptor;
use crate::exceptions::{FlavorError, Result};

/// Where a slot's source bytes come from
#[derive(Debug, Clone)]
pub enum SlotSource {
    /// Literal bytes
    Bytes(Vec<u8>),
    /// A file read at build time
    File(PathBuf),
    /// A directory packed into a tar stream at build time (chain must
    /// include TAR)
    Directory(PathBuf),
}

/// Builder-facing slot specification
#[derive(Debug, Clone)]
pub struct SlotSpec {
    pub id: String,
    pub source: SlotSource,
    pub operations: Vec<u8>,
    pub purpose: String,
    pub lifecycle: String,
    pub target: Option<String>,
    pub content_type: Option<String>,
    pub permissions: Option<String>,
}

impl SlotSpec {
    /// A slot with literal bytes and the given op chain
    pub fn from_bytes(id: &str, data: Vec<u8>, operations: Vec<u8>) -> Self {
        SlotSpec {
            id: id.to_string(),
            source: SlotSource::Bytes(data),
            operations,
            purpose: "payload".to_string(),
            lifecycle: "runtime".to_string(),
            target: None,
            content_type: None,
            permissions: None,
        }
    }

    /// A slot sourced from a file
    pub fn from_file(id: &str, path: PathBuf, operations: Vec<u8>) -> Self {
        SlotSpec {
            id: id.to_string(),
            source: SlotSource::File(path),
            operations,
            purpose: "payload".to_string(),
            lifecycle: "runtime".to_string(),
            target: None,
            content_type: None,
            permissions: None,
        }
    }

    /// A slot sourced from a directory, tarred at build time
    pub fn from_directory(id: &str, path: PathBuf, operations: Vec<u8>) -> Self {
        SlotSpec {
            id: id.to_string(),
            source: SlotSource::Directory(path),
            operations,
            purpose: "payload".to_string(),
            lifecycle: "runtime".to_string(),
            target: None,
            content_type: None,
            permissions: None,
        }
    }

    pub fn purpose(mut self, purpose: &str) -> Self {
        self.purpose = purpose.to_string();
        self
    }

    pub fn lifecycle(mut self, lifecycle: &str) -> Self {
        self.lifecycle = lifecycle.to_string();
        self
    }

    pub fn target(mut self, target: &str) -> Self {
        self.target = Some(target.to_string());
        self
    }

    pub fn permissions(mut self, permissions: &str) -> Self {
        self.permissions = Some(permissions.to_string());
        self
    }
}

/// One fully processed slot ready for layout
#[derive(Debug)]
pub(super) struct ProcessedSlot {
    pub(super) descriptor: SlotDescriptor,
    pub(super) metadata: SlotMetadata,
    pub(super) encoded: Vec<u8>,
}

/// Apply op chains to every slot spec and record checksums
pub(super) fn process_slots(
    specs: &[SlotSpec],
    compression_level: u32,
    deterministic: bool,
) -> Result<Vec<ProcessedSlot>> {
    let mut processed = Vec::with_capacity(specs.len());

    for (i, spec) in specs.iter().enumerate() {
        trace!("Processing slot {}: {}", i, spec.id);

        let raw = load_source(spec, deterministic)?;
        let encoded = apply_chain(&spec.operations, &raw, compression_level, deterministic)?;
        let packed_ops = pack_operations(&spec.operations)?;

        let mut descriptor = SlotDescriptor::new(i as u32);
        descriptor.size = encoded.len() as u64;
        descriptor.checksum = checksum64(&encoded);
        descriptor.operations = packed_ops;

        let metadata = SlotMetadata {
            index: i,
            id: spec.id.clone(),
            operations: operations_to_string(packed_ops),
            purpose: spec.purpose.clone(),
            lifecycle: spec.lifecycle.clone(),
            target: spec.target.clone(),
            content_type: spec.content_type.clone(),
            permissions: spec.permissions.clone(),
            checksum: Some(sha256_hex(&encoded)),
        };

        debug!(
            "Slot {}: {} raw {} -> encoded {} bytes, ops '{}'",
            i,
            spec.id,
            raw.len(),
            encoded.len(),
            metadata.operations
        );

        processed.push(ProcessedSlot {
            descriptor,
            metadata,
            encoded,
        });
    }

    Ok(processed)
}

fn load_source(spec: &SlotSpec, deterministic: bool) -> Result<Vec<u8>> {
    match &spec.source {
        SlotSource::Bytes(data) => Ok(data.clone()),
        SlotSource::File(path) => std::fs::read(path).map_err(|e| {
            FlavorError::BuildError(format!("Failed to read slot source {}: {e}", path.display()))
        }),
        SlotSource::Directory(path) => {
            if !spec.operations.contains(&OP_TAR) {
                return Err(FlavorError::InvalidInput(format!(
                    "Directory slot '{}' requires a TAR op in its chain",
                    spec.id
                )));
            }
            build_tar(path, deterministic)
        }
    }
}

/// Pack a directory into an in-memory tar stream
///
/// Deterministic mode fixes member order (lexicographic), zeroes mtimes,
/// uid/gid, and owner names so identical trees give identical archives.
fn build_tar(dir: &std::path::Path, deterministic: bool) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);

    let mut entries = collect_paths(dir, dir)?;
    if deterministic {
        entries.sort();
    }

    for relative in entries {
        let full = dir.join(&relative);
        if deterministic {
            let mut header = tar::Header::new_gnu();
            let data = std::fs::read(&full)?;
            header.set_size(data.len() as u64);
            header.set_mtime(0);
            header.set_uid(0);
            header.set_gid(0);
            header.set_username("")?;
            header.set_groupname("")?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                header.set_mode(std::fs::metadata(&full)?.permissions().mode());
            }
            #[cfg(not(unix))]
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, &relative, data.as_slice())?;
        } else {
            builder.append_path_with_name(&full, &relative)?;
        }
    }

    builder
        .into_inner()
        .map_err(|e| FlavorError::BuildError(format!("Failed to build tar: {e}")))
}

fn collect_paths(root: &std::path::Path, dir: &std::path::Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            files.extend(collect_paths(root, &path)?);
        } else {
            let relative = path.strip_prefix(root).map_err(|_| {
                FlavorError::BuildError(format!("Path escape while tarring {}", path.display()))
            })?;
            files.push(relative.to_path_buf());
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::super::super::constants::{OP_GZIP, OP_TAR};
    use super::super::super::pipeline::reverse_chain;
    use super::*;

    #[test]
    fn test_process_bytes_slot() {
        let specs = vec![SlotSpec::from_bytes(
            "payload",
            b"hello world".to_vec(),
            vec![OP_GZIP],
        )];
        let processed = process_slots(&specs, 6, false).unwrap();
        assert_eq!(processed.len(), 1);

        let slot = &processed[0];
        assert_eq!(slot.descriptor.size, slot.encoded.len() as u64);
        assert_eq!(slot.metadata.operations, "gzip");
        assert_eq!(
            reverse_chain(&[OP_GZIP], &slot.encoded).unwrap(),
            b"hello world"
        );
    }

    #[test]
    fn test_raw_slot_equals_payload() {
        let specs = vec![SlotSpec::from_bytes("raw", b"as-is".to_vec(), vec![])];
        let processed = process_slots(&specs, 6, false).unwrap();
        assert_eq!(processed[0].encoded, b"as-is");
        assert_eq!(processed[0].descriptor.operations, 0);
        assert_eq!(processed[0].metadata.operations, "raw");
    }

    #[test]
    fn test_directory_slot_requires_tar() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();

        let bad = vec![SlotSpec::from_directory(
            "tree",
            dir.path().to_path_buf(),
            vec![OP_GZIP],
        )];
        assert!(process_slots(&bad, 6, false).is_err());

        let good = vec![SlotSpec::from_directory(
            "tree",
            dir.path().to_path_buf(),
            vec![OP_TAR, OP_GZIP],
        )];
        assert!(process_slots(&good, 6, false).is_ok());
    }

    #[test]
    fn test_deterministic_tar_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), b"bbb").unwrap();
        std::fs::write(dir.path().join("a.txt"), b"aaa").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/c.txt"), b"ccc").unwrap();

        let a = build_tar(dir.path(), true).unwrap();
        let b = build_tar(dir.path(), true).unwrap();
        assert_eq!(a, b);

        // And the archive unpacks to the same content
        let out = tempfile::tempdir().unwrap();
        let mut archive = tar::Archive::new(std::io::Cursor::new(a));
        archive.unpack(out.path()).unwrap();
        assert_eq!(std::fs::read(out.path().join("a.txt")).unwrap(), b"aaa");
        assert_eq!(std::fs::read(out.path().join("sub/c.txt")).unwrap(), b"ccc");
    }
}
