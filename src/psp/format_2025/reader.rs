// src/psp/format_2025/reader.rs
// PSPF 2025 package reader - trailer location, structural validation, slot access

use log::{debug, trace, warn};
use std::path::{Path, PathBuf};

use super::backends::{BackendMode, StorageBackend, open_backend};
use super::checksums::checksum64;
use super::constants::{MAGIC_TRAILER_SIZE, SLOT_DESCRIPTOR_SIZE, TRAILER_END_BYTES, TRAILER_START_BYTES};
use super::defaults::{ValidationLevel, get_validation_level};
use super::index::{Index, Trailer};
use super::metadata::{Metadata, decode_metadata};
use super::operations::unpack_operations;
use super::pipeline::reverse_chain;
use super::slots::SlotDescriptor;
use super::verifier::{IntegrityReport, verify_integrity_with_level};
use crate::exceptions::{FlavorError, Result};

/// Reader for PSPF/2025 packages
///
/// Exclusively borrows the file for its lifetime; the backend holds exactly
/// one read mapping or one read handle.
pub struct Reader {
    backend: Box<dyn StorageBackend>,
    path: PathBuf,
    trailer: Option<Trailer>,
    metadata: Option<Metadata>,
}

impl std::fmt::Debug for Reader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reader")
            .field("path", &self.path)
            .field("trailer", &self.trailer.as_ref().map(|_| "<Trailer>"))
            .field("metadata", &self.metadata.as_ref().map(|_| "<Metadata>"))
            .finish()
    }
}

impl Reader {
    /// Open a package with automatic backend selection
    pub fn open(path: &Path) -> Result<Self> {
        Self::with_backend(path, BackendMode::Auto)
    }

    /// Open a package with a specific backend mode
    pub fn with_backend(path: &Path, mode: BackendMode) -> Result<Self> {
        trace!("Opening reader for {:?} with {:?} backend", path, mode);
        let backend = open_backend(mode, path)?;

        Ok(Self {
            backend,
            path: path.to_path_buf(),
            trailer: None,
            metadata: None,
        })
    }

    /// Path of the underlying package file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check both trailer sentinels without parsing the index
    pub fn verify_magic_trailer(&self) -> Result<bool> {
        let size = self.backend.size();
        if size < MAGIC_TRAILER_SIZE as u64 {
            return Ok(false);
        }

        let end = self.backend.read_at(size - 4, 4)?;
        if end != TRAILER_END_BYTES {
            return Ok(false);
        }

        let start = self
            .backend
            .read_at(size - MAGIC_TRAILER_SIZE as u64, 4)?;
        Ok(start == TRAILER_START_BYTES)
    }

    /// Read and cache the trailer from the end of the file
    ///
    /// An index CRC mismatch is a hard error under the strict tier; all other
    /// tiers log a warning and use the index as read.
    pub fn read_trailer(&mut self) -> Result<&Trailer> {
        if self.trailer.is_none() {
            let size = self.backend.size();
            if size < MAGIC_TRAILER_SIZE as u64 {
                return Err(FlavorError::FormatViolation(format!(
                    "File too small for a trailer: {size} bytes"
                )));
            }

            let raw = self
                .backend
                .read_at(size - MAGIC_TRAILER_SIZE as u64, MAGIC_TRAILER_SIZE)?;
            let trailer = Trailer::unpack(&raw)?;

            if !Index::verify_checksum_raw(&raw[..super::constants::INDEX_SIZE]) {
                if get_validation_level().fails_hard() {
                    return Err(FlavorError::FormatViolation(
                        "Index checksum mismatch".into(),
                    ));
                }
                warn!("Index checksum mismatch, continuing at current validation level");
            }

            trailer.index.validate(size)?;

            let pkg_size = trailer.index.package_size;
            let slot_count = trailer.index.slot_count;
            debug!("Trailer parsed: package_size={pkg_size}, slot_count={slot_count}");

            self.trailer = Some(trailer);
        }

        self.trailer
            .as_ref()
            .ok_or_else(|| FlavorError::Generic("Failed to read trailer".into()))
    }

    /// The locator index inside the trailer
    pub fn read_index(&mut self) -> Result<&Index> {
        Ok(&self.read_trailer()?.index)
    }

    /// Raw compressed metadata region bytes
    pub fn read_metadata_bytes(&mut self) -> Result<Vec<u8>> {
        let index = self.read_index()?.clone();
        self.backend
            .read_at(index.metadata_offset, index.metadata_size as usize)
    }

    /// Read, decode, and cache the metadata document
    pub fn read_metadata(&mut self) -> Result<&Metadata> {
        if self.metadata.is_none() {
            let compressed = self.read_metadata_bytes()?;
            let metadata = decode_metadata(&compressed)?;
            debug!(
                "Parsed metadata for {} v{}",
                metadata.package.name, metadata.package.version
            );
            self.metadata = Some(metadata);
        }

        self.metadata
            .as_ref()
            .ok_or_else(|| FlavorError::Generic("Failed to read metadata".into()))
    }

    /// Read and validate all slot descriptors from the slot table
    pub fn read_slot_descriptors(&mut self) -> Result<Vec<SlotDescriptor>> {
        let index = self.read_index()?.clone();
        let data_start = index.metadata_offset + index.metadata_size;
        let mut descriptors = Vec::with_capacity(index.slot_count as usize);

        trace!(
            "Reading {} slot descriptors from {:#x}",
            index.slot_count, index.slot_table_offset
        );

        for i in 0..index.slot_count {
            let offset = index.slot_table_offset + u64::from(i) * SLOT_DESCRIPTOR_SIZE as u64;
            let raw = self.backend.read_at(offset, SLOT_DESCRIPTOR_SIZE)?;
            let descriptor = SlotDescriptor::unpack(&raw)?;
            descriptor.validate(data_start, index.slot_table_offset)?;
            descriptors.push(descriptor);
        }

        Ok(descriptors)
    }

    /// Read a slot's encoded bytes by index
    pub fn read_slot(&mut self, slot_index: usize) -> Result<Vec<u8>> {
        let descriptors = self.read_slot_descriptors()?;
        let descriptor = descriptors.get(slot_index).ok_or_else(|| {
            FlavorError::InvalidInput(format!("Slot index {slot_index} out of range"))
        })?;
        self.backend.read_slot(descriptor)
    }

    /// Read a slot and reverse its op chain, returning the decoded bytes
    pub fn read_slot_data(&mut self, slot_index: usize) -> Result<Vec<u8>> {
        let descriptors = self.read_slot_descriptors()?;
        let descriptor = descriptors.get(slot_index).ok_or_else(|| {
            FlavorError::InvalidInput(format!("Slot index {slot_index} out of range"))
        })?;
        let encoded = self.backend.read_slot(descriptor)?;
        let operations = unpack_operations(descriptor.operations);
        reverse_chain(&operations, &encoded)
    }

    /// Extract a slot under `dest_dir`, returning the created path
    ///
    /// TAR-chained slots expand into a directory named by the slot id; other
    /// slots are written as a single file. Both go through a temp path and an
    /// atomic rename.
    pub fn extract_slot(&mut self, slot_index: usize, dest_dir: &Path) -> Result<PathBuf> {
        let descriptors = self.read_slot_descriptors()?;
        let descriptor = *descriptors.get(slot_index).ok_or_else(|| {
            FlavorError::InvalidInput(format!("Slot index {slot_index} out of range"))
        })?;

        let operations = unpack_operations(descriptor.operations);
        let encoded = self.backend.read_slot(&descriptor)?;
        let decoded = reverse_chain(&operations, &encoded)?;

        let slot_id = self.read_metadata()?.slot_id(slot_index);
        let target = dest_dir.join(&slot_id);
        std::fs::create_dir_all(dest_dir)?;

        trace!(
            "Extracting slot {slot_index} ({} bytes decoded) to {:?}",
            decoded.len(),
            target
        );

        if operations.contains(&super::constants::OP_TAR) {
            extract_tar_atomic(&decoded, dest_dir, &target)?;
        } else {
            write_file_atomic(&decoded, dest_dir, &target)?;
        }

        Ok(target)
    }

    /// Verify every slot's stored checksum against its encoded bytes
    pub fn verify_all_checksums(&mut self) -> Result<bool> {
        let descriptors = self.read_slot_descriptors()?;
        let mut all_valid = true;

        for (i, descriptor) in descriptors.iter().enumerate() {
            let encoded = self.backend.read_slot(descriptor)?;
            let actual = checksum64(&encoded);
            if actual != descriptor.checksum {
                warn!(
                    "Slot {} checksum mismatch: stored {:#018x}, computed {:#018x}",
                    i, descriptor.checksum, actual
                );
                all_valid = false;
            }
        }

        Ok(all_valid)
    }

    /// Run the tiered integrity check at the process-configured level
    pub fn verify_integrity(&mut self) -> Result<IntegrityReport> {
        let level = get_validation_level();
        verify_integrity_with_level(self, level)
    }

    /// Run the tiered integrity check at an explicit level (test override)
    pub fn verify_integrity_at(&mut self, level: ValidationLevel) -> Result<IntegrityReport> {
        verify_integrity_with_level(self, level)
    }
}

fn write_file_atomic(data: &[u8], parent: &Path, target: &Path) -> Result<()> {
    use std::io::Write;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(data)?;
    tmp.flush()?;
    tmp.persist(target)
        .map_err(|e| FlavorError::IoError(e.error))?;
    Ok(())
}

fn extract_tar_atomic(data: &[u8], parent: &Path, target: &Path) -> Result<()> {
    let staging = tempfile::tempdir_in(parent)?;
    let mut archive = tar::Archive::new(std::io::Cursor::new(data));
    archive.set_preserve_permissions(true);
    archive.unpack(staging.path())?;

    if target.exists() {
        if target.is_dir() {
            std::fs::remove_dir_all(target)?;
        } else {
            std::fs::remove_file(target)?;
        }
    }

    // Keep the staging dir alive until the rename lands
    let staging_path = staging.keep();
    std::fs::rename(&staging_path, target)?;
    Ok(())
}

impl Drop for Reader {
    fn drop(&mut self) {
        let _ = self.backend.close();
    }
}
