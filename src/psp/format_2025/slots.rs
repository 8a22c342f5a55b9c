// src/psp/format_2025/slots.rs
// PSPF 2025 slot descriptors - 64 bytes each, little-endian

use super::constants::{SLOT_ALIGNMENT, SLOT_DESCRIPTOR_SIZE};
use crate::exceptions::{FlavorError, Result};

/// Slot descriptor - 64 bytes total
///
/// Layout: id (u32) | reserved (4) | offset (u64) | size (u64) |
/// checksum (u64, first 8 bytes of SHA-256 of the encoded bytes, LE) |
/// operations (u64, packed op chain) | reserved (24).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotDescriptor {
    pub id: u32,         // Stable numeric identifier within the package
    pub offset: u64,     // Absolute file offset of the slot's bytes
    pub size: u64,       // Encoded byte length
    pub checksum: u64,   // SHA-256 prefix of the encoded bytes
    pub operations: u64, // Packed operation chain (up to 8 ops)
}

impl SlotDescriptor {
    /// Create a new slot descriptor
    pub fn new(id: u32) -> Self {
        SlotDescriptor {
            id,
            offset: 0,
            size: 0,
            checksum: 0,
            operations: 0,
        }
    }

    /// Pack descriptor to bytes
    pub fn pack(&self) -> [u8; SLOT_DESCRIPTOR_SIZE] {
        let mut bytes = [0u8; SLOT_DESCRIPTOR_SIZE];

        bytes[0..4].copy_from_slice(&self.id.to_le_bytes());
        // 4..8 reserved
        bytes[8..16].copy_from_slice(&self.offset.to_le_bytes());
        bytes[16..24].copy_from_slice(&self.size.to_le_bytes());
        bytes[24..32].copy_from_slice(&self.checksum.to_le_bytes());
        bytes[32..40].copy_from_slice(&self.operations.to_le_bytes());
        // 40..64 reserved

        bytes
    }

    /// Unpack descriptor from bytes
    pub fn unpack(data: &[u8]) -> Result<Self> {
        if data.len() != SLOT_DESCRIPTOR_SIZE {
            return Err(FlavorError::FormatViolation(format!(
                "Invalid slot descriptor size: {} != {}",
                data.len(),
                SLOT_DESCRIPTOR_SIZE
            )));
        }

        let read_u64 = |range: std::ops::Range<usize>| -> Result<u64> {
            Ok(u64::from_le_bytes(data[range].try_into().map_err(
                |_| FlavorError::FormatViolation("Truncated slot descriptor field".into()),
            )?))
        };

        Ok(SlotDescriptor {
            id: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
            offset: read_u64(8..16)?,
            size: read_u64(16..24)?,
            checksum: read_u64(24..32)?,
            operations: read_u64(32..40)?,
        })
    }

    /// Validate placement against the index-declared data window
    ///
    /// Every slot must be 8-byte aligned, start at or after the end of the
    /// metadata region, and end at or before the slot table.
    pub fn validate(&self, data_start: u64, slot_table_offset: u64) -> Result<()> {
        if self.offset % SLOT_ALIGNMENT != 0 {
            return Err(FlavorError::FormatViolation(format!(
                "Slot {} offset {:#x} is not {}-byte aligned",
                self.id, self.offset, SLOT_ALIGNMENT
            )));
        }
        if self.offset < data_start {
            return Err(FlavorError::FormatViolation(format!(
                "Slot {} offset {:#x} precedes the data region at {:#x}",
                self.id, self.offset, data_start
            )));
        }
        let end = self.offset.checked_add(self.size).ok_or_else(|| {
            FlavorError::FormatViolation(format!("Slot {} extent overflows", self.id))
        })?;
        if end > slot_table_offset {
            return Err(FlavorError::FormatViolation(format!(
                "Slot {} extends past the slot table ({:#x} > {:#x})",
                self.id, end, slot_table_offset
            )));
        }
        Ok(())
    }
}

/// Align offset up to the given power-of-two boundary
pub fn align_offset(offset: u64, alignment: u64) -> u64 {
    (offset + alignment - 1) & !(alignment - 1)
}
