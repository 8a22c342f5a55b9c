// src/psp/format_2025/index.rs
// PSPF 2025 index block and MagicTrailer packing

use super::checksums::crc32;
use super::constants::{
    FORMAT_VERSION, INDEX_SIZE, MAGIC_TRAILER_SIZE, PUBLIC_KEY_OFFSET, PUBLIC_KEY_SIZE,
    SIGNATURE_FIELD_SIZE, SIGNATURE_OFFSET, TRAILER_END_BYTES, TRAILER_START_BYTES,
};
use crate::exceptions::{FlavorError, Result};

/// PSPF/2025 index block (packs to exactly 256 bytes)
///
/// The index begins with the start-of-trailer sentinel and locates every
/// region of the package file by absolute offset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Index {
    pub format_version: u32, // 0x20250001
    pub index_checksum: u32, // CRC-32 of index block (with this field as 0)
    pub package_size: u64,   // Total file size
    pub launcher_size: u64,  // Size of launcher binary
    pub metadata_offset: u64, // Offset to metadata region (== launcher_size)
    pub metadata_size: u64,  // Size of compressed metadata region
    pub slot_table_offset: u64, // Offset to slot descriptor table
    pub slot_table_size: u64, // slot_count * 64
    pub slot_count: u32,     // Number of slots
}

impl Index {
    /// Create a new index with defaults
    pub fn new() -> Self {
        Index {
            format_version: FORMAT_VERSION,
            index_checksum: 0,
            package_size: 0,
            launcher_size: 0,
            metadata_offset: 0,
            metadata_size: 0,
            slot_table_offset: 0,
            slot_table_size: 0,
            slot_count: 0,
        }
    }

    /// Pack the index to its 256-byte on-disk form
    ///
    /// The checksum field is recomputed over the packed block with the field
    /// temporarily zeroed, then patched in.
    pub fn pack(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; INDEX_SIZE];

        bytes[0..4].copy_from_slice(TRAILER_START_BYTES);
        bytes[4..8].copy_from_slice(&self.format_version.to_le_bytes());
        // bytes 8..12 stay zero until the checksum is computed
        bytes[12..20].copy_from_slice(&self.package_size.to_le_bytes());
        bytes[20..28].copy_from_slice(&self.launcher_size.to_le_bytes());
        bytes[28..36].copy_from_slice(&self.metadata_offset.to_le_bytes());
        bytes[36..44].copy_from_slice(&self.metadata_size.to_le_bytes());
        bytes[44..52].copy_from_slice(&self.slot_table_offset.to_le_bytes());
        bytes[52..60].copy_from_slice(&self.slot_table_size.to_le_bytes());
        bytes[60..64].copy_from_slice(&self.slot_count.to_le_bytes());
        // 64..256 reserved, zero-filled

        let checksum = crc32(&bytes);
        bytes[8..12].copy_from_slice(&checksum.to_le_bytes());

        bytes
    }

    /// Unpack an index from its 256-byte on-disk form
    pub fn unpack(data: &[u8]) -> Result<Self> {
        if data.len() != INDEX_SIZE {
            return Err(FlavorError::FormatViolation(format!(
                "Invalid index size: {} != {}",
                data.len(),
                INDEX_SIZE
            )));
        }

        if &data[0..4] != TRAILER_START_BYTES {
            return Err(FlavorError::FormatViolation(
                "Invalid index: missing start-of-trailer sentinel".into(),
            ));
        }

        let read_u32 = |range: std::ops::Range<usize>| -> Result<u32> {
            Ok(u32::from_le_bytes(data[range].try_into().map_err(
                |_| FlavorError::FormatViolation("Truncated index field".into()),
            )?))
        };
        let read_u64 = |range: std::ops::Range<usize>| -> Result<u64> {
            Ok(u64::from_le_bytes(data[range].try_into().map_err(
                |_| FlavorError::FormatViolation("Truncated index field".into()),
            )?))
        };

        let format_version = read_u32(4..8)?;
        if format_version != FORMAT_VERSION {
            return Err(FlavorError::UnsupportedFormat(format!(
                "Unknown format version {format_version:#010x}"
            )));
        }

        Ok(Index {
            format_version,
            index_checksum: read_u32(8..12)?,
            package_size: read_u64(12..20)?,
            launcher_size: read_u64(20..28)?,
            metadata_offset: read_u64(28..36)?,
            metadata_size: read_u64(36..44)?,
            slot_table_offset: read_u64(44..52)?,
            slot_table_size: read_u64(52..60)?,
            slot_count: read_u32(60..64)?,
        })
    }

    /// Verify the index checksum against the raw 256-byte block
    pub fn verify_checksum_raw(raw_data: &[u8]) -> bool {
        if raw_data.len() != INDEX_SIZE {
            return false;
        }

        let stored = u32::from_le_bytes([raw_data[8], raw_data[9], raw_data[10], raw_data[11]]);

        let mut data_copy = raw_data.to_vec();
        data_copy[8..12].copy_from_slice(&[0, 0, 0, 0]);

        crc32(&data_copy) == stored
    }

    /// Structural invariants of the locator offsets (spec-level, not I/O)
    pub fn validate(&self, file_size: u64) -> Result<()> {
        if self.package_size != file_size {
            return Err(FlavorError::FormatViolation(format!(
                "Recorded package size {} does not match file size {}",
                self.package_size, file_size
            )));
        }
        if self.metadata_offset != self.launcher_size {
            return Err(FlavorError::FormatViolation(format!(
                "metadata_offset {:#x} != launcher_size {:#x}",
                self.metadata_offset, self.launcher_size
            )));
        }
        if self.slot_table_size != self.slot_count as u64 * 64 {
            return Err(FlavorError::FormatViolation(format!(
                "slot_table_size {} inconsistent with slot_count {}",
                self.slot_table_size, self.slot_count
            )));
        }
        let expected_end = self
            .slot_table_offset
            .checked_add(self.slot_table_size)
            .and_then(|v| v.checked_add(MAGIC_TRAILER_SIZE as u64));
        if expected_end != Some(self.package_size) {
            return Err(FlavorError::FormatViolation(format!(
                "slot_table_offset {} + slot_table_size {} + trailer {} != package_size {}",
                self.slot_table_offset, self.slot_table_size, MAGIC_TRAILER_SIZE, self.package_size
            )));
        }
        Ok(())
    }
}

impl Default for Index {
    fn default() -> Self {
        Self::new()
    }
}

/// The fixed-size structure at the end of every package file
///
/// Layout: index block (256) | public key (32) | signature field (512) |
/// reserved padding | end sentinel (4). Total MAGIC_TRAILER_SIZE bytes.
#[derive(Clone, Debug)]
pub struct Trailer {
    pub index: Index,
    pub public_key: [u8; PUBLIC_KEY_SIZE],
    pub integrity_signature: [u8; SIGNATURE_FIELD_SIZE],
}

impl Trailer {
    pub fn new(index: Index) -> Self {
        Trailer {
            index,
            public_key: [0u8; PUBLIC_KEY_SIZE],
            integrity_signature: [0u8; SIGNATURE_FIELD_SIZE],
        }
    }

    /// Pack the full trailer including both sentinels
    pub fn pack(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; MAGIC_TRAILER_SIZE];

        bytes[..INDEX_SIZE].copy_from_slice(&self.index.pack());
        bytes[PUBLIC_KEY_OFFSET..PUBLIC_KEY_OFFSET + PUBLIC_KEY_SIZE]
            .copy_from_slice(&self.public_key);
        bytes[SIGNATURE_OFFSET..SIGNATURE_OFFSET + SIGNATURE_FIELD_SIZE]
            .copy_from_slice(&self.integrity_signature);
        bytes[MAGIC_TRAILER_SIZE - 4..].copy_from_slice(TRAILER_END_BYTES);

        bytes
    }

    /// Unpack a trailer from its full on-disk form, verifying both sentinels
    pub fn unpack(data: &[u8]) -> Result<Self> {
        if data.len() != MAGIC_TRAILER_SIZE {
            return Err(FlavorError::FormatViolation(format!(
                "Invalid trailer size: {} != {}",
                data.len(),
                MAGIC_TRAILER_SIZE
            )));
        }

        if &data[MAGIC_TRAILER_SIZE - 4..] != TRAILER_END_BYTES {
            return Err(FlavorError::FormatViolation(
                "Invalid trailer: missing end-of-file sentinel".into(),
            ));
        }

        let index = Index::unpack(&data[..INDEX_SIZE])?;

        let mut public_key = [0u8; PUBLIC_KEY_SIZE];
        public_key.copy_from_slice(&data[PUBLIC_KEY_OFFSET..PUBLIC_KEY_OFFSET + PUBLIC_KEY_SIZE]);

        let mut integrity_signature = [0u8; SIGNATURE_FIELD_SIZE];
        integrity_signature
            .copy_from_slice(&data[SIGNATURE_OFFSET..SIGNATURE_OFFSET + SIGNATURE_FIELD_SIZE]);

        Ok(Trailer {
            index,
            public_key,
            integrity_signature,
        })
    }

    /// The 64 signature bytes Ed25519 actually uses
    pub fn signature_bytes(&self) -> [u8; 64] {
        let mut sig = [0u8; 64];
        sig.copy_from_slice(&self.integrity_signature[..64]);
        sig
    }

    /// Store a 64-byte signature into the zero-padded signature field
    pub fn set_signature(&mut self, signature: &[u8; 64]) {
        self.integrity_signature = [0u8; SIGNATURE_FIELD_SIZE];
        self.integrity_signature[..64].copy_from_slice(signature);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_index() -> Index {
        Index {
            format_version: FORMAT_VERSION,
            index_checksum: 0,
            package_size: 100_000,
            launcher_size: 50_000,
            metadata_offset: 50_000,
            metadata_size: 1_234,
            slot_table_offset: 91_736,
            slot_table_size: 64,
            slot_count: 1,
        }
    }

    #[test]
    fn test_index_pack_size() {
        assert_eq!(sample_index().pack().len(), INDEX_SIZE);
    }

    #[test]
    fn test_index_round_trip() {
        let index = sample_index();
        let packed = index.pack();
        let unpacked = Index::unpack(&packed).unwrap();
        // The packed form carries the computed checksum
        assert_eq!(unpacked.package_size, index.package_size);
        assert_eq!(unpacked.launcher_size, index.launcher_size);
        assert_eq!(unpacked.metadata_offset, index.metadata_offset);
        assert_eq!(unpacked.metadata_size, index.metadata_size);
        assert_eq!(unpacked.slot_table_offset, index.slot_table_offset);
        assert_eq!(unpacked.slot_count, index.slot_count);
        // And re-packing it reproduces the identical bytes
        assert_eq!(unpacked.pack(), packed);
    }

    #[test]
    fn test_index_checksum_verifies() {
        let packed = sample_index().pack();
        assert!(Index::verify_checksum_raw(&packed));
    }

    #[test]
    fn test_index_checksum_detects_flip() {
        let mut packed = sample_index().pack();
        packed[20] ^= 0xFF;
        assert!(!Index::verify_checksum_raw(&packed));
    }

    #[test]
    fn test_index_rejects_bad_sentinel() {
        let mut packed = sample_index().pack();
        packed[0] = b'X';
        assert!(Index::unpack(&packed).is_err());
    }

    #[test]
    fn test_trailer_round_trip() {
        let mut trailer = Trailer::new(sample_index());
        trailer.public_key = [7u8; PUBLIC_KEY_SIZE];
        trailer.set_signature(&[9u8; 64]);

        let packed = trailer.pack();
        assert_eq!(packed.len(), MAGIC_TRAILER_SIZE);
        assert_eq!(&packed[..4], TRAILER_START_BYTES);
        assert_eq!(&packed[MAGIC_TRAILER_SIZE - 4..], TRAILER_END_BYTES);

        let unpacked = Trailer::unpack(&packed).unwrap();
        assert_eq!(unpacked.public_key, trailer.public_key);
        assert_eq!(unpacked.signature_bytes(), trailer.signature_bytes());
        assert_eq!(unpacked.index.package_size, 100_000);
    }

    #[test]
    fn test_trailer_rejects_missing_end_sentinel() {
        let mut packed = Trailer::new(sample_index()).pack();
        let len = packed.len();
        packed[len - 1] = 0;
        assert!(Trailer::unpack(&packed).is_err());
    }

    #[test]
    fn test_index_validate_invariants() {
        // 91_736 + 64 + 8200 == 100_000
        let good = sample_index();
        assert!(good.validate(100_000).is_ok());

        let mut bad = good.clone();
        bad.metadata_offset = 1;
        assert!(bad.validate(100_000).is_err());

        let mut short = good.clone();
        short.slot_table_offset -= 8;
        assert!(short.validate(100_000).is_err());

        assert!(good.validate(99_999).is_err());
    }
}
