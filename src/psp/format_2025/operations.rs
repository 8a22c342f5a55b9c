// src/psp/format_2025/operations.rs
// Packed operation chains - up to eight single-byte op codes in a u64

use super::constants::{MAX_OPERATIONS, OP_BZIP2, OP_GZIP, OP_NONE, OP_TAR, OP_XZ, OP_ZSTD};
use crate::exceptions::{FlavorError, Result};

/// Pack a list of operations into a 64-bit integer
///
/// Operations are packed as 8-bit values in little-endian order, low byte
/// first. Trailing NONE entries are dropped by construction.
pub fn pack_operations(operations: &[u8]) -> Result<u64> {
    if operations.len() > MAX_OPERATIONS {
        return Err(FlavorError::InvalidInput(format!(
            "Maximum {} operations allowed, got {}",
            MAX_OPERATIONS,
            operations.len()
        )));
    }

    let mut packed = 0u64;
    for (i, &op) in operations.iter().enumerate() {
        packed |= (op as u64) << (i * 8);
    }

    Ok(packed)
}

/// Unpack a 64-bit integer into a list of operations
///
/// Reads low byte first and stops at the first NONE terminator.
pub fn unpack_operations(packed: u64) -> Vec<u8> {
    let mut operations = Vec::new();

    for i in 0..MAX_OPERATIONS {
        let op = ((packed >> (i * 8)) & 0xFF) as u8;
        if op == OP_NONE {
            break;
        }
        operations.push(op);
    }

    operations
}

/// Name of a single operation code
pub fn op_name(op: u8) -> Option<&'static str> {
    match op {
        OP_NONE => Some("none"),
        OP_TAR => Some("tar"),
        OP_GZIP => Some("gzip"),
        OP_BZIP2 => Some("bzip2"),
        OP_XZ => Some("xz"),
        OP_ZSTD => Some("zstd"),
        _ => None,
    }
}

/// Convert packed operations to the human-readable form stored in metadata
///
/// A raw slot is "raw"; chains join with '|' in apply order, e.g. "tar|gzip".
pub fn operations_to_string(packed: u64) -> String {
    if packed == 0 {
        return "raw".to_string();
    }

    unpack_operations(packed)
        .iter()
        .map(|&op| op_name(op).unwrap_or("unknown").to_string())
        .collect::<Vec<_>>()
        .join("|")
}

/// Parse an operation string back to a packed chain
///
/// Accepts "raw", single names, pipe-joined chains, and the usual archive
/// shorthands (tgz, tar.gz, ...).
pub fn string_to_operations(op_string: &str) -> Result<u64> {
    let op_string = op_string.trim().to_lowercase();
    if op_string.is_empty() || op_string == "raw" || op_string == "none" {
        return Ok(0);
    }

    let ops: Vec<u8> = match op_string.as_str() {
        "tgz" | "tar.gz" => vec![OP_TAR, OP_GZIP],
        "tbz2" | "tar.bz2" => vec![OP_TAR, OP_BZIP2],
        "txz" | "tar.xz" => vec![OP_TAR, OP_XZ],
        "tar.zst" => vec![OP_TAR, OP_ZSTD],
        _ => op_string
            .split(['|', ','])
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| match part {
                "tar" => Ok(OP_TAR),
                "gzip" | "gz" => Ok(OP_GZIP),
                "bzip2" | "bz2" => Ok(OP_BZIP2),
                "xz" => Ok(OP_XZ),
                "zstd" | "zst" => Ok(OP_ZSTD),
                other => Err(FlavorError::InvalidInput(format!(
                    "Unknown operation name: {other}"
                ))),
            })
            .collect::<Result<Vec<u8>>>()?,
    };

    pack_operations(&ops)
}

#[cfg(test)]
mod tests {
    use super::super::constants::{OP_GZIP, OP_TAR, OP_XZ, OP_ZSTD};
    use super::*;

    #[test]
    fn test_pack_single_operation() {
        let packed = pack_operations(&[OP_GZIP]).unwrap();
        assert_eq!(packed, 0x0000_0000_0000_0010);
    }

    #[test]
    fn test_pack_multiple_operations() {
        let packed = pack_operations(&[OP_TAR, OP_GZIP]).unwrap();
        assert_eq!(packed, 0x0000_0000_0000_1001);
    }

    #[test]
    fn test_unpack_stops_at_none() {
        // GZIP in byte 0, NONE in byte 1, XZ in byte 2: XZ is unreachable
        let packed = (OP_XZ as u64) << 16 | OP_GZIP as u64;
        assert_eq!(unpack_operations(packed), vec![OP_GZIP]);
    }

    #[test]
    fn test_round_trip() {
        let original = vec![OP_TAR, OP_ZSTD];
        let packed = pack_operations(&original).unwrap();
        assert_eq!(unpack_operations(packed), original);
    }

    #[test]
    fn test_empty_operations() {
        assert_eq!(pack_operations(&[]).unwrap(), 0);
        assert!(unpack_operations(0).is_empty());
    }

    #[test]
    fn test_too_many_operations() {
        let ops = vec![1u8; 9];
        assert!(pack_operations(&ops).is_err());
    }

    #[test]
    fn test_operations_to_string() {
        assert_eq!(operations_to_string(0), "raw");
        let packed = pack_operations(&[OP_TAR, OP_GZIP]).unwrap();
        assert_eq!(operations_to_string(packed), "tar|gzip");
    }

    #[test]
    fn test_string_to_operations() {
        assert_eq!(string_to_operations("raw").unwrap(), 0);
        assert_eq!(
            string_to_operations("tar|gzip").unwrap(),
            pack_operations(&[OP_TAR, OP_GZIP]).unwrap()
        );
        assert_eq!(
            string_to_operations("tgz").unwrap(),
            pack_operations(&[OP_TAR, OP_GZIP]).unwrap()
        );
        assert!(string_to_operations("lz4").is_err());
    }
}
