//! Digest helpers shared by the builder, reader, and verifier

use sha2::{Digest, Sha256};
use std::io::Read;

use crate::exceptions::{FlavorError, Result};

/// SHA-256 of a byte slice as a prefixed hex string ("sha256:...")
pub fn sha256_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    format!("sha256:{}", hex::encode(digest))
}

/// SHA-256 over a reader, streaming in 8 MiB chunks
pub fn sha256_hex_reader<R: Read>(reader: &mut R) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 8 * 1024 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

/// First 8 bytes of SHA-256, little-endian, as used by slot descriptors
pub fn checksum64(data: &[u8]) -> u64 {
    let digest = Sha256::digest(data);
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

/// Parse a "sha256:..." string back into the descriptor's u64 prefix
pub fn checksum64_from_hex(checksum: &str) -> Result<u64> {
    let bytes = checksum
        .strip_prefix("sha256:")
        .and_then(|hex_str| hex::decode(hex_str).ok())
        .ok_or_else(|| {
            FlavorError::InvalidInput(format!("Invalid SHA256 checksum format: {checksum}"))
        })?;
    if bytes.len() < 8 {
        return Err(FlavorError::InvalidInput("SHA256 hash too short".into()));
    }
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&bytes[..8]);
    Ok(u64::from_le_bytes(prefix))
}

/// CRC-32 over a byte slice, as used by the trailer index checksum
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = flate2::Crc::new();
    crc.update(data);
    crc.sum()
}

#[cfg(test)]
mod tests {
    use super::{checksum64, checksum64_from_hex, crc32, sha256_hex};

    #[test]
    fn test_sha256_hex_known_value() {
        // SHA-256 of the empty string
        assert_eq!(
            sha256_hex(b""),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_checksum64_matches_hex_prefix() {
        let data = b"hello world";
        let hex_form = sha256_hex(data);
        let parsed = checksum64_from_hex(&hex_form).unwrap();
        assert_eq!(parsed, checksum64(data));
    }

    #[test]
    fn test_checksum64_rejects_bad_prefix() {
        assert!(checksum64_from_hex("md5:abcdef").is_err());
        assert!(checksum64_from_hex("sha256:zz").is_err());
    }

    #[test]
    fn test_crc32_known_value() {
        // CRC-32 of "123456789" is the classic check value
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }
}
