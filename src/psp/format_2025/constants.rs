// src/psp/format_2025/constants.rs
// Core format constants that never change
// For defaults and configuration, see defaults.rs

/// Start-of-trailer sentinel, first 4 bytes of the MagicTrailer
pub const TRAILER_START_BYTES: &[u8; 4] = b"PSPF";
/// End-of-file sentinel, the 📦 wordmark as UTF-8 bytes
pub const TRAILER_END_BYTES: &[u8; 4] = &[0xF0, 0x9F, 0x93, 0xA6];

// Format version - immutable
pub const PSPF_VERSION: u32 = 0x2025_0001;
pub const FORMAT_VERSION: u32 = PSPF_VERSION;

// Fixed sizes - part of the format specification
pub const INDEX_SIZE: usize = 256; // Index block size
pub const SLOT_DESCRIPTOR_SIZE: usize = 64; // Slot descriptor size
pub const MAGIC_TRAILER_SIZE: usize = 8200; // Full trailer including sentinels
pub const SLOT_ALIGNMENT: u64 = 8; // Slots must be 8-byte aligned

// Trailer interior offsets (relative to trailer start)
pub const PUBLIC_KEY_OFFSET: usize = INDEX_SIZE; // 256
pub const PUBLIC_KEY_SIZE: usize = 32;
pub const SIGNATURE_OFFSET: usize = PUBLIC_KEY_OFFSET + PUBLIC_KEY_SIZE; // 288
pub const SIGNATURE_FIELD_SIZE: usize = 512; // Ed25519 uses first 64 bytes

// Operation codes - part of format spec
pub const OP_NONE: u8 = 0x00; // Chain terminator / no-op filler
pub const OP_TAR: u8 = 0x01; // POSIX TAR archive (extraction-side only)
pub const OP_GZIP: u8 = 0x10; // DEFLATE with gzip framing
pub const OP_BZIP2: u8 = 0x11; // BZIP2, always max level
pub const OP_XZ: u8 = 0x12; // XZ/LZMA2, honors compression level
pub const OP_ZSTD: u8 = 0x13; // Zstandard (optional capability)

/// Maximum number of operations in a packed chain
pub const MAX_OPERATIONS: usize = 8;
