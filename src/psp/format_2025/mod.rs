//! PSPF/2025 format implementation

pub mod backends;
pub mod builder;
pub mod checksums;
pub mod constants;
pub mod crypto;
pub mod defaults;
pub mod environment;
pub mod execution;
pub mod index;
pub mod keys;
pub mod launcher;
pub mod locking;
pub mod manifest;
pub mod metadata;
pub mod operations;
pub mod paths;
pub mod pe_utils;
pub mod pipeline;
pub mod reader;
pub mod slots;
pub mod verifier;
pub mod workenv;

// Re-export main entry points
pub use builder::{BuildReport, PackageBuilder, SlotSpec};
pub use launcher::launch;
pub use verifier::{IntegrityReport, verify_integrity_with_level};

// Re-export types for advanced usage
pub use index::{Index, Trailer};
pub use metadata::Metadata;
pub use reader::Reader;
pub use slots::SlotDescriptor;
