//! Package format implementations

pub mod format_2025;

use crate::exceptions::{FlavorError, Result};
use std::path::Path;

/// Supported package formats
#[derive(Debug, Clone, Copy)]
pub enum PackageFormat {
    PSPF2025,
}

/// Detect the format of a package by reading its trailer sentinels
pub fn detect_format(package_path: &Path) -> Result<PackageFormat> {
    use std::fs::File;
    use std::io::{Read, Seek, SeekFrom};

    log::trace!("Detecting format for: {:?}", package_path);
    let mut file = File::open(package_path)?;
    let file_size = file.metadata()?.len();

    if file_size >= format_2025::constants::MAGIC_TRAILER_SIZE as u64 {
        // End-of-file sentinel first (last 4 bytes)
        file.seek(SeekFrom::End(-4))?;
        let mut end = [0u8; 4];
        file.read_exact(&mut end)?;

        if end == *format_2025::constants::TRAILER_END_BYTES {
            // Then the start-of-trailer sentinel
            file.seek(SeekFrom::End(
                -(format_2025::constants::MAGIC_TRAILER_SIZE as i64),
            ))?;
            let mut start = [0u8; 4];
            file.read_exact(&mut start)?;

            if start == *format_2025::constants::TRAILER_START_BYTES {
                log::debug!("Found valid MagicTrailer at end of file");
                return Ok(PackageFormat::PSPF2025);
            }
        }
        log::trace!("No valid MagicTrailer found");
    }

    Err(FlavorError::UnsupportedFormat(
        "Not a PSPF package".to_string(),
    ))
}
