//! Windows PE Executable Utilities
//!
//! Appending container data to a PE image is only safe if the PE loader's
//! internal file offsets stay self-consistent afterwards. Launchers built by
//! minimal-DOS-stub toolchains (PE header at 0x80) are left untouched and the
//! appended data rides as an overlay; launchers with an MSVC-style stub
//! (PE header at 0xE8 or later) get their DOS stub padded to 0xF0 so the
//! appended data lands at a fixed offset, with every absolute file offset
//! inside the image rewritten to match.

use anyhow::{Context, Result};
use log::{debug, info, trace, warn};

/// Target DOS stub size after expansion (240 bytes / 0xF0)
const TARGET_DOS_STUB_SIZE: usize = 0xF0;

/// PE header offset that marks a minimal-stub (overlay-mode) launcher
const MINIMAL_STUB_PE_OFFSET: usize = 0x80;

/// Smallest PE header offset treated as stub-expandable
const EXPANDABLE_PE_OFFSET: usize = 0xE8;

/// How a launcher binary tolerates appended container data
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LauncherKind {
    /// Not a PE image (ELF, Mach-O); appending is always safe
    NonPe,
    /// PE left untouched; appended data is a loader-ignored overlay
    Overlay,
    /// PE whose DOS stub is padded so appended data sits at a fixed offset
    Expandable,
}

/// Check if data starts with a valid Windows PE executable header ("MZ")
pub fn is_pe_executable(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == b'M' && data[1] == b'Z'
}

/// Read the PE header offset from the DOS header
///
/// The offset is stored at position 0x3C (e_lfanew) as a little-endian u32;
/// the PE signature at that offset is validated.
pub fn get_pe_header_offset(data: &[u8]) -> Option<usize> {
    if data.len() < 0x40 {
        return None;
    }

    let pe_offset = u32::from_le_bytes([data[0x3C], data[0x3D], data[0x3E], data[0x3F]]) as usize;

    if data.len() < pe_offset + 4 {
        return None;
    }

    let pe_signature = &data[pe_offset..pe_offset + 4];
    if pe_signature != b"PE\x00\x00" {
        warn!(
            "Invalid PE signature at offset 0x{:x}: expected 'PE\\x00\\x00', got {:?}",
            pe_offset,
            String::from_utf8_lossy(pe_signature)
        );
        return None;
    }

    Some(pe_offset)
}

/// Classify a launcher binary by its DOS stub size
///
/// Offsets strictly between the minimal stub and the expandable threshold are
/// unclassified in practice; overlay is the safe default for them.
pub fn classify_launcher(data: &[u8]) -> LauncherKind {
    if !is_pe_executable(data) {
        return LauncherKind::NonPe;
    }

    match get_pe_header_offset(data) {
        Some(MINIMAL_STUB_PE_OFFSET) => {
            debug!("Minimal DOS stub launcher, pe_offset=0x{MINIMAL_STUB_PE_OFFSET:x}");
            LauncherKind::Overlay
        }
        Some(offset) if offset >= EXPANDABLE_PE_OFFSET => {
            debug!("Expandable DOS stub launcher, pe_offset=0x{offset:x}");
            LauncherKind::Expandable
        }
        Some(offset) => {
            debug!("Unclassified DOS stub size 0x{offset:x}, treating as overlay");
            LauncherKind::Overlay
        }
        None => LauncherKind::Overlay,
    }
}

/// Map a Relative Virtual Address to a file offset by walking the section table
pub fn rva_to_file_offset(data: &[u8], rva: u32) -> Option<u32> {
    let pe_offset = u32::from_le_bytes([data[0x3C], data[0x3D], data[0x3E], data[0x3F]]) as usize;
    let coff_offset = pe_offset + 4;

    let num_sections = u16::from_le_bytes([data[coff_offset + 2], data[coff_offset + 3]]) as usize;
    let opt_hdr_size =
        u16::from_le_bytes([data[coff_offset + 16], data[coff_offset + 17]]) as usize;
    let section_table_offset = coff_offset + 20 + opt_hdr_size;

    for i in 0..num_sections {
        let section_offset = section_table_offset + (i * 40);
        if section_offset + 40 > data.len() {
            break;
        }

        // Section header: VirtualSize at +8, VirtualAddress at +12,
        // PointerToRawData at +20
        let virtual_size = u32::from_le_bytes([
            data[section_offset + 8],
            data[section_offset + 9],
            data[section_offset + 10],
            data[section_offset + 11],
        ]);
        let virtual_addr = u32::from_le_bytes([
            data[section_offset + 12],
            data[section_offset + 13],
            data[section_offset + 14],
            data[section_offset + 15],
        ]);
        let pointer_to_raw_data = u32::from_le_bytes([
            data[section_offset + 20],
            data[section_offset + 21],
            data[section_offset + 22],
            data[section_offset + 23],
        ]);

        if rva >= virtual_addr && rva < virtual_addr + virtual_size {
            let file_offset = pointer_to_raw_data + (rva - virtual_addr);
            trace!(
                "Mapped RVA 0x{:x} to file offset 0x{:x} (section {}, VA=0x{:x})",
                rva, file_offset, i, virtual_addr
            );
            return Some(file_offset);
        }
    }

    trace!("RVA 0x{rva:x} not found in any section");
    None
}

/// Offset of the data directory array from the COFF header, by PE magic
fn data_directory_offset(data: &[u8], coff_offset: usize) -> usize {
    // Optional header magic: 0x10B is PE32, 0x20B is PE32+. The directory
    // array starts at optional header + 96 (PE32) or + 112 (PE32+).
    let magic = u16::from_le_bytes([data[coff_offset + 20], data[coff_offset + 21]]);
    if magic == 0x20B {
        coff_offset + 20 + 112
    } else {
        coff_offset + 20 + 96
    }
}

/// Add `padding_size` to every section's non-zero PointerToRawData
fn update_section_offsets(data: &mut [u8], padding_size: usize) -> Result<()> {
    let pe_offset = u32::from_le_bytes([data[0x3C], data[0x3D], data[0x3E], data[0x3F]]) as usize;
    let coff_offset = pe_offset + 4;

    let num_sections = u16::from_le_bytes([data[coff_offset + 2], data[coff_offset + 3]]) as usize;
    let opt_hdr_size =
        u16::from_le_bytes([data[coff_offset + 16], data[coff_offset + 17]]) as usize;
    let section_table_offset = coff_offset + 20 + opt_hdr_size;

    debug!("Updating {num_sections} section offset(s), padding_size=0x{padding_size:x}");

    let mut updated = 0;
    for i in 0..num_sections {
        let ptr_offset = section_table_offset + (i * 40) + 20;
        if ptr_offset + 4 > data.len() {
            anyhow::bail!("Section table entry {i} extends past end of file");
        }

        let current_ptr = u32::from_le_bytes([
            data[ptr_offset],
            data[ptr_offset + 1],
            data[ptr_offset + 2],
            data[ptr_offset + 3],
        ]);

        if current_ptr > 0 {
            let new_ptr = current_ptr + padding_size as u32;
            data[ptr_offset..ptr_offset + 4].copy_from_slice(&new_ptr.to_le_bytes());
            trace!("Updated section {i} offset: 0x{current_ptr:x} -> 0x{new_ptr:x}");
            updated += 1;
        }
    }

    debug!("Updated {updated}/{num_sections} section offset(s)");
    Ok(())
}

/// Add `padding_size` to SizeOfHeaders in the optional header
///
/// The loader validates that sections start at or after SizeOfHeaders; a
/// stale value after stub expansion gets the image rejected.
fn update_size_of_headers(data: &mut [u8], padding_size: usize) -> Result<()> {
    let pe_offset = u32::from_le_bytes([data[0x3C], data[0x3D], data[0x3E], data[0x3F]]) as usize;
    let coff_offset = pe_offset + 4;

    // SizeOfHeaders sits at optional header + 60
    let size_of_headers_offset = coff_offset + 20 + 60;
    if size_of_headers_offset + 4 > data.len() {
        anyhow::bail!(
            "SizeOfHeaders offset 0x{:x} beyond file bounds",
            size_of_headers_offset
        );
    }

    let current_size = u32::from_le_bytes([
        data[size_of_headers_offset],
        data[size_of_headers_offset + 1],
        data[size_of_headers_offset + 2],
        data[size_of_headers_offset + 3],
    ]);

    let new_size = current_size + padding_size as u32;
    data[size_of_headers_offset..size_of_headers_offset + 4]
        .copy_from_slice(&new_size.to_le_bytes());

    debug!(
        "Updated SizeOfHeaders: old=0x{current_size:x}, new=0x{new_size:x}, padding={padding_size}"
    );
    Ok(())
}

/// Fix the Certificate Table entry and zero the optional-header checksum
///
/// Data directory #4 (Certificate Table) is the one directory holding an
/// absolute file offset rather than an RVA.
fn update_data_directories(data: &mut [u8], padding_size: usize) -> Result<()> {
    let pe_offset = u32::from_le_bytes([data[0x3C], data[0x3D], data[0x3E], data[0x3F]]) as usize;
    let coff_offset = pe_offset + 4;
    let data_dir_offset = data_directory_offset(data, coff_offset);

    // Certificate Table is entry index 4; each entry is 8 bytes
    let cert_entry_offset = data_dir_offset + (4 * 8);
    if cert_entry_offset + 8 <= data.len() {
        let cert_file_offset = u32::from_le_bytes([
            data[cert_entry_offset],
            data[cert_entry_offset + 1],
            data[cert_entry_offset + 2],
            data[cert_entry_offset + 3],
        ]);

        if cert_file_offset != 0 && cert_file_offset as usize >= MINIMAL_STUB_PE_OFFSET {
            let new_cert_offset = cert_file_offset + padding_size as u32;
            data[cert_entry_offset..cert_entry_offset + 4]
                .copy_from_slice(&new_cert_offset.to_le_bytes());
            debug!(
                "Updated certificate table offset: 0x{cert_file_offset:x} -> 0x{new_cert_offset:x}"
            );
        }
    } else {
        trace!("Certificate table entry beyond file bounds, skipping");
    }

    // The optional-header CheckSum is not validated for executables; zero it
    // rather than recompute. Field sits at optional header + 64.
    let checksum_offset = coff_offset + 20 + 64;
    if checksum_offset + 4 <= data.len() {
        data[checksum_offset..checksum_offset + 4].copy_from_slice(&0u32.to_le_bytes());
        trace!("Zeroed PE checksum");
    }

    Ok(())
}

/// Fix PointerToRawData in every debug directory entry
///
/// Data directory #6 locates an array of 28-byte IMAGE_DEBUG_DIRECTORY
/// records whose PointerToRawData (offset 24 within each record) is an
/// absolute file offset.
fn update_debug_directory(data: &mut [u8], padding_size: usize) -> Result<()> {
    let pe_offset = u32::from_le_bytes([data[0x3C], data[0x3D], data[0x3E], data[0x3F]]) as usize;
    let coff_offset = pe_offset + 4;
    let data_dir_offset = data_directory_offset(data, coff_offset);

    let debug_dir_entry_offset = data_dir_offset + (6 * 8);
    if debug_dir_entry_offset + 8 > data.len() {
        trace!("Debug directory entry beyond file bounds, skipping");
        return Ok(());
    }

    let debug_dir_rva = u32::from_le_bytes([
        data[debug_dir_entry_offset],
        data[debug_dir_entry_offset + 1],
        data[debug_dir_entry_offset + 2],
        data[debug_dir_entry_offset + 3],
    ]);
    let debug_dir_size = u32::from_le_bytes([
        data[debug_dir_entry_offset + 4],
        data[debug_dir_entry_offset + 5],
        data[debug_dir_entry_offset + 6],
        data[debug_dir_entry_offset + 7],
    ]);

    if debug_dir_rva == 0 || debug_dir_size == 0 {
        trace!("No debug directory present");
        return Ok(());
    }

    let Some(debug_dir_file_offset) = rva_to_file_offset(data, debug_dir_rva) else {
        trace!("Unable to map debug directory RVA 0x{debug_dir_rva:x}, skipping");
        return Ok(());
    };

    debug!(
        "Debug directory: RVA=0x{debug_dir_rva:x}, file_offset=0x{debug_dir_file_offset:x}, size={debug_dir_size}"
    );

    let num_debug_entries = (debug_dir_size as usize) / 28;
    let mut updated = 0;
    for i in 0..num_debug_entries {
        let ptr_raw_data_offset = (debug_dir_file_offset as usize) + (i * 28) + 24;
        if ptr_raw_data_offset + 4 > data.len() {
            trace!("Debug entry {i} PointerToRawData beyond file bounds");
            continue;
        }

        let current_ptr = u32::from_le_bytes([
            data[ptr_raw_data_offset],
            data[ptr_raw_data_offset + 1],
            data[ptr_raw_data_offset + 2],
            data[ptr_raw_data_offset + 3],
        ]);

        if current_ptr != 0 {
            let new_ptr = current_ptr + padding_size as u32;
            data[ptr_raw_data_offset..ptr_raw_data_offset + 4]
                .copy_from_slice(&new_ptr.to_le_bytes());
            trace!("Updated debug entry {i} PointerToRawData: 0x{current_ptr:x} -> 0x{new_ptr:x}");
            updated += 1;
        }
    }

    if updated > 0 {
        debug!("Updated {updated}/{num_debug_entries} debug directory entries");
    }

    Ok(())
}

/// Expand the DOS stub of a PE executable to the fixed 0xF0 layout
///
/// Inserts zero padding between the existing DOS stub and the PE header,
/// updates e_lfanew, then rewrites every absolute file offset that now points
/// past the insertion. A no-op when the stub is already at or past 0xF0.
pub fn expand_dos_stub(data: Vec<u8>) -> Result<Vec<u8>> {
    if !is_pe_executable(&data) {
        anyhow::bail!("Data is not a Windows PE executable");
    }

    let current_pe_offset = get_pe_header_offset(&data).context("Invalid PE header offset")?;

    if current_pe_offset >= TARGET_DOS_STUB_SIZE {
        debug!(
            "DOS stub already adequate: current=0x{current_pe_offset:x}, target=0x{TARGET_DOS_STUB_SIZE:x}"
        );
        return Ok(data);
    }

    let padding_size = TARGET_DOS_STUB_SIZE - current_pe_offset;

    info!(
        "Expanding DOS stub: current_pe_offset=0x{current_pe_offset:x}, \
         target_pe_offset=0x{TARGET_DOS_STUB_SIZE:x}, padding_bytes={padding_size}"
    );

    let mut new_data = Vec::with_capacity(data.len() + padding_size);
    new_data.extend_from_slice(&data[..current_pe_offset]);
    new_data.extend(std::iter::repeat_n(0u8, padding_size));
    new_data.extend_from_slice(&data[current_pe_offset..]);

    // Point e_lfanew at the relocated PE header
    new_data[0x3C..0x40].copy_from_slice(&(TARGET_DOS_STUB_SIZE as u32).to_le_bytes());

    update_section_offsets(&mut new_data, padding_size)?;
    update_size_of_headers(&mut new_data, padding_size)?;
    update_data_directories(&mut new_data, padding_size)?;
    update_debug_directory(&mut new_data, padding_size)?;

    let new_pe_offset =
        get_pe_header_offset(&new_data).context("Failed to read PE offset after modification")?;
    if new_pe_offset != TARGET_DOS_STUB_SIZE {
        anyhow::bail!(
            "Failed to update PE offset: expected 0x{:x}, got 0x{:x}",
            TARGET_DOS_STUB_SIZE,
            new_pe_offset
        );
    }

    debug!(
        "DOS stub expansion complete: original_size={}, new_size={}, new_pe_offset=0x{:x}",
        data.len(),
        new_data.len(),
        new_pe_offset
    );

    Ok(new_data)
}

/// Process a launcher binary so appended container data cannot break it
///
/// Non-PE launchers and overlay-mode PEs pass through unchanged; expandable
/// PEs get the fixed-offset DOS stub.
pub fn process_launcher(launcher_data: Vec<u8>) -> Result<Vec<u8>> {
    match classify_launcher(&launcher_data) {
        LauncherKind::NonPe => {
            trace!("Launcher is not a PE executable, no processing needed");
            Ok(launcher_data)
        }
        LauncherKind::Overlay => {
            info!("Using PE overlay approach (appended data, image untouched)");
            Ok(launcher_data)
        }
        LauncherKind::Expandable => {
            info!("Expanding DOS stub so appended data lands at 0xF0");
            expand_dos_stub(launcher_data)
        }
    }
}
