// src/psp/format_2025/backends.rs
// Storage backends for package access - mmap and positional file I/O

use log::{debug, trace};
use memmap2::Mmap;
use std::fs::File;
use std::path::Path;

use super::defaults::AUTO_MMAP_THRESHOLD;
use super::slots::SlotDescriptor;
use crate::exceptions::{FlavorError, Result};

/// Backend selection mode
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BackendMode {
    /// Pick mmap for files larger than one page, file I/O otherwise
    #[default]
    Auto,
    /// Memory-mapped access
    Mmap,
    /// Positional file I/O
    File,
}

impl BackendMode {
    /// Parse a backend mode name (case insensitive)
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "mmap" => Some(Self::Mmap),
            "file" => Some(Self::File),
            _ => None,
        }
    }
}

/// Trait for package storage backends
///
/// Implementations are safe for concurrent readers; every accessor validates
/// `offset + len <= size()` and fails after `close()`.
pub trait StorageBackend: Send + Sync {
    /// Read `len` bytes at `offset` into an owned buffer
    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>>;

    /// Borrow a zero-copy view at `offset` (mmap only)
    fn view_at(&self, offset: u64, len: usize) -> Result<&[u8]>;

    /// Total size of the backing file in bytes
    fn size(&self) -> u64;

    /// Release the mapping or file handle; subsequent calls error
    fn close(&mut self) -> Result<()>;

    /// Read slot data based on its descriptor
    fn read_slot(&self, descriptor: &SlotDescriptor) -> Result<Vec<u8>> {
        self.read_at(descriptor.offset, descriptor.size as usize)
    }
}

fn check_range(offset: u64, len: usize, size: u64) -> Result<()> {
    let end = offset
        .checked_add(len as u64)
        .ok_or(FlavorError::OffsetOutOfRange { offset, len, size })?;
    if end > size {
        return Err(FlavorError::OffsetOutOfRange { offset, len, size });
    }
    Ok(())
}

/// Memory-mapped file access backend
///
/// Maps the whole file once; views borrow directly into the mapping.
pub struct MmapBackend {
    mmap: Option<Mmap>,
    size: u64,
}

impl std::fmt::Debug for MmapBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MmapBackend")
            .field("mapped", &self.mmap.is_some())
            .field("size", &self.size)
            .finish()
    }
}

impl MmapBackend {
    /// Open and map a file read-only
    ///
    /// Refuses to map an empty file.
    // The single unsafe block in the crate: the mapping is read-only, held
    // privately, and never outlives the backend that owns it.
    #[allow(unsafe_code)]
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();

        if size == 0 {
            return Err(FlavorError::EmptyFile);
        }

        let mmap = unsafe { Mmap::map(&file)? };
        debug!("Mapped {} ({} bytes)", path.display(), size);

        Ok(MmapBackend {
            mmap: Some(mmap),
            size,
        })
    }

    fn mapping(&self) -> Result<&Mmap> {
        self.mmap.as_ref().ok_or(FlavorError::AlreadyClosed)
    }
}

impl StorageBackend for MmapBackend {
    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        Ok(self.view_at(offset, len)?.to_vec())
    }

    fn view_at(&self, offset: u64, len: usize) -> Result<&[u8]> {
        let mmap = self.mapping()?;
        check_range(offset, len, self.size)?;
        trace!("mmap view_at: offset={offset}, len={len}");
        Ok(&mmap[offset as usize..offset as usize + len])
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn close(&mut self) -> Result<()> {
        if self.mmap.take().is_none() {
            return Err(FlavorError::AlreadyClosed);
        }
        Ok(())
    }
}

/// Positional file I/O backend
///
/// Reads are pread-style: no shared cursor, so concurrent readers are safe.
pub struct FileBackend {
    file: Option<File>,
    size: u64,
}

impl std::fmt::Debug for FileBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileBackend")
            .field("open", &self.file.is_some())
            .field("size", &self.size)
            .finish()
    }
}

impl FileBackend {
    /// Open a file read-only
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        debug!("Opened {} ({} bytes)", path.display(), size);

        Ok(FileBackend {
            file: Some(file),
            size,
        })
    }

    fn handle(&self) -> Result<&File> {
        self.file.as_ref().ok_or(FlavorError::AlreadyClosed)
    }

    #[cfg(unix)]
    fn pread(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
        use std::os::unix::fs::FileExt;
        file.read_exact_at(buf, offset)
    }

    #[cfg(windows)]
    fn pread(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
        use std::os::windows::fs::FileExt;
        let mut read = 0usize;
        while read < buf.len() {
            let n = file.seek_read(&mut buf[read..], offset + read as u64)?;
            if n == 0 {
                return Err(std::io::ErrorKind::UnexpectedEof.into());
            }
            read += n;
        }
        Ok(())
    }
}

impl StorageBackend for FileBackend {
    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let file = self.handle()?;
        check_range(offset, len, self.size)?;
        trace!("file read_at: offset={offset}, len={len}");

        let mut buffer = vec![0u8; len];
        Self::pread(file, &mut buffer, offset)?;
        Ok(buffer)
    }

    fn view_at(&self, _offset: u64, _len: usize) -> Result<&[u8]> {
        Err(FlavorError::Generic(
            "Zero-copy views are not supported by the file backend".into(),
        ))
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn close(&mut self) -> Result<()> {
        if self.file.take().is_none() {
            return Err(FlavorError::AlreadyClosed);
        }
        Ok(())
    }
}

/// Open the appropriate backend for a file
pub fn open_backend(mode: BackendMode, path: &Path) -> Result<Box<dyn StorageBackend>> {
    let resolved = match mode {
        BackendMode::Auto => {
            let file_size = std::fs::metadata(path)?.len();
            if file_size > AUTO_MMAP_THRESHOLD {
                BackendMode::Mmap
            } else {
                BackendMode::File
            }
        }
        other => other,
    };

    trace!("Selected {:?} backend for {}", resolved, path.display());
    match resolved {
        BackendMode::Mmap => Ok(Box::new(MmapBackend::open(path)?)),
        _ => Ok(Box::new(FileBackend::open(path)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn fixture(content: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn test_mmap_rejects_empty_file() {
        let f = fixture(b"");
        match MmapBackend::open(f.path()) {
            Err(FlavorError::EmptyFile) => {}
            other => panic!("expected EmptyFile, got {other:?}"),
        }
    }

    #[test]
    fn test_mmap_read_and_view() {
        let f = fixture(b"0123456789");
        let backend = MmapBackend::open(f.path()).unwrap();
        assert_eq!(backend.size(), 10);
        assert_eq!(backend.read_at(2, 3).unwrap(), b"234");
        assert_eq!(backend.view_at(0, 10).unwrap(), b"0123456789");
    }

    #[test]
    fn test_file_backend_read() {
        let f = fixture(b"0123456789");
        let backend = FileBackend::open(f.path()).unwrap();
        assert_eq!(backend.read_at(5, 5).unwrap(), b"56789");
        assert!(backend.view_at(0, 1).is_err());
    }

    #[test]
    fn test_out_of_range_reads() {
        let f = fixture(b"0123456789");
        let backend = FileBackend::open(f.path()).unwrap();
        // offset == size with len == 0 returns empty
        assert_eq!(backend.read_at(10, 0).unwrap(), b"");
        // any positive len there fails
        assert!(matches!(
            backend.read_at(10, 1),
            Err(FlavorError::OffsetOutOfRange { .. })
        ));
        assert!(backend.read_at(8, 3).is_err());
    }

    #[test]
    fn test_closed_backend_errors() {
        let f = fixture(b"0123456789");
        let mut backend = FileBackend::open(f.path()).unwrap();
        backend.close().unwrap();
        assert!(matches!(
            backend.read_at(0, 1),
            Err(FlavorError::AlreadyClosed)
        ));
        assert!(matches!(backend.close(), Err(FlavorError::AlreadyClosed)));
    }

    #[test]
    fn test_auto_selection() {
        let small = fixture(b"tiny");
        let backend = open_backend(BackendMode::Auto, small.path()).unwrap();
        // Small file gets the file backend, which cannot hand out views
        assert!(backend.view_at(0, 1).is_err());

        let big = fixture(&vec![0xAAu8; 8192]);
        let backend = open_backend(BackendMode::Auto, big.path()).unwrap();
        assert_eq!(backend.view_at(0, 4).unwrap(), &[0xAA; 4]);
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!(BackendMode::parse("MMAP"), Some(BackendMode::Mmap));
        assert_eq!(BackendMode::parse("auto"), Some(BackendMode::Auto));
        assert_eq!(BackendMode::parse("stream"), None);
    }
}
