//! Memory-mapped block device implementation
//!
//! Zero-copy reads for image files. The mapping is created read-only
//! over the whole file; page alignment is the mapping's concern, not
//! the caller's.

use crate::domain::repositories::{BlockDeviceError, BlockDeviceReader};
use memmap2::Mmap;
use std::fs::OpenOptions;
use std::io;
use std::path::Path;

/// Device reader backed by a read-only memory mapping.
pub struct MmapBlockDevice {
    mmap: Mmap,
    path: String,
}

impl MmapBlockDevice {
    /// Borrows `length` bytes at `offset` without copying. Returns
    /// `None` when the range leaves the mapping.
    #[inline]
    pub fn slice_at(&self, offset: u64, length: usize) -> Option<&[u8]> {
        let start = usize::try_from(offset).ok()?;
        let end = start.checked_add(length)?;
        self.mmap.get(start..end)
    }
}

impl BlockDeviceReader for MmapBlockDevice {
    fn open(path: &str) -> Result<Self, BlockDeviceError> {
        let path_obj = Path::new(path);
        if !path_obj.exists() {
            return Err(BlockDeviceError::NotFound(path.to_string()));
        }

        let file = OpenOptions::new().read(true).open(path_obj).map_err(|e| {
            if e.kind() == io::ErrorKind::PermissionDenied {
                BlockDeviceError::AccessDenied(path.to_string())
            } else {
                BlockDeviceError::Io(e)
            }
        })?;

        let size = file.metadata().map_err(BlockDeviceError::Io)?.len();
        if size == 0 {
            return Err(BlockDeviceError::Unsupported(format!(
                "{path} has zero size and cannot be mapped"
            )));
        }

        let mmap = unsafe { Mmap::map(&file) }.map_err(BlockDeviceError::Io)?;

        Ok(Self {
            mmap,
            path: path.to_string(),
        })
    }

    fn size(&self) -> u64 {
        self.mmap.len() as u64
    }

    fn read_at(&self, offset: u64, length: usize) -> Result<Vec<u8>, BlockDeviceError> {
        let len = self.mmap.len() as u64;
        if offset >= len {
            return Ok(Vec::new());
        }

        let start = offset as usize;
        let end = start + length.min((len - offset) as usize);
        Ok(self.mmap[start..end].to_vec())
    }

    fn path(&self) -> &str {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_mmap_read_at() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"Hello, memory-mapped world!").unwrap();
        file.flush().unwrap();

        let device = MmapBlockDevice::open(file.path().to_str().unwrap()).unwrap();
        assert_eq!(device.read_at(0, 5).unwrap(), b"Hello");
        assert_eq!(device.slice_at(7, 6).unwrap(), b"memory");
        assert!(device.read_at(device.size(), 4).unwrap().is_empty());
    }

    #[test]
    fn test_mmap_rejects_empty_file() {
        let file = NamedTempFile::new().unwrap();
        let result = MmapBlockDevice::open(file.path().to_str().unwrap());
        assert!(matches!(result, Err(BlockDeviceError::Unsupported(_))));
    }
}
