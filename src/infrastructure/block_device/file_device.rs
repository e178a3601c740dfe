//! Positional-read block device implementation
//!
//! Read-only access to block devices and disk images through
//! positional reads, so concurrent scan workers never contend on a
//! shared file cursor.

use crate::domain::repositories::{BlockDeviceError, BlockDeviceReader};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

#[cfg(target_os = "linux")]
const BLKGETSIZE64: libc::c_ulong = 0x8008_1272;

/// Size reported by the `BLKGETSIZE64` ioctl for block devices whose
/// file metadata reports zero length.
#[cfg(target_os = "linux")]
fn block_device_size(file: &File) -> io::Result<u64> {
    use std::os::unix::io::AsRawFd;

    let mut size: u64 = 0;
    let result = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64, &mut size) };
    if result == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(size)
    }
}

#[cfg(not(target_os = "linux"))]
fn block_device_size(_file: &File) -> io::Result<u64> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "block device size query not supported on this platform",
    ))
}

/// Read-only device reader backed by positional reads.
///
/// Works on regular image files and on raw block devices; on Linux the
/// device size falls back to the `BLKGETSIZE64` ioctl when metadata
/// reports zero bytes.
pub struct FileBlockDevice {
    file: File,
    path: String,
    size: u64,
}

impl FileBlockDevice {
    fn map_open_error(path: &str, e: io::Error) -> BlockDeviceError {
        match e.kind() {
            io::ErrorKind::NotFound => BlockDeviceError::NotFound(path.to_string()),
            io::ErrorKind::PermissionDenied => BlockDeviceError::AccessDenied(path.to_string()),
            _ => BlockDeviceError::Io(e),
        }
    }

    #[cfg(unix)]
    fn pread(&self, offset: u64, buffer: &mut [u8]) -> io::Result<usize> {
        use std::os::unix::fs::FileExt;
        self.file.read_at(buffer, offset)
    }

    #[cfg(not(unix))]
    fn pread(&self, offset: u64, buffer: &mut [u8]) -> io::Result<usize> {
        use std::os::windows::fs::FileExt;
        self.file.seek_read(buffer, offset)
    }
}

impl BlockDeviceReader for FileBlockDevice {
    fn open(path: &str) -> Result<Self, BlockDeviceError> {
        let path_obj = Path::new(path);
        if !path_obj.exists() {
            return Err(BlockDeviceError::NotFound(path.to_string()));
        }

        let file = OpenOptions::new()
            .read(true)
            .open(path_obj)
            .map_err(|e| Self::map_open_error(path, e))?;

        let mut size = file.metadata().map_err(BlockDeviceError::Io)?.len();
        if size == 0 {
            if let Ok(device_size) = block_device_size(&file) {
                size = device_size;
            }
        }
        if size == 0 {
            return Err(BlockDeviceError::Unsupported(format!(
                "cannot determine size of {path}"
            )));
        }

        Ok(Self {
            file,
            path: path.to_string(),
            size,
        })
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn read_at(&self, offset: u64, length: usize) -> Result<Vec<u8>, BlockDeviceError> {
        if offset >= self.size {
            return Ok(Vec::new());
        }

        let available = (self.size - offset) as usize;
        let to_read = length.min(available);
        let mut buffer = vec![0u8; to_read];

        let mut filled = 0;
        while filled < to_read {
            match self.pread(offset + filled as u64, &mut buffer[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(BlockDeviceError::ReadError {
                        offset: offset + filled as u64,
                        message: e.to_string(),
                    })
                }
            }
        }

        buffer.truncate(filled);
        Ok(buffer)
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
    fn test_open_missing_path() {
        let result = FileBlockDevice::open("/nonexistent/device");
        assert!(matches!(result, Err(BlockDeviceError::NotFound(_))));
    }

    #[test]
    fn test_read_past_end_is_empty() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&[0xAB; 64]).unwrap();
        file.flush().unwrap();

        let device = FileBlockDevice::open(file.path().to_str().unwrap()).unwrap();
        assert_eq!(device.size(), 64);
        assert!(device.read_at(64, 16).unwrap().is_empty());
        assert!(device.read_at(1000, 16).unwrap().is_empty());
    }

    #[test]
    fn test_short_read_at_end() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&[0xCD; 100]).unwrap();
        file.flush().unwrap();

        let device = FileBlockDevice::open(file.path().to_str().unwrap()).unwrap();
        let tail = device.read_at(90, 64).unwrap();
        assert_eq!(tail.len(), 10);
        assert!(tail.iter().all(|&b| b == 0xCD));
    }
}
