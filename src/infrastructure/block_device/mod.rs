//! Block device readers

mod file_device;
mod mmap_device;

pub use file_device::FileBlockDevice;
pub use mmap_device::MmapBlockDevice;
