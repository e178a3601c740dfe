//! Repository traits (interfaces)
//!
//! Contracts for the external collaborators the recovery core depends
//! on: the raw device reader and the recovered-payload persister.

mod block_device;
mod file_writer;

pub use block_device::{BlockDeviceError, BlockDeviceReader};
pub use file_writer::{FileWriterError, RecoveredFileWriter, WriteResult};
