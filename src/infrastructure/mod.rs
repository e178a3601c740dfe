//! Infrastructure layer
//!
//! Concrete implementations of the domain contracts: device readers,
//! format engines, filesystem parsers and the output persister.

pub mod block_device;
pub mod carvers;
pub mod file_systems;
pub mod persistence;
