//! NTFS metadata recovery

mod parser;

pub use parser::NtfsParser;
