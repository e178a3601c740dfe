//! ext2/3/4 metadata recovery

mod parser;

pub use parser::ExtParser;
