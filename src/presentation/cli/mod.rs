//! Command-line interface definitions

mod progress;

pub use progress::ProgressReporter;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "salvor")]
#[command(version)]
#[command(about = "Recover files from damaged or formatted block devices", long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Enable debug output
    #[arg(short, long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the full recovery pipeline and persist recovered files
    Recover {
        /// Source device or image path
        #[arg(short = 'D', long)]
        device: String,

        /// Directory recovered files are written into
        #[arg(short, long, default_value = "./recovered")]
        output: PathBuf,

        /// Only keep these file types (e.g. jpeg,png,pdf,zip)
        #[arg(short = 't', long, value_delimiter = ',')]
        types: Option<Vec<String>>,

        /// Worker threads for the signature scan (0 = auto)
        #[arg(long, default_value = "0")]
        threads: usize,

        /// Chunk size for the signature scan, in MiB
        #[arg(long, default_value = "1")]
        chunk_size_mb: u64,

        /// Skip the filesystem-metadata phase
        #[arg(long)]
        no_metadata: bool,

        /// Skip the signature-carving phase
        #[arg(long)]
        no_signature: bool,
    },

    /// Scan without persisting: report what would be recovered
    Scan {
        /// Source device or image path
        #[arg(short = 'D', long)]
        device: String,

        /// Only report these file types
        #[arg(short = 't', long, value_delimiter = ',')]
        types: Option<Vec<String>>,

        /// Chunk size for the signature scan, in MiB
        #[arg(long, default_value = "1")]
        chunk_size_mb: u64,
    },

    /// Show detected filesystem information for a device
    Info {
        /// Source device or image path
        #[arg(short = 'D', long)]
        device: String,
    },

    /// List registered format engines and their signatures
    ListEngines,
}

/// Normalizes a user-supplied type list; unknown tags are kept (the
/// filter is a plain case-insensitive match).
pub fn parse_file_types(types: Option<Vec<String>>) -> Vec<String> {
    types
        .unwrap_or_default()
        .into_iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_file_types() {
        assert!(parse_file_types(None).is_empty());
        assert_eq!(
            parse_file_types(Some(vec!["JPEG".into(), " pdf ".into(), "".into()])),
            vec!["jpeg".to_string(), "pdf".to_string()]
        );
    }
}
