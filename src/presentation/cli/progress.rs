//! Progress reporting for the CLI

use crate::application::ProgressCallback;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;

/// Indicatif-backed reporter bridging the engine's progress callback
/// to a terminal bar.
pub struct ProgressReporter {
    bar: Arc<ProgressBar>,
}

impl ProgressReporter {
    /// A percentage bar for one recovery run.
    pub fn for_recovery() -> Self {
        let bar = ProgressBar::new(100);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}% ({eta})")
                .unwrap()
                .progress_chars("#>-"),
        );
        bar.set_message("Preparing recovery...".to_string());

        Self { bar: Arc::new(bar) }
    }

    /// Callback to hand to `RecoveryEngine::set_progress_callback`.
    pub fn callback(&self) -> ProgressCallback {
        let bar = Arc::clone(&self.bar);
        Box::new(move |progress: f64, status: &str| {
            bar.set_position(progress.clamp(0.0, 100.0) as u64);
            bar.set_message(status.to_string());
        })
    }

    pub fn finish(&self, message: &str) {
        self.bar.finish_with_message(message.to_string());
    }
}
