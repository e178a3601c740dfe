//! Recovery outcome taxonomy

/// Top-level outcome of a recovery run. Per-record parse failures never
/// surface here; they are skipped and logged at debug level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStatus {
    /// All phases completed.
    Success,
    /// Some recovered files could not be persisted.
    PartialSuccess,
    /// Invalid configuration or an unrecoverable internal failure.
    Failed,
    /// The source device refused read access.
    AccessDenied,
    /// The source device could not be opened.
    DeviceNotFound,
    /// The output directory could not be created.
    InsufficientSpace,
}

impl RecoveryStatus {
    pub fn name(&self) -> &'static str {
        match self {
            RecoveryStatus::Success => "success",
            RecoveryStatus::PartialSuccess => "partial success",
            RecoveryStatus::Failed => "failed",
            RecoveryStatus::AccessDenied => "access denied",
            RecoveryStatus::DeviceNotFound => "device not found",
            RecoveryStatus::InsufficientSpace => "insufficient space",
        }
    }
}

impl std::fmt::Display for RecoveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}
