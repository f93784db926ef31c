//! Typed error hierarchy for the pipeline.
//!
//! Every fallible operation in the workspace returns [`Result`].  Each variant
//! maps to a stable integer code via [`EngineError::error_code`]; the CLI uses
//! that code as its process exit status.

use std::path::PathBuf;

/// All errors originating from the segmentation pipeline.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    // ── Configuration ────────────────────────────────────────────────
    #[error("Configuration error: {0}")]
    Configuration(String),

    // ── Media ────────────────────────────────────────────────────────
    #[error("Cannot open source {}: {reason}", path.display())]
    SourceOpen { path: PathBuf, reason: String },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Encode error: {0}")]
    Encode(String),

    // ── Pipeline consistency ─────────────────────────────────────────
    #[error("Batch index mismatch: expected {expected}, got {actual}")]
    BatchIndexMismatch { expected: u64, actual: u64 },

    #[error("Consistency violation: {0}")]
    Consistency(String),

    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("Pipeline channel closed unexpectedly")]
    ChannelClosed,

    // ── Device ───────────────────────────────────────────────────────
    #[error("Device error: {0}")]
    Device(String),

    #[cfg(feature = "cuda")]
    #[error("CUDA driver error: {0}")]
    Cuda(#[from] cudarc::driver::DriverError),

    // ── Inference ────────────────────────────────────────────────────
    #[error("Inference error: {0}")]
    Inference(String),

    // ── Instrumentation ──────────────────────────────────────────────
    #[error("Instrumentation error: {0}")]
    Instrumentation(String),

    // ── I/O ──────────────────────────────────────────────────────────
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Shorthand for [`EngineError::SourceOpen`].
    pub fn source_open(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::SourceOpen {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Stable integer error code for structured logs and exit statuses.
    ///
    /// Codes are grouped by category:
    /// - 1x: configuration
    /// - 2x: media (open, decode, encode)
    /// - 3x: pipeline consistency
    /// - 4x: device
    /// - 5x: inference
    /// - 6x: instrumentation
    /// - 7x: I/O
    pub fn error_code(&self) -> u32 {
        match self {
            Self::Configuration(_) => 10,
            Self::SourceOpen { .. } => 20,
            Self::Decode(_) => 21,
            Self::Encode(_) => 22,
            Self::BatchIndexMismatch { .. } => 30,
            Self::Consistency(_) => 31,
            Self::DimensionMismatch(_) => 32,
            Self::ChannelClosed => 33,
            Self::Device(_) => 40,
            #[cfg(feature = "cuda")]
            Self::Cuda(_) => 41,
            Self::Inference(_) => 50,
            Self::Instrumentation(_) => 60,
            Self::Io(_) => 70,
        }
    }

    /// Whether this error is raised before any device resource is acquired.
    ///
    /// Configuration and source-open failures abort a run during validation,
    /// so no context, stream, or stage object exists when they surface.
    pub fn is_pre_acquisition(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::SourceOpen { .. })
    }

    /// Whether this error belongs to the consistency category (batch order,
    /// stream issue order, tensor shape contracts).
    pub fn is_consistency(&self) -> bool {
        matches!(
            self,
            Self::BatchIndexMismatch { .. }
                | Self::Consistency(_)
                | Self::DimensionMismatch(_)
                | Self::ChannelClosed
        )
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::EngineError;

    #[test]
    fn error_codes_are_grouped_by_category() {
        assert_eq!(EngineError::Configuration("x".into()).error_code(), 10);
        assert_eq!(EngineError::source_open("/nope", "missing").error_code(), 20);
        assert_eq!(
            EngineError::BatchIndexMismatch {
                expected: 1,
                actual: 2
            }
            .error_code(),
            30
        );
        assert_eq!(EngineError::Device("lost".into()).error_code(), 40);
        assert_eq!(EngineError::Instrumentation("open".into()).error_code(), 60);
    }

    #[test]
    fn only_configuration_and_source_open_are_pre_acquisition() {
        assert!(EngineError::Configuration("bad".into()).is_pre_acquisition());
        assert!(EngineError::source_open("in.mp4", "missing").is_pre_acquisition());
        assert!(!EngineError::Decode("corrupt".into()).is_pre_acquisition());
        assert!(!EngineError::Device("lost".into()).is_pre_acquisition());
    }

    #[test]
    fn source_open_message_names_the_path() {
        let err = EngineError::source_open("/data/clip.mp4", "no such file");
        let msg = err.to_string();
        assert!(msg.contains("/data/clip.mp4"), "{msg}");
        assert!(msg.contains("no such file"), "{msg}");
    }
}
