//! Error taxonomy for the acquisition pipeline.
//!
//! Decode failures never surface here: a provider that cannot decode its frame
//! moves to `ProviderState::Failed` and carries a plain message instead.
//! What remains are the conditions reported synchronously to the caller.

use std::path::PathBuf;

use thiserror::Error;

/// Errors reported synchronously by collections, the cache and the pipeline context
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    /// Frame index outside `[0, len)`
    #[error("frame index {index} out of range (length {len})")]
    OutOfRange { index: usize, len: usize },

    /// Container or array header that cannot be interpreted
    #[error("malformed header in {}: {reason}", path.display())]
    MalformedHeader { path: PathBuf, reason: String },

    /// Unreadable source file
    #[error("cannot read {}: {message}", path.display())]
    DecodeIo { path: PathBuf, message: String },

    /// Edit expression rejected at parse time
    #[error("invalid edit expression: {0}")]
    Edit(String),

    /// File watcher could not be set up
    #[error("file watcher error: {0}")]
    Watch(String),

    /// Background worker thread could not be started
    #[error("cannot start worker thread: {0}")]
    Spawn(String),

    /// Configuration file unreadable or invalid
    #[error("configuration error: {0}")]
    Config(String),

    /// Removing a frame would leave the collection empty
    #[error("cannot remove the only frame of a collection")]
    LastFrame,
}

impl PipelineError {
    pub fn malformed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        PipelineError::MalformedHeader {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, err: &std::io::Error) -> Self {
        PipelineError::DecodeIo {
            path: path.into(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_range_message() {
        let err = PipelineError::OutOfRange { index: 10, len: 10 };
        assert_eq!(err.to_string(), "frame index 10 out of range (length 10)");
    }

    #[test]
    fn test_malformed_mentions_path() {
        let err = PipelineError::malformed("/tmp/a.npy", "fortran order");
        let msg = err.to_string();
        assert!(msg.contains("/tmp/a.npy"));
        assert!(msg.contains("fortran order"));
    }
}
