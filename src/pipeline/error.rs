//! Pipeline Errors

use crate::pipeline::checkpoint::CheckpointError;
use crate::pipeline::config::ConfigError;
use crate::pipeline::record::{InputError, StreamId};
use crate::pipeline::writer::WriteFailure;
use std::fmt;

/// Why an upload task did not produce a durable, acknowledged object
#[derive(Debug)]
pub enum UploadError {
    Write(WriteFailure),
    Checkpoint(CheckpointError),
    /// The upload task panicked
    Panicked(String),
}

impl fmt::Display for UploadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadError::Write(e) => write!(f, "{}", e),
            UploadError::Checkpoint(e) => write!(f, "{}", e),
            UploadError::Panicked(msg) => write!(f, "Upload task panicked: {}", msg),
        }
    }
}

impl std::error::Error for UploadError {}

/// A fatal upload failure on one stream
#[derive(Debug)]
pub struct StreamFailure {
    pub stream: StreamId,
    pub seq: u64,
    pub error: UploadError,
}

impl fmt::Display for StreamFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream {} batch {}: {}", self.stream, self.seq, self.error)
    }
}

/// Top-level pipeline error
#[derive(Debug)]
pub enum PipelineError {
    /// A record arrived for a stream that no longer accepts records
    StreamClosed { stream: StreamId },
    /// Offsets or batch sequence went backwards
    OrderingViolation(CheckpointError),
    /// Fail-fast: first fatal stream failure
    StreamFailed(StreamFailure),
    /// Isolate: streams that failed while others completed
    StreamsFailed(Vec<StreamFailure>),
    /// Reading upstream failed
    Input(InputError),
    /// Shutdown requested before the input finished
    Cancelled { hard: bool },
    Config(ConfigError),
}

impl PipelineError {
    /// Streams whose data is not fully durable because of this error
    pub fn failed_streams(&self) -> Vec<&StreamId> {
        match self {
            PipelineError::StreamClosed { stream } => vec![stream],
            PipelineError::StreamFailed(f) => vec![&f.stream],
            PipelineError::StreamsFailed(fs) => fs.iter().map(|f| &f.stream).collect(),
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::StreamClosed { stream } => {
                write!(f, "Record received for closed stream {}", stream)
            }
            PipelineError::OrderingViolation(e) => write!(f, "{}", e),
            PipelineError::StreamFailed(failure) => write!(f, "Stream failed: {}", failure),
            PipelineError::StreamsFailed(failures) => {
                write!(f, "{} stream(s) failed", failures.len())?;
                for failure in failures {
                    write!(f, "; {}", failure)?;
                }
                Ok(())
            }
            PipelineError::Input(e) => write!(f, "{}", e),
            PipelineError::Cancelled { hard: true } => write!(f, "Pipeline aborted"),
            PipelineError::Cancelled { hard: false } => {
                write!(f, "Pipeline cancelled after draining buffered records")
            }
            PipelineError::Config(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PipelineError::OrderingViolation(e) => Some(e),
            PipelineError::Input(e) => Some(e),
            PipelineError::Config(e) => Some(e),
            PipelineError::StreamFailed(f) => Some(&f.error),
            _ => None,
        }
    }
}

impl From<CheckpointError> for PipelineError {
    fn from(e: CheckpointError) -> Self {
        PipelineError::OrderingViolation(e)
    }
}

impl From<InputError> for PipelineError {
    fn from(e: InputError) -> Self {
        PipelineError::Input(e)
    }
}

impl From<ConfigError> for PipelineError {
    fn from(e: ConfigError) -> Self {
        PipelineError::Config(e)
    }
}
