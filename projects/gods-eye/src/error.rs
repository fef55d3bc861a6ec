// Error taxonomy for the detection-and-streaming pipeline
//
// Only sustained capture failure may stop the pipeline loop. Everything else
// degrades a single inference cycle or a single request.

use thiserror::Error;

/// The video device could not be opened or stopped producing frames.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("capture device unavailable: {0}")]
    Unavailable(String),

    #[error("failed to read frame: {0}")]
    Read(String),

    #[error("capture source exhausted")]
    Exhausted,
}

/// Detection or identity inference failed for one cycle.
#[derive(Debug, Error)]
pub enum OracleError {
    #[error("model failed to load: {0}")]
    Load(String),

    #[error("inference failed: {0}")]
    Inference(String),
}

/// An uploaded image could not be enrolled. The registry is left unchanged.
#[derive(Debug, Error)]
pub enum EnrollmentError {
    #[error("no usable face found in image")]
    NoFace,

    #[error("invalid identity name: {0:?}")]
    InvalidName(String),

    #[error("image could not be decoded: {0}")]
    UndecodableImage(String),

    #[error(transparent)]
    Oracle(#[from] OracleError),

    #[error("failed to persist registry: {0}")]
    Persist(String),
}

/// A malformed record found while loading the event log. Logged and skipped.
#[derive(Debug, Error)]
#[error("skipping malformed detection record at line {line}: {reason}")]
pub struct LogCorruption {
    pub line: u64,
    pub reason: String,
}
