use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures that end a flow on the error path.
///
/// Every variant is recovered at the controller/assembler boundary and turned into
/// a single error result; nothing here is allowed to reach the host as a panic.
#[derive(Debug, Error)]
pub enum FlowError {
    /// The capture pipeline could not produce an artifact.
    #[error("capture failed: {0}")]
    Capture(String),

    /// The job layer rejected the submission. The cause is carried through as-is.
    #[error("submission failed: {0}")]
    Submission(String),

    #[error("could not write temporary artifact: {0}")]
    TempFile(#[from] std::io::Error),

    #[error("could not encode result: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("could not decode artifact bytes: {0}")]
    Decode(#[from] base64::DecodeError),
}

/// Coarse error taxonomy reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    CaptureFailure,
    SubmissionFailure,
    SerializationFailure,
}

impl FlowError {
    pub fn kind(&self) -> FailureKind {
        match self {
            FlowError::Capture(_) => FailureKind::CaptureFailure,
            FlowError::Submission(_) => FailureKind::SubmissionFailure,
            FlowError::TempFile(_) | FlowError::Encode(_) | FlowError::Decode(_) => {
                FailureKind::SerializationFailure
            }
        }
    }
}
