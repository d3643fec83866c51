//! Terminal payload construction.
//!
//! Success and error payloads are JSON strings handed to the caller as-is. Any
//! failure while writing placeholder files or encoding is folded into an error
//! payload by [`ResultAssembler::seal`].

use crate::error::FlowError;
use crate::model::{
    CapturedArtifact, EncodedError, EncodedPayload, SmartSelfieCaptureResult, SubmissionResponse,
    TerminalResult,
};
use crate::storage;
use std::path::{Path, PathBuf};

/// Placeholder liveness frames written for a sandbox result.
pub(crate) const SANDBOX_LIVENESS_FRAMES: usize = 3;

#[derive(Debug, Clone)]
pub(crate) struct ResultAssembler {
    cache_dir: PathBuf,
}

impl ResultAssembler {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
        }
    }

    pub fn assemble_success(
        &self,
        artifact: &CapturedArtifact,
        submission: &SubmissionResponse,
    ) -> Result<EncodedPayload, FlowError> {
        let record = SmartSelfieCaptureResult {
            selfie_file: path_ref(&artifact.selfie),
            liveness_files: artifact.liveness.iter().map(|p| path_ref(p)).collect(),
            api_response: submission.api_response.clone(),
            did_submit_biometric_kyc_job: submission.did_submit_biometric_kyc_job,
        };
        Ok(EncodedPayload(serde_json::to_string(&record)?))
    }

    /// Synthesize a capture from the placeholder image without touching the pipeline.
    pub fn assemble_sandbox_success(&self) -> Result<EncodedPayload, FlowError> {
        let image = storage::placeholder_image()?;
        let selfie = storage::write_temp_image(&self.cache_dir, "sandbox_selfie_", &image)?;
        let liveness = (0..SANDBOX_LIVENESS_FRAMES)
            .map(|i| {
                storage::write_temp_image(
                    &self.cache_dir,
                    &format!("sandbox_liveness_{i}_"),
                    &image,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;
        tracing::debug!(
            selfie = %selfie.display(),
            frames = liveness.len(),
            "sandbox artifacts written"
        );
        self.assemble_success(
            &CapturedArtifact { selfie, liveness },
            &SubmissionResponse::default(),
        )
    }

    pub fn assemble_error(&self, cause: &FlowError) -> EncodedError {
        let body = serde_json::json!({
            "kind": cause.kind(),
            "message": cause.to_string(),
        });
        EncodedError(body.to_string())
    }

    /// Fail closed: an assembly failure becomes the error result.
    pub fn seal(&self, assembled: Result<EncodedPayload, FlowError>) -> TerminalResult {
        match assembled {
            Ok(payload) => TerminalResult::Success(payload),
            Err(e) => {
                tracing::warn!(error = %e, "result assembly failed");
                TerminalResult::Error(self.assemble_error(&e))
            }
        }
    }
}

fn path_ref(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
