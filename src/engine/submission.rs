use super::JobSubmission;
use crate::error::FlowError;
use crate::model::{CapturedArtifact, SubmissionResponse};
use futures::future::BoxFuture;
use serde::Deserialize;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionScript {
    Accept {
        #[serde(default)]
        api_response: Option<serde_json::Value>,
        #[serde(default)]
        did_submit_biometric_kyc_job: bool,
    },
    Reject {
        cause: String,
    },
}

impl Default for SubmissionScript {
    fn default() -> Self {
        SubmissionScript::Accept {
            api_response: None,
            did_submit_biometric_kyc_job: false,
        }
    }
}

/// Job layer stand-in that answers with a fixed outcome after a fixed latency.
#[derive(Debug, Clone)]
pub struct ScriptedSubmission {
    latency: Duration,
    outcome: SubmissionScript,
    calls: Arc<AtomicUsize>,
}

impl ScriptedSubmission {
    pub fn new(latency: Duration, outcome: SubmissionScript) -> Self {
        Self {
            latency,
            outcome,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of submissions made so far.
    #[cfg(test)]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

impl JobSubmission for ScriptedSubmission {
    fn submit(
        &self,
        artifact: &CapturedArtifact,
    ) -> BoxFuture<'static, Result<SubmissionResponse, FlowError>> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            selfie = %artifact.selfie.display(),
            liveness = artifact.liveness.len(),
            "submitting job"
        );
        let latency = self.latency;
        let outcome = self.outcome.clone();
        Box::pin(async move {
            tokio::time::sleep(latency).await;
            match outcome {
                SubmissionScript::Accept {
                    api_response,
                    did_submit_biometric_kyc_job,
                } => Ok(SubmissionResponse {
                    api_response,
                    did_submit_biometric_kyc_job,
                }),
                SubmissionScript::Reject { cause } => Err(FlowError::Submission(cause)),
            }
        })
    }
}
