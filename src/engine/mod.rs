//! Collaborator contracts: the capture pipeline that produces artifacts and the
//! job layer that submits them.

mod scripted;
mod submission;

pub use scripted::{ScriptStep, ScriptedEvent, ScriptedPipeline};
pub use submission::{ScriptedSubmission, SubmissionScript};

use crate::error::FlowError;
use crate::model::{CapturedArtifact, FlowConfiguration, PipelineEvent, SubmissionResponse};
use futures::future::BoxFuture;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineControl {
    /// Drop the current capture and start a new one
    Retake,
    /// Stop capturing entirely
    Cancel,
}

/// Live capture: face detection, liveness frames, and optionally its own submission.
///
/// `start` consumes the pipeline, so a flow can subscribe to it only once.
pub trait CapturePipeline: Send + 'static {
    fn start(
        self: Box<Self>,
        user_id: &str,
        job_id: &str,
        cfg: &FlowConfiguration,
        control_rx: mpsc::UnboundedReceiver<PipelineControl>,
    ) -> mpsc::UnboundedReceiver<PipelineEvent>;
}

/// Job submission for a confirmed artifact.
pub trait JobSubmission: Send + Sync + 'static {
    fn submit(
        &self,
        artifact: &CapturedArtifact,
    ) -> BoxFuture<'static, Result<SubmissionResponse, FlowError>>;
}
