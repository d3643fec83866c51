//! Capture pipeline that replays a scripted sequence of events.
//!
//! Each "take" is one capture attempt. A retake request abandons the current take
//! and moves on to the next one; once the takes run out the pipeline stays open and
//! silent, like a camera that never finds a face.

use super::{CapturePipeline, PipelineControl};
use crate::error::FlowError;
use crate::model::{
    CaptureOutcome, CapturedArtifact, FlowConfiguration, PipelineEvent, SubmissionResponse,
};
use crate::storage;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

/// One scripted pipeline event, emitted `after` the previous one.
#[derive(Debug, Clone, Deserialize)]
pub struct ScriptStep {
    #[serde(default, with = "humantime_serde")]
    pub after: Duration,
    #[serde(flatten)]
    pub event: ScriptedEvent,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ScriptedEvent {
    /// Capture a selfie plus `liveness_frames` frames.
    Capture {
        #[serde(default = "default_liveness_frames")]
        liveness_frames: usize,
    },
    ProcessingStarted,
    /// The pipeline captured and submitted on its own (strict mode).
    ProcessingCompleted {
        #[serde(default = "default_liveness_frames")]
        liveness_frames: usize,
        #[serde(default)]
        api_response: Option<serde_json::Value>,
        #[serde(default)]
        did_submit_biometric_kyc_job: bool,
    },
    CaptureFailed {
        cause: String,
    },
    ProcessingFailed {
        cause: String,
    },
    /// End the event stream.
    Close,
}

fn default_liveness_frames() -> usize {
    8
}

impl ScriptStep {
    pub fn new(after: Duration, event: ScriptedEvent) -> Self {
        Self { after, event }
    }
}

pub struct ScriptedPipeline {
    cache_dir: PathBuf,
    takes: Vec<Vec<ScriptStep>>,
}

impl ScriptedPipeline {
    pub fn new(cache_dir: impl Into<PathBuf>, takes: Vec<Vec<ScriptStep>>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            takes,
        }
    }
}

impl CapturePipeline for ScriptedPipeline {
    fn start(
        self: Box<Self>,
        user_id: &str,
        job_id: &str,
        cfg: &FlowConfiguration,
        control_rx: mpsc::UnboundedReceiver<PipelineControl>,
    ) -> mpsc::UnboundedReceiver<PipelineEvent> {
        tracing::debug!(
            user_id,
            job_id,
            strict = cfg.use_strict_mode,
            sensitivity = ?cfg.smile_sensitivity,
            takes = self.takes.len(),
            "scripted pipeline started"
        );
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let ScriptedPipeline { cache_dir, takes } = *self;
        tokio::spawn(run_script(cache_dir, takes, event_tx, control_rx));
        event_rx
    }
}

async fn run_script(
    cache_dir: PathBuf,
    takes: Vec<Vec<ScriptStep>>,
    event_tx: mpsc::UnboundedSender<PipelineEvent>,
    mut control_rx: mpsc::UnboundedReceiver<PipelineControl>,
) {
    let mut takes = takes.into_iter();
    'takes: loop {
        let steps = takes.next().unwrap_or_default();
        for step in steps {
            tokio::select! {
                _ = tokio::time::sleep(step.after) => {}
                ctrl = control_rx.recv() => match ctrl {
                    Some(PipelineControl::Retake) => continue 'takes,
                    Some(PipelineControl::Cancel) | None => return,
                }
            }
            let Some(ev) = step.event.materialize(&cache_dir) else {
                tracing::debug!("scripted pipeline closed its stream");
                return;
            };
            if event_tx.send(ev).is_err() {
                return;
            }
        }
        match control_rx.recv().await {
            Some(PipelineControl::Retake) => continue,
            Some(PipelineControl::Cancel) | None => return,
        }
    }
}

impl ScriptedEvent {
    /// Turn the scripted step into a real pipeline event, writing frames as needed.
    /// Returns `None` for `Close`.
    fn materialize(self, cache_dir: &Path) -> Option<PipelineEvent> {
        let ev = match self {
            ScriptedEvent::Capture { liveness_frames } => {
                match capture_files(cache_dir, liveness_frames) {
                    Ok(artifact) => PipelineEvent::ArtifactCaptured(artifact),
                    Err(e) => PipelineEvent::CaptureFailed {
                        cause: e.to_string(),
                    },
                }
            }
            ScriptedEvent::ProcessingStarted => PipelineEvent::ProcessingStarted,
            ScriptedEvent::ProcessingCompleted {
                liveness_frames,
                api_response,
                did_submit_biometric_kyc_job,
            } => match capture_files(cache_dir, liveness_frames) {
                Ok(artifact) => PipelineEvent::ProcessingCompleted(CaptureOutcome {
                    artifact,
                    submission: SubmissionResponse {
                        api_response,
                        did_submit_biometric_kyc_job,
                    },
                }),
                Err(e) => PipelineEvent::ProcessingFailed {
                    cause: e.to_string(),
                },
            },
            ScriptedEvent::CaptureFailed { cause } => PipelineEvent::CaptureFailed { cause },
            ScriptedEvent::ProcessingFailed { cause } => PipelineEvent::ProcessingFailed { cause },
            ScriptedEvent::Close => return None,
        };
        Some(ev)
    }
}

fn capture_files(dir: &Path, liveness_frames: usize) -> Result<CapturedArtifact, FlowError> {
    let image = storage::placeholder_image()?;
    let selfie = storage::write_temp_image(dir, "si_selfie_", &image)?;
    let liveness = (0..liveness_frames)
        .map(|i| storage::write_temp_image(dir, &format!("si_liveness_{i}_"), &image))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(CapturedArtifact { selfie, liveness })
}
