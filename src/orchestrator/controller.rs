//! Capture flow controller.
//!
//! Owns the flow phase, the sandbox fallback state and the single result sender.
//! One controller runs one event loop; every handler checks for the absorbing
//! terminal state before doing anything.

use super::assembler::ResultAssembler;
use super::gate::{self, ConfirmationDecision};
use super::sandbox::SandboxFallbackTimer;
use crate::engine::{CapturePipeline, JobSubmission, PipelineControl};
use crate::error::FlowError;
use crate::model::{
    CapturedArtifact, FlowConfiguration, FlowEnvironment, FlowPhase, FlowSnapshot, FlowUpdate,
    InfoEvent, PipelineEvent, SandboxFallbackState, SubmissionResponse, TerminalResult,
    UserAction,
};
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

/// Inputs from the host: user actions and lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FlowInput {
    User(UserAction),
    SandboxMode(bool),
    Dispose,
}

type PendingSubmission = BoxFuture<'static, Result<SubmissionResponse, FlowError>>;

/// Receiving ends handed to the host when a controller is built.
pub(crate) struct ControllerChannels {
    pub arm_rx: mpsc::UnboundedReceiver<u64>,
    pub state_rx: watch::Receiver<FlowSnapshot>,
    pub update_rx: mpsc::UnboundedReceiver<FlowUpdate>,
    pub result_rx: oneshot::Receiver<TerminalResult>,
}

pub(crate) struct FlowController {
    cfg: FlowConfiguration,
    sandbox_mode: bool,
    phase: FlowPhase,
    acknowledged: bool,
    sandbox: SandboxFallbackState,
    artifact: Option<CapturedArtifact>,

    pipeline: Option<Box<dyn CapturePipeline>>,
    pipeline_ctrl: Option<mpsc::UnboundedSender<PipelineControl>>,
    pipeline_rx: Option<mpsc::UnboundedReceiver<PipelineEvent>>,
    // Set when the pipeline announced it is submitting on its own.
    pipeline_driven: bool,

    submission: Arc<dyn JobSubmission>,
    pending_submission: Option<PendingSubmission>,
    submitted: bool,

    timer: SandboxFallbackTimer,
    timer_generation: u64,
    arm_tx: mpsc::UnboundedSender<u64>,

    assembler: ResultAssembler,
    result_tx: Option<oneshot::Sender<TerminalResult>>,
    state_tx: watch::Sender<FlowSnapshot>,
    update_tx: mpsc::UnboundedSender<FlowUpdate>,
    disposed: bool,
}

impl FlowController {
    pub fn new(
        cfg: FlowConfiguration,
        env: FlowEnvironment,
        pipeline: Box<dyn CapturePipeline>,
        submission: Arc<dyn JobSubmission>,
    ) -> (Self, ControllerChannels) {
        let phase = if cfg.show_instructions && !cfg.use_strict_mode {
            FlowPhase::Instructions
        } else {
            FlowPhase::Capturing
        };
        // Only the instructions screen acknowledges; skipping it does not.
        let acknowledged = false;
        let (arm_tx, arm_rx) = mpsc::unbounded_channel();
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let (result_tx, result_rx) = oneshot::channel();
        let (state_tx, state_rx) = watch::channel(FlowSnapshot {
            phase,
            sandbox: SandboxFallbackState::default(),
            instructions_acknowledged: acknowledged,
            manual_capture_visible: false,
            selfie_to_confirm: None,
        });

        let controller = Self {
            cfg,
            sandbox_mode: env.sandbox,
            phase,
            acknowledged,
            sandbox: SandboxFallbackState::default(),
            artifact: None,
            pipeline: Some(pipeline),
            pipeline_ctrl: None,
            pipeline_rx: None,
            pipeline_driven: false,
            submission,
            pending_submission: None,
            submitted: false,
            timer: SandboxFallbackTimer::default(),
            timer_generation: 0,
            arm_tx,
            assembler: ResultAssembler::new(env.cache_dir),
            result_tx: Some(result_tx),
            state_tx,
            update_tx,
            disposed: false,
        };
        let channels = ControllerChannels {
            arm_rx,
            state_rx,
            update_rx,
            result_rx,
        };
        (controller, channels)
    }

    /// Drive the flow until it reaches `Terminal` or the host disposes it.
    pub async fn run(
        mut self,
        mut input_rx: mpsc::UnboundedReceiver<FlowInput>,
        mut arm_rx: mpsc::UnboundedReceiver<u64>,
    ) {
        self.start();
        while !self.closed() {
            tokio::select! {
                input = input_rx.recv() => match input {
                    Some(FlowInput::User(action)) => self.handle_user_action(action),
                    Some(FlowInput::SandboxMode(on)) => self.set_sandbox_mode(on),
                    // A dropped host handle counts as disposal.
                    Some(FlowInput::Dispose) | None => self.dispose(),
                },
                Some(generation) = arm_rx.recv() => self.on_sandbox_armed(generation),
                ev = next_event(&mut self.pipeline_rx) => match ev {
                    Some(ev) => self.on_pipeline_event(ev),
                    None => self.on_pipeline_closed(),
                },
                // The future is only cleared after it resolves; clearing it in another
                // branch would drop the submission's completion on the floor.
                res = settle(&mut self.pending_submission) => {
                    self.pending_submission = None;
                    self.on_submission_settled(res);
                }
            }
        }
        tracing::debug!(job_id = %self.cfg.job_id, phase = %self.phase, "flow loop exited");
    }

    /// Start capturing right away when there is no instructional phase.
    pub fn start(&mut self) {
        if self.phase == FlowPhase::Capturing {
            self.start_pipeline();
        }
        self.publish();
    }

    #[cfg(test)]
    pub fn phase(&self) -> FlowPhase {
        self.phase
    }

    #[cfg(test)]
    pub fn sandbox_state(&self) -> SandboxFallbackState {
        self.sandbox
    }

    fn closed(&self) -> bool {
        self.phase == FlowPhase::Terminal || self.disposed
    }

    pub fn handle_user_action(&mut self, action: UserAction) {
        match action {
            UserAction::AcknowledgeInstructions => self.acknowledge_instructions(),
            UserAction::Confirm => self.confirm(),
            UserAction::Retake => self.retake(),
            UserAction::SandboxManualCapture => self.activate_manual_capture(),
        }
    }

    fn acknowledge_instructions(&mut self) {
        if self.closed() || self.phase != FlowPhase::Instructions {
            return;
        }
        self.acknowledged = true;
        self.enter(FlowPhase::Capturing);
        self.start_pipeline();
        self.restart_sandbox_timer();
    }

    fn confirm(&mut self) {
        if self.closed() {
            return;
        }
        if self.phase != FlowPhase::AwaitingConfirmation || self.artifact.is_none() {
            tracing::debug!(phase = %self.phase, "confirm ignored");
            return;
        }
        self.submit();
    }

    fn retake(&mut self) {
        if self.closed() {
            return;
        }
        if self.phase != FlowPhase::AwaitingConfirmation {
            tracing::debug!(phase = %self.phase, "retake ignored");
            return;
        }
        if let Some(discarded) = self.artifact.take() {
            self.info(InfoEvent::ArtifactDiscarded(discarded));
        }
        if let Some(ctrl) = &self.pipeline_ctrl {
            let _ = ctrl.send(PipelineControl::Retake);
        }
        self.enter(FlowPhase::Capturing);
        if self.pipeline_rx.is_none() {
            self.fail(FlowError::Capture(
                "capture pipeline is no longer running".into(),
            ));
        }
    }

    fn activate_manual_capture(&mut self) {
        if self.closed() {
            return;
        }
        if !self.manual_capture_visible() {
            tracing::debug!(
                armed = self.sandbox.armed,
                acknowledged = self.acknowledged,
                "manual capture not available"
            );
            return;
        }
        if !self.sandbox.enabled {
            tracing::debug!("manual capture already used");
            return;
        }
        self.sandbox.enabled = false;
        self.sandbox_changed();
        self.info(InfoEvent::ManualCaptureUsed);
        let assembled = self.assembler.assemble_sandbox_success();
        let result = self.assembler.seal(assembled);
        self.finish(result);
    }

    pub fn set_sandbox_mode(&mut self, on: bool) {
        if self.closed() || self.sandbox_mode == on {
            return;
        }
        self.sandbox_mode = on;
        self.restart_sandbox_timer();
        self.publish();
    }

    pub fn on_sandbox_armed(&mut self, generation: u64) {
        if self.closed() || generation != self.timer_generation {
            tracing::trace!(generation, current = self.timer_generation, "stale arm dropped");
            return;
        }
        self.sandbox.armed = true;
        self.info(InfoEvent::SandboxFallbackArmed);
        self.sandbox_changed();
    }

    pub fn on_pipeline_event(&mut self, ev: PipelineEvent) {
        if self.closed() {
            return;
        }
        match ev {
            PipelineEvent::ArtifactCaptured(artifact) => self.on_artifact_captured(artifact),
            PipelineEvent::ProcessingStarted => {
                if self.phase == FlowPhase::Capturing {
                    self.pipeline_driven = true;
                    self.enter(FlowPhase::Processing);
                } else {
                    tracing::debug!(phase = %self.phase, "processing start ignored");
                }
            }
            PipelineEvent::ProcessingCompleted(outcome) => {
                if self.awaiting_pipeline() {
                    let assembled = self
                        .assembler
                        .assemble_success(&outcome.artifact, &outcome.submission);
                    let result = self.assembler.seal(assembled);
                    self.finish(result);
                } else {
                    tracing::debug!(phase = %self.phase, "pipeline completion ignored");
                }
            }
            PipelineEvent::CaptureFailed { cause } => {
                if self.awaiting_pipeline() {
                    self.fail(FlowError::Capture(cause));
                }
            }
            PipelineEvent::ProcessingFailed { cause } => {
                if self.awaiting_pipeline() {
                    self.fail(FlowError::Submission(cause));
                }
            }
        }
    }

    fn on_artifact_captured(&mut self, artifact: CapturedArtifact) {
        if self.phase != FlowPhase::Capturing {
            tracing::debug!(phase = %self.phase, "artifact ignored outside capture");
            return;
        }
        self.artifact = Some(artifact);
        // The strict pipeline has no confirmation step.
        let show = self.cfg.show_confirmation_dialog && !self.cfg.use_strict_mode;
        match gate::decide(show) {
            ConfirmationDecision::Show => self.enter(FlowPhase::AwaitingConfirmation),
            ConfirmationDecision::Skip => self.submit(),
        }
    }

    pub fn on_pipeline_closed(&mut self) {
        self.pipeline_rx = None;
        if self.closed() {
            return;
        }
        if self.awaiting_pipeline() {
            self.fail(FlowError::Capture(
                "capture pipeline ended before producing a result".into(),
            ));
        }
    }

    pub fn on_submission_settled(&mut self, res: Result<SubmissionResponse, FlowError>) {
        if self.closed() {
            return;
        }
        match res {
            Ok(response) => {
                let Some(artifact) = self.artifact.take() else {
                    self.fail(FlowError::Capture(
                        "artifact released before submission completed".into(),
                    ));
                    return;
                };
                let assembled = self.assembler.assemble_success(&artifact, &response);
                let result = self.assembler.seal(assembled);
                self.finish(result);
            }
            Err(e) => self.fail(e),
        }
    }

    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        if self.phase != FlowPhase::Terminal {
            self.teardown();
            // No result is owed once the host tears the flow down.
            self.result_tx = None;
            self.info(InfoEvent::Disposed);
            tracing::debug!(phase = %self.phase, "flow disposed before a result");
        }
    }

    fn awaiting_pipeline(&self) -> bool {
        self.phase == FlowPhase::Capturing
            || (self.phase == FlowPhase::Processing && self.pipeline_driven)
    }

    fn manual_capture_visible(&self) -> bool {
        self.sandbox_mode
            && self.cfg.enable_sandbox_manual_capture
            && self.sandbox.armed
            && self.acknowledged
            && self.phase != FlowPhase::Terminal
    }

    fn start_pipeline(&mut self) {
        let Some(pipeline) = self.pipeline.take() else {
            return;
        };
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        let events = pipeline.start(&self.cfg.user_id, &self.cfg.job_id, &self.cfg, ctrl_rx);
        self.pipeline_ctrl = Some(ctrl_tx);
        self.pipeline_rx = Some(events);
    }

    fn restart_sandbox_timer(&mut self) {
        let enabled =
            self.sandbox_mode && self.cfg.enable_sandbox_manual_capture && self.acknowledged;
        self.timer_generation += 1;
        let generation = self.timer_generation;
        let arm_tx = self.arm_tx.clone();
        self.timer.start(enabled, move || {
            let _ = arm_tx.send(generation);
        });
        if self.sandbox.armed {
            self.sandbox.armed = false;
            self.sandbox_changed();
        }
    }

    fn submit(&mut self) {
        if self.submitted {
            tracing::warn!(job_id = %self.cfg.job_id, "submission already invoked for this flow");
            return;
        }
        let Some(artifact) = self.artifact.as_ref() else {
            return;
        };
        self.submitted = true;
        self.pending_submission = Some(self.submission.submit(artifact));
        self.info(InfoEvent::SubmissionStarted);
        self.enter(FlowPhase::Processing);
    }

    fn fail(&mut self, cause: FlowError) {
        tracing::warn!(error = %cause, kind = ?cause.kind(), "flow failed");
        let encoded = self.assembler.assemble_error(&cause);
        self.finish(TerminalResult::Error(encoded));
    }

    fn finish(&mut self, result: TerminalResult) {
        if self.phase == FlowPhase::Terminal {
            return;
        }
        self.teardown();
        self.enter(FlowPhase::Terminal);
        match self.result_tx.take() {
            Some(tx) => {
                tracing::info!(
                    job_id = %self.cfg.job_id,
                    success = result.is_success(),
                    "flow finished"
                );
                if tx.send(result).is_err() {
                    tracing::debug!("result receiver already dropped");
                }
            }
            None => tracing::warn!("terminal result already delivered"),
        }
    }

    fn teardown(&mut self) {
        self.timer.cancel();
        if let Some(ctrl) = self.pipeline_ctrl.take() {
            let _ = ctrl.send(PipelineControl::Cancel);
        }
        self.pipeline_rx = None;
        self.pending_submission = None;
        self.artifact = None;
    }

    fn enter(&mut self, next: FlowPhase) {
        if self.phase == next {
            return;
        }
        let from = self.phase;
        self.phase = next;
        tracing::debug!(%from, to = %next, "phase changed");
        let _ = self.update_tx.send(FlowUpdate::PhaseChanged { from, to: next });
        self.publish();
    }

    fn sandbox_changed(&mut self) {
        let _ = self.update_tx.send(FlowUpdate::SandboxChanged(self.sandbox));
        self.publish();
    }

    fn info(&self, event: InfoEvent) {
        let _ = self.update_tx.send(FlowUpdate::Info(event));
    }

    fn snapshot(&self) -> FlowSnapshot {
        FlowSnapshot {
            phase: self.phase,
            sandbox: self.sandbox,
            instructions_acknowledged: self.acknowledged,
            manual_capture_visible: self.manual_capture_visible(),
            selfie_to_confirm: self
                .artifact
                .as_ref()
                .filter(|_| self.phase == FlowPhase::AwaitingConfirmation)
                .map(|a| a.selfie.clone()),
        }
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.snapshot());
    }
}

async fn next_event<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => futures::future::pending().await,
    }
}

async fn settle(
    pending: &mut Option<PendingSubmission>,
) -> Result<SubmissionResponse, FlowError> {
    match pending.as_mut() {
        Some(fut) => fut.await,
        None => futures::future::pending().await,
    }
}
