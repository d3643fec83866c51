//! Host lifecycle: create a flow instance, talk to it, dispose of it.

use super::controller::{FlowController, FlowInput};
use crate::engine::{CapturePipeline, JobSubmission};
use crate::model::{
    FlowConfiguration, FlowEnvironment, FlowSnapshot, FlowUpdate, TerminalResult, UserAction,
};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Handle to one running flow. The flow is disposed once this and every
/// [`FlowHandle`] cloned from it are dropped, or on [`FlowInstance::dispose`].
pub struct FlowInstance {
    config: FlowConfiguration,
    input_tx: mpsc::UnboundedSender<FlowInput>,
    state_rx: watch::Receiver<FlowSnapshot>,
    update_rx: Option<mpsc::UnboundedReceiver<FlowUpdate>>,
    result_rx: Option<oneshot::Receiver<TerminalResult>>,
    task: JoinHandle<()>,
}

/// Cloneable sender side of a flow, for feeding input from other tasks.
#[derive(Debug, Clone)]
pub struct FlowHandle {
    input_tx: mpsc::UnboundedSender<FlowInput>,
}

impl FlowHandle {
    /// Forward a user action. Ignored once the flow has finished.
    pub fn send(&self, action: UserAction) {
        let _ = self.input_tx.send(FlowInput::User(action));
    }

    pub fn set_sandbox_mode(&self, enabled: bool) {
        let _ = self.input_tx.send(FlowInput::SandboxMode(enabled));
    }

    /// Ask the flow to tear down without waiting for it.
    pub fn request_dispose(&self) {
        let _ = self.input_tx.send(FlowInput::Dispose);
    }
}

/// Spawn the controller for a new flow. Must be called from within a Tokio runtime.
pub fn create(
    config: FlowConfiguration,
    env: FlowEnvironment,
    pipeline: Box<dyn CapturePipeline>,
    submission: Arc<dyn JobSubmission>,
) -> FlowInstance {
    tracing::debug!(
        user_id = %config.user_id,
        job_id = %config.job_id,
        sandbox = env.sandbox,
        "creating flow"
    );
    let (controller, channels) = FlowController::new(config.clone(), env, pipeline, submission);
    let (input_tx, input_rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(controller.run(input_rx, channels.arm_rx));
    FlowInstance {
        config,
        input_tx,
        state_rx: channels.state_rx,
        update_rx: Some(channels.update_rx),
        result_rx: Some(channels.result_rx),
        task,
    }
}

impl FlowInstance {
    pub fn config(&self) -> &FlowConfiguration {
        &self.config
    }

    pub fn handle(&self) -> FlowHandle {
        FlowHandle {
            input_tx: self.input_tx.clone(),
        }
    }

    /// Forward a user action. Ignored once the flow has finished.
    pub fn send(&self, action: UserAction) {
        let _ = self.input_tx.send(FlowInput::User(action));
    }

    pub fn set_sandbox_mode(&self, enabled: bool) {
        let _ = self.input_tx.send(FlowInput::SandboxMode(enabled));
    }

    pub fn snapshot(&self) -> FlowSnapshot {
        self.state_rx.borrow().clone()
    }

    /// Subscribe to snapshot changes for re-rendering.
    pub fn watch(&self) -> watch::Receiver<FlowSnapshot> {
        self.state_rx.clone()
    }

    /// Take the update stream. Only one consumer can hold it.
    pub fn take_updates(&mut self) -> Option<mpsc::UnboundedReceiver<FlowUpdate>> {
        self.update_rx.take()
    }

    /// Wait for the terminal result.
    ///
    /// Resolves to `None` if the flow was disposed first, or if the result was
    /// already taken by an earlier call.
    pub async fn result(&mut self) -> Option<TerminalResult> {
        let rx = self.result_rx.take()?;
        rx.await.ok()
    }

    /// Tear the flow down and wait for its loop to exit. No result is delivered
    /// afterwards if none was delivered before.
    pub async fn dispose(self) {
        let _ = self.input_tx.send(FlowInput::Dispose);
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "flow task failed during dispose");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{
        ScriptStep, ScriptedEvent, ScriptedPipeline, ScriptedSubmission, SubmissionScript,
    };
    use crate::model::{FlowPhase, InfoEvent, SmartSelfieCaptureResult};
    use serde_json::{json, Value};
    use std::path::Path;
    use std::time::Duration;

    struct Setup {
        dir: tempfile::TempDir,
        submission: ScriptedSubmission,
    }

    impl Setup {
        fn new(outcome: SubmissionScript) -> Self {
            Self {
                dir: tempfile::TempDir::new().unwrap(),
                submission: ScriptedSubmission::new(Duration::from_millis(50), outcome),
            }
        }

        fn accepting() -> Self {
            Self::new(SubmissionScript::Accept {
                api_response: Some(json!({"resultCode": "0810", "jobComplete": true})),
                did_submit_biometric_kyc_job: false,
            })
        }

        fn create(&self, args: Value, sandbox: bool, takes: Vec<Vec<ScriptStep>>) -> FlowInstance {
            create(
                FlowConfiguration::from_args(args.as_object().unwrap()),
                FlowEnvironment {
                    sandbox,
                    cache_dir: self.dir.path().to_path_buf(),
                },
                Box::new(ScriptedPipeline::new(self.dir.path(), takes)),
                Arc::new(self.submission.clone()),
            )
        }
    }

    fn capture_after(ms: u64, frames: usize) -> Vec<ScriptStep> {
        vec![ScriptStep::new(
            Duration::from_millis(ms),
            ScriptedEvent::Capture {
                liveness_frames: frames,
            },
        )]
    }

    fn phases(updates: &mut mpsc::UnboundedReceiver<FlowUpdate>) -> Vec<FlowPhase> {
        let mut out = Vec::new();
        while let Ok(update) = updates.try_recv() {
            if let FlowUpdate::PhaseChanged { to, .. } = update {
                out.push(to);
            }
        }
        out
    }

    fn decode(result: &TerminalResult) -> SmartSelfieCaptureResult {
        match result {
            TerminalResult::Success(p) => serde_json::from_str(&p.0).unwrap(),
            TerminalResult::Error(e) => panic!("expected success, got {}", e.0),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn no_instructions_no_confirmation_submits_real_artifact() {
        let setup = Setup::accepting();
        let mut flow = setup.create(
            json!({"showInstructions": false, "showConfirmationDialog": false}),
            false,
            vec![capture_after(200, 4)],
        );
        assert_eq!(flow.snapshot().phase, FlowPhase::Capturing);
        let mut updates = flow.take_updates().unwrap();

        let result = flow.result().await.expect("a result");
        let decoded = decode(&result);
        assert!(Path::new(&decoded.selfie_file).starts_with(setup.dir.path()));
        assert!(Path::new(&decoded.selfie_file).exists());
        assert_eq!(decoded.liveness_files.len(), 4);
        assert_eq!(decoded.api_response.unwrap()["resultCode"], "0810");
        assert!(!decoded.did_submit_biometric_kyc_job);

        assert_eq!(
            phases(&mut updates),
            vec![FlowPhase::Processing, FlowPhase::Terminal]
        );
        assert_eq!(setup.submission.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn instructions_then_confirmation_then_success() {
        let setup = Setup::accepting();
        let mut flow = setup.create(json!({}), false, vec![capture_after(100, 2)]);
        let mut updates = flow.take_updates().unwrap();
        assert_eq!(flow.snapshot().phase, FlowPhase::Instructions);

        // Nothing happens before acknowledgement.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(flow.snapshot().phase, FlowPhase::Instructions);

        flow.send(UserAction::AcknowledgeInstructions);
        tokio::time::sleep(Duration::from_millis(150)).await;
        let snap = flow.snapshot();
        assert_eq!(snap.phase, FlowPhase::AwaitingConfirmation);
        assert!(snap.selfie_to_confirm.is_some());

        flow.send(UserAction::Confirm);
        let result = flow.result().await.unwrap();
        assert!(result.is_success());
        assert_eq!(
            phases(&mut updates),
            vec![
                FlowPhase::Capturing,
                FlowPhase::AwaitingConfirmation,
                FlowPhase::Processing,
                FlowPhase::Terminal
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retake_discards_the_first_artifact() {
        let setup = Setup::accepting();
        let mut flow = setup.create(
            json!({"showInstructions": false}),
            false,
            vec![capture_after(100, 2), capture_after(100, 2)],
        );
        let mut updates = flow.take_updates().unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        let first = flow.snapshot().selfie_to_confirm.expect("first capture");
        flow.send(UserAction::Retake);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(flow.snapshot().phase, FlowPhase::Capturing);

        tokio::time::sleep(Duration::from_millis(150)).await;
        let second = flow.snapshot().selfie_to_confirm.expect("second capture");
        assert_ne!(first, second);
        flow.send(UserAction::Confirm);

        let decoded = decode(&flow.result().await.unwrap());
        assert_eq!(Path::new(&decoded.selfie_file), second.as_path());
        assert_eq!(decoded.liveness_files.len(), 2);

        let mut discarded = None;
        while let Ok(update) = updates.try_recv() {
            if let FlowUpdate::Info(InfoEvent::ArtifactDiscarded(artifact)) = update {
                discarded = Some(artifact);
            }
        }
        let discarded = discarded.expect("a discarded artifact");
        assert_eq!(discarded.selfie, first);
        assert_eq!(discarded.liveness.len(), 2);
        let mut old_files = discarded.liveness.clone();
        old_files.push(discarded.selfie.clone());
        for old in &old_files {
            assert_ne!(Path::new(&decoded.selfie_file), old.as_path());
            assert!(decoded
                .liveness_files
                .iter()
                .all(|f| Path::new(f) != old.as_path()));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sandbox_arms_only_after_acknowledgement_and_delay() {
        let setup = Setup::accepting();
        let flow = setup.create(json!({"enableSandboxManualCapture": true}), true, vec![]);

        tokio::time::sleep(Duration::from_secs(10)).await;
        let snap = flow.snapshot();
        assert!(!snap.sandbox.armed);
        assert!(!snap.manual_capture_visible);

        flow.send(UserAction::AcknowledgeInstructions);
        tokio::time::sleep(Duration::from_millis(3999)).await;
        assert!(!flow.snapshot().sandbox.armed);
        tokio::time::sleep(Duration::from_millis(2)).await;
        let snap = flow.snapshot();
        assert!(snap.sandbox.armed);
        assert!(snap.manual_capture_visible);
        assert!(snap.sandbox.enabled);
    }

    #[tokio::test(start_paused = true)]
    async fn sandbox_never_arms_when_disabled() {
        let setup = Setup::accepting();
        let flow = setup.create(json!({"showInstructions": false}), true, vec![]);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(!flow.snapshot().sandbox.armed);
        assert!(!flow.snapshot().manual_capture_visible);

        // Manual capture enabled but not in sandbox mode.
        let flow = setup.create(
            json!({"showInstructions": false, "enableSandboxManualCapture": true}),
            false,
            vec![],
        );
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(!flow.snapshot().sandbox.armed);
    }

    #[tokio::test(start_paused = true)]
    async fn sandbox_control_needs_the_instructions_screen() {
        let setup = Setup::accepting();
        for args in [
            json!({"showInstructions": false, "enableSandboxManualCapture": true}),
            json!({"useStrictMode": true, "enableSandboxManualCapture": true}),
        ] {
            let mut flow = setup.create(args, true, vec![]);
            tokio::time::sleep(Duration::from_secs(5)).await;
            let snap = flow.snapshot();
            assert!(!snap.instructions_acknowledged);
            assert!(!snap.sandbox.armed);
            assert!(!snap.manual_capture_visible);

            flow.send(UserAction::SandboxManualCapture);
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert_eq!(flow.snapshot().phase, FlowPhase::Capturing);
            let result_rx = flow.result_rx.take().unwrap();
            flow.dispose().await;
            assert!(result_rx.await.is_err());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn manual_capture_yields_synthetic_success_once() {
        let setup = Setup::accepting();
        let mut flow = setup.create(json!({"enableSandboxManualCapture": true}), true, vec![]);
        flow.send(UserAction::AcknowledgeInstructions);
        tokio::time::sleep(Duration::from_millis(4001)).await;
        assert!(flow.snapshot().manual_capture_visible);

        flow.send(UserAction::SandboxManualCapture);
        flow.send(UserAction::SandboxManualCapture);
        let decoded = decode(&flow.result().await.unwrap());
        assert_eq!(decoded.liveness_files.len(), 3);
        assert!(decoded.api_response.is_none());
        assert!(!decoded.did_submit_biometric_kyc_job);
        assert!(Path::new(&decoded.selfie_file).exists());

        let snap = flow.snapshot();
        assert_eq!(snap.phase, FlowPhase::Terminal);
        assert!(!snap.sandbox.enabled);
        assert_eq!(setup.submission.calls(), 0);
        assert!(flow.result().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn disabling_sandbox_disarms_the_control() {
        let setup = Setup::accepting();
        let flow = setup.create(json!({"enableSandboxManualCapture": true}), true, vec![]);
        flow.send(UserAction::AcknowledgeInstructions);
        tokio::time::sleep(Duration::from_millis(4001)).await;
        assert!(flow.snapshot().sandbox.armed);

        flow.set_sandbox_mode(false);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(!flow.snapshot().sandbox.armed);
        assert!(!flow.snapshot().manual_capture_visible);

        flow.set_sandbox_mode(true);
        tokio::time::sleep(Duration::from_millis(3000)).await;
        assert!(!flow.snapshot().sandbox.armed);
        tokio::time::sleep(Duration::from_millis(1001)).await;
        assert!(flow.snapshot().sandbox.armed);
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_while_capturing_delivers_nothing() {
        let setup = Setup::accepting();
        let mut flow = setup.create(json!({"enableSandboxManualCapture": true}), true, vec![]);
        let mut updates = flow.take_updates().unwrap();
        let watch = flow.watch();
        flow.send(UserAction::AcknowledgeInstructions);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(watch.borrow().phase, FlowPhase::Capturing);
        flow.dispose().await;

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!watch.borrow().sandbox.armed);
        let mut saw_disposed = false;
        while let Ok(update) = updates.try_recv() {
            assert!(!matches!(update, FlowUpdate::SandboxChanged(_)));
            if update == FlowUpdate::Info(InfoEvent::Disposed) {
                saw_disposed = true;
            }
        }
        assert!(saw_disposed);
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_while_awaiting_confirmation_delivers_nothing() {
        let setup = Setup::accepting();
        let mut flow = setup.create(
            json!({"showInstructions": false}),
            false,
            vec![capture_after(10, 1)],
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(flow.snapshot().phase, FlowPhase::AwaitingConfirmation);
        let result_rx = flow.result_rx.take().unwrap();
        flow.dispose().await;
        assert!(result_rx.await.is_err());
        assert_eq!(setup.submission.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn flow_outlives_the_instance_while_a_handle_remains() {
        let setup = Setup::accepting();
        let mut flow = setup.create(json!({}), false, vec![]);
        let mut updates = flow.take_updates().unwrap();
        let handle = flow.handle();
        drop(flow);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(updates.try_recv().is_err());

        handle.send(UserAction::AcknowledgeInstructions);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(phases(&mut updates), vec![FlowPhase::Capturing]);

        drop(handle);
        let mut disposed = false;
        while let Some(update) = updates.recv().await {
            if update == FlowUpdate::Info(InfoEvent::Disposed) {
                disposed = true;
            }
        }
        assert!(disposed);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_submission_is_an_error_result() {
        let setup = Setup::new(SubmissionScript::Reject {
            cause: "job rejected".into(),
        });
        let mut flow = setup.create(
            json!({"showInstructions": false, "showConfirmationDialog": false}),
            false,
            vec![capture_after(10, 1)],
        );
        let TerminalResult::Error(err) = flow.result().await.unwrap() else {
            panic!("expected an error result");
        };
        let v: Value = serde_json::from_str(&err.0).unwrap();
        assert_eq!(v["kind"], "submission_failure");
        assert_eq!(flow.snapshot().phase, FlowPhase::Terminal);
    }

    #[tokio::test(start_paused = true)]
    async fn pipeline_failure_and_early_close_are_capture_failures() {
        let setup = Setup::accepting();
        let mut flow = setup.create(
            json!({"showInstructions": false}),
            false,
            vec![vec![ScriptStep::new(
                Duration::from_millis(10),
                ScriptedEvent::CaptureFailed {
                    cause: "camera unavailable".into(),
                },
            )]],
        );
        let TerminalResult::Error(err) = flow.result().await.unwrap() else {
            panic!("expected an error result");
        };
        let v: Value = serde_json::from_str(&err.0).unwrap();
        assert_eq!(v["kind"], "capture_failure");

        let mut flow = setup.create(
            json!({"showInstructions": false}),
            false,
            vec![vec![ScriptStep::new(Duration::ZERO, ScriptedEvent::Close)]],
        );
        let TerminalResult::Error(err) = flow.result().await.unwrap() else {
            panic!("expected an error result");
        };
        assert!(err.0.contains("capture_failure"));
    }

    #[tokio::test(start_paused = true)]
    async fn strict_pipeline_submits_on_its_own() {
        let setup = Setup::accepting();
        let mut flow = setup.create(
            json!({"useStrictMode": true}),
            false,
            vec![vec![
                ScriptStep::new(Duration::from_millis(100), ScriptedEvent::ProcessingStarted),
                ScriptStep::new(
                    Duration::from_millis(100),
                    ScriptedEvent::ProcessingCompleted {
                        liveness_frames: 2,
                        api_response: Some(json!({"resultCode": "0812"})),
                        did_submit_biometric_kyc_job: true,
                    },
                ),
            ]],
        );
        let mut updates = flow.take_updates().unwrap();
        let decoded = decode(&flow.result().await.unwrap());
        assert_eq!(decoded.api_response.unwrap()["resultCode"], "0812");
        assert!(decoded.did_submit_biometric_kyc_job);
        assert_eq!(decoded.liveness_files.len(), 2);
        assert_eq!(setup.submission.calls(), 0);
        assert_eq!(
            phases(&mut updates),
            vec![FlowPhase::Processing, FlowPhase::Terminal]
        );
    }
}
