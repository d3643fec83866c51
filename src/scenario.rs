//! Scripted runs for the command-line host.
//!
//! A scenario describes the creation arguments, what the capture pipeline does,
//! how the job layer answers, and when the user taps what.

use crate::engine::{ScriptStep, ScriptedEvent, SubmissionScript};
use crate::model::UserAction;
use crate::orchestrator::FlowHandle;
use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub sandbox: bool,
    /// Creation arguments, as the embedding application would pass them.
    #[serde(default)]
    pub args: Map<String, Value>,
    #[serde(default)]
    pub takes: Vec<Vec<ScriptStep>>,
    #[serde(default)]
    pub actions: Vec<TimedAction>,
    #[serde(default)]
    pub submission: SubmissionStep,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmissionStep {
    #[serde(default = "default_latency", with = "humantime_serde")]
    pub latency: Duration,
    #[serde(default)]
    pub outcome: SubmissionScript,
}

impl Default for SubmissionStep {
    fn default() -> Self {
        Self {
            latency: default_latency(),
            outcome: SubmissionScript::default(),
        }
    }
}

fn default_latency() -> Duration {
    Duration::from_millis(300)
}

/// A host input fired `at` a fixed offset from flow creation.
#[derive(Debug, Clone, Deserialize)]
pub struct TimedAction {
    #[serde(with = "humantime_serde")]
    pub at: Duration,
    #[serde(flatten)]
    pub action: ScenarioAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ScenarioAction {
    AcknowledgeInstructions,
    Confirm,
    Retake,
    SandboxManualCapture,
    SandboxMode { enabled: bool },
    Dispose,
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read scenario {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parse scenario {}", path.display()))
    }

    /// Acknowledge, capture, confirm, accept.
    pub fn happy_path() -> Self {
        Self {
            sandbox: false,
            args: Map::new(),
            takes: vec![vec![ScriptStep::new(
                Duration::from_millis(800),
                ScriptedEvent::Capture { liveness_frames: 8 },
            )]],
            actions: vec![
                TimedAction {
                    at: Duration::from_millis(500),
                    action: ScenarioAction::AcknowledgeInstructions,
                },
                TimedAction {
                    at: Duration::from_millis(2000),
                    action: ScenarioAction::Confirm,
                },
            ],
            submission: SubmissionStep {
                latency: default_latency(),
                outcome: SubmissionScript::Accept {
                    api_response: Some(serde_json::json!({
                        "code": "2302",
                        "message": "Job is being processed",
                    })),
                    did_submit_biometric_kyc_job: false,
                },
            },
        }
    }
}

/// Fire scenario actions in order of their offsets.
pub async fn feed_actions(handle: FlowHandle, mut actions: Vec<TimedAction>) {
    actions.sort_by_key(|a| a.at);
    let start = tokio::time::Instant::now();
    for timed in actions {
        tokio::time::sleep_until(start + timed.at).await;
        tracing::debug!(at = ?timed.at, action = ?timed.action, "scenario action");
        match timed.action {
            ScenarioAction::AcknowledgeInstructions => {
                handle.send(UserAction::AcknowledgeInstructions)
            }
            ScenarioAction::Confirm => handle.send(UserAction::Confirm),
            ScenarioAction::Retake => handle.send(UserAction::Retake),
            ScenarioAction::SandboxManualCapture => handle.send(UserAction::SandboxManualCapture),
            ScenarioAction::SandboxMode { enabled } => handle.set_sandbox_mode(enabled),
            ScenarioAction::Dispose => handle.request_dispose(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_scenario() {
        let s: Scenario = serde_json::from_str(
            r#"{
                "sandbox": true,
                "args": {"showInstructions": false, "enableSandboxManualCapture": true},
                "takes": [[{"after": "1s", "event": "capture", "liveness_frames": 3}]],
                "actions": [
                    {"at": "4500ms", "action": "sandbox_manual_capture"},
                    {"at": "10s", "action": "sandbox_mode", "enabled": false}
                ],
                "submission": {"latency": "50ms", "outcome": {"reject": {"cause": "offline"}}}
            }"#,
        )
        .unwrap();
        assert!(s.sandbox);
        assert_eq!(s.args["showInstructions"], false);
        assert_eq!(s.takes[0].len(), 1);
        assert_eq!(s.actions[0].at, Duration::from_millis(4500));
        assert_eq!(s.actions[0].action, ScenarioAction::SandboxManualCapture);
        assert_eq!(
            s.actions[1].action,
            ScenarioAction::SandboxMode { enabled: false }
        );
        assert_eq!(s.submission.latency, Duration::from_millis(50));
        assert!(matches!(
            s.submission.outcome,
            SubmissionScript::Reject { .. }
        ));
    }

    #[test]
    fn empty_scenario_uses_defaults() {
        let s: Scenario = serde_json::from_str("{}").unwrap();
        assert!(!s.sandbox);
        assert!(s.takes.is_empty());
        assert_eq!(s.submission.latency, Duration::from_millis(300));
        assert!(matches!(
            s.submission.outcome,
            SubmissionScript::Accept { .. }
        ));
    }
}
