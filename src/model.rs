use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SmileSensitivity {
    Relaxed,
    #[default]
    Normal,
    Strict,
}

impl SmileSensitivity {
    /// Parse a creation argument. Anything unrecognised falls back to `Normal`.
    pub fn from_arg(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("relaxed") => SmileSensitivity::Relaxed,
            Some("strict") => SmileSensitivity::Strict,
            _ => SmileSensitivity::Normal,
        }
    }
}

/// Immutable per-flow configuration, built once from the host's creation arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowConfiguration {
    pub smile_sensitivity: SmileSensitivity,
    pub show_confirmation_dialog: bool,
    pub show_instructions: bool,
    pub show_attribution: bool,
    pub allow_agent_mode: bool,
    pub use_strict_mode: bool,
    pub enable_sandbox_manual_capture: bool,
    pub user_id: String,
    pub job_id: String,
}

impl Default for FlowConfiguration {
    fn default() -> Self {
        Self::from_args(&Map::new())
    }
}

impl FlowConfiguration {
    /// Build a configuration from a loosely typed argument map.
    ///
    /// A missing key or a value of the wrong type yields the documented default,
    /// the same way a platform view treats its creation params.
    pub fn from_args(args: &Map<String, Value>) -> Self {
        Self {
            smile_sensitivity: SmileSensitivity::from_arg(
                args.get("smileSensitivity").and_then(Value::as_str),
            ),
            show_confirmation_dialog: flag(args, "showConfirmationDialog", true),
            show_instructions: flag(args, "showInstructions", true),
            show_attribution: flag(args, "showAttribution", true),
            allow_agent_mode: flag(args, "allowAgentMode", true),
            use_strict_mode: flag(args, "useStrictMode", false),
            enable_sandbox_manual_capture: flag(args, "enableSandboxManualCapture", false),
            user_id: random_id("user"),
            job_id: random_id("job"),
        }
    }
}

fn flag(args: &Map<String, Value>, key: &str, default: bool) -> bool {
    args.get(key).and_then(Value::as_bool).unwrap_or(default)
}

/// Generate a prefixed random identifier (`user-…`, `job-…`).
fn random_id(prefix: &str) -> String {
    let mut b = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut b);
    let hex: String = b.iter().map(|x| format!("{x:02x}")).collect();
    format!("{prefix}-{hex}")
}

/// Host-side facts the flow needs but does not configure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowEnvironment {
    /// Whether the SDK runs against the sandbox backend.
    pub sandbox: bool,
    /// Directory for temporary artifacts; must exist.
    pub cache_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowPhase {
    Instructions,
    Capturing,
    AwaitingConfirmation,
    Processing,
    Terminal,
}

impl fmt::Display for FlowPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FlowPhase::Instructions => "Instructions",
            FlowPhase::Capturing => "Capturing",
            FlowPhase::AwaitingConfirmation => "Awaiting confirmation",
            FlowPhase::Processing => "Processing",
            FlowPhase::Terminal => "Terminal",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxFallbackState {
    /// Set once the fallback timer has fired.
    pub armed: bool,
    /// Cleared when the manual control is pressed.
    pub enabled: bool,
}

impl Default for SandboxFallbackState {
    fn default() -> Self {
        Self {
            armed: false,
            enabled: true,
        }
    }
}

/// Primary selfie plus ordered liveness frames, as files on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedArtifact {
    pub selfie: PathBuf,
    pub liveness: Vec<PathBuf>,
}

/// What the job layer (or a pipeline that submits on its own) reports back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubmissionResponse {
    pub api_response: Option<Value>,
    pub did_submit_biometric_kyc_job: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureOutcome {
    pub artifact: CapturedArtifact,
    pub submission: SubmissionResponse,
}

/// Events emitted by the capture pipeline.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    ArtifactCaptured(CapturedArtifact),
    /// The pipeline took over submission; confirmation is bypassed.
    ProcessingStarted,
    ProcessingCompleted(CaptureOutcome),
    CaptureFailed {
        cause: String,
    },
    ProcessingFailed {
        cause: String,
    },
}

/// Input originating from the person in front of the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserAction {
    AcknowledgeInstructions,
    Confirm,
    Retake,
    SandboxManualCapture,
}

/// Encoded success record, opaque to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPayload(pub String);

/// Encoded error description, opaque to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedError(pub String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalResult {
    Success(EncodedPayload),
    Error(EncodedError),
}

impl TerminalResult {
    pub fn is_success(&self) -> bool {
        matches!(self, TerminalResult::Success(_))
    }

    pub fn encoded(&self) -> &str {
        match self {
            TerminalResult::Success(p) => &p.0,
            TerminalResult::Error(e) => &e.0,
        }
    }
}

/// Wire shape of a successful capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmartSelfieCaptureResult {
    pub selfie_file: String,
    pub liveness_files: Vec<String>,
    pub api_response: Option<Value>,
    pub did_submit_biometric_kyc_job: bool,
}

/// Observable controller state for rendering layers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowSnapshot {
    pub phase: FlowPhase,
    pub sandbox: SandboxFallbackState,
    pub instructions_acknowledged: bool,
    pub manual_capture_visible: bool,
    /// Selfie waiting for the user's confirm/retake decision.
    pub selfie_to_confirm: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowUpdate {
    PhaseChanged { from: FlowPhase, to: FlowPhase },
    SandboxChanged(SandboxFallbackState),
    Info(InfoEvent),
}

/// Structured info events emitted by the controller and consumed by host layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InfoEvent {
    ArtifactDiscarded(CapturedArtifact),
    SubmissionStarted,
    SandboxFallbackArmed,
    ManualCaptureUsed,
    Disposed,
}

impl InfoEvent {
    /// Render a human-readable message for host layers.
    pub fn to_message(&self) -> String {
        match self {
            InfoEvent::ArtifactDiscarded(artifact) => format!(
                "Retake requested, discarded {} and {} liveness frames",
                artifact.selfie.display(),
                artifact.liveness.len()
            ),
            InfoEvent::SubmissionStarted => "Submitting job…".to_string(),
            InfoEvent::SandboxFallbackArmed => "Sandbox manual capture available".to_string(),
            InfoEvent::ManualCaptureUsed => "Sandbox manual capture used".to_string(),
            InfoEvent::Disposed => "Flow disposed".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn empty_args_use_defaults() {
        let cfg = FlowConfiguration::from_args(&Map::new());
        assert!(cfg.show_confirmation_dialog);
        assert!(cfg.show_instructions);
        assert!(cfg.show_attribution);
        assert!(cfg.allow_agent_mode);
        assert!(!cfg.use_strict_mode);
        assert!(!cfg.enable_sandbox_manual_capture);
        assert_eq!(cfg.smile_sensitivity, SmileSensitivity::Normal);
    }

    #[test]
    fn wrong_types_fall_back_to_defaults() {
        let cfg = FlowConfiguration::from_args(&args(json!({
            "showInstructions": "no",
            "useStrictMode": 1,
            "enableSandboxManualCapture": true,
            "showConfirmationDialog": false,
            "smileSensitivity": 3,
        })));
        assert!(cfg.show_instructions);
        assert!(!cfg.use_strict_mode);
        assert!(cfg.enable_sandbox_manual_capture);
        assert!(!cfg.show_confirmation_dialog);
        assert_eq!(cfg.smile_sensitivity, SmileSensitivity::Normal);
    }

    #[test]
    fn sensitivity_parsing_is_case_insensitive() {
        assert_eq!(
            SmileSensitivity::from_arg(Some(" RELAXED ")),
            SmileSensitivity::Relaxed
        );
        assert_eq!(
            SmileSensitivity::from_arg(Some("strict")),
            SmileSensitivity::Strict
        );
        assert_eq!(
            SmileSensitivity::from_arg(Some("unknown")),
            SmileSensitivity::Normal
        );
        assert_eq!(SmileSensitivity::from_arg(None), SmileSensitivity::Normal);
    }

    #[test]
    fn identities_are_prefixed_and_unique_per_flow() {
        let a = FlowConfiguration::default();
        let b = FlowConfiguration::default();
        assert!(a.user_id.starts_with("user-"));
        assert!(a.job_id.starts_with("job-"));
        assert_eq!(a.job_id.len(), "job-".len() + 32);
        assert_ne!(a.job_id, b.job_id);
        assert_ne!(a.user_id, b.user_id);
    }

    #[test]
    fn capture_result_uses_camel_case_and_keeps_null_response() {
        let r = SmartSelfieCaptureResult {
            selfie_file: "/tmp/s.jpg".into(),
            liveness_files: vec!["/tmp/l0.jpg".into()],
            api_response: None,
            did_submit_biometric_kyc_job: false,
        };
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["selfieFile"], "/tmp/s.jpg");
        assert_eq!(v["livenessFiles"][0], "/tmp/l0.jpg");
        assert!(v.get("apiResponse").unwrap().is_null());
        assert_eq!(v["didSubmitBiometricKycJob"], false);
    }
}
