use crate::engine::{ScriptedPipeline, ScriptedSubmission};
use crate::model::{FlowConfiguration, FlowEnvironment, FlowUpdate, TerminalResult};
use crate::orchestrator::{self, FlowInstance};
use crate::scenario::{self, Scenario};
use crate::storage;
use anyhow::{Context, Result};
use clap::Parser;
use serde_json::{Map, Value};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        // Locks are taken per line; tracing shares stderr with this writer.
        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let mut out = std::io::stdout().lock();
                    let _ = writeln!(out, "{}", msg);
                    let _ = out.flush();
                }
                OutputLine::Stderr(msg) => {
                    let mut err = std::io::stderr().lock();
                    let _ = writeln!(err, "{}", msg);
                    let _ = err.flush();
                }
            }
        }
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "selfie-capture-flow",
    version,
    about = "Run a guided selfie capture flow against a scripted capture pipeline"
)]
pub struct Cli {
    /// Scenario file (JSON) describing pipeline events, user actions and submission
    #[arg(long)]
    pub scenario: Option<std::path::PathBuf>,

    /// Directory for temporary capture artifacts
    #[arg(long)]
    pub cache_dir: Option<std::path::PathBuf>,

    /// Run against the sandbox backend (enables the manual capture fallback)
    #[arg(long)]
    pub sandbox: bool,

    /// Smile sensitivity: relaxed, normal or strict
    #[arg(long)]
    pub smile_sensitivity: Option<String>,

    /// Show the instructions screen before capturing
    #[arg(long, action = clap::ArgAction::Set)]
    pub show_instructions: Option<bool>,

    /// Ask the user to confirm the captured selfie
    #[arg(long, action = clap::ArgAction::Set)]
    pub show_confirmation_dialog: Option<bool>,

    /// Show attribution on the instructions screen
    #[arg(long, action = clap::ArgAction::Set)]
    pub show_attribution: Option<bool>,

    /// Allow switching to the back camera for agent-assisted capture
    #[arg(long, action = clap::ArgAction::Set)]
    pub allow_agent_mode: Option<bool>,

    /// Use the enhanced capture pipeline, which submits on its own
    #[arg(long, action = clap::ArgAction::Set)]
    pub use_strict_mode: Option<bool>,

    /// Offer a manual capture button in sandbox after a short delay
    #[arg(long, action = clap::ArgAction::Set)]
    pub enable_sandbox_manual_capture: Option<bool>,

    /// Give up and dispose the flow if no result arrives in time
    #[arg(long, default_value = "30s")]
    pub timeout: humantime::Duration,

    /// Print the encoded result and exit
    #[arg(long)]
    pub json: bool,

    /// Run silently: suppress all output except errors
    #[arg(long)]
    pub silent: bool,

    /// Export the result as JSON
    #[arg(long)]
    pub export_json: Option<std::path::PathBuf>,
}

pub async fn run(args: Cli) -> Result<()> {
    // Validate that --silent can only be used with --json
    if args.silent && !args.json {
        return Err(anyhow::anyhow!(
            "--silent can only be used with --json. Use --silent --json together."
        ));
    }

    let scenario = match args.scenario.as_deref() {
        Some(path) => Scenario::load(path)?,
        None => Scenario::happy_path(),
    };
    let cache_dir = args
        .cache_dir
        .clone()
        .unwrap_or_else(storage::default_cache_dir);
    std::fs::create_dir_all(&cache_dir)
        .with_context(|| format!("create cache dir {}", cache_dir.display()))?;

    let cfg = build_config(&args, &scenario);
    let env = FlowEnvironment {
        sandbox: args.sandbox || scenario.sandbox,
        cache_dir: cache_dir.clone(),
    };
    let pipeline = ScriptedPipeline::new(&cache_dir, scenario.takes.clone());
    let submission = ScriptedSubmission::new(
        scenario.submission.latency,
        scenario.submission.outcome.clone(),
    );
    let mut flow = orchestrator::create(cfg, env, Box::new(pipeline), Arc::new(submission));

    let (out_tx, out_handle) = if args.silent {
        (None, None)
    } else {
        let (tx, handle) = spawn_output_writer();
        (Some(tx), Some(handle))
    };

    // In text mode, echo phase changes and info events as they happen.
    let printer = match (&out_tx, args.json, flow.take_updates()) {
        (Some(tx), false, Some(updates)) => {
            let _ = tx.send(OutputLine::Stderr(describe_flow(&flow)));
            Some(tokio::spawn(print_updates(updates, tx.clone())))
        }
        _ => None,
    };

    let feeder = tokio::spawn(scenario::feed_actions(flow.handle(), scenario.actions.clone()));
    let waited = tokio::time::timeout(Duration::from(args.timeout), flow.result()).await;
    feeder.abort();
    let cfg = flow.config().clone();
    flow.dispose().await;
    if let Some(p) = printer {
        let _ = p.await;
    }

    let outcome = match waited {
        Ok(Some(result)) => finish(&args, &cfg, &result, out_tx.as_ref()),
        Ok(None) => Err(anyhow::anyhow!("flow was disposed before producing a result")),
        Err(_) => Err(anyhow::anyhow!(
            "no result within {}; flow disposed",
            args.timeout
        )),
    };

    drop(out_tx);
    if let Some(handle) = out_handle {
        let _ = handle.await;
    }
    outcome
}

/// Build a `FlowConfiguration` from scenario creation args overlaid with CLI flags.
pub fn build_config(args: &Cli, scenario: &Scenario) -> FlowConfiguration {
    let mut creation = scenario.args.clone();
    overlay(&mut creation, "showInstructions", args.show_instructions);
    overlay(
        &mut creation,
        "showConfirmationDialog",
        args.show_confirmation_dialog,
    );
    overlay(&mut creation, "showAttribution", args.show_attribution);
    overlay(&mut creation, "allowAgentMode", args.allow_agent_mode);
    overlay(&mut creation, "useStrictMode", args.use_strict_mode);
    overlay(
        &mut creation,
        "enableSandboxManualCapture",
        args.enable_sandbox_manual_capture,
    );
    if let Some(s) = args.smile_sensitivity.as_deref() {
        creation.insert("smileSensitivity".into(), Value::String(s.to_string()));
    }
    FlowConfiguration::from_args(&creation)
}

fn overlay(creation: &mut Map<String, Value>, key: &str, value: Option<bool>) {
    if let Some(v) = value {
        creation.insert(key.to_string(), Value::Bool(v));
    }
}

fn describe_flow(flow: &FlowInstance) -> String {
    let snap = flow.snapshot();
    format!(
        "Job {} started in {} (sandbox manual capture: {})",
        flow.config().job_id,
        snap.phase,
        if flow.config().enable_sandbox_manual_capture {
            "on"
        } else {
            "off"
        }
    )
}

async fn print_updates(
    mut updates: mpsc::UnboundedReceiver<FlowUpdate>,
    out_tx: mpsc::UnboundedSender<OutputLine>,
) {
    while let Some(update) = updates.recv().await {
        let line = match update {
            FlowUpdate::PhaseChanged { to, .. } => format!("== {to} =="),
            FlowUpdate::SandboxChanged(state) => format!(
                "Sandbox fallback: armed={} enabled={}",
                state.armed, state.enabled
            ),
            FlowUpdate::Info(info) => info.to_message(),
        };
        let _ = out_tx.send(OutputLine::Stderr(line));
    }
}

/// Print the result per output mode and run exports. An error result fails the run.
fn finish(
    args: &Cli,
    cfg: &FlowConfiguration,
    result: &TerminalResult,
    out_tx: Option<&mpsc::UnboundedSender<OutputLine>>,
) -> Result<()> {
    let processed = orchestrator::process_flow_completion(args, result);

    if let Some(tx) = out_tx {
        if args.json {
            let out = match serde_json::from_str::<Value>(result.encoded()) {
                Ok(v) => serde_json::to_string_pretty(&v)?,
                Err(_) => result.encoded().to_string(),
            };
            let _ = tx.send(OutputLine::Stdout(out));
        } else {
            let summary = crate::text_summary::build_text_summary(cfg, result)?;
            for line in summary.lines {
                let _ = tx.send(OutputLine::Stdout(line));
            }
        }
        for msg in processed.export_messages {
            let _ = tx.send(OutputLine::Stderr(msg));
        }
    }

    if result.is_success() {
        Ok(())
    } else {
        Err(anyhow::anyhow!("capture flow ended with an error"))
    }
}
