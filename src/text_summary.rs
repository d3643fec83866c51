//! Text summary builder for CLI output.
//!
//! This module decodes the terminal result and formats human-readable lines for text mode.

use crate::model::{FlowConfiguration, SmartSelfieCaptureResult, TerminalResult};
use anyhow::{Context, Result};
use serde::Deserialize;

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

#[derive(Deserialize)]
struct ErrorBody {
    kind: String,
    message: String,
}

/// Build a text summary from the configuration and the encoded result.
pub(crate) fn build_text_summary(
    cfg: &FlowConfiguration,
    result: &TerminalResult,
) -> Result<TextSummary> {
    let mut lines = vec![format!("Job: {} (user {})", cfg.job_id, cfg.user_id)];

    match result {
        TerminalResult::Success(payload) => {
            let r: SmartSelfieCaptureResult =
                serde_json::from_str(&payload.0).context("decode success payload")?;
            lines.push(format!("Selfie: {}", r.selfie_file));
            lines.push(format!("Liveness frames: {}", r.liveness_files.len()));
            for frame in &r.liveness_files {
                lines.push(format!("  {frame}"));
            }
            match r.api_response.as_ref() {
                Some(v) => lines.push(format!("API response: {v}")),
                None => lines.push("API response: -".to_string()),
            }
            lines.push(format!(
                "Biometric KYC job submitted: {}",
                if r.did_submit_biometric_kyc_job {
                    "yes"
                } else {
                    "no"
                }
            ));
        }
        TerminalResult::Error(err) => {
            let e: ErrorBody = serde_json::from_str(&err.0).context("decode error payload")?;
            lines.push(format!("Failed ({}): {}", e.kind, e.message));
        }
    }

    Ok(TextSummary { lines })
}
