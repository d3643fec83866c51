//! Post-flow processing utilities.
//!
//! Handles exports after a flow delivers its terminal result.

use crate::cli::Cli;
use crate::model::TerminalResult;
use crate::storage;

/// Result of post-flow processing, ready for presentation layers.
pub(crate) struct ProcessedFlow {
    pub export_messages: Vec<String>,
}

/// Export the encoded result when requested.
pub(crate) fn process_flow_completion(args: &Cli, result: &TerminalResult) -> ProcessedFlow {
    let mut export_messages = Vec::new();
    if let Some(export_path) = args.export_json.as_deref() {
        match storage::export_json(export_path, result.encoded()) {
            Ok(_) => export_messages.push(format!("Exported JSON: {}", export_path.display())),
            Err(e) => export_messages.push(format!("Export JSON failed: {e:#}")),
        }
    }
    ProcessedFlow { export_messages }
}
