//! Temporary artifact files and result export.

use crate::error::FlowError;
use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::io::Write;
use std::path::{Path, PathBuf};

// 1x1 transparent PNG, used for every placeholder selfie and liveness frame.
const PLACEHOLDER_IMAGE_B64: &str =
    "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAQAAAC1HAwCAAAAC0lEQVR4nGMAAQAABQABDQottAAAAABJRU5ErkJggg==";

/// Decode the constant placeholder image.
pub fn placeholder_image() -> Result<Vec<u8>, FlowError> {
    Ok(STANDARD.decode(PLACEHOLDER_IMAGE_B64)?)
}

/// Write `bytes` to a freshly created, uniquely named `.jpg` file inside `dir`.
///
/// The file is persisted; removing it is the caller's business. `dir` must already exist.
pub fn write_temp_image(dir: &Path, prefix: &str, bytes: &[u8]) -> Result<PathBuf, FlowError> {
    let mut file = tempfile::Builder::new()
        .prefix(prefix)
        .suffix(".jpg")
        .tempfile_in(dir)?;
    file.write_all(bytes)?;
    file.flush()?;
    let (_, path) = file.keep().map_err(|e| e.error)?;
    Ok(path)
}

/// Default cache directory for temporary artifacts.
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("selfie-capture-flow")
}

/// Export an encoded result to `path`, pretty-printed when it parses as JSON.
pub fn export_json(path: &Path, encoded: &str) -> Result<()> {
    let body = match serde_json::from_str::<serde_json::Value>(encoded) {
        Ok(v) => serde_json::to_string_pretty(&v)?,
        Err(_) => encoded.to_string(),
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create export dir {}", parent.display()))?;
    }
    std::fs::write(path, body).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
