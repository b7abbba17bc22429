//! I/O helpers for checkloop commands.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::io::job_client::BackendError;

pub mod comfy;
pub mod config;
pub mod frames;
pub mod job_client;
pub mod paths;
pub mod process;
pub mod prompt;
pub mod reasoning;
pub mod recorder;
pub mod replicate;
pub mod summary;

/// Atomically replace `path` (temp file + rename).
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents).with_context(|| format!("write temp {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

/// Pretty JSON with a trailing newline.
pub(crate) fn to_json_pretty<T: Serialize>(value: &T) -> Result<String> {
    let mut buf = serde_json::to_string_pretty(value).context("serialize json")?;
    buf.push('\n');
    Ok(buf)
}

/// Prompt as sent to a generation backend, with the configured prefix in front.
pub(crate) fn prefixed_prompt(prefix: &str, prompt: &str) -> String {
    if prefix.trim().is_empty() {
        prompt.to_string()
    } else {
        format!("{} {prompt}", prefix.trim())
    }
}

/// HTTP status errors are rejections; anything else means the backend is unreachable.
pub(crate) fn http_backend_error(err: ureq::Error) -> BackendError {
    match err {
        ureq::Error::StatusCode(code) => BackendError::Rejected(format!("http status {code}")),
        other => BackendError::Transport(other.to_string()),
    }
}
