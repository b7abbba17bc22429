//! Run directory layout.

use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use regex::Regex;

use crate::core::types::iteration_tag;

/// Paths inside one run directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    pub root: PathBuf,
    pub metadata: PathBuf,
    pub state: PathBuf,
    pub logs_dir: PathBuf,
    pub frames_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub summary: PathBuf,
}

impl RunPaths {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            metadata: root.join("run_metadata.json"),
            state: root.join("state").join("run_state.json"),
            logs_dir: root.join("logs"),
            frames_dir: root.join("frames"),
            artifacts_dir: root.join("artifacts"),
            summary: root.join("final_summary.txt"),
        }
    }

    pub fn record(&self, index: u32) -> PathBuf {
        self.logs_dir.join(format!("{}.json", iteration_tag(index)))
    }

    pub fn frames_for(&self, index: u32) -> PathBuf {
        self.frames_dir.join(iteration_tag(index))
    }
}

/// Validate an explicit run name.
pub fn validate_run_name(name: &str) -> Result<()> {
    let re = Regex::new(r"^[A-Za-z0-9._-]+$")?;
    if !re.is_match(name) || name == "." || name == ".." {
        return Err(anyhow!(
            "invalid run name {name:?}: use letters, digits, '.', '_' or '-'"
        ));
    }
    Ok(())
}

/// Default run name: local timestamp `YYYYmmdd_HHMMSS`.
pub fn timestamp_run_name() -> String {
    chrono::Local::now().format("%Y%m%d_%H%M%S").to_string()
}
