//! Run recorder: metadata, immutable iteration records and checkpointed state.
//!
//! Write order per iteration is record first, state second. A crash between
//! the two leaves a state file one iteration behind, which resume repairs by
//! replaying the records.

use std::fs;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::checklist::ChecklistState;
use crate::core::types::{IterationRecord, Mode, RequirementItem, RunExit, SatisfactionMap};
use crate::io::paths::RunPaths;
use crate::io::{to_json_pretty, write_atomic};

/// Written once when a run starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_name: String,
    pub goal: String,
    pub mode: Mode,
    pub max_iterations: u32,
    pub requirements: Vec<RequirementItem>,
    /// RFC 3339 local time; never rendered into the summary.
    pub created_at: String,
}

/// Checkpoint of the controller (`state/run_state.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    /// Next iteration number (1-indexed).
    pub next_iteration: u32,
    pub checklist: ChecklistState,
    /// Satisfaction map of the most recent judged iteration.
    pub last_judged: Option<SatisfactionMap>,
    /// Set once the run has stopped.
    pub exit: Option<RunExit>,
}

impl RunState {
    pub fn initial(requirements: Vec<RequirementItem>) -> Self {
        Self {
            next_iteration: 1,
            checklist: ChecklistState::new(requirements),
            last_judged: None,
            exit: None,
        }
    }
}

pub fn write_metadata(paths: &RunPaths, metadata: &RunMetadata) -> Result<()> {
    if paths.metadata.exists() {
        bail!("run metadata already exists at {}", paths.metadata.display());
    }
    debug!(path = %paths.metadata.display(), "writing run metadata");
    write_atomic(&paths.metadata, to_json_pretty(metadata)?.as_bytes())
}

pub fn load_metadata(paths: &RunPaths) -> Result<RunMetadata> {
    let contents = fs::read_to_string(&paths.metadata)
        .with_context(|| format!("read run metadata {}", paths.metadata.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("parse run metadata {}", paths.metadata.display()))
}

/// Persist one iteration record. Records are immutable: an existing index is an error.
pub fn write_record(paths: &RunPaths, record: &IterationRecord) -> Result<()> {
    let path = paths.record(record.index);
    if path.exists() {
        bail!(
            "iteration record {} already exists at {}",
            record.index,
            path.display()
        );
    }
    debug!(path = %path.display(), index = record.index, "writing iteration record");
    write_atomic(&path, to_json_pretty(record)?.as_bytes())
}

/// Load all records, ordered by index. Indices must run contiguously from 1.
pub fn load_records(paths: &RunPaths) -> Result<Vec<IterationRecord>> {
    if !paths.logs_dir.exists() {
        return Ok(Vec::new());
    }

    let mut records = Vec::new();
    let entries = fs::read_dir(&paths.logs_dir)
        .with_context(|| format!("read logs dir {}", paths.logs_dir.display()))?;
    for entry in entries {
        let path = entry.context("read logs dir entry")?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(index) = name
            .strip_prefix("iteration_")
            .and_then(|rest| rest.strip_suffix(".json"))
            .and_then(|n| n.parse::<u32>().ok())
        else {
            continue;
        };
        let contents =
            fs::read_to_string(&path).with_context(|| format!("read record {}", path.display()))?;
        let record: IterationRecord = serde_json::from_str(&contents)
            .with_context(|| format!("parse record {}", path.display()))?;
        if record.index != index {
            bail!(
                "record {} declares index {} but is stored as iteration {}",
                path.display(),
                record.index,
                index
            );
        }
        records.push(record);
    }

    records.sort_by_key(|r| r.index);
    for (pos, record) in records.iter().enumerate() {
        let expected = u32::try_from(pos + 1)?;
        if record.index != expected {
            return Err(anyhow!(
                "iteration records are not contiguous: expected {expected}, found {}",
                record.index
            ));
        }
    }
    debug!(count = records.len(), "iteration records loaded");
    Ok(records)
}

pub fn write_state(paths: &RunPaths, state: &RunState) -> Result<()> {
    debug!(
        path = %paths.state.display(),
        next_iteration = state.next_iteration,
        current_index = state.checklist.current_index,
        "writing run state"
    );
    write_atomic(&paths.state, to_json_pretty(state)?.as_bytes())
}

/// Load the state checkpoint, or `None` if it has not been written yet.
pub fn load_state(paths: &RunPaths) -> Result<Option<RunState>> {
    if !paths.state.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(&paths.state)
        .with_context(|| format!("read run state {}", paths.state.display()))?;
    let state = serde_json::from_str(&contents)
        .with_context(|| format!("parse run state {}", paths.state.display()))?;
    Ok(Some(state))
}
