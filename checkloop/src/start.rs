//! Orchestration for starting a new run.
//!
//! Starting a run creates `<runs_directory>/<run_name>/`, writes the run
//! metadata once and checkpoints the initial checklist state. An empty
//! requirement set ends the run immediately with `NoRequirements`, before any
//! iteration, and still leaves a summary behind.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::agents::extractor::{RequirementExtractor, parse_requirements};
use crate::core::checklist::normalize_requirements;
use crate::core::types::{Mode, RequirementItem, RunExit};
use crate::io::paths::{RunPaths, timestamp_run_name, validate_run_name};
use crate::io::reasoning::AdapterError;
use crate::io::recorder::{RunMetadata, RunState, write_metadata, write_state};
use crate::io::summary::write_summary;

/// Inputs for a new run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRequest {
    /// Explicit run name; a timestamp is used when absent.
    pub run_name: Option<String>,
    pub goal: String,
    pub mode: Mode,
    pub max_iterations: u32,
    pub requirements: Vec<RequirementItem>,
}

/// Outcome of `checkloop run` setup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartOutcome {
    pub run_name: String,
    pub run_dir: PathBuf,
    pub requirement_count: usize,
    /// Set when the run ended before its first iteration.
    pub exit: Option<RunExit>,
}

/// Create a run directory under `runs_dir` and checkpoint its initial state.
pub fn start_run(runs_dir: &Path, request: &RunRequest) -> Result<StartOutcome> {
    let goal = request.goal.trim();
    if goal.is_empty() {
        bail!("goal must be non-empty");
    }
    if request.max_iterations == 0 {
        bail!("max_iterations must be > 0");
    }

    let run_name = match &request.run_name {
        Some(name) => {
            validate_run_name(name)?;
            if runs_dir.join(name).exists() {
                bail!("run {} already exists", runs_dir.join(name).display());
            }
            name.clone()
        }
        None => unique_run_name(runs_dir, &timestamp_run_name())?,
    };
    let paths = RunPaths::new(&runs_dir.join(&run_name));
    fs::create_dir_all(&paths.root)
        .with_context(|| format!("create run dir {}", paths.root.display()))?;

    let requirements = normalize_requirements(request.requirements.clone());
    write_metadata(
        &paths,
        &RunMetadata {
            run_name: run_name.clone(),
            goal: goal.to_string(),
            mode: request.mode,
            max_iterations: request.max_iterations,
            requirements: requirements.clone(),
            created_at: chrono::Local::now().to_rfc3339(),
        },
    )?;

    let mut state = RunState::initial(requirements.clone());
    let exit = if requirements.is_empty() {
        warn!(run = %run_name, "no requirements; ending run before the first iteration");
        state.exit = Some(RunExit::NoRequirements);
        write_state(&paths, &state)?;
        write_summary(&paths)?;
        Some(RunExit::NoRequirements)
    } else {
        write_state(&paths, &state)?;
        None
    };

    info!(
        run = %run_name,
        mode = %request.mode,
        requirements = requirements.len(),
        max_iterations = request.max_iterations,
        "run started"
    );
    Ok(StartOutcome {
        run_name,
        run_dir: paths.root,
        requirement_count: requirements.len(),
        exit,
    })
}

fn unique_run_name(runs_dir: &Path, base: &str) -> Result<String> {
    for suffix in 1..=999u32 {
        let name = if suffix == 1 {
            base.to_string()
        } else {
            format!("{base}-{suffix}")
        };
        validate_run_name(&name)?;
        if !runs_dir.join(&name).exists() {
            return Ok(name);
        }
    }
    Err(anyhow!(
        "unable to generate unique run name from base '{base}' (too many existing runs)"
    ))
}

/// Ask the extractor for requirements. An unusable reply yields an empty
/// list (the run then ends with `NoRequirements`); an unreachable service is
/// an error.
pub fn extract_requirements<X: RequirementExtractor>(
    extractor: &X,
    goal: &str,
) -> Result<Vec<RequirementItem>> {
    match extractor.extract(goal) {
        Ok(items) => Ok(items),
        Err(err @ AdapterError::Malformed { .. }) => {
            warn!(err = %err, raw = %err.raw(), "requirement extraction unusable; treating as empty");
            Ok(Vec::new())
        }
        Err(err) => Err(anyhow!(err).context("extract requirements")),
    }
}

/// Load requirements from a JSON file: either a bare array of items or an
/// object with `elements` (or `rubric_items`).
pub fn load_requirements_file(path: &Path) -> Result<Vec<RequirementItem>> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let value: Value =
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    let wrapped = match value {
        Value::Array(items) => json!({ "elements": items }),
        other => other,
    };
    parse_requirements(&wrapped.to_string())
        .map_err(|e| anyhow!(e).context(format!("validate {}", path.display())))
}
