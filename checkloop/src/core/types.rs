//! Shared deterministic types for the iteration controller.
//!
//! These types define stable contracts between core components and the run
//! directory on disk. They must not depend on external state or I/O, and their
//! serialized form must stay deterministic across runs (maps and sets are
//! ordered).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Requirement id → judged satisfaction.
pub type SatisfactionMap = BTreeMap<String, bool>;

/// One discrete, independently judgeable property the artifact must exhibit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequirementItem {
    pub id: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
}

impl RequirementItem {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            weight: None,
        }
    }
}

/// How the controller sequences requirements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Focus on one requirement at a time and lock it in once satisfied.
    #[default]
    Ordered,
    /// Satisfy the whole set simultaneously.
    Set,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Ordered => "ordered",
            Mode::Set => "set",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generation dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// A drafted generation input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<Dimensions>,
}

/// What the backend is asked to render for one iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobSpec {
    pub prompt_text: String,
    pub width: u32,
    pub height: u32,
    /// Stable per-iteration tag, also the canonical artifact file stem.
    pub iteration_tag: String,
    /// Name the backend gives its output; unique across runs.
    pub output_tag: String,
}

/// Canonical tag for an iteration index (`iteration_<n>`).
pub fn iteration_tag(index: u32) -> String {
    format!("iteration_{index}")
}

/// Backend-side output name for an iteration (`<run_name>_iteration_<n>`).
///
/// Backends may share one output directory between runs, so the run name is
/// part of the name.
pub fn output_tag(run_name: &str, index: u32) -> String {
    format!("{run_name}_{}", iteration_tag(index))
}

/// Error class of a failed generation attempt, as recorded on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Submission,
    JobFailed,
    JobTimeout,
    ClientUnavailable,
    ArtifactMissing,
    Io,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Submission => "submission_error",
            FailureKind::JobFailed => "job_failed",
            FailureKind::JobTimeout => "job_timeout",
            FailureKind::ClientUnavailable => "client_unavailable",
            FailureKind::ArtifactMissing => "artifact_missing",
            FailureKind::Io => "io",
        }
    }
}

/// How an iteration ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IterationOutcome {
    /// The artifact was produced and judged.
    Judged,
    /// The artifact was produced but the judgment could not be used; every
    /// requirement counts as unsatisfied.
    JudgmentDegraded { reason: String, raw: String },
    /// No artifact was produced; the iteration carries no satisfaction data.
    GenerationFailed { failure: FailureKind, detail: String },
}

impl IterationOutcome {
    /// Whether this iteration produced satisfaction data the controller acted on.
    pub fn was_judged(&self) -> bool {
        !matches!(self, IterationOutcome::GenerationFailed { .. })
    }

    pub fn failure(&self) -> Option<FailureKind> {
        match self {
            IterationOutcome::GenerationFailed { failure, .. } => Some(*failure),
            _ => None,
        }
    }
}

/// Immutable, append-only record of one completed iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    /// 1-indexed iteration number.
    pub index: u32,
    /// 0-indexed requirement the iteration focused on (ordered mode only).
    pub step_focus: Option<usize>,
    pub prompt_used: String,
    pub dimensions: Option<Dimensions>,
    pub artifact_path: Option<PathBuf>,
    pub submission_id: Option<String>,
    pub satisfaction_map: SatisfactionMap,
    pub notes: String,
    pub regressed_ids: BTreeSet<String>,
    pub advanced: bool,
    pub outcome: IterationOutcome,
    pub draft_error: Option<String>,
    pub duration_ms: u64,
}

/// Why a run stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "exit", rename_all = "snake_case")]
pub enum RunExit {
    AllSatisfied {
        iterations_used: u32,
    },
    BudgetExhausted {
        steps_completed: usize,
        total_steps: usize,
    },
    NoRequirements,
    /// The backend stayed unreachable for several consecutive iterations.
    BackendUnavailable {
        consecutive_failures: u32,
        steps_completed: usize,
        total_steps: usize,
    },
}

impl fmt::Display for RunExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunExit::AllSatisfied { iterations_used } => {
                write!(f, "AllSatisfied(iterations_used={iterations_used})")
            }
            RunExit::BudgetExhausted {
                steps_completed,
                total_steps,
            } => write!(
                f,
                "BudgetExhausted(steps_completed={steps_completed}, total_steps={total_steps})"
            ),
            RunExit::NoRequirements => f.write_str("NoRequirements"),
            RunExit::BackendUnavailable {
                consecutive_failures,
                steps_completed,
                total_steps,
            } => write!(
                f,
                "BackendUnavailable(consecutive_failures={consecutive_failures}, steps_completed={steps_completed}, total_steps={total_steps})"
            ),
        }
    }
}
