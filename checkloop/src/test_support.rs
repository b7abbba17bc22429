//! Test-only builders and scripted fakes for the controller's collaborators.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::agents::drafter::{CandidateDrafter, DraftContext};
use crate::agents::extractor::RequirementExtractor;
use crate::agents::judge::{Judge, Judgment, JudgmentRequest};
use crate::core::judgment::{ReportedResult, resolve};
use crate::core::types::{
    Candidate, Dimensions, FailureKind, IterationOutcome, IterationRecord, JobSpec,
    RequirementItem, SatisfactionMap, iteration_tag, output_tag,
};
use crate::io::job_client::{
    BackendError, GenerationBackend, JobError, JobStatus, LocalOutputs, PollPolicy, RemoteJob,
};
use crate::io::reasoning::{AdapterError, ReasoningRequest, ReasoningService};

/// Requirements with the given ids and descriptions `"<id> description"`.
pub fn requirements(ids: &[&str]) -> Vec<RequirementItem> {
    ids.iter()
        .map(|id| RequirementItem::new(*id, format!("{id} description")))
        .collect()
}

pub fn judged(pairs: &[(&str, bool)]) -> SatisfactionMap {
    pairs
        .iter()
        .map(|(id, present)| (id.to_string(), *present))
        .collect()
}

/// A judged record with deterministic prompt, dimensions and artifact.
pub fn judged_record(
    index: u32,
    focus: Option<usize>,
    pairs: &[(&str, bool)],
    regressed: &[&str],
    advanced: bool,
) -> IterationRecord {
    IterationRecord {
        index,
        step_focus: focus,
        prompt_used: format!("prompt {index}"),
        dimensions: Some(Dimensions::new(512, 512)),
        artifact_path: Some(PathBuf::from(format!("artifacts/{}.mp4", iteration_tag(index)))),
        submission_id: Some(format!("job-{index}")),
        satisfaction_map: judged(pairs),
        notes: String::new(),
        regressed_ids: regressed.iter().map(|id| id.to_string()).collect(),
        advanced,
        outcome: IterationOutcome::Judged,
        draft_error: None,
        duration_ms: 0,
    }
}

/// A record whose generation timed out.
pub fn failed_record(index: u32, focus: Option<usize>) -> IterationRecord {
    IterationRecord {
        index,
        step_focus: focus,
        prompt_used: format!("prompt {index}"),
        dimensions: Some(Dimensions::new(512, 512)),
        artifact_path: None,
        submission_id: Some(format!("job-{index}")),
        satisfaction_map: SatisfactionMap::new(),
        notes: String::new(),
        regressed_ids: BTreeSet::new(),
        advanced: false,
        outcome: IterationOutcome::GenerationFailed {
            failure: FailureKind::JobTimeout,
            detail: "no terminal status".to_string(),
        },
        draft_error: None,
        duration_ms: 0,
    }
}

/// Job for iteration `index` of a run named `"run"`.
pub fn job_spec(index: u32) -> JobSpec {
    run_job_spec("run", index)
}

pub fn run_job_spec(run_name: &str, index: u32) -> JobSpec {
    JobSpec {
        prompt_text: format!("prompt {index}"),
        width: 512,
        height: 512,
        iteration_tag: iteration_tag(index),
        output_tag: output_tag(run_name, index),
    }
}

/// Millisecond polling so job tests stay fast.
pub fn fast_poll_policy() -> PollPolicy {
    PollPolicy {
        poll_interval: Duration::from_millis(1),
        max_wait: Duration::from_millis(20),
        max_consecutive_poll_errors: 3,
    }
}

/// Behaviour of one scripted job, consumed per submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobScript {
    /// Report `Running` this many times, then complete and write the artifact.
    CompletesAfter(u32),
    NeverFinishes,
    Fails(String),
    /// Fail this many status calls with a transport error, then complete.
    FlakyThenCompletes(u32),
    /// Every status call is a transport error.
    Unreachable,
    RejectSubmit,
    /// Report completion without writing any artifact.
    CompletesWithoutArtifact,
}

#[derive(Debug)]
struct ActiveJob {
    script: JobScript,
    tag: String,
    polls: u32,
}

/// Generation backend driven by a queue of [`JobScript`]s. Once the queue is
/// empty every job completes on the first poll. Completed jobs write
/// `<output_tag>_00001_.<ext>` (containing the output tag) into `out_dir`.
#[derive(Debug)]
pub struct ScriptedBackend {
    outputs: LocalOutputs,
    scripts: RefCell<VecDeque<JobScript>>,
    jobs: RefCell<BTreeMap<String, ActiveJob>>,
    submissions: RefCell<Vec<JobSpec>>,
    status_calls: Cell<u32>,
}

impl ScriptedBackend {
    pub fn new(out_dir: &Path, extension: &str, scripts: Vec<JobScript>) -> Self {
        Self {
            outputs: LocalOutputs {
                dir: out_dir.to_path_buf(),
                extension: extension.to_string(),
                match_tag_prefix: true,
            },
            scripts: RefCell::new(scripts.into()),
            jobs: RefCell::new(BTreeMap::new()),
            submissions: RefCell::new(Vec::new()),
            status_calls: Cell::new(0),
        }
    }

    pub fn status_calls(&self) -> u32 {
        self.status_calls.get()
    }

    pub fn submissions(&self) -> Vec<JobSpec> {
        self.submissions.borrow().clone()
    }

    fn write_artifact(&self, tag: &str) -> Result<(), BackendError> {
        fs::create_dir_all(&self.outputs.dir)
            .and_then(|()| {
                fs::write(
                    self.outputs.dir.join(format!("{tag}_00001_.{}", self.outputs.extension)),
                    tag.as_bytes(),
                )
            })
            .map_err(|e| BackendError::Transport(e.to_string()))
    }
}

impl GenerationBackend for ScriptedBackend {
    fn submit(&self, spec: &JobSpec) -> Result<String, BackendError> {
        self.submissions.borrow_mut().push(spec.clone());
        let script = self
            .scripts
            .borrow_mut()
            .pop_front()
            .unwrap_or(JobScript::CompletesAfter(0));
        if script == JobScript::RejectSubmit {
            return Err(BackendError::Rejected("invalid workflow".to_string()));
        }
        let id = format!("job-{}", self.submissions.borrow().len());
        self.jobs.borrow_mut().insert(
            id.clone(),
            ActiveJob {
                script,
                tag: spec.output_tag.clone(),
                polls: 0,
            },
        );
        Ok(id)
    }

    fn status(&self, submission_id: &str) -> Result<JobStatus, BackendError> {
        self.status_calls.set(self.status_calls.get() + 1);
        let mut jobs = self.jobs.borrow_mut();
        let job = jobs
            .get_mut(submission_id)
            .ok_or_else(|| BackendError::Rejected(format!("unknown job {submission_id}")))?;
        job.polls += 1;
        match &job.script {
            JobScript::CompletesAfter(n) if job.polls <= *n => Ok(JobStatus::Running),
            JobScript::FlakyThenCompletes(n) if job.polls <= *n => {
                Err(BackendError::Transport("connection refused".to_string()))
            }
            JobScript::CompletesAfter(_) | JobScript::FlakyThenCompletes(_) => {
                self.write_artifact(&job.tag)?;
                Ok(JobStatus::Completed)
            }
            JobScript::NeverFinishes => Ok(JobStatus::Running),
            JobScript::Fails(detail) => Ok(JobStatus::Failed {
                detail: detail.clone(),
            }),
            JobScript::Unreachable => {
                Err(BackendError::Transport("connection refused".to_string()))
            }
            JobScript::RejectSubmit | JobScript::CompletesWithoutArtifact => {
                Ok(JobStatus::Completed)
            }
        }
    }

    fn fetch_artifact(&self, job: &RemoteJob, dest: &Path) -> Result<(), JobError> {
        self.outputs.copy_to(job, dest)
    }

    fn artifact_extension(&self) -> &str {
        &self.outputs.extension
    }
}

/// Reasoning service replaying canned replies; errors once the script is exhausted.
#[derive(Debug, Default)]
pub struct ScriptedReasoning {
    replies: RefCell<VecDeque<Result<String, AdapterError>>>,
    requests: RefCell<Vec<ReasoningRequest>>,
}

impl ScriptedReasoning {
    pub fn new(replies: Vec<Result<String, AdapterError>>) -> Self {
        Self {
            replies: RefCell::new(replies.into()),
            requests: RefCell::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<ReasoningRequest> {
        self.requests.borrow().clone()
    }
}

impl ReasoningService for ScriptedReasoning {
    fn complete_json(&self, request: &ReasoningRequest) -> Result<String, AdapterError> {
        self.requests.borrow_mut().push(request.clone());
        self.replies
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| Err(AdapterError::Transport("script exhausted".to_string())))
    }
}

/// What a drafter was asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DraftCall {
    pub focus: Option<usize>,
    pub locked_ids: Vec<String>,
    pub history_len: usize,
    pub previous_prompt: Option<String>,
}

/// Drafter replaying canned candidates. Once exhausted it drafts `"draft <n>"`.
#[derive(Debug, Default)]
pub struct ScriptedDrafter {
    replies: RefCell<VecDeque<Result<Candidate, AdapterError>>>,
    calls: RefCell<Vec<DraftCall>>,
}

impl ScriptedDrafter {
    pub fn new(replies: Vec<Result<Candidate, AdapterError>>) -> Self {
        Self {
            replies: RefCell::new(replies.into()),
            calls: RefCell::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<DraftCall> {
        self.calls.borrow().clone()
    }
}

impl CandidateDrafter for ScriptedDrafter {
    fn draft(&self, ctx: &DraftContext<'_>) -> Result<Candidate, AdapterError> {
        let mut calls = self.calls.borrow_mut();
        calls.push(DraftCall {
            focus: ctx.focus,
            locked_ids: ctx.locked_ids.to_vec(),
            history_len: ctx.records.len(),
            previous_prompt: ctx.previous_prompt().map(str::to_string),
        });
        let n = calls.len();
        self.replies.borrow_mut().pop_front().unwrap_or_else(|| {
            Ok(Candidate {
                prompt: format!("draft {n}"),
                dimensions: None,
            })
        })
    }
}

/// Judge replaying canned satisfaction maps, resolved fail-closed onto the
/// requested requirements. Errors once the script is exhausted.
#[derive(Debug, Default)]
pub struct ScriptedJudge {
    verdicts: RefCell<VecDeque<Result<SatisfactionMap, AdapterError>>>,
    priors: RefCell<Vec<Option<SatisfactionMap>>>,
    artifacts: RefCell<Vec<PathBuf>>,
}

impl ScriptedJudge {
    pub fn new(verdicts: Vec<Result<SatisfactionMap, AdapterError>>) -> Self {
        Self {
            verdicts: RefCell::new(verdicts.into()),
            priors: RefCell::new(Vec::new()),
            artifacts: RefCell::new(Vec::new()),
        }
    }

    /// Prior maps passed in, one per call.
    pub fn priors(&self) -> Vec<Option<SatisfactionMap>> {
        self.priors.borrow().clone()
    }

    pub fn artifacts(&self) -> Vec<PathBuf> {
        self.artifacts.borrow().clone()
    }
}

impl Judge for ScriptedJudge {
    fn judge(&self, request: &JudgmentRequest<'_>) -> Result<Judgment, AdapterError> {
        self.priors.borrow_mut().push(request.prior.cloned());
        self.artifacts
            .borrow_mut()
            .push(request.artifact.to_path_buf());
        let verdict = self.verdicts.borrow_mut().pop_front().unwrap_or_else(|| {
            Err(AdapterError::Malformed {
                reason: "script exhausted".to_string(),
                raw: String::new(),
            })
        })?;
        let reported: Vec<ReportedResult> = verdict
            .into_iter()
            .map(|(id, present)| ReportedResult { id, present })
            .collect();
        let resolution = resolve(request.requirements, &reported);
        Ok(Judgment {
            satisfaction: resolution.satisfaction.clone(),
            notes: String::new(),
            resolution,
        })
    }
}

/// Extractor returning a fixed answer.
#[derive(Debug, Clone)]
pub struct FixedExtractor(pub Result<Vec<RequirementItem>, AdapterError>);

impl RequirementExtractor for FixedExtractor {
    fn extract(&self, _goal: &str) -> Result<Vec<RequirementItem>, AdapterError> {
        self.0.clone()
    }
}
