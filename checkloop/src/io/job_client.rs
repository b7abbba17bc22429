//! Submit/poll protocol for the remote generation backend.
//!
//! One job is in flight at a time. The poll loop is the only blocking
//! operation in a run: it sleeps one interval, reads the status, and repeats
//! until a terminal status, the poll budget, or too many consecutive
//! transport errors. A completed job's output is handed over by the backend
//! and lands at `<artifacts_dir>/<iteration_tag>.<ext>`.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, SystemTime};

use tracing::{debug, info, instrument, warn};

use crate::core::types::{FailureKind, JobSpec};
use crate::io::config::{BackendConfig, JobConfig};

/// Lifecycle status reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed { detail: String },
    /// Status string the client does not recognise; treated as non-terminal.
    Unknown(String),
}

/// Error returned by a backend call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// The backend answered but refused or garbled the exchange.
    #[error("backend rejected request: {0}")]
    Rejected(String),
    /// The backend could not be reached.
    #[error("backend transport error: {0}")]
    Transport(String),
}

/// What the job client needs from a generation backend.
pub trait GenerationBackend {
    fn submit(&self, spec: &JobSpec) -> Result<String, BackendError>;
    fn status(&self, submission_id: &str) -> Result<JobStatus, BackendError>;
    /// Write the output of a completed job to `dest`.
    fn fetch_artifact(&self, job: &RemoteJob, dest: &Path) -> Result<(), JobError>;
    /// Extension of the produced artifacts, without the dot.
    fn artifact_extension(&self) -> &str;
}

impl<B: GenerationBackend + ?Sized> GenerationBackend for &B {
    fn submit(&self, spec: &JobSpec) -> Result<String, BackendError> {
        (**self).submit(spec)
    }

    fn status(&self, submission_id: &str) -> Result<JobStatus, BackendError> {
        (**self).status(submission_id)
    }

    fn fetch_artifact(&self, job: &RemoteJob, dest: &Path) -> Result<(), JobError> {
        (**self).fetch_artifact(job, dest)
    }

    fn artifact_extension(&self) -> &str {
        (**self).artifact_extension()
    }
}

/// A submitted job as tracked by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteJob {
    pub submission_id: String,
    pub iteration_tag: String,
    pub output_tag: String,
    pub submitted_at: SystemTime,
    pub status: JobStatus,
    pub artifact_path: Option<PathBuf>,
}

/// Failure of one generation attempt. Each is fatal to one iteration only.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("submission failed: {0}")]
    Submission(#[source] BackendError),
    #[error("job {submission_id} failed: {detail}")]
    Failed { submission_id: String, detail: String },
    #[error("job {submission_id} reached no terminal status after {polls} polls")]
    Timeout { submission_id: String, polls: u32 },
    #[error("backend unavailable after {consecutive_errors} consecutive poll errors: {last_error}")]
    ClientUnavailable {
        consecutive_errors: u32,
        last_error: BackendError,
    },
    #[error("artifact missing: {0}")]
    ArtifactMissing(String),
    #[error("artifact copy failed: {0}")]
    Io(#[from] std::io::Error),
}

impl JobError {
    pub fn kind(&self) -> FailureKind {
        match self {
            JobError::Submission(_) => FailureKind::Submission,
            JobError::Failed { .. } => FailureKind::JobFailed,
            JobError::Timeout { .. } => FailureKind::JobTimeout,
            JobError::ClientUnavailable { .. } => FailureKind::ClientUnavailable,
            JobError::ArtifactMissing(_) => FailureKind::ArtifactMissing,
            JobError::Io(_) => FailureKind::Io,
        }
    }
}

/// Poll timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub poll_interval: Duration,
    pub max_wait: Duration,
    pub max_consecutive_poll_errors: u32,
}

impl PollPolicy {
    /// Expects a validated config (finite, positive seconds).
    pub fn from_config(cfg: &JobConfig) -> Self {
        Self {
            poll_interval: Duration::from_secs_f64(cfg.poll_interval_secs),
            max_wait: Duration::from_secs_f64(cfg.max_wait_secs),
            max_consecutive_poll_errors: cfg.max_consecutive_poll_errors,
        }
    }

    /// `ceil(max_wait / poll_interval)`, at least one.
    pub fn max_polls(&self) -> u32 {
        let interval = self.poll_interval.as_nanos().max(1);
        let polls = self.max_wait.as_nanos().div_ceil(interval).max(1);
        u32::try_from(polls).unwrap_or(u32::MAX)
    }
}

/// File timestamps come from a coarse clock and can trail the submit time.
const MTIME_SLACK: Duration = Duration::from_secs(2);

/// A local directory a backend writes finished artifacts into, possibly
/// shared with other runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalOutputs {
    pub dir: PathBuf,
    pub extension: String,
    /// Only consider files named after the job's output tag.
    pub match_tag_prefix: bool,
}

impl LocalOutputs {
    /// The backend writes into `output_dir`, below `filename_prefix_dir` when one is set.
    pub fn from_config(cfg: &BackendConfig) -> Self {
        let dir = match cfg.filename_prefix_dir.as_deref().map(str::trim) {
            Some(sub) if !sub.is_empty() => cfg.output_dir.join(sub),
            _ => cfg.output_dir.clone(),
        };
        Self {
            dir,
            extension: cfg.artifact_extension.clone(),
            match_tag_prefix: cfg.match_tag_prefix,
        }
    }

    /// Copy the newest output written for `job` since it was submitted.
    pub fn copy_to(&self, job: &RemoteJob, dest: &Path) -> Result<(), JobError> {
        let since = job
            .submitted_at
            .checked_sub(MTIME_SLACK)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let newest = newest_artifact(self, &job.output_tag, since)?;
        fs::copy(&newest, dest)?;
        debug!(from = %newest.display(), to = %dest.display(), "artifact copied");
        Ok(())
    }
}

pub struct JobClient<B> {
    backend: B,
    policy: PollPolicy,
}

impl<B: GenerationBackend> JobClient<B> {
    pub fn new(backend: B, policy: PollPolicy) -> Self {
        Self { backend, policy }
    }

    /// Submit a job. Never retried.
    #[instrument(skip_all, fields(tag = %spec.output_tag))]
    pub fn submit(&self, spec: &JobSpec) -> Result<RemoteJob, JobError> {
        let submitted_at = SystemTime::now();
        let submission_id = self.backend.submit(spec).map_err(JobError::Submission)?;
        info!(%submission_id, "job submitted");
        Ok(RemoteJob {
            submission_id,
            iteration_tag: spec.iteration_tag.clone(),
            output_tag: spec.output_tag.clone(),
            submitted_at,
            status: JobStatus::Queued,
            artifact_path: None,
        })
    }

    /// Poll until the job is terminal, then fetch the artifact to
    /// `<artifacts_dir>/<iteration_tag>.<ext>` and return that path.
    #[instrument(skip_all, fields(submission_id = %job.submission_id))]
    pub fn await_completion(
        &self,
        job: &mut RemoteJob,
        artifacts_dir: &Path,
    ) -> Result<PathBuf, JobError> {
        let max_polls = self.policy.max_polls();
        let mut consecutive_errors = 0u32;

        for poll in 1..=max_polls {
            thread::sleep(self.policy.poll_interval);
            match self.backend.status(&job.submission_id) {
                Ok(JobStatus::Completed) => {
                    job.status = JobStatus::Completed;
                    info!(poll, "job completed");
                    let path = self.retrieve_artifact(job, artifacts_dir)?;
                    job.artifact_path = Some(path.clone());
                    return Ok(path);
                }
                Ok(JobStatus::Failed { detail }) => {
                    job.status = JobStatus::Failed {
                        detail: detail.clone(),
                    };
                    return Err(JobError::Failed {
                        submission_id: job.submission_id.clone(),
                        detail,
                    });
                }
                Ok(status) => {
                    consecutive_errors = 0;
                    debug!(poll, ?status, "job not finished");
                    job.status = status;
                }
                Err(err) => {
                    consecutive_errors += 1;
                    warn!(poll, consecutive_errors, err = %err, "status poll failed");
                    if consecutive_errors >= self.policy.max_consecutive_poll_errors {
                        return Err(JobError::ClientUnavailable {
                            consecutive_errors,
                            last_error: err,
                        });
                    }
                }
            }
        }

        Err(JobError::Timeout {
            submission_id: job.submission_id.clone(),
            polls: max_polls,
        })
    }

    fn retrieve_artifact(
        &self,
        job: &RemoteJob,
        artifacts_dir: &Path,
    ) -> Result<PathBuf, JobError> {
        fs::create_dir_all(artifacts_dir)?;
        let dest = artifacts_dir.join(format!(
            "{}.{}",
            job.iteration_tag,
            self.backend.artifact_extension()
        ));
        self.backend.fetch_artifact(job, &dest)?;
        Ok(dest)
    }
}

/// Most recently modified matching file in the output dir that is not older
/// than `since`, ties broken by name.
pub fn newest_artifact(
    outputs: &LocalOutputs,
    tag: &str,
    since: SystemTime,
) -> Result<PathBuf, JobError> {
    let entries = fs::read_dir(&outputs.dir).map_err(|err| {
        JobError::ArtifactMissing(format!("cannot read {}: {err}", outputs.dir.display()))
    })?;

    let mut best: Option<(SystemTime, String, PathBuf)> = None;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            continue;
        };
        let ext_matches = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(&outputs.extension));
        if !ext_matches || (outputs.match_tag_prefix && !named_after_tag(&name, tag)) {
            continue;
        }
        let meta = entry.metadata()?;
        if !meta.is_file() {
            continue;
        }
        let modified = meta.modified()?;
        if modified < since {
            debug!(file = %name, "ignoring output older than the submission");
            continue;
        }
        let key = (modified, name, path);
        if best.as_ref().is_none_or(|b| (&key.0, &key.1) > (&b.0, &b.1)) {
            best = Some(key);
        }
    }

    best.map(|(_, _, path)| path).ok_or_else(|| {
        JobError::ArtifactMissing(format!(
            "no new .{} file for {tag} in {}",
            outputs.extension,
            outputs.dir.display()
        ))
    })
}

/// `run_iteration_1` matches `run_iteration_1_00001_.mp4` but not `run_iteration_12.mp4`.
fn named_after_tag(name: &str, tag: &str) -> bool {
    name.strip_prefix(tag)
        .is_some_and(|rest| !rest.starts_with(|c: char| c.is_ascii_digit()))
}
