//! Orchestration for a single iteration of the checklist controller.
//!
//! One step drafts a candidate, generates it through the job client, judges
//! the artifact against every requirement and commits the strategy's decision.
//! Per-iteration failures (draft, generation, judgment) are recorded and never
//! abort the run; only local I/O errors propagate.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::agents::drafter::{CandidateDrafter, DraftContext, fallback_candidate};
use crate::agents::judge::{Judge, JudgmentRequest};
use crate::core::dimensions::DimensionPolicy;
use crate::core::judgment::all_unsatisfied;
use crate::core::strategy::{Strategy, replay, strategy_for};
use crate::core::types::{
    FailureKind, IterationOutcome, IterationRecord, JobSpec, SatisfactionMap, iteration_tag,
    output_tag,
};
use crate::io::job_client::{GenerationBackend, JobClient};
use crate::io::paths::RunPaths;
use crate::io::recorder::{
    RunMetadata, RunState, load_metadata, load_records, load_state, write_record, write_state,
};

/// Collaborators injected into every step.
pub struct Services<D, J, B> {
    pub drafter: D,
    pub judge: J,
    pub jobs: JobClient<B>,
    pub dimensions: DimensionPolicy,
}

/// A loaded run: metadata, records so far, and the strategy rebuilt from them.
pub struct Session {
    pub paths: RunPaths,
    pub metadata: RunMetadata,
    pub state: RunState,
    pub records: Vec<IterationRecord>,
    strategy: Box<dyn Strategy>,
}

impl Session {
    /// Load a run directory and rebuild controller state by replaying its
    /// records. The persisted state file only contributes the exit; when it
    /// disagrees with the replay a warning is logged and the replay wins.
    #[instrument(skip_all, fields(run = %root.display()))]
    pub fn open(root: &Path) -> Result<Self> {
        let paths = RunPaths::new(root);
        let metadata = load_metadata(&paths)?;
        let records = load_records(&paths)?;

        let mut strategy = strategy_for(metadata.mode, metadata.requirements.clone());
        for mismatch in replay(strategy.as_mut(), &records) {
            warn!(%mismatch, "recorded decision differs from replay");
        }
        debug!(mode = %strategy.mode(), records = records.len(), "records replayed");

        let next_iteration = u32::try_from(records.len() + 1)?;
        let last_judged = records
            .iter()
            .rev()
            .find(|r| r.outcome.was_judged())
            .map(|r| r.satisfaction_map.clone());
        let mut state = RunState {
            next_iteration,
            checklist: strategy.checklist().clone(),
            last_judged,
            exit: None,
        };

        match load_state(&paths)? {
            Some(persisted) if persisted.next_iteration == next_iteration => {
                if persisted.checklist != state.checklist {
                    warn!("state file checklist disagrees with records; using replayed state");
                }
                state.exit = persisted.exit;
            }
            Some(persisted) => warn!(
                persisted = persisted.next_iteration,
                replayed = next_iteration,
                "state file is behind the records; using replayed state"
            ),
            None => warn!("state file missing; using replayed state"),
        }

        Ok(Self {
            paths,
            metadata,
            state,
            records,
            strategy,
        })
    }

    pub fn strategy(&self) -> &dyn Strategy {
        self.strategy.as_ref()
    }

    /// Trailing iterations that ended because the backend was unreachable.
    pub fn unavailable_streak(&self) -> u32 {
        let streak = self
            .records
            .iter()
            .rev()
            .take_while(|r| r.outcome.failure() == Some(FailureKind::ClientUnavailable))
            .count();
        u32::try_from(streak).unwrap_or(u32::MAX)
    }
}

/// Result of one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub index: u32,
    pub focus: Option<usize>,
    pub advanced: bool,
    pub regressed_ids: BTreeSet<String>,
    /// All requirements satisfied after this step.
    pub complete: bool,
    /// Set when generation failed and the iteration carries no judgment.
    pub failure: Option<FailureKind>,
    pub judgment_degraded: bool,
}

/// Run one iteration, persisting the record and then the state.
#[instrument(skip_all, fields(run = %session.metadata.run_name, index = session.state.next_iteration))]
pub fn run_step<D: CandidateDrafter, J: Judge, B: GenerationBackend>(
    session: &mut Session,
    services: &Services<D, J, B>,
) -> Result<StepOutcome> {
    if session.state.exit.is_some() {
        return Err(anyhow!("run {} has already ended", session.metadata.run_name));
    }
    let started = Instant::now();
    let index = session.state.next_iteration;
    let focus = session.strategy.focus();
    let locked_ids = session.strategy.locked_ids();

    let ctx = DraftContext {
        goal: &session.metadata.goal,
        requirements: session.strategy.items(),
        focus,
        locked_ids: &locked_ids,
        records: &session.records,
    };
    let (candidate, draft_error) = match services.drafter.draft(&ctx) {
        Ok(candidate) => (candidate, None),
        Err(err) => {
            warn!(err = %err, raw = %err.raw(), "draft unusable; using fallback candidate");
            (fallback_candidate(&err, &ctx), Some(err.to_string()))
        }
    };
    let dimensions = services.dimensions.resolve(candidate.dimensions);
    let spec = JobSpec {
        prompt_text: candidate.prompt.clone(),
        width: dimensions.width,
        height: dimensions.height,
        iteration_tag: iteration_tag(index),
        output_tag: output_tag(&session.metadata.run_name, index),
    };

    let mut submission_id = None;
    let generated = match services.jobs.submit(&spec) {
        Ok(mut job) => {
            submission_id = Some(job.submission_id.clone());
            services
                .jobs
                .await_completion(&mut job, &session.paths.artifacts_dir)
        }
        Err(err) => Err(err),
    };

    let mut record = IterationRecord {
        index,
        step_focus: focus,
        prompt_used: spec.prompt_text.clone(),
        dimensions: Some(dimensions),
        artifact_path: None,
        submission_id,
        satisfaction_map: SatisfactionMap::new(),
        notes: String::new(),
        regressed_ids: BTreeSet::new(),
        advanced: false,
        outcome: IterationOutcome::Judged,
        draft_error,
        duration_ms: 0,
    };

    let mut transition = None;
    match generated {
        Err(err) => {
            warn!(kind = err.kind().as_str(), err = %err, "generation failed");
            record.outcome = IterationOutcome::GenerationFailed {
                failure: err.kind(),
                detail: err.to_string(),
            };
        }
        Ok(artifact) => {
            let frames_dir = session.paths.frames_for(index);
            let judged = services.judge.judge(&JudgmentRequest {
                artifact: &artifact,
                requirements: session.strategy.items(),
                prior: session.state.last_judged.as_ref(),
                frames_dir: &frames_dir,
            });
            match judged {
                Ok(judgment) => {
                    record.satisfaction_map = judgment.satisfaction;
                    record.notes = judgment.notes;
                }
                Err(err) => {
                    warn!(err = %err, raw = %err.raw(), "judgment unusable; counting every requirement absent");
                    record.satisfaction_map = all_unsatisfied(session.strategy.items());
                    record.outcome = IterationOutcome::JudgmentDegraded {
                        reason: err.to_string(),
                        raw: err.raw().to_string(),
                    };
                }
            }
            record.artifact_path = Some(relative_to(&artifact, &session.paths.root));
            let decided = session.strategy.evaluate(&record.satisfaction_map);
            record.regressed_ids = decided.regressed_ids.clone();
            record.advanced = decided.advanced;
            transition = Some(decided);
        }
    }
    record.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    write_record(&session.paths, &record)?;

    if let Some(transition) = &transition {
        session.strategy.commit(transition, &record.satisfaction_map);
        session.state.last_judged = Some(record.satisfaction_map.clone());
        if !transition.regressed_ids.is_empty() {
            warn!(regressed = ?transition.regressed_ids, "locked requirements regressed");
        }
    }
    session.state.next_iteration = index + 1;
    session.state.checklist = session.strategy.checklist().clone();
    write_state(&session.paths, &session.state)?;

    let progress = session.strategy.progress();
    let outcome = StepOutcome {
        index,
        focus,
        advanced: record.advanced,
        regressed_ids: record.regressed_ids.clone(),
        complete: session.strategy.is_complete(),
        failure: record.outcome.failure(),
        judgment_degraded: matches!(record.outcome, IterationOutcome::JudgmentDegraded { .. }),
    };
    info!(
        advanced = outcome.advanced,
        complete = outcome.complete,
        completed = progress.completed,
        total = progress.total,
        failure = outcome.failure.map(FailureKind::as_str),
        "iteration finished"
    );
    session.records.push(record);
    Ok(outcome)
}

fn relative_to(path: &Path, root: &Path) -> PathBuf {
    path.strip_prefix(root).unwrap_or(path).to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Candidate, Mode};
    use crate::io::reasoning::AdapterError;
    use crate::start::{RunRequest, start_run};
    use crate::test_support::{
        JobScript, ScriptedBackend, ScriptedDrafter, ScriptedJudge, fast_poll_policy, judged,
        requirements,
    };

    fn start(runs: &Path, mode: Mode, ids: &[&str]) -> PathBuf {
        start_run(
            runs,
            &RunRequest {
                run_name: Some("r1".to_string()),
                goal: "a red sneaker".to_string(),
                mode,
                max_iterations: 5,
                requirements: requirements(ids),
            },
        )
        .expect("start")
        .run_dir
    }

    fn services<'a>(
        drafter: &'a ScriptedDrafter,
        judge: &'a ScriptedJudge,
        backend: &'a ScriptedBackend,
    ) -> Services<&'a ScriptedDrafter, &'a ScriptedJudge, &'a ScriptedBackend> {
        Services {
            drafter,
            judge,
            jobs: JobClient::new(backend, fast_poll_policy()),
            dimensions: DimensionPolicy::default(),
        }
    }

    #[test]
    fn judged_step_locks_focus_and_persists_record_and_state() {
        let temp = tempfile::tempdir().expect("tempdir");
        let out = temp.path().join("out");
        let run_dir = start(temp.path(), Mode::Ordered, &["a", "b"]);
        let drafter = ScriptedDrafter::new(Vec::new());
        let judge = ScriptedJudge::new(vec![Ok(judged(&[("a", true), ("b", false)]))]);
        let backend = ScriptedBackend::new(&out, "mp4", Vec::new());
        let services = services(&drafter, &judge, &backend);

        let mut session = Session::open(&run_dir).expect("open");
        let outcome = run_step(&mut session, &services).expect("step");
        assert_eq!(outcome.index, 1);
        assert_eq!(outcome.focus, Some(0));
        assert!(outcome.advanced);
        assert!(!outcome.complete);

        let record = &session.records[0];
        assert_eq!(record.prompt_used, "draft 1");
        assert_eq!(
            record.artifact_path.as_deref(),
            Some(Path::new("artifacts/iteration_1.mp4"))
        );
        assert!(run_dir.join("artifacts/iteration_1.mp4").is_file());
        let submitted = &backend.submissions()[0];
        assert_eq!(submitted.width, 512);
        assert_eq!(submitted.iteration_tag, "iteration_1");
        assert_eq!(submitted.output_tag, "r1_iteration_1");

        let reopened = Session::open(&run_dir).expect("reopen");
        assert_eq!(reopened.state, session.state);
        assert_eq!(reopened.state.checklist.current_index, 1);
        assert_eq!(reopened.records, session.records);
    }

    #[test]
    fn generation_failure_records_no_judgment_and_keeps_checklist() {
        let temp = tempfile::tempdir().expect("tempdir");
        let out = temp.path().join("out");
        let run_dir = start(temp.path(), Mode::Ordered, &["a"]);
        let drafter = ScriptedDrafter::new(Vec::new());
        let judge = ScriptedJudge::new(Vec::new());
        let backend =
            ScriptedBackend::new(&out, "mp4", vec![JobScript::Fails("oom".to_string())]);
        let services = services(&drafter, &judge, &backend);

        let mut session = Session::open(&run_dir).expect("open");
        let before = session.state.checklist.clone();
        let outcome = run_step(&mut session, &services).expect("step");
        assert_eq!(outcome.failure, Some(FailureKind::JobFailed));
        assert_eq!(session.state.checklist, before);
        assert_eq!(session.state.next_iteration, 2);
        assert_eq!(session.state.last_judged, None);
        let record = &session.records[0];
        assert!(record.satisfaction_map.is_empty());
        assert_eq!(record.submission_id.as_deref(), Some("job-1"));
        assert!(judge.priors().is_empty(), "judge not called");
    }

    #[test]
    fn malformed_judgment_counts_everything_absent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let out = temp.path().join("out");
        let run_dir = start(temp.path(), Mode::Ordered, &["a", "b"]);
        let drafter = ScriptedDrafter::new(Vec::new());
        let judge = ScriptedJudge::new(vec![Err(AdapterError::Malformed {
            reason: "invalid JSON".to_string(),
            raw: "I think it looks great".to_string(),
        })]);
        let backend = ScriptedBackend::new(&out, "mp4", Vec::new());
        let services = services(&drafter, &judge, &backend);

        let mut session = Session::open(&run_dir).expect("open");
        let outcome = run_step(&mut session, &services).expect("step");
        assert!(outcome.judgment_degraded);
        assert!(!outcome.advanced);
        let record = &session.records[0];
        assert_eq!(record.satisfaction_map, judged(&[("a", false), ("b", false)]));
        assert!(matches!(
            &record.outcome,
            IterationOutcome::JudgmentDegraded { raw, .. } if raw == "I think it looks great"
        ));
    }

    #[test]
    fn malformed_draft_falls_back_and_still_generates() {
        let temp = tempfile::tempdir().expect("tempdir");
        let out = temp.path().join("out");
        let run_dir = start(temp.path(), Mode::Set, &["a"]);
        let drafter = ScriptedDrafter::new(vec![Err(AdapterError::Malformed {
            reason: "invalid JSON".to_string(),
            raw: "a sneaker, rain".to_string(),
        })]);
        let judge = ScriptedJudge::new(vec![Ok(judged(&[("a", true)]))]);
        let backend = ScriptedBackend::new(&out, "mp4", Vec::new());
        let services = services(&drafter, &judge, &backend);

        let mut session = Session::open(&run_dir).expect("open");
        let outcome = run_step(&mut session, &services).expect("step");
        assert!(outcome.complete);
        assert_eq!(backend.submissions()[0].prompt_text, "a sneaker, rain");
        assert!(session.records[0].draft_error.is_some());
        assert_eq!(drafter.calls()[0].focus, None);
    }

    #[test]
    fn candidate_dimensions_go_through_policy() {
        let temp = tempfile::tempdir().expect("tempdir");
        let out = temp.path().join("out");
        let run_dir = start(temp.path(), Mode::Ordered, &["a"]);
        let drafter = ScriptedDrafter::new(vec![Ok(Candidate {
            prompt: "wide".to_string(),
            dimensions: Some(crate::core::types::Dimensions::new(1920, 50)),
        })]);
        let judge = ScriptedJudge::new(vec![Ok(judged(&[("a", false)]))]);
        let backend = ScriptedBackend::new(&out, "mp4", Vec::new());
        let services = services(&drafter, &judge, &backend);

        let mut session = Session::open(&run_dir).expect("open");
        run_step(&mut session, &services).expect("step");
        let spec = &backend.submissions()[0];
        assert_eq!((spec.width, spec.height), (512, 100));
    }

    #[test]
    fn unavailable_streak_counts_trailing_failures() {
        let temp = tempfile::tempdir().expect("tempdir");
        let out = temp.path().join("out");
        let run_dir = start(temp.path(), Mode::Ordered, &["a"]);
        let drafter = ScriptedDrafter::new(Vec::new());
        let judge = ScriptedJudge::new(vec![Ok(judged(&[("a", false)]))]);
        let backend = ScriptedBackend::new(
            &out,
            "mp4",
            vec![
                JobScript::Unreachable,
                JobScript::CompletesAfter(0),
                JobScript::Unreachable,
                JobScript::Unreachable,
            ],
        );
        let services = services(&drafter, &judge, &backend);
        let mut session = Session::open(&run_dir).expect("open");

        run_step(&mut session, &services).expect("step 1");
        assert_eq!(session.unavailable_streak(), 1);
        run_step(&mut session, &services).expect("step 2");
        assert_eq!(session.unavailable_streak(), 0);
        run_step(&mut session, &services).expect("step 3");
        run_step(&mut session, &services).expect("step 4");
        assert_eq!(session.unavailable_streak(), 2);
    }

    #[test]
    fn open_repairs_state_that_lags_behind_records() {
        let temp = tempfile::tempdir().expect("tempdir");
        let out = temp.path().join("out");
        let run_dir = start(temp.path(), Mode::Ordered, &["a", "b"]);
        let drafter = ScriptedDrafter::new(Vec::new());
        let judge = ScriptedJudge::new(vec![Ok(judged(&[("a", true), ("b", false)]))]);
        let backend = ScriptedBackend::new(&out, "mp4", Vec::new());
        let services = services(&drafter, &judge, &backend);
        let mut session = Session::open(&run_dir).expect("open");
        run_step(&mut session, &services).expect("step");

        // Simulate a crash between the record and the state write.
        let paths = RunPaths::new(&run_dir);
        write_state(&paths, &RunState::initial(requirements(&["a", "b"]))).expect("rewind");

        let reopened = Session::open(&run_dir).expect("reopen");
        assert_eq!(reopened.state.next_iteration, 2);
        assert_eq!(reopened.state.checklist.current_index, 1);
        assert_eq!(reopened.strategy().focus(), Some(1));
        assert_eq!(reopened.state.last_judged, Some(judged(&[("a", true), ("b", false)])));
    }
}
