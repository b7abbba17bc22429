//! The controller loop behind `checkloop run` and `checkloop resume`.

use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::{info, warn};

use crate::agents::drafter::CandidateDrafter;
use crate::agents::judge::Judge;
use crate::core::types::RunExit;
use crate::io::job_client::GenerationBackend;
use crate::io::recorder::write_state;
use crate::io::summary::write_summary;
use crate::step::{Services, Session, StepOutcome, run_step};

/// Loop limits that are not part of the run metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopSettings {
    /// Stop once this many consecutive iterations ended `client_unavailable`.
    pub max_consecutive_unavailable: u32,
}

/// Summary of a loop invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub run_name: String,
    pub started_at_iteration: u32,
    pub steps_executed: u32,
    pub exit: RunExit,
    pub summary_path: PathBuf,
}

/// Run iterations until every requirement is satisfied, the iteration budget
/// is spent, or the backend stays unavailable. Continues an interrupted run
/// where its records end; a run that already stopped is re-reported without
/// new iterations. The final summary is always (re)written.
pub fn run_loop<D, J, B, F>(
    run_dir: &Path,
    services: &Services<D, J, B>,
    settings: &LoopSettings,
    mut on_step: F,
) -> Result<LoopOutcome>
where
    D: CandidateDrafter,
    J: Judge,
    B: GenerationBackend,
    F: FnMut(&StepOutcome),
{
    let mut session = Session::open(run_dir)?;
    let started_at_iteration = session.state.next_iteration;
    let mut steps_executed = 0u32;

    let exit = match session.state.exit.clone() {
        Some(exit) => {
            info!(run = %session.metadata.run_name, %exit, "run already finished");
            exit
        }
        None => {
            let exit = loop {
                if let Some(exit) = stop_condition(&session, settings) {
                    break exit;
                }
                let step = run_step(&mut session, services)?;
                steps_executed += 1;
                on_step(&step);
            };
            session.state.exit = Some(exit.clone());
            write_state(&session.paths, &session.state)?;
            exit
        }
    };

    write_summary(&session.paths)?;
    info!(run = %session.metadata.run_name, %exit, steps_executed, "run stopped");
    Ok(LoopOutcome {
        run_name: session.metadata.run_name.clone(),
        started_at_iteration,
        steps_executed,
        exit,
        summary_path: session.paths.summary.clone(),
    })
}

fn stop_condition(session: &Session, settings: &LoopSettings) -> Option<RunExit> {
    let strategy = session.strategy();
    if strategy.items().is_empty() {
        return Some(RunExit::NoRequirements);
    }
    let used = u32::try_from(session.records.len()).unwrap_or(u32::MAX);
    if strategy.is_complete() {
        return Some(RunExit::AllSatisfied {
            iterations_used: used,
        });
    }
    let progress = strategy.progress();
    let streak = session.unavailable_streak();
    if streak >= settings.max_consecutive_unavailable {
        warn!(streak, "backend unavailable on consecutive iterations; stopping");
        return Some(RunExit::BackendUnavailable {
            consecutive_failures: streak,
            steps_completed: progress.completed,
            total_steps: progress.total,
        });
    }
    if used >= session.metadata.max_iterations {
        return Some(RunExit::BudgetExhausted {
            steps_completed: progress.completed,
            total_steps: progress.total,
        });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dimensions::DimensionPolicy;
    use crate::core::types::Mode;
    use crate::io::job_client::JobClient;
    use crate::io::paths::RunPaths;
    use crate::io::recorder::load_state;
    use crate::start::{RunRequest, start_run};
    use crate::test_support::{
        ScriptedBackend, ScriptedDrafter, ScriptedJudge, fast_poll_policy, judged, requirements,
    };

    const SETTINGS: LoopSettings = LoopSettings {
        max_consecutive_unavailable: 3,
    };

    #[test]
    fn already_finished_run_is_re_reported() {
        let temp = tempfile::tempdir().expect("tempdir");
        let out = temp.path().join("out");
        let run_dir = start_run(
            temp.path(),
            &RunRequest {
                run_name: Some("done".to_string()),
                goal: "goal".to_string(),
                mode: Mode::Ordered,
                max_iterations: 2,
                requirements: requirements(&["a"]),
            },
        )
        .expect("start")
        .run_dir;
        let drafter = ScriptedDrafter::new(Vec::new());
        let judge = ScriptedJudge::new(vec![Ok(judged(&[("a", true)]))]);
        let backend = ScriptedBackend::new(&out, "mp4", Vec::new());
        let services = Services {
            drafter: &drafter,
            judge: &judge,
            jobs: JobClient::new(&backend, fast_poll_policy()),
            dimensions: DimensionPolicy::default(),
        };

        let first = run_loop(&run_dir, &services, &SETTINGS, |_| {}).expect("first");
        assert_eq!(first.exit, RunExit::AllSatisfied { iterations_used: 1 });
        assert_eq!(first.steps_executed, 1);

        let second = run_loop(&run_dir, &services, &SETTINGS, |_| {}).expect("second");
        assert_eq!(second.exit, first.exit);
        assert_eq!(second.steps_executed, 0);
        assert_eq!(second.started_at_iteration, 2);
        assert_eq!(backend.submissions().len(), 1);

        let state = load_state(&RunPaths::new(&run_dir)).expect("state").expect("present");
        assert_eq!(state.exit, Some(first.exit));
    }
}
