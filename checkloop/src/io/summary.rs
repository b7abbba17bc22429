//! Final one-page summary (`final_summary.txt`).
//!
//! The summary is a pure function of metadata, records and state, so
//! regenerating it is byte-identical. It never includes wall-clock data.

use std::fmt::Write as _;

use anyhow::Result;
use tracing::debug;

use crate::core::types::{IterationOutcome, IterationRecord, Mode};
use crate::io::paths::RunPaths;
use crate::io::recorder::{self, RunMetadata, RunState};
use crate::io::write_atomic;

pub fn render_summary(
    metadata: &RunMetadata,
    records: &[IterationRecord],
    state: Option<&RunState>,
) -> String {
    let mut out = String::new();
    // Writing into a String cannot fail.
    let _ = write_summary_into(&mut out, metadata, records, state);
    out
}

fn write_summary_into(
    out: &mut String,
    metadata: &RunMetadata,
    records: &[IterationRecord],
    state: Option<&RunState>,
) -> std::fmt::Result {
    writeln!(out, "FINAL ONE-PAGER SUMMARY")?;
    writeln!(out, "=======================")?;
    writeln!(out)?;
    writeln!(out, "Run: {}", metadata.run_name)?;
    writeln!(out, "Goal: {}", metadata.goal)?;
    writeln!(out, "Mode: {}", metadata.mode)?;
    writeln!(out, "Iteration budget: {}", metadata.max_iterations)?;
    writeln!(out)?;

    writeln!(out, "Requirements:")?;
    if metadata.requirements.is_empty() {
        writeln!(out, "  (none)")?;
    }
    for (pos, item) in metadata.requirements.iter().enumerate() {
        write!(out, "  {}. {}: {}", pos + 1, item.id, item.description)?;
        if let Some(weight) = item.weight {
            write!(out, " (weight {weight})")?;
        }
        writeln!(out)?;
    }
    writeln!(out)?;

    match state.and_then(|s| s.exit.as_ref()) {
        Some(exit) => writeln!(out, "Outcome: {exit}")?,
        None => writeln!(out, "Outcome: in progress")?,
    }
    writeln!(out, "Iterations used: {}", records.len())?;
    writeln!(out)?;

    if let Some(state) = state {
        writeln!(out, "Final checklist:")?;
        for (pos, item) in state.checklist.items.iter().enumerate() {
            let (mark, label) = match metadata.mode {
                Mode::Ordered => {
                    let locked = state.checklist.is_locked(&item.id);
                    let label = if pos == state.checklist.current_index {
                        " <- focus"
                    } else {
                        ""
                    };
                    (locked, label)
                }
                Mode::Set => {
                    let satisfied = state
                        .last_judged
                        .as_ref()
                        .and_then(|m| m.get(&item.id).copied())
                        .unwrap_or(false);
                    (satisfied, "")
                }
            };
            writeln!(
                out,
                "  [{}] {}{}",
                if mark { "x" } else { " " },
                item.id,
                label
            )?;
        }
        writeln!(out)?;
    }

    writeln!(out, "Iterations:")?;
    if records.is_empty() {
        writeln!(out, "  (none)")?;
    }
    for record in records {
        write_record(out, metadata, record)?;
    }
    Ok(())
}

fn write_record(
    out: &mut String,
    metadata: &RunMetadata,
    record: &IterationRecord,
) -> std::fmt::Result {
    write!(out, "--- Iteration {}", record.index)?;
    if let Some(item) = record.step_focus.and_then(|i| metadata.requirements.get(i)) {
        write!(out, " (focus: {})", item.id)?;
    }
    writeln!(out, " ---")?;
    writeln!(out, "Prompt: {}", record.prompt_used)?;
    if let Some(dimensions) = record.dimensions {
        writeln!(out, "Dimensions: {dimensions}")?;
    }
    if let Some(err) = &record.draft_error {
        writeln!(out, "Draft fallback: {err}")?;
    }

    match &record.outcome {
        IterationOutcome::GenerationFailed { failure, detail } => {
            writeln!(out, "Generation failed ({}): {detail}", failure.as_str())?;
        }
        outcome => {
            if let Some(path) = &record.artifact_path {
                writeln!(out, "Artifact: {}", path.display())?;
            }
            if let IterationOutcome::JudgmentDegraded { reason, .. } = outcome {
                writeln!(out, "Judgment unusable, all requirements counted absent: {reason}")?;
            }
            writeln!(out, "Results:")?;
            for item in &metadata.requirements {
                let present = record.satisfaction_map.get(&item.id).copied().unwrap_or(false);
                writeln!(
                    out,
                    "  {}: {}",
                    item.id,
                    if present { "present" } else { "absent" }
                )?;
            }
            if !record.regressed_ids.is_empty() {
                let ids: Vec<&str> = record.regressed_ids.iter().map(String::as_str).collect();
                writeln!(out, "Regressions: {}", ids.join(", "))?;
            }
            writeln!(out, "Advanced: {}", if record.advanced { "yes" } else { "no" })?;
            if !record.notes.trim().is_empty() {
                writeln!(out, "Notes: {}", record.notes.trim())?;
            }
        }
    }
    writeln!(out)
}

/// Regenerate `final_summary.txt` from what is on disk.
pub fn write_summary(paths: &RunPaths) -> Result<String> {
    let metadata = recorder::load_metadata(paths)?;
    let records = recorder::load_records(paths)?;
    let state = recorder::load_state(paths)?;
    let text = render_summary(&metadata, &records, state.as_ref());
    debug!(path = %paths.summary.display(), bytes = text.len(), "writing summary");
    write_atomic(&paths.summary, text.as_bytes())?;
    Ok(text)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::core::types::RunExit;
    use crate::io::recorder::{write_metadata, write_record, write_state};
    use crate::test_support::{failed_record, judged_record, requirements};

    fn seed(paths: &RunPaths) {
        let items = requirements(&["a", "b"]);
        write_metadata(
            paths,
            &RunMetadata {
                run_name: "r1".to_string(),
                goal: "a red shoe".to_string(),
                mode: Mode::Ordered,
                max_iterations: 3,
                requirements: items.clone(),
                created_at: "2025-01-01T00:00:00+00:00".to_string(),
            },
        )
        .expect("metadata");
        write_record(paths, &judged_record(1, Some(0), &[("a", true), ("b", false)], &[], true))
            .expect("record 1");
        write_record(paths, &failed_record(2, Some(1))).expect("record 2");
        let mut state = RunState::initial(items);
        state.checklist.locked_in.insert("a".to_string(), true);
        state.checklist.current_index = 1;
        state.next_iteration = 3;
        state.exit = Some(RunExit::BudgetExhausted {
            steps_completed: 1,
            total_steps: 2,
        });
        write_state(paths, &state).expect("state");
    }

    #[test]
    fn summary_is_idempotent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = RunPaths::new(temp.path());
        seed(&paths);

        let first = write_summary(&paths).expect("first");
        let on_disk = fs::read(&paths.summary).expect("read");
        let second = write_summary(&paths).expect("second");
        assert_eq!(first, second);
        assert_eq!(on_disk, fs::read(&paths.summary).expect("read again"));
    }

    #[test]
    fn summary_lists_outcome_checklist_and_iterations() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = RunPaths::new(temp.path());
        seed(&paths);
        let text = write_summary(&paths).expect("summary");

        assert!(text.starts_with("FINAL ONE-PAGER SUMMARY\n"));
        assert!(text.contains("Goal: a red shoe\n"));
        assert!(text.contains("Outcome: BudgetExhausted(steps_completed=1, total_steps=2)\n"));
        assert!(text.contains("  [x] a\n  [ ] b <- focus\n"));
        assert!(text.contains("--- Iteration 1 (focus: a) ---"));
        assert!(text.contains("  a: present\n  b: absent\n"));
        assert!(text.contains("Advanced: yes"));
        assert!(text.contains("--- Iteration 2 (focus: b) ---"));
        assert!(text.contains("Generation failed (job_timeout)"));
        assert!(!text.contains("2025-01-01"), "no wall-clock data");
    }
}
