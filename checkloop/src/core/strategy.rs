//! Interchangeable controller strategies.
//!
//! Both modes share one iteration shape (draft, generate, judge, reconcile,
//! persist); they differ only in how a judgment moves the run forward:
//!
//! - [`StepLock`]: ordered mode. One focused requirement at a time, lock-in and
//!   regression detection over the full checklist.
//! - [`SetSatisfaction`]: set mode. Every judgment is evaluated independently
//!   and the run succeeds once all requirements hold at the same time.

use crate::core::checklist::{ChecklistState, Transition};
use crate::core::types::{IterationRecord, Mode, RequirementItem, SatisfactionMap};

/// Completed vs. total steps, as reported on budget exhaustion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
}

/// Per-mode decision logic behind the controller.
pub trait Strategy {
    fn mode(&self) -> Mode;

    /// Requirements in checklist order.
    fn items(&self) -> &[RequirementItem];

    /// Index of the requirement the next candidate should address, if any.
    fn focus(&self) -> Option<usize>;

    /// Ids the next candidate must keep satisfied.
    fn locked_ids(&self) -> Vec<String>;

    /// Derive the transition for a judged iteration without mutating state.
    fn evaluate(&self, judged: &SatisfactionMap) -> Transition;

    /// Commit a transition produced by [`Strategy::evaluate`].
    fn commit(&mut self, transition: &Transition, judged: &SatisfactionMap);

    fn is_complete(&self) -> bool;

    fn progress(&self) -> Progress;

    /// Snapshot of the checklist for persistence.
    fn checklist(&self) -> &ChecklistState;
}

/// Build the strategy for `mode`.
pub fn strategy_for(mode: Mode, items: Vec<RequirementItem>) -> Box<dyn Strategy> {
    match mode {
        Mode::Ordered => Box::new(StepLock::new(items)),
        Mode::Set => Box::new(SetSatisfaction::new(items)),
    }
}

/// Ordered step-lock mode.
#[derive(Debug, Clone)]
pub struct StepLock {
    state: ChecklistState,
}

impl StepLock {
    pub fn new(items: Vec<RequirementItem>) -> Self {
        Self {
            state: ChecklistState::new(items),
        }
    }
}

impl Strategy for StepLock {
    fn mode(&self) -> Mode {
        Mode::Ordered
    }

    fn items(&self) -> &[RequirementItem] {
        &self.state.items
    }

    fn focus(&self) -> Option<usize> {
        (!self.state.is_complete()).then_some(self.state.current_index)
    }

    fn locked_ids(&self) -> Vec<String> {
        self.state.locked_ids()
    }

    fn evaluate(&self, judged: &SatisfactionMap) -> Transition {
        self.state.reconcile(judged)
    }

    fn commit(&mut self, transition: &Transition, _judged: &SatisfactionMap) {
        self.state.apply(transition);
    }

    fn is_complete(&self) -> bool {
        self.state.is_complete()
    }

    fn progress(&self) -> Progress {
        Progress {
            completed: self.state.current_index,
            total: self.state.items.len(),
        }
    }

    fn checklist(&self) -> &ChecklistState {
        &self.state
    }
}

/// Set-satisfaction mode.
#[derive(Debug, Clone)]
pub struct SetSatisfaction {
    state: ChecklistState,
    last_satisfied: usize,
}

impl SetSatisfaction {
    pub fn new(items: Vec<RequirementItem>) -> Self {
        Self {
            state: ChecklistState::new(items),
            last_satisfied: 0,
        }
    }

    fn satisfied_count(&self, judged: &SatisfactionMap) -> usize {
        self.state
            .items
            .iter()
            .filter(|item| judged.get(&item.id).copied().unwrap_or(false))
            .count()
    }
}

impl Strategy for SetSatisfaction {
    fn mode(&self) -> Mode {
        Mode::Set
    }

    fn items(&self) -> &[RequirementItem] {
        &self.state.items
    }

    fn focus(&self) -> Option<usize> {
        None
    }

    fn locked_ids(&self) -> Vec<String> {
        Vec::new()
    }

    fn evaluate(&self, judged: &SatisfactionMap) -> Transition {
        let complete = self.satisfied_count(judged) == self.state.items.len();
        Transition {
            advanced: complete,
            complete,
            ..Transition::default()
        }
    }

    fn commit(&mut self, transition: &Transition, judged: &SatisfactionMap) {
        self.last_satisfied = self.satisfied_count(judged);
        if transition.complete {
            self.state.current_index = self.state.items.len();
        }
    }

    fn is_complete(&self) -> bool {
        self.state.is_complete()
    }

    fn progress(&self) -> Progress {
        Progress {
            completed: self.last_satisfied,
            total: self.state.items.len(),
        }
    }

    fn checklist(&self) -> &ChecklistState {
        &self.state
    }
}

/// Rebuild strategy state from persisted records.
///
/// Records without satisfaction data (failed generations) are skipped. Returns
/// one message per record whose stored decision differs from the replayed one.
pub fn replay(strategy: &mut dyn Strategy, records: &[IterationRecord]) -> Vec<String> {
    let mut mismatches = Vec::new();
    for record in records {
        if !record.outcome.was_judged() {
            continue;
        }
        let transition = strategy.evaluate(&record.satisfaction_map);
        if transition.advanced != record.advanced
            || transition.regressed_ids != record.regressed_ids
        {
            mismatches.push(format!(
                "iteration {}: recorded advanced={} regressed={:?}, replay advanced={} regressed={:?}",
                record.index,
                record.advanced,
                record.regressed_ids,
                transition.advanced,
                transition.regressed_ids
            ));
        }
        strategy.commit(&transition, &record.satisfaction_map);
    }
    mismatches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{failed_record, judged, judged_record, requirements};

    #[test]
    fn set_mode_completes_only_when_all_hold() {
        let mut strategy = SetSatisfaction::new(requirements(&["a", "b", "c"]));

        let judged_partial = judged(&[("a", true), ("b", true), ("c", false)]);
        let t = strategy.evaluate(&judged_partial);
        assert!(!t.complete);
        assert!(t.regressed_ids.is_empty());
        strategy.commit(&t, &judged_partial);
        assert_eq!(strategy.progress(), Progress { completed: 2, total: 3 });
        assert!(!strategy.is_complete());

        let judged_all = judged(&[("a", true), ("b", true), ("c", true)]);
        let t = strategy.evaluate(&judged_all);
        assert!(t.complete);
        strategy.commit(&t, &judged_all);
        assert!(strategy.is_complete());
    }

    /// Set mode has no memory: a later partial judgment is not a regression.
    #[test]
    fn set_mode_never_reports_regressions() {
        let mut strategy = SetSatisfaction::new(requirements(&["a", "b"]));
        let first = judged(&[("a", true), ("b", false)]);
        let t = strategy.evaluate(&first);
        strategy.commit(&t, &first);

        let second = judged(&[("a", false), ("b", true)]);
        let t = strategy.evaluate(&second);
        assert!(t.regressed_ids.is_empty());
        assert!(strategy.locked_ids().is_empty());
        assert_eq!(strategy.focus(), None);
    }

    #[test]
    fn step_lock_focus_tracks_current_index() {
        let mut strategy = StepLock::new(requirements(&["a", "b"]));
        assert_eq!(strategy.focus(), Some(0));
        let j = judged(&[("a", true)]);
        let t = strategy.evaluate(&j);
        strategy.commit(&t, &j);
        assert_eq!(strategy.focus(), Some(1));
        assert_eq!(strategy.locked_ids(), vec!["a".to_string()]);
        assert_eq!(strategy.progress(), Progress { completed: 1, total: 2 });
    }

    #[test]
    fn replay_skips_failed_generations_and_matches_records() {
        let records = vec![
            judged_record(1, Some(0), &[("a", true), ("b", false)], &[], true),
            failed_record(2, Some(1)),
            judged_record(3, Some(1), &[("a", false), ("b", true)], &["a"], false),
        ];
        let mut strategy = strategy_for(Mode::Ordered, requirements(&["a", "b"]));
        let mismatches = replay(strategy.as_mut(), &records);
        assert!(mismatches.is_empty(), "{mismatches:?}");
        assert_eq!(strategy.checklist().current_index, 1);
        assert!(strategy.checklist().is_locked("a"));
    }

    #[test]
    fn replay_reports_mismatched_records() {
        let records = vec![judged_record(1, Some(0), &[("a", false)], &[], true)];
        let mut strategy = strategy_for(Mode::Ordered, requirements(&["a"]));
        let mismatches = replay(strategy.as_mut(), &records);
        assert_eq!(mismatches.len(), 1);
        assert!(mismatches[0].contains("iteration 1"));
        assert_eq!(strategy.checklist().current_index, 0);
    }
}
