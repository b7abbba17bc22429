//! Stable exit codes for checkloop CLI commands.

use crate::core::types::RunExit;

/// Command succeeded, or the run ended with every requirement satisfied.
pub const OK: i32 = 0;
/// Invalid config, run directory or arguments, or any other error.
pub const INVALID: i32 = 1;
/// The iteration budget ran out first.
pub const BUDGET_EXHAUSTED: i32 = 2;
/// The run had no requirements and ended before iteration 1.
pub const NO_REQUIREMENTS: i32 = 3;
/// The generation backend stayed unreachable.
pub const BACKEND_UNAVAILABLE: i32 = 4;

pub fn for_exit(exit: &RunExit) -> i32 {
    match exit {
        RunExit::AllSatisfied { .. } => OK,
        RunExit::BudgetExhausted { .. } => BUDGET_EXHAUSTED,
        RunExit::NoRequirements => NO_REQUIREMENTS,
        RunExit::BackendUnavailable { .. } => BACKEND_UNAVAILABLE,
    }
}
