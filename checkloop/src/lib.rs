//! Checklist-driven generation loop.
//!
//! A goal is broken into discrete requirements, and the controller iterates:
//! draft a prompt, generate an artifact on a remote backend, judge the artifact
//! against every requirement, and decide what to do next. Two strategies share
//! the controller: ordered step-lock (one requirement at a time, satisfied
//! ones locked in) and set satisfaction (everything at once).
//!
//! - **[`core`]**: pure, deterministic logic (checklist, strategies, judgment
//!   resolution, dimension policy). No I/O.
//! - **[`io`]**: side effects (config, run directory, job client, HTTP
//!   backends, frame sampling, prompt templates).
//! - **[`agents`]**: reasoning-backed adapters (extraction, drafting, judgment).
//!
//! Orchestration modules ([`start`], [`step`], [`looping`]) tie them together
//! for the CLI commands.

pub mod agents;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod start;
pub mod step;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
