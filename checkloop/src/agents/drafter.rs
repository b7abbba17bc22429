//! Candidate drafting: goal + requirements + history → generation prompt.

use serde::Deserialize;
use tracing::{debug, instrument};

use crate::agents::validate_output;
use crate::core::history::render_history;
use crate::core::types::{Candidate, Dimensions, IterationRecord, RequirementItem};
use crate::io::prompt::{DraftInputs, render_draft};
use crate::io::reasoning::{AdapterError, ReasoningRequest, ReasoningService, parse_json_reply};

const DRAFT_OUTPUT_SCHEMA: &str = include_str!("../../schemas/draft_output.schema.json");

const SYSTEM: &str = "You are an expert prompt writer for text-to-video models. \
You always answer with one JSON object.";

/// What the drafter sees for one iteration.
#[derive(Debug, Clone, Copy)]
pub struct DraftContext<'a> {
    pub goal: &'a str,
    pub requirements: &'a [RequirementItem],
    /// Focused requirement (ordered mode only).
    pub focus: Option<usize>,
    pub locked_ids: &'a [String],
    pub records: &'a [IterationRecord],
}

impl DraftContext<'_> {
    /// Most recent prompt actually sent to the backend.
    pub fn previous_prompt(&self) -> Option<&str> {
        self.records
            .iter()
            .rev()
            .map(|r| r.prompt_used.as_str())
            .find(|p| !p.trim().is_empty())
    }
}

pub trait CandidateDrafter {
    fn draft(&self, ctx: &DraftContext<'_>) -> Result<Candidate, AdapterError>;
}

impl<D: CandidateDrafter + ?Sized> CandidateDrafter for &D {
    fn draft(&self, ctx: &DraftContext<'_>) -> Result<Candidate, AdapterError> {
        (**self).draft(ctx)
    }
}

/// Candidate used when drafting fails: the raw reply if it has text, else the
/// previous prompt, else the goal itself.
pub fn fallback_candidate(err: &AdapterError, ctx: &DraftContext<'_>) -> Candidate {
    let raw = err.raw().trim();
    let prompt = if !raw.is_empty() {
        raw.to_string()
    } else if let Some(previous) = ctx.previous_prompt() {
        previous.to_string()
    } else {
        ctx.goal.trim().to_string()
    };
    Candidate {
        prompt,
        dimensions: None,
    }
}

#[derive(Debug, Deserialize)]
struct DraftReply {
    prompt: String,
    #[serde(default, alias = "resolution_width")]
    width: Option<u32>,
    #[serde(default, alias = "resolution_height")]
    height: Option<u32>,
}

/// Parse a drafting reply. Dimensions count only when both sides are given.
pub fn parse_candidate(raw: &str) -> Result<Candidate, AdapterError> {
    let value = parse_json_reply(raw)?;
    validate_output(DRAFT_OUTPUT_SCHEMA, &value, raw)?;
    let reply: DraftReply = serde_json::from_value(value).map_err(|e| AdapterError::Malformed {
        reason: format!("unexpected shape: {e}"),
        raw: raw.to_string(),
    })?;
    let prompt = reply.prompt.trim().to_string();
    if prompt.is_empty() {
        return Err(AdapterError::Malformed {
            reason: "empty prompt".to_string(),
            raw: raw.to_string(),
        });
    }
    Ok(Candidate {
        prompt,
        dimensions: reply
            .width
            .zip(reply.height)
            .map(|(w, h)| Dimensions::new(w, h)),
    })
}

pub struct ReasoningDrafter<R> {
    service: R,
    budget_bytes: usize,
    guide: Option<String>,
}

impl<R: ReasoningService> ReasoningDrafter<R> {
    pub fn new(service: R, budget_bytes: usize, guide: Option<String>) -> Self {
        Self {
            service,
            budget_bytes,
            guide,
        }
    }

    fn prompt(&self, ctx: &DraftContext<'_>) -> Result<String, AdapterError> {
        let inputs = DraftInputs {
            goal: ctx.goal.to_string(),
            requirements: ctx.requirements.to_vec(),
            focus: ctx.focus,
            locked_ids: ctx.locked_ids.to_vec(),
            previous_prompt: ctx.previous_prompt().map(str::to_string),
            history: render_history(ctx.requirements, ctx.records, self.budget_bytes),
            guide: self.guide.clone(),
        };
        render_draft(&inputs, self.budget_bytes).map_err(|e| AdapterError::Malformed {
            reason: format!("render prompt: {e:#}"),
            raw: String::new(),
        })
    }
}

impl<R: ReasoningService> CandidateDrafter for ReasoningDrafter<R> {
    #[instrument(skip_all, fields(focus = ?ctx.focus, history = ctx.records.len()))]
    fn draft(&self, ctx: &DraftContext<'_>) -> Result<Candidate, AdapterError> {
        let user = self.prompt(ctx)?;
        debug!(bytes = user.len(), "drafting prompt rendered");
        let raw = self.service.complete_json(&ReasoningRequest {
            system: SYSTEM.to_string(),
            user,
            images: Vec::new(),
        })?;
        parse_candidate(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedReasoning, judged_record, requirements};

    fn ctx<'a>(
        items: &'a [RequirementItem],
        locked: &'a [String],
        records: &'a [IterationRecord],
    ) -> DraftContext<'a> {
        DraftContext {
            goal: "a red sneaker on a wet street",
            requirements: items,
            focus: Some(1),
            locked_ids: locked,
            records,
        }
    }

    #[test]
    fn parses_prompt_and_dimensions() {
        let candidate =
            parse_candidate(r#"{"prompt": " A red sneaker ", "width": 480, "height": 848}"#)
                .expect("parse");
        assert_eq!(candidate.prompt, "A red sneaker");
        assert_eq!(candidate.dimensions, Some(Dimensions::new(480, 848)));

        let candidate =
            parse_candidate(r#"{"prompt": "x", "resolution_width": 320, "resolution_height": 240}"#)
                .expect("aliases");
        assert_eq!(candidate.dimensions, Some(Dimensions::new(320, 240)));

        let candidate = parse_candidate(r#"{"prompt": "x", "width": 320}"#).expect("partial");
        assert_eq!(candidate.dimensions, None);
    }

    #[test]
    fn rejects_missing_or_empty_prompt() {
        assert!(parse_candidate(r#"{"width": 1, "height": 1}"#).is_err());
        assert!(parse_candidate(r#"{"prompt": "   "}"#).is_err());
        assert!(parse_candidate(r#"{"prompt": "x", "width": -5, "height": 10}"#).is_err());
    }

    #[test]
    fn fallback_prefers_raw_then_previous_then_goal() {
        let items = requirements(&["a", "b"]);
        let records = vec![judged_record(1, Some(0), &[("a", true)], &[], true)];
        let context = ctx(&items, &[], &records);

        let raw = AdapterError::Malformed {
            reason: "invalid JSON".to_string(),
            raw: "a sneaker in the rain".to_string(),
        };
        assert_eq!(fallback_candidate(&raw, &context).prompt, "a sneaker in the rain");

        let transport = AdapterError::Transport("down".to_string());
        assert_eq!(
            fallback_candidate(&transport, &context).prompt,
            records[0].prompt_used
        );

        let empty = ctx(&items, &[], &[]);
        assert_eq!(
            fallback_candidate(&transport, &empty).prompt,
            "a red sneaker on a wet street"
        );
    }

    #[test]
    fn drafter_renders_focus_and_history() {
        let items = requirements(&["a", "b"]);
        let locked = vec!["a".to_string()];
        let records = vec![judged_record(1, Some(0), &[("a", true)], &[], true)];
        let service = ScriptedReasoning::new(vec![Ok(r#"{"prompt": "next"}"#.to_string())]);
        let drafter = ReasoningDrafter::new(&service, 20_000, Some("be specific".to_string()));

        let candidate = drafter.draft(&ctx(&items, &locked, &records)).expect("draft");
        assert_eq!(candidate.prompt, "next");

        let requests = service.requests();
        let user = &requests[0].user;
        assert!(user.contains("Add this requirement now: b"));
        assert!(user.contains("Keep these achieved requirements intact: a"));
        assert!(user.contains("Iteration 1 (focus: a)"));
        assert!(user.contains("be specific"));
        assert!(requests[0].images.is_empty());
    }
}
