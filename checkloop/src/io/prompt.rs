//! Prompt rendering for the reasoning-backed adapters.
//!
//! Templates mark their sections with `<!-- section:KEY required|droppable -->`.
//! After rendering, droppable sections are removed (guide first, then
//! history) until the prompt fits the byte budget.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::core::types::{RequirementItem, SatisfactionMap};

const DRAFT_TEMPLATE: &str = include_str!("prompts/draft.md");
const JUDGE_TEMPLATE: &str = include_str!("prompts/judge.md");
const EXTRACT_TEMPLATE: &str = include_str!("prompts/extract.md");

/// Sections removed, in order, when a prompt exceeds its budget.
const DROP_ORDER: [&str; 2] = ["guide", "history"];

#[derive(Debug, Clone, Serialize)]
struct DraftItem<'a> {
    id: &'a str,
    description: &'a str,
    status: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct JudgeItem<'a> {
    id: &'a str,
    description: &'a str,
    prior: Option<&'static str>,
}

/// Everything the drafting prompt is built from.
#[derive(Debug, Clone, Default)]
pub struct DraftInputs {
    pub goal: String,
    pub requirements: Vec<RequirementItem>,
    /// Focused requirement index (ordered mode).
    pub focus: Option<usize>,
    pub locked_ids: Vec<String>,
    pub previous_prompt: Option<String>,
    pub history: String,
    pub guide: Option<String>,
}

fn engine() -> Result<Environment<'static>> {
    let mut env = Environment::new();
    env.add_template("draft", DRAFT_TEMPLATE)
        .context("register draft template")?;
    env.add_template("judge", JUDGE_TEMPLATE)
        .context("register judge template")?;
    env.add_template("extract", EXTRACT_TEMPLATE)
        .context("register extract template")?;
    Ok(env)
}

fn non_empty(text: Option<&str>) -> Option<&str> {
    text.map(str::trim).filter(|s| !s.is_empty())
}

/// Render the drafting prompt within `budget_bytes`.
pub fn render_draft(input: &DraftInputs, budget_bytes: usize) -> Result<String> {
    let items: Vec<DraftItem<'_>> = input
        .requirements
        .iter()
        .enumerate()
        .map(|(pos, item)| DraftItem {
            id: &item.id,
            description: &item.description,
            status: match input.focus {
                None => "required",
                Some(_) if input.locked_ids.contains(&item.id) => "achieved",
                Some(focus) if focus == pos => "focus",
                Some(_) => "pending",
            },
        })
        .collect();
    let focus = input
        .focus
        .and_then(|i| input.requirements.get(i))
        .map(|item| context! { id => &item.id, description => &item.description });

    let rendered = engine()?
        .get_template("draft")?
        .render(context! {
            goal => input.goal.trim(),
            requirements => items,
            focus => focus,
            locked => &input.locked_ids,
            previous_prompt => non_empty(input.previous_prompt.as_deref()),
            history => non_empty(Some(input.history.as_str())),
            guide => non_empty(input.guide.as_deref()),
        })
        .context("render draft prompt")?;
    fit_to_budget(&rendered, budget_bytes)
}

/// Render the judging prompt.
pub fn render_judge(
    requirements: &[RequirementItem],
    prior: Option<&SatisfactionMap>,
    frame_count: usize,
) -> Result<String> {
    let items: Vec<JudgeItem<'_>> = requirements
        .iter()
        .map(|item| JudgeItem {
            id: &item.id,
            description: &item.description,
            prior: prior
                .and_then(|m| m.get(&item.id))
                .map(|present| if *present { "present" } else { "absent" }),
        })
        .collect();
    let rendered = engine()?
        .get_template("judge")?
        .render(context! { requirements => items, frame_count => frame_count })
        .context("render judge prompt")?;
    fit_to_budget(&rendered, usize::MAX)
}

/// Render the requirement extraction prompt.
pub fn render_extract(goal: &str) -> Result<String> {
    let rendered = engine()?
        .get_template("extract")?
        .render(context! { goal => goal.trim() })
        .context("render extract prompt")?;
    fit_to_budget(&rendered, usize::MAX)
}

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct Section {
    key: String,
    required: bool,
    /// Section content without the marker.
    content: String,
}

fn parse_sections(rendered: &str) -> Result<Vec<Section>> {
    let marker = Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")?;
    let matches: Vec<_> = marker.captures_iter(rendered).collect();

    let mut sections = Vec::new();
    for (i, caps) in matches.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = matches
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |m| m.start());
        let content = rendered[whole.end()..end].trim().to_string();
        let required = kind.as_str() == "required";
        if !content.is_empty() || required {
            sections.push(Section {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }
    Ok(sections)
}

fn total_len(sections: &[Section]) -> usize {
    sections.iter().map(|s| s.content.len()).sum()
}

fn fit_to_budget(rendered: &str, budget: usize) -> Result<String> {
    let mut sections = parse_sections(rendered)?;

    for key in DROP_ORDER {
        if total_len(&sections) <= budget {
            break;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    if total_len(&sections) > budget {
        debug!(
            bytes = total_len(&sections),
            budget, "prompt still over budget with only required sections"
        );
    }

    Ok(sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n"))
}
