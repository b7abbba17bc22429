//! Free-form iteration history handed to the drafting adapter.

use crate::core::types::{IterationOutcome, IterationRecord, RequirementItem};

/// Render prior iterations oldest-first, keeping the newest entries that fit
/// in `budget_bytes`. Older entries are replaced by a one-line omission note.
pub fn render_history(
    items: &[RequirementItem],
    records: &[IterationRecord],
    budget_bytes: usize,
) -> String {
    let mut kept: Vec<String> = Vec::new();
    let mut used = 0usize;

    for record in records.iter().rev() {
        let entry = render_entry(items, record);
        if used + entry.len() > budget_bytes {
            break;
        }
        used += entry.len();
        kept.push(entry);
    }

    let omitted = records.len() - kept.len();
    let mut out = String::new();
    if omitted > 0 {
        out.push_str(&format!("({omitted} earlier iterations omitted)\n\n"));
    }
    for entry in kept.iter().rev() {
        out.push_str(entry);
    }
    out
}

fn render_entry(items: &[RequirementItem], record: &IterationRecord) -> String {
    let mut out = format!("Iteration {}", record.index);
    if let Some(item) = record.step_focus.and_then(|i| items.get(i)) {
        out.push_str(&format!(" (focus: {})", item.id));
    }
    out.push_str(":\n");
    out.push_str(&format!("  prompt: {}\n", one_line(&record.prompt_used)));

    match &record.outcome {
        IterationOutcome::GenerationFailed { failure, detail } => {
            out.push_str(&format!(
                "  generation failed ({}): {}\n",
                failure.as_str(),
                one_line(detail)
            ));
        }
        outcome => {
            let (satisfied, missing): (Vec<&RequirementItem>, Vec<&RequirementItem>) = items
                .iter()
                .partition(|item| record.satisfaction_map.get(&item.id).copied().unwrap_or(false));
            out.push_str(&format!("  satisfied: {}\n", join_ids(&satisfied)));
            out.push_str(&format!("  missing: {}\n", join_ids(&missing)));
            if !record.regressed_ids.is_empty() {
                let regressed: Vec<&str> = record.regressed_ids.iter().map(String::as_str).collect();
                out.push_str(&format!("  regressed: {}\n", regressed.join(", ")));
            }
            if let IterationOutcome::JudgmentDegraded { reason, .. } = outcome {
                out.push_str(&format!("  judgment unusable: {}\n", one_line(reason)));
            }
            if !record.notes.trim().is_empty() {
                out.push_str(&format!("  notes: {}\n", one_line(&record.notes)));
            }
        }
    }
    out.push('\n');
    out
}

fn join_ids(items: &[&RequirementItem]) -> String {
    if items.is_empty() {
        return "(none)".to_string();
    }
    items
        .iter()
        .map(|item| item.id.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn one_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
