//! Ordered checklist state and its reconcile rules.
//!
//! The controller is the only mutator. Reconciliation is split in two so the
//! caller can persist the iteration record before the state moves:
//! [`ChecklistState::reconcile`] computes a [`Transition`] without side effects
//! and [`ChecklistState::apply`] commits it.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::core::types::{RequirementItem, SatisfactionMap};

/// Decision derived from one judged iteration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transition {
    /// Locked-in ids judged absent this iteration.
    pub regressed_ids: BTreeSet<String>,
    /// Whether the focus moved forward.
    pub advanced: bool,
    /// Id newly locked in by this transition.
    pub locked: Option<String>,
    /// Whether the run is satisfied after this transition.
    pub complete: bool,
}

/// Ordered requirements plus lock-in bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChecklistState {
    pub items: Vec<RequirementItem>,
    pub locked_in: BTreeMap<String, bool>,
    /// Index of the focused item; equals `items.len()` once every item is locked in.
    pub current_index: usize,
}

impl ChecklistState {
    pub fn new(items: Vec<RequirementItem>) -> Self {
        let locked_in = items.iter().map(|item| (item.id.clone(), false)).collect();
        Self {
            items,
            locked_in,
            current_index: 0,
        }
    }

    pub fn current(&self) -> Option<&RequirementItem> {
        self.items.get(self.current_index)
    }

    pub fn is_complete(&self) -> bool {
        self.current_index >= self.items.len()
    }

    pub fn is_locked(&self, id: &str) -> bool {
        self.locked_in.get(id).copied().unwrap_or(false)
    }

    /// Locked-in ids in checklist order.
    pub fn locked_ids(&self) -> Vec<String> {
        self.items
            .iter()
            .filter(|item| self.is_locked(&item.id))
            .map(|item| item.id.clone())
            .collect()
    }

    /// Compute the transition for a judged iteration.
    ///
    /// Rules, in priority order:
    /// 1. any locked-in item judged absent is a regression and blocks advancing,
    ///    even when the focused item was satisfied;
    /// 2. otherwise a satisfied focused item is locked in and the focus advances;
    /// 3. otherwise the focus stays.
    ///
    /// Ids missing from `judged` count as absent.
    pub fn reconcile(&self, judged: &SatisfactionMap) -> Transition {
        let present = |id: &str| judged.get(id).copied().unwrap_or(false);

        let regressed_ids: BTreeSet<String> = self
            .items
            .iter()
            .filter(|item| self.is_locked(&item.id) && !present(&item.id))
            .map(|item| item.id.clone())
            .collect();

        let Some(current) = self.current() else {
            return Transition {
                regressed_ids,
                complete: true,
                ..Transition::default()
            };
        };

        if !regressed_ids.is_empty() || !present(&current.id) {
            return Transition {
                regressed_ids,
                ..Transition::default()
            };
        }

        Transition {
            regressed_ids,
            advanced: true,
            locked: Some(current.id.clone()),
            complete: self.current_index + 1 >= self.items.len(),
        }
    }

    /// Commit a transition produced by [`ChecklistState::reconcile`] on this state.
    ///
    /// Lock-in is never cleared here: a regressed item stays locked and keeps
    /// blocking progress until it is judged present again.
    pub fn apply(&mut self, transition: &Transition) {
        if !transition.advanced {
            return;
        }
        let Some(current) = self.current() else {
            return;
        };
        let id = current.id.clone();
        debug_assert_eq!(transition.locked.as_deref(), Some(id.as_str()));
        self.locked_in.insert(id, true);
        self.current_index += 1;
    }
}

/// Normalize extracted requirements into stable, unique snake_case ids.
///
/// Items with neither an id nor a description are dropped. Blank ids are
/// derived from the description; duplicates get `_2`, `_3`, ... suffixes.
pub fn normalize_requirements(raw: Vec<RequirementItem>) -> Vec<RequirementItem> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::with_capacity(raw.len());

    for item in raw {
        let description = item.description.trim().to_string();
        let mut base = slugify(&item.id);
        if base.is_empty() {
            base = slugify(&description);
        }
        if base.is_empty() {
            continue;
        }
        base.truncate(48);
        let base = base.trim_end_matches('_').to_string();

        let mut id = base.clone();
        let mut suffix = 2u32;
        while seen.contains(&id) {
            id = format!("{base}_{suffix}");
            suffix += 1;
        }
        seen.insert(id.clone());

        out.push(RequirementItem {
            description: if description.is_empty() {
                id.clone()
            } else {
                description
            },
            id,
            weight: item.weight,
        });
    }

    out
}

fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    for c in text.trim().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('_') {
            slug.push('_');
        }
    }
    slug.trim_end_matches('_').to_string()
}
