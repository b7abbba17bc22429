//! Fail-closed resolution of judged results onto the requirement set.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::types::{RequirementItem, SatisfactionMap};

/// One per-requirement verdict as reported by the judge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportedResult {
    pub id: String,
    pub present: bool,
}

/// Satisfaction map plus the ids that needed fail-closed handling.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    pub satisfaction: SatisfactionMap,
    /// Requirement ids the judge did not mention (resolved to false).
    pub omitted: Vec<String>,
    /// Requirement ids reported both present and absent (resolved to false).
    pub conflicting: Vec<String>,
    /// Reported ids that are not requirements (ignored).
    pub unknown: Vec<String>,
}

impl Resolution {
    pub fn is_clean(&self) -> bool {
        self.omitted.is_empty() && self.conflicting.is_empty() && self.unknown.is_empty()
    }
}

/// Map reported results onto `items`. Every requirement gets exactly one entry.
pub fn resolve(items: &[RequirementItem], reported: &[ReportedResult]) -> Resolution {
    let mut seen: BTreeMap<&str, Option<bool>> = BTreeMap::new();
    let mut unknown = Vec::new();

    for result in reported {
        let id = result.id.trim();
        if !items.iter().any(|item| item.id == id) {
            if !unknown.iter().any(|u: &String| u == id) {
                unknown.push(id.to_string());
            }
            continue;
        }
        seen.entry(id)
            .and_modify(|slot| {
                if *slot != Some(result.present) {
                    *slot = None;
                }
            })
            .or_insert(Some(result.present));
    }

    let mut resolution = Resolution {
        unknown,
        ..Resolution::default()
    };
    for item in items {
        let present = match seen.get(item.id.as_str()) {
            Some(Some(present)) => *present,
            Some(None) => {
                resolution.conflicting.push(item.id.clone());
                false
            }
            None => {
                resolution.omitted.push(item.id.clone());
                false
            }
        };
        resolution.satisfaction.insert(item.id.clone(), present);
    }
    resolution
}

/// Satisfaction map with every requirement false.
pub fn all_unsatisfied(items: &[RequirementItem]) -> SatisfactionMap {
    items.iter().map(|item| (item.id.clone(), false)).collect()
}
