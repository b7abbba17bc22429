//! Requirement extraction: goal text → ordered requirement list.

use serde::Deserialize;
use tracing::{info, instrument, warn};

use crate::agents::validate_output;
use crate::core::checklist::normalize_requirements;
use crate::core::types::RequirementItem;
use crate::io::prompt::render_extract;
use crate::io::reasoning::{AdapterError, ReasoningRequest, ReasoningService, parse_json_reply};

const REQUIREMENTS_OUTPUT_SCHEMA: &str =
    include_str!("../../schemas/requirements_output.schema.json");

const SYSTEM: &str = "You turn creative goals into checklists of visual requirements. \
You always answer with one JSON object.";

pub trait RequirementExtractor {
    fn extract(&self, goal: &str) -> Result<Vec<RequirementItem>, AdapterError>;
}

impl<X: RequirementExtractor + ?Sized> RequirementExtractor for &X {
    fn extract(&self, goal: &str) -> Result<Vec<RequirementItem>, AdapterError> {
        (**self).extract(goal)
    }
}

#[derive(Debug, Deserialize)]
struct ExtractedItem {
    #[serde(default)]
    id: String,
    description: String,
    #[serde(default)]
    weight: Option<f64>,
    #[serde(default)]
    points: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ExtractionReply {
    #[serde(default)]
    elements: Option<Vec<ExtractedItem>>,
    #[serde(default)]
    rubric_items: Option<Vec<ExtractedItem>>,
}

/// Parse an extraction reply into normalized requirements.
pub fn parse_requirements(raw: &str) -> Result<Vec<RequirementItem>, AdapterError> {
    let value = parse_json_reply(raw)?;
    validate_output(REQUIREMENTS_OUTPUT_SCHEMA, &value, raw)?;
    let reply: ExtractionReply =
        serde_json::from_value(value).map_err(|e| AdapterError::Malformed {
            reason: format!("unexpected shape: {e}"),
            raw: raw.to_string(),
        })?;
    let items = reply
        .elements
        .or(reply.rubric_items)
        .unwrap_or_default()
        .into_iter()
        .map(|item| RequirementItem {
            id: item.id,
            description: item.description,
            weight: item.weight.or(item.points),
        })
        .collect();
    Ok(normalize_requirements(items))
}

pub struct ReasoningExtractor<R> {
    service: R,
}

impl<R: ReasoningService> ReasoningExtractor<R> {
    pub fn new(service: R) -> Self {
        Self { service }
    }
}

impl<R: ReasoningService> RequirementExtractor for ReasoningExtractor<R> {
    #[instrument(skip_all)]
    fn extract(&self, goal: &str) -> Result<Vec<RequirementItem>, AdapterError> {
        let user = render_extract(goal).map_err(|e| AdapterError::Malformed {
            reason: format!("render prompt: {e:#}"),
            raw: String::new(),
        })?;
        let raw = self.service.complete_json(&ReasoningRequest {
            system: SYSTEM.to_string(),
            user,
            images: Vec::new(),
        })?;
        match parse_requirements(&raw) {
            Ok(items) => {
                info!(count = items.len(), "requirements extracted");
                Ok(items)
            }
            Err(err) => {
                warn!(err = %err, raw = %raw, "unusable extraction reply");
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedReasoning;

    #[test]
    fn parses_elements_with_normalized_ids() {
        let raw = r#"{"elements": [
            {"id": "Red Shoe", "description": "A red sneaker is visible", "weight": 2},
            {"description": "Wet asphalt street"}
        ]}"#;
        let items = parse_requirements(raw).expect("parse");
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, "red_shoe");
        assert_eq!(items[0].weight, Some(2.0));
        assert_eq!(items[1].id, "wet_asphalt_street");
    }

    #[test]
    fn accepts_rubric_items_with_points() {
        let raw = r#"```json
{"rubric_items": [{"id": "a", "description": "A", "points": 3}]}
```"#;
        let items = parse_requirements(raw).expect("parse");
        assert_eq!(items[0].weight, Some(3.0));
    }

    #[test]
    fn rejects_wrong_shape() {
        let err = parse_requirements(r#"{"items": []}"#).expect_err("shape");
        assert!(matches!(err, AdapterError::Malformed { .. }));
        let err = parse_requirements("nope").expect_err("garbage");
        assert_eq!(err.raw(), "nope");
    }

    #[test]
    fn extractor_sends_goal_and_parses_reply() {
        let service = ScriptedReasoning::new(vec![Ok(
            r#"{"elements": [{"id": "dog", "description": "A dog"}]}"#.to_string(),
        )]);
        let extractor = ReasoningExtractor::new(&service);
        let items = extractor.extract("a dog surfing").expect("extract");
        assert_eq!(items, vec![RequirementItem::new("dog", "A dog")]);
        let requests = service.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].user.contains("a dog surfing"));
    }
}
