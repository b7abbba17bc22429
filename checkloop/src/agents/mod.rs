//! Reasoning-backed adapters: requirement extraction, drafting and judgment.

use jsonschema::validator_for;
use serde_json::Value;

use crate::io::reasoning::AdapterError;

pub mod drafter;
pub mod extractor;
pub mod judge;

/// Validate a reply against an embedded JSON schema.
pub(crate) fn validate_output(schema: &str, value: &Value, raw: &str) -> Result<(), AdapterError> {
    let malformed = |reason: String| AdapterError::Malformed {
        reason,
        raw: raw.to_string(),
    };
    let schema: Value =
        serde_json::from_str(schema).map_err(|e| malformed(format!("invalid schema: {e}")))?;
    let compiled = validator_for(&schema).map_err(|e| malformed(format!("invalid schema: {e}")))?;
    if !compiled.is_valid(value) {
        let messages = compiled
            .iter_errors(value)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(malformed(format!(
            "schema validation failed: {}",
            messages.join("; ")
        )));
    }
    Ok(())
}
