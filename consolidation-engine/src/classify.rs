use serde::Deserialize;
use tracing::warn;

use common::storage::types::chunk::{ConsolidationDirection, ConsolidationType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeepChoice {
    First,
    Second,
    Merge,
}

/// The LLM's verdict on a candidate pair.
#[derive(Debug, Clone, Deserialize)]
pub struct Classification {
    #[serde(rename = "type")]
    pub consolidation_type: ConsolidationType,
    pub direction: ConsolidationDirection,
    pub reasoning: String,
    pub keep: KeepChoice,
}

impl Classification {
    /// The documented default when the response cannot be parsed.
    pub fn fallback() -> Self {
        Self {
            consolidation_type: ConsolidationType::DuplicateWork,
            direction: ConsolidationDirection::Unknown,
            reasoning: "classification failed".to_string(),
            keep: KeepChoice::First,
        }
    }
}

pub fn classification_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "type": {
                "type": "string",
                "enum": ["duplicate_work", "sequential_iteration", "contextual_convergence"]
            },
            "direction": {
                "type": "string",
                "enum": ["forward", "backward", "convergent", "unknown"]
            },
            "reasoning": { "type": "string" },
            "keep": {
                "type": "string",
                "enum": ["first", "second", "merge"]
            }
        },
        "required": ["type", "direction", "reasoning", "keep"],
        "additionalProperties": false
    })
}

/// Parse the model's JSON; any shape mismatch degrades to the fallback.
pub fn parse_classification(value: serde_json::Value) -> Classification {
    match serde_json::from_value::<Classification>(value) {
        Ok(classification) => classification,
        Err(err) => {
            warn!(error = %err, "classification response malformed; using fallback");
            Classification::fallback()
        }
    }
}
