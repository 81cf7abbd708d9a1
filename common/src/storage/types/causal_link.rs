use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::storage::types::{surreal_serde, StoredObject};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CausalRelation {
    Supersedes,
    References,
    DerivedFrom,
    Contradicts,
    Extends,
}

/// A directed edge between two chunks. Links are additive; they never imply
/// ownership of either endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CausalLink {
    #[serde(deserialize_with = "surreal_serde::deserialize_flexible_id")]
    pub id: String,
    pub from_chunk: String,
    pub to_chunk: String,
    pub relation: CausalRelation,
    /// Confidence in [0,1].
    pub confidence: f32,
    /// Identifier of whatever inferred the link (model name, "tracker", ...).
    pub inferred_by: String,
    #[serde(with = "surreal_serde::datetime")]
    pub created_at: DateTime<Utc>,
}

impl StoredObject for CausalLink {
    fn table_name() -> &'static str {
        "causal_link"
    }

    fn get_id(&self) -> &str {
        &self.id
    }
}

impl CausalLink {
    pub fn new(
        from_chunk: String,
        to_chunk: String,
        relation: CausalRelation,
        confidence: f32,
        inferred_by: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            from_chunk,
            to_chunk,
            relation,
            confidence: confidence.clamp(0.0, 1.0),
            inferred_by,
            created_at: Utc::now(),
        }
    }
}
