//! Scripted backends for tests. Nothing here touches the network.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{BackendIdentity, CanCompleteJson, CanRerank, Capability, LatencyClass};
use crate::error::AppError;

/// JSON-completion backend that replays queued responses in order. When the
/// queue runs dry it returns an `LLMParsing` error, which exercises the
/// callers' fallback paths.
pub struct ScriptedLlmBackend {
    name: String,
    responses: Mutex<VecDeque<serde_json::Value>>,
    calls: Mutex<Vec<String>>,
    capabilities: Vec<Capability>,
}

impl ScriptedLlmBackend {
    pub fn new(responses: Vec<serde_json::Value>) -> Arc<Self> {
        Arc::new(Self {
            name: "scripted".to_string(),
            responses: Mutex::new(responses.into()),
            calls: Mutex::new(Vec::new()),
            capabilities: vec![
                Capability::TextCompletion,
                Capability::JsonCompletion,
                Capability::QntmGeneration,
            ],
        })
    }

    /// User prompts seen so far, in call order.
    pub async fn recorded_calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }

    pub async fn call_count(&self) -> usize {
        self.calls.lock().await.len()
    }
}

#[async_trait]
impl BackendIdentity for ScriptedLlmBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    fn latency_class(&self) -> LatencyClass {
        LatencyClass::Local
    }

    async fn is_available(&self) -> bool {
        true
    }
}

#[async_trait]
impl CanCompleteJson for ScriptedLlmBackend {
    async fn complete_json(
        &self,
        _system: &str,
        user: &str,
        _schema_name: &str,
        _schema: serde_json::Value,
    ) -> Result<serde_json::Value, AppError> {
        self.calls.lock().await.push(user.to_string());
        self.responses
            .lock()
            .await
            .pop_front()
            .ok_or_else(|| AppError::LLMParsing("scripted responses exhausted".into()))
    }

    fn model_family(&self) -> String {
        "scripted".to_string()
    }
}

/// Reranker that scores documents by naive term overlap with the query.
/// Deterministic and offline, but order-sensitive enough for ranking tests.
pub struct OverlapReranker {
    capabilities: Vec<Capability>,
    calls: Mutex<Vec<usize>>,
}

impl OverlapReranker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            capabilities: vec![Capability::Reranking],
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Document counts per rerank call.
    pub async fn recorded_calls(&self) -> Vec<usize> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl BackendIdentity for OverlapReranker {
    fn name(&self) -> &str {
        "overlap-reranker"
    }

    fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    fn latency_class(&self) -> LatencyClass {
        LatencyClass::Local
    }

    async fn is_available(&self) -> bool {
        true
    }
}

#[async_trait]
impl CanRerank for OverlapReranker {
    async fn rerank(&self, query: &str, documents: &[String]) -> Result<Vec<f32>, AppError> {
        self.calls.lock().await.push(documents.len());

        let query_terms: Vec<String> = query
            .split_whitespace()
            .map(|t| t.to_ascii_lowercase())
            .collect();

        Ok(documents
            .iter()
            .map(|doc| {
                if query_terms.is_empty() {
                    return 0.0;
                }
                let doc_lower = doc.to_ascii_lowercase();
                let hits = query_terms
                    .iter()
                    .filter(|term| doc_lower.contains(term.as_str()))
                    .count();
                hits as f32 / query_terms.len() as f32
            })
            .collect())
    }
}
