pub mod embedding;
pub mod llm;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Capability tags a provider can advertise. Selection happens per tag, never
/// by provider type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    TextEmbedding,
    CodeEmbedding,
    ContextualizedEmbedding,
    MultimodalEmbedding,
    TextCompletion,
    JsonCompletion,
    ToolUse,
    ExtendedThinking,
    Reranking,
    QntmGeneration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LatencyClass {
    /// In-process, no network hop.
    Local,
    /// Network hop to a co-located service.
    Fast,
    Standard,
}

/// Identity every provider exposes regardless of capability.
#[async_trait]
pub trait BackendIdentity: Send + Sync {
    fn name(&self) -> &str;
    fn capabilities(&self) -> &[Capability];
    fn latency_class(&self) -> LatencyClass {
        LatencyClass::Standard
    }
    fn priority(&self) -> u8 {
        0
    }
    async fn is_available(&self) -> bool;
}

#[async_trait]
pub trait CanEmbedText: BackendIdentity {
    async fn embed_text(&self, input: &str) -> Result<Vec<f32>, AppError>;
    fn dimension(&self) -> usize;
    fn model_name(&self) -> String;
}

#[async_trait]
pub trait CanEmbedCode: BackendIdentity {
    async fn embed_code(&self, input: &str) -> Result<Vec<f32>, AppError>;
    fn code_dimension(&self) -> usize;
}

/// One call embeds all chunks of a document at once so each vector reflects
/// intra-document context.
#[async_trait]
pub trait CanEmbedContextualized: BackendIdentity {
    async fn embed_contextualized(&self, chunks: &[String]) -> Result<Vec<Vec<f32>>, AppError>;
    /// Token budget a single contextualized call may not exceed.
    fn safe_token_limit(&self) -> usize;
}

#[async_trait]
pub trait CanCompleteJson: BackendIdentity {
    /// Run a JSON-mode completion and return the parsed value.
    async fn complete_json(
        &self,
        system: &str,
        user: &str,
        schema_name: &str,
        schema: serde_json::Value,
    ) -> Result<serde_json::Value, AppError>;

    fn model_family(&self) -> String;
}

#[async_trait]
pub trait CanRerank: BackendIdentity {
    /// Relevance scores for `documents` against `query`, same order, in [0,1].
    async fn rerank(&self, query: &str, documents: &[String]) -> Result<Vec<f32>, AppError>;
}

/// Read-only description used by diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct BackendDescriptor {
    pub name: String,
    pub capabilities: Vec<Capability>,
    pub latency_class: LatencyClass,
    pub priority: u8,
}

fn descriptor<B: BackendIdentity + ?Sized>(backend: &B) -> BackendDescriptor {
    BackendDescriptor {
        name: backend.name().to_string(),
        capabilities: backend.capabilities().to_vec(),
        latency_class: backend.latency_class(),
        priority: backend.priority(),
    }
}

/// Named providers keyed by capability. Effectively immutable once the daemon
/// starts; `clear` + re-register is the only mutation path.
#[derive(Default)]
pub struct BackendRegistry {
    text_embedding: Vec<Arc<dyn CanEmbedText>>,
    code_embedding: Vec<Arc<dyn CanEmbedCode>>,
    contextualized_embedding: Vec<Arc<dyn CanEmbedContextualized>>,
    json_completion: Vec<Arc<dyn CanCompleteJson>>,
    reranking: Vec<Arc<dyn CanRerank>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.text_embedding.clear();
        self.code_embedding.clear();
        self.contextualized_embedding.clear();
        self.json_completion.clear();
        self.reranking.clear();
    }

    pub fn register_text_embedding(&mut self, backend: Arc<dyn CanEmbedText>) {
        self.text_embedding.push(backend);
        self.text_embedding
            .sort_by(|a, b| b.priority().cmp(&a.priority()));
    }

    pub fn register_code_embedding(&mut self, backend: Arc<dyn CanEmbedCode>) {
        self.code_embedding.push(backend);
        self.code_embedding
            .sort_by(|a, b| b.priority().cmp(&a.priority()));
    }

    pub fn register_contextualized_embedding(
        &mut self,
        backend: Arc<dyn CanEmbedContextualized>,
    ) {
        self.contextualized_embedding.push(backend);
        self.contextualized_embedding
            .sort_by(|a, b| b.priority().cmp(&a.priority()));
    }

    pub fn register_json_completion(&mut self, backend: Arc<dyn CanCompleteJson>) {
        self.json_completion.push(backend);
        self.json_completion
            .sort_by(|a, b| b.priority().cmp(&a.priority()));
    }

    pub fn register_reranker(&mut self, backend: Arc<dyn CanRerank>) {
        self.reranking.push(backend);
        self.reranking
            .sort_by(|a, b| b.priority().cmp(&a.priority()));
    }

    pub fn text_embedding(&self) -> Result<Arc<dyn CanEmbedText>, AppError> {
        self.text_embedding
            .first()
            .cloned()
            .ok_or(AppError::NoProvider(Capability::TextEmbedding))
    }

    pub fn code_embedding(&self) -> Option<Arc<dyn CanEmbedCode>> {
        self.code_embedding.first().cloned()
    }

    pub fn contextualized_embedding(&self) -> Option<Arc<dyn CanEmbedContextualized>> {
        self.contextualized_embedding.first().cloned()
    }

    /// Highest-priority JSON-completion provider advertising `capability`.
    pub fn json_completion_for(
        &self,
        capability: Capability,
    ) -> Result<Arc<dyn CanCompleteJson>, AppError> {
        self.json_completion
            .iter()
            .find(|backend| backend.capabilities().contains(&capability))
            .cloned()
            .ok_or(AppError::NoProvider(capability))
    }

    pub fn json_completion(&self) -> Result<Arc<dyn CanCompleteJson>, AppError> {
        self.json_completion
            .first()
            .cloned()
            .ok_or(AppError::NoProvider(Capability::JsonCompletion))
    }

    pub fn reranker(&self) -> Option<Arc<dyn CanRerank>> {
        self.reranking.first().cloned()
    }

    pub fn descriptors(&self) -> Vec<BackendDescriptor> {
        let mut out: Vec<BackendDescriptor> = Vec::new();
        let mut push = |d: BackendDescriptor| {
            if !out.iter().any(|existing| existing.name == d.name) {
                out.push(d);
            }
        };
        for backend in &self.text_embedding {
            push(descriptor(backend.as_ref()));
        }
        for backend in &self.code_embedding {
            push(descriptor(backend.as_ref()));
        }
        for backend in &self.contextualized_embedding {
            push(descriptor(backend.as_ref()));
        }
        for backend in &self.json_completion {
            push(descriptor(backend.as_ref()));
        }
        for backend in &self.reranking {
            push(descriptor(backend.as_ref()));
        }
        out
    }
}

/// `provider[:model]` backend specifier, e.g. `ollama:nomic-embed-text`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendSpec {
    pub provider: String,
    pub model: Option<String>,
}

impl FromStr for BackendSpec {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(AppError::Configuration(
                "empty backend specifier".to_string(),
            ));
        }
        match trimmed.split_once(':') {
            Some((provider, model)) if !provider.is_empty() && !model.is_empty() => Ok(Self {
                provider: provider.to_string(),
                model: Some(model.to_string()),
            }),
            Some(_) => Err(AppError::Configuration(format!(
                "malformed backend specifier: {trimmed}"
            ))),
            None => Ok(Self {
                provider: trimmed.to_string(),
                model: None,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::embedding::HashedEmbeddingBackend;

    #[test]
    fn backend_spec_parsing() {
        let spec: BackendSpec = "voyage:voyage-3-large".parse().expect("spec");
        assert_eq!(spec.provider, "voyage");
        assert_eq!(spec.model.as_deref(), Some("voyage-3-large"));

        let bare: BackendSpec = "fastembed".parse().expect("bare spec");
        assert_eq!(bare.provider, "fastembed");
        assert!(bare.model.is_none());

        assert!("".parse::<BackendSpec>().is_err());
        assert!(":model".parse::<BackendSpec>().is_err());
        assert!("provider:".parse::<BackendSpec>().is_err());
    }

    #[tokio::test]
    async fn registry_selects_by_priority_and_errors_when_empty() {
        let mut registry = BackendRegistry::new();
        assert!(matches!(
            registry.text_embedding(),
            Err(AppError::NoProvider(Capability::TextEmbedding))
        ));

        let low = Arc::new(HashedEmbeddingBackend::named("low", 8, 0));
        let high = Arc::new(HashedEmbeddingBackend::named("high", 8, 5));
        registry.register_text_embedding(low);
        registry.register_text_embedding(high);

        let selected = registry.text_embedding().expect("provider");
        assert_eq!(selected.name(), "high");

        registry.clear();
        assert!(registry.text_embedding().is_err());
    }
}
