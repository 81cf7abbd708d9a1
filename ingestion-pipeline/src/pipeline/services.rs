use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use common::backends::{BackendRegistry, Capability};
use common::error::AppError;
use common::prompts::{PromptRegistry, RenderTarget, QNTM_GENERATE};

/// Context descriptor accompanying a QNTM key generation call.
#[derive(Debug, Clone)]
pub struct QntmContext {
    pub file_name: String,
    pub chunk_index: usize,
    pub total_chunks: usize,
}

/// Key generation never fails a chunk; errors come back as a reason beside an
/// empty key list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QntmKeys {
    pub keys: Vec<String>,
    pub reasoning: Option<String>,
    pub error: Option<String>,
}

/// Backend access the pipeline stages go through. A trait seam so tests can
/// run the full pipeline against scripted providers.
#[async_trait]
pub trait PipelineServices: Send + Sync {
    fn text_model_name(&self) -> String;
    fn text_dimension(&self) -> usize;
    fn contextualized_available(&self) -> bool;
    fn contextualized_token_limit(&self) -> usize;
    fn code_embedding_available(&self) -> bool;

    async fn embed_snippet(&self, text: &str) -> Result<Vec<f32>, AppError>;
    /// One call for all chunks of a sub-document. `None` when no
    /// contextualized backend is registered.
    async fn embed_contextualized(
        &self,
        chunks: &[String],
    ) -> Result<Option<Vec<Vec<f32>>>, AppError>;
    async fn embed_code(&self, text: &str) -> Result<Option<Vec<f32>>, AppError>;

    async fn generate_qntm_keys(
        &self,
        text: &str,
        existing_keys: &[String],
        context: QntmContext,
    ) -> QntmKeys;
}

pub struct DefaultPipelineServices {
    registry: Arc<BackendRegistry>,
    prompts: Arc<PromptRegistry>,
    /// Fallback window when the contextualized backend does not report one.
    default_token_limit: usize,
}

impl DefaultPipelineServices {
    pub fn new(
        registry: Arc<BackendRegistry>,
        prompts: Arc<PromptRegistry>,
        default_token_limit: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            prompts,
            default_token_limit,
        })
    }
}

pub fn qntm_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "keys": {
                "type": "array",
                "items": { "type": "string" }
            },
            "reasoning": { "type": "string" }
        },
        "required": ["keys"],
        "additionalProperties": false
    })
}

#[async_trait]
impl PipelineServices for DefaultPipelineServices {
    fn text_model_name(&self) -> String {
        self.registry
            .text_embedding()
            .map(|backend| backend.model_name())
            .unwrap_or_else(|_| "unconfigured".to_string())
    }

    fn text_dimension(&self) -> usize {
        self.registry
            .text_embedding()
            .map(|backend| backend.dimension())
            .unwrap_or(0)
    }

    fn contextualized_available(&self) -> bool {
        self.registry.contextualized_embedding().is_some()
    }

    fn contextualized_token_limit(&self) -> usize {
        self.registry
            .contextualized_embedding()
            .map_or(self.default_token_limit, |backend| {
                backend.safe_token_limit()
            })
    }

    fn code_embedding_available(&self) -> bool {
        self.registry.code_embedding().is_some()
    }

    async fn embed_snippet(&self, text: &str) -> Result<Vec<f32>, AppError> {
        self.registry.text_embedding()?.embed_text(text).await
    }

    async fn embed_contextualized(
        &self,
        chunks: &[String],
    ) -> Result<Option<Vec<Vec<f32>>>, AppError> {
        match self.registry.contextualized_embedding() {
            Some(backend) => backend.embed_contextualized(chunks).await.map(Some),
            None => Ok(None),
        }
    }

    async fn embed_code(&self, text: &str) -> Result<Option<Vec<f32>>, AppError> {
        match self.registry.code_embedding() {
            Some(backend) => backend.embed_code(text).await.map(Some),
            None => Ok(None),
        }
    }

    async fn generate_qntm_keys(
        &self,
        text: &str,
        existing_keys: &[String],
        context: QntmContext,
    ) -> QntmKeys {
        let backend = match self.registry.json_completion_for(Capability::QntmGeneration) {
            Ok(backend) => backend,
            Err(err) => {
                return QntmKeys {
                    keys: Vec::new(),
                    reasoning: None,
                    error: Some(err.to_string()),
                }
            }
        };

        let target = RenderTarget {
            provider: backend.name().to_string(),
            model_family: backend.model_family(),
            capabilities: backend.capabilities().to_vec(),
        };

        let mut vars: HashMap<&str, String> = HashMap::new();
        vars.insert(
            "existing_keys",
            if existing_keys.is_empty() {
                "(none yet)".to_string()
            } else {
                existing_keys.join("\n")
            },
        );
        vars.insert("file_name", context.file_name.clone());
        vars.insert("chunk_index", context.chunk_index.to_string());
        vars.insert("total_chunks", context.total_chunks.to_string());
        vars.insert("text", text.to_string());

        let prompt = match self.prompts.render(QNTM_GENERATE, &target, &vars) {
            Ok(prompt) => prompt,
            Err(err) => {
                return QntmKeys {
                    keys: Vec::new(),
                    reasoning: None,
                    error: Some(err.to_string()),
                }
            }
        };

        #[derive(Deserialize)]
        struct Parsed {
            keys: Vec<String>,
            reasoning: Option<String>,
        }

        let response = backend
            .complete_json(
                "You tag knowledge chunks with stable semantic keys.",
                &prompt,
                "qntm_keys",
                qntm_schema(),
            )
            .await;

        match response.and_then(|value| {
            serde_json::from_value::<Parsed>(value)
                .map_err(|e| AppError::LLMParsing(format!("qntm response shape: {e}")))
        }) {
            Ok(parsed) => {
                debug!(
                    file = %context.file_name,
                    chunk = context.chunk_index,
                    keys = parsed.keys.len(),
                    "qntm keys generated"
                );
                QntmKeys {
                    keys: parsed.keys,
                    reasoning: parsed.reasoning,
                    error: None,
                }
            }
            Err(err) => {
                warn!(
                    file = %context.file_name,
                    chunk = context.chunk_index,
                    error = %err,
                    "qntm key generation failed; continuing with empty keys"
                );
                QntmKeys {
                    keys: Vec::new(),
                    reasoning: None,
                    error: Some(err.to_string()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::backends::embedding::HashedEmbeddingBackend;
    use common::backends::testing::ScriptedLlmBackend;

    fn services_with_llm(
        llm: Option<Arc<ScriptedLlmBackend>>,
    ) -> Arc<DefaultPipelineServices> {
        let mut registry = BackendRegistry::new();
        let hashed = Arc::new(HashedEmbeddingBackend::new(8));
        registry.register_text_embedding(hashed.clone());
        registry.register_contextualized_embedding(hashed.clone());
        registry.register_code_embedding(hashed);
        if let Some(llm) = llm {
            registry.register_json_completion(llm);
        }
        DefaultPipelineServices::new(
            Arc::new(registry),
            Arc::new(PromptRegistry::with_defaults()),
            50_000,
        )
    }

    #[tokio::test]
    async fn qntm_keys_parse_from_scripted_response() {
        let llm = ScriptedLlmBackend::new(vec![serde_json::json!({
            "keys": ["auth.session", "auth.tokens"],
            "reasoning": "both chunks discuss session auth"
        })]);
        let services = services_with_llm(Some(llm.clone()));

        let result = services
            .generate_qntm_keys(
                "session token refresh flow",
                &["auth.session".to_string()],
                QntmContext {
                    file_name: "auth.md".into(),
                    chunk_index: 0,
                    total_chunks: 2,
                },
            )
            .await;

        assert_eq!(result.keys, vec!["auth.session", "auth.tokens"]);
        assert!(result.error.is_none());
        assert_eq!(llm.call_count().await, 1);
    }

    #[tokio::test]
    async fn qntm_failure_yields_empty_keys_with_reason() {
        // Empty script: first call already errors.
        let llm = ScriptedLlmBackend::new(vec![]);
        let services = services_with_llm(Some(llm));

        let result = services
            .generate_qntm_keys(
                "text",
                &[],
                QntmContext {
                    file_name: "x.md".into(),
                    chunk_index: 0,
                    total_chunks: 1,
                },
            )
            .await;

        assert!(result.keys.is_empty());
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn missing_llm_backend_is_not_fatal() {
        let services = services_with_llm(None);
        let result = services
            .generate_qntm_keys(
                "text",
                &[],
                QntmContext {
                    file_name: "x.md".into(),
                    chunk_index: 0,
                    total_chunks: 1,
                },
            )
            .await;
        assert!(result.keys.is_empty());
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn embedding_dimensions_come_from_registry() {
        let services = services_with_llm(None);
        assert_eq!(services.text_dimension(), 8);
        assert!(services.contextualized_available());
        assert!(services.code_embedding_available());
        let vector = services.embed_snippet("hello").await.expect("embed");
        assert_eq!(vector.len(), 8);
    }
}
