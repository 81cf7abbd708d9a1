use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    sync::Arc,
};

use anyhow::{anyhow, Context};
use async_openai::{config::OpenAIConfig, types::CreateEmbeddingRequestArgs, Client};
use async_trait::async_trait;
use fastembed::{EmbeddingModel, ModelTrait, TextEmbedding, TextInitOptions};
use tokio::sync::Mutex;
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    Retry,
};
use tracing::debug;

use super::{BackendIdentity, BackendSpec, CanEmbedCode, CanEmbedContextualized, CanEmbedText,
    Capability, LatencyClass};
use crate::error::AppError;
use crate::utils::config::AppConfig;

/// Rough token estimate used for contextualized window budgeting.
pub fn estimate_tokens(text: &str) -> usize {
    // ~4 chars per token holds well enough across prose and code.
    text.chars().count().div_ceil(4)
}

// ---------------------------------------------------------------------------
// OpenAI-compatible embedding backend (OpenAI, Ollama, Voyage-style gateways)
// ---------------------------------------------------------------------------

pub struct OpenAiEmbeddingBackend {
    client: Client<OpenAIConfig>,
    provider: String,
    model: String,
    dimension: usize,
    capabilities: Vec<Capability>,
    latency_class: LatencyClass,
    safe_token_limit: usize,
}

impl OpenAiEmbeddingBackend {
    pub fn new(
        client: Client<OpenAIConfig>,
        provider: String,
        model: String,
        dimension: usize,
        capabilities: Vec<Capability>,
        latency_class: LatencyClass,
        safe_token_limit: usize,
    ) -> Self {
        Self {
            client,
            provider,
            model,
            dimension,
            capabilities,
            latency_class,
            safe_token_limit,
        }
    }

    async fn embed_inputs(&self, inputs: Vec<String>) -> Result<Vec<Vec<f32>>, AppError> {
        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.model)
            .input(inputs)
            .build()?;

        let retry_strategy = ExponentialBackoff::from_millis(100).map(jitter).take(3);
        let response = Retry::spawn(retry_strategy, || async {
            self.client.embeddings().create(request.clone()).await
        })
        .await?;

        if response.data.is_empty() {
            return Err(AppError::LLMParsing(
                "No embedding data received from API".into(),
            ));
        }

        let mut ordered = response.data;
        ordered.sort_by_key(|d| d.index);
        Ok(ordered.into_iter().map(|d| d.embedding).collect())
    }
}

#[async_trait]
impl BackendIdentity for OpenAiEmbeddingBackend {
    fn name(&self) -> &str {
        &self.provider
    }

    fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    fn latency_class(&self) -> LatencyClass {
        self.latency_class
    }

    async fn is_available(&self) -> bool {
        // A one-token embedding round-trip doubles as the health probe.
        self.embed_inputs(vec!["ping".to_string()]).await.is_ok()
    }
}

#[async_trait]
impl CanEmbedText for OpenAiEmbeddingBackend {
    async fn embed_text(&self, input: &str) -> Result<Vec<f32>, AppError> {
        let mut vectors = self.embed_inputs(vec![input.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| AppError::LLMParsing("No embedding data received".into()))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> String {
        self.model.clone()
    }
}

#[async_trait]
impl CanEmbedCode for OpenAiEmbeddingBackend {
    async fn embed_code(&self, input: &str) -> Result<Vec<f32>, AppError> {
        self.embed_text(input).await
    }

    fn code_dimension(&self) -> usize {
        self.dimension
    }
}

#[async_trait]
impl CanEmbedContextualized for OpenAiEmbeddingBackend {
    async fn embed_contextualized(&self, chunks: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        let vectors = self.embed_inputs(chunks.to_vec()).await?;
        if vectors.len() != chunks.len() {
            return Err(AppError::LLMParsing(format!(
                "contextualized call returned {} vectors for {} chunks",
                vectors.len(),
                chunks.len()
            )));
        }
        Ok(vectors)
    }

    fn safe_token_limit(&self) -> usize {
        self.safe_token_limit
    }
}

// ---------------------------------------------------------------------------
// FastEmbed local backend
// ---------------------------------------------------------------------------

pub struct FastEmbedBackend {
    model: Arc<Mutex<TextEmbedding>>,
    model_code: String,
    dimension: usize,
    capabilities: Vec<Capability>,
}

impl FastEmbedBackend {
    pub async fn load(model_code: Option<&str>) -> Result<Self, AppError> {
        let model_name = match model_code {
            Some(code) => code
                .parse::<EmbeddingModel>()
                .map_err(|err| AppError::Configuration(format!("unknown fastembed model: {err}")))?,
            None => EmbeddingModel::default(),
        };

        let options = TextInitOptions::new(model_name.clone()).with_show_download_progress(true);
        let model_name_for_task = model_name.clone();
        let model_name_code = model_name.to_string();

        let (model, dimension) = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
            let model =
                TextEmbedding::try_new(options).context("initialising FastEmbed text model")?;
            let info = EmbeddingModel::get_model_info(&model_name_for_task)
                .ok_or_else(|| anyhow!("FastEmbed model metadata missing for {model_name_code}"))?;
            Ok((model, info.dim))
        })
        .await
        .context("joining FastEmbed initialisation task")?
        .map_err(AppError::Anyhow)?;

        debug!(model = %model_name, dimension, "fastembed backend loaded");

        Ok(Self {
            model: Arc::new(Mutex::new(model)),
            model_code: model_name.to_string(),
            dimension,
            capabilities: vec![Capability::TextEmbedding],
        })
    }
}

#[async_trait]
impl BackendIdentity for FastEmbedBackend {
    fn name(&self) -> &str {
        "fastembed"
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
impl CanEmbedText for FastEmbedBackend {
    async fn embed_text(&self, input: &str) -> Result<Vec<f32>, AppError> {
        let mut guard = self.model.lock().await;
        let embeddings = guard
            .embed(vec![input.to_owned()], None)
            .context("generating fastembed vector")?;
        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| AppError::InternalError("fastembed returned no embedding".into()))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> String {
        self.model_code.clone()
    }
}

// ---------------------------------------------------------------------------
// Hashed backend: deterministic, offline, test- and fallback-grade
// ---------------------------------------------------------------------------

pub struct HashedEmbeddingBackend {
    name: String,
    dimension: usize,
    priority: u8,
    capabilities: Vec<Capability>,
}

impl HashedEmbeddingBackend {
    pub fn new(dimension: usize) -> Self {
        Self::named("hashed", dimension, 0)
    }

    pub fn named(name: &str, dimension: usize, priority: u8) -> Self {
        Self {
            name: name.to_string(),
            dimension: dimension.max(1),
            priority,
            capabilities: vec![
                Capability::TextEmbedding,
                Capability::CodeEmbedding,
                Capability::ContextualizedEmbedding,
            ],
        }
    }
}

#[async_trait]
impl BackendIdentity for HashedEmbeddingBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    fn latency_class(&self) -> LatencyClass {
        LatencyClass::Local
    }

    fn priority(&self) -> u8 {
        self.priority
    }

    async fn is_available(&self) -> bool {
        true
    }
}

#[async_trait]
impl CanEmbedText for HashedEmbeddingBackend {
    async fn embed_text(&self, input: &str) -> Result<Vec<f32>, AppError> {
        Ok(hashed_embedding(input, self.dimension))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> String {
        "hashed".to_string()
    }
}

#[async_trait]
impl CanEmbedCode for HashedEmbeddingBackend {
    async fn embed_code(&self, input: &str) -> Result<Vec<f32>, AppError> {
        Ok(hashed_embedding(input, self.dimension))
    }

    fn code_dimension(&self) -> usize {
        self.dimension
    }
}

#[async_trait]
impl CanEmbedContextualized for HashedEmbeddingBackend {
    async fn embed_contextualized(&self, chunks: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        Ok(chunks
            .iter()
            .map(|chunk| hashed_embedding(chunk, self.dimension))
            .collect())
    }

    fn safe_token_limit(&self) -> usize {
        100_000
    }
}

fn hashed_embedding(text: &str, dimension: usize) -> Vec<f32> {
    let dim = dimension.max(1);
    let mut vector = vec![0.0f32; dim];
    if text.is_empty() {
        return vector;
    }

    for token in tokens(text) {
        let idx = bucket(&token, dim);
        if let Some(slot) = vector.get_mut(idx) {
            *slot += 1.0;
        }
    }

    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in &mut vector {
            *value /= norm;
        }
    }

    vector
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(|token| token.to_ascii_lowercase())
}

fn bucket(token: &str, dimension: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    token.hash(&mut hasher);
    (hasher.finish() as usize) % dimension
}

// ---------------------------------------------------------------------------
// Spec-driven construction
// ---------------------------------------------------------------------------

/// Build an OpenAI-compatible client for the given provider name.
pub fn openai_compatible_client(
    provider: &str,
    config: &AppConfig,
) -> Result<Client<OpenAIConfig>, AppError> {
    let (base_url, api_key) = match provider {
        "openai" => (
            config.openai_base_url.clone(),
            config.openai_api_key.clone().unwrap_or_default(),
        ),
        "ollama" => (config.ollama_url.clone(), "ollama".to_string()),
        "voyage" => (
            config.voyage_base_url.clone(),
            config.voyage_key.clone().ok_or_else(|| {
                AppError::Configuration("voyage backend requires a voyage key".into())
            })?,
        ),
        other => {
            return Err(AppError::Configuration(format!(
                "unknown backend provider: {other}"
            )))
        }
    };

    Ok(Client::with_config(
        OpenAIConfig::new()
            .with_api_key(api_key)
            .with_api_base(base_url),
    ))
}

/// Text-embedding backend (with contextualized + code capability where the
/// provider supports it) from a `provider[:model]` specifier.
pub async fn build_text_embedding(
    spec: &BackendSpec,
    config: &AppConfig,
) -> Result<TextEmbeddingHandles, AppError> {
    match spec.provider.as_str() {
        "hashed" => {
            let backend = Arc::new(HashedEmbeddingBackend::new(config.embedding_dimension));
            Ok(TextEmbeddingHandles {
                text: backend.clone(),
                contextualized: Some(backend.clone()),
                code: Some(backend),
            })
        }
        "fastembed" => {
            let backend = Arc::new(FastEmbedBackend::load(spec.model.as_deref()).await?);
            Ok(TextEmbeddingHandles {
                text: backend,
                contextualized: None,
                code: None,
            })
        }
        provider @ ("openai" | "ollama" | "voyage") => {
            let client = openai_compatible_client(provider, config)?;
            let model = spec
                .model
                .clone()
                .unwrap_or_else(|| default_model_for(provider).to_string());
            let latency = if provider == "ollama" {
                LatencyClass::Fast
            } else {
                LatencyClass::Standard
            };
            let backend = Arc::new(OpenAiEmbeddingBackend::new(
                client,
                provider.to_string(),
                model,
                config.embedding_dimension,
                vec![
                    Capability::TextEmbedding,
                    Capability::CodeEmbedding,
                    Capability::ContextualizedEmbedding,
                ],
                latency,
                config.contextualized_safe_token_limit,
            ));
            Ok(TextEmbeddingHandles {
                text: backend.clone(),
                contextualized: Some(backend.clone()),
                code: Some(backend),
            })
        }
        other => Err(AppError::Configuration(format!(
            "unknown embedding backend: {other}"
        ))),
    }
}

fn default_model_for(provider: &str) -> &'static str {
    match provider {
        "ollama" => "nomic-embed-text",
        "voyage" => "voyage-3-large",
        _ => "text-embedding-3-small",
    }
}

/// The handles one embedding spec yields; the same object may serve several
/// capabilities.
pub struct TextEmbeddingHandles {
    pub text: Arc<dyn CanEmbedText>,
    pub contextualized: Option<Arc<dyn CanEmbedContextualized>>,
    pub code: Option<Arc<dyn CanEmbedCode>>,
}
