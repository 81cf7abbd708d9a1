use std::sync::Arc;

use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestSystemMessage, ChatCompletionRequestUserMessage,
        CreateChatCompletionRequestArgs, ResponseFormat, ResponseFormatJsonSchema,
    },
    Client,
};
use async_trait::async_trait;

use super::{BackendIdentity, BackendSpec, CanCompleteJson, Capability, LatencyClass};
use crate::error::AppError;
use crate::utils::config::AppConfig;

/// OpenAI-compatible chat backend used for QNTM key generation, consolidation
/// classification and query expansion.
pub struct OpenAiLlmBackend {
    client: Client<OpenAIConfig>,
    provider: String,
    model: String,
    capabilities: Vec<Capability>,
    latency_class: LatencyClass,
}

impl OpenAiLlmBackend {
    pub fn new(
        client: Client<OpenAIConfig>,
        provider: String,
        model: String,
        latency_class: LatencyClass,
    ) -> Self {
        Self {
            client,
            provider,
            model,
            capabilities: vec![
                Capability::TextCompletion,
                Capability::JsonCompletion,
                Capability::QntmGeneration,
            ],
            latency_class,
        }
    }
}

#[async_trait]
impl BackendIdentity for OpenAiLlmBackend {
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
        self.client.models().list().await.is_ok()
    }
}

#[async_trait]
impl CanCompleteJson for OpenAiLlmBackend {
    async fn complete_json(
        &self,
        system: &str,
        user: &str,
        schema_name: &str,
        schema: serde_json::Value,
    ) -> Result<serde_json::Value, AppError> {
        let response_format = ResponseFormat::JsonSchema {
            json_schema: ResponseFormatJsonSchema {
                description: None,
                name: schema_name.into(),
                schema: Some(schema),
                strict: Some(true),
            },
        };

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages([
                ChatCompletionRequestSystemMessage::from(system).into(),
                ChatCompletionRequestUserMessage::from(user).into(),
            ])
            .response_format(response_format)
            .build()?;

        let response = self.client.chat().create(request).await?;

        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.as_ref())
            .ok_or(AppError::LLMParsing(
                "No content found in LLM response".into(),
            ))?;

        serde_json::from_str(content).map_err(|e| {
            AppError::LLMParsing(format!("Failed to parse LLM response as JSON: {e}"))
        })
    }

    fn model_family(&self) -> String {
        // "gpt-4o-mini" -> "gpt-4o", "claude-3-5-haiku" -> family prefix
        self.model
            .split('-')
            .take(2)
            .collect::<Vec<_>>()
            .join("-")
    }
}

/// Build a chat backend from a `provider[:model]` specifier. The `anthropic`
/// and `claude-code` providers route through an OpenAI-compatible gateway
/// configured by `openai_base_url`.
pub fn build_llm_backend(
    spec: &BackendSpec,
    config: &AppConfig,
) -> Result<Arc<OpenAiLlmBackend>, AppError> {
    let (client_provider, latency) = match spec.provider.as_str() {
        "openai" | "anthropic" | "claude-code" => ("openai", LatencyClass::Standard),
        "ollama" => ("ollama", LatencyClass::Fast),
        other => {
            return Err(AppError::Configuration(format!(
                "unknown llm backend: {other}"
            )))
        }
    };

    let client = super::embedding::openai_compatible_client(client_provider, config)?;
    let model = spec
        .model
        .clone()
        .unwrap_or_else(|| "gpt-4o-mini".to_string());

    Ok(Arc::new(OpenAiLlmBackend::new(
        client,
        spec.provider.clone(),
        model,
        latency,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_family_is_a_prefix() {
        let client = Client::with_config(OpenAIConfig::new());
        let backend = OpenAiLlmBackend::new(
            client,
            "openai".into(),
            "gpt-4o-mini".into(),
            LatencyClass::Standard,
        );
        assert_eq!(backend.model_family(), "gpt-4o");
    }

    #[test]
    fn unknown_llm_provider_is_rejected() {
        let config = AppConfig::for_tests();
        let spec: BackendSpec = "smoke-signals:v1".parse().expect("spec");
        assert!(matches!(
            build_llm_backend(&spec, &config),
            Err(AppError::Configuration(_))
        ));
    }
}
