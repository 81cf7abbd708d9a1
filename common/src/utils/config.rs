use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    #[serde(default = "default_surrealdb_address")]
    pub surrealdb_address: String,
    #[serde(default = "default_surrealdb_credential")]
    pub surrealdb_username: String,
    #[serde(default = "default_surrealdb_credential")]
    pub surrealdb_password: String,
    #[serde(default = "default_surrealdb_scope")]
    pub surrealdb_namespace: String,
    #[serde(default = "default_surrealdb_scope")]
    pub surrealdb_database: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Backend specifier for text embeddings, `provider[:model]`.
    #[serde(default = "default_embedding_backend")]
    pub embedding_backend: String,
    /// Backend specifier for code embeddings; none means code chunks only get
    /// a text vector.
    #[serde(default)]
    pub code_embedding_backend: Option<String>,
    /// Backend specifier for the LLM used for QNTM keys, classification and
    /// query expansion.
    #[serde(default = "default_llm_backend")]
    pub llm_backend: String,

    #[serde(default)]
    pub openai_api_key: Option<String>,
    #[serde(default = "default_openai_base_url")]
    pub openai_base_url: String,
    #[serde(default = "default_ollama_url")]
    pub ollama_url: String,
    #[serde(default)]
    pub voyage_key: Option<String>,
    #[serde(default = "default_voyage_base_url")]
    pub voyage_base_url: String,

    /// Dimension used when the backend cannot report one (hashed, remote
    /// OpenAI-compatible endpoints).
    #[serde(default = "default_embedding_dimension")]
    pub embedding_dimension: usize,
    /// Token budget per contextualized-embedding call.
    #[serde(default = "default_contextualized_token_limit")]
    pub contextualized_safe_token_limit: usize,

    #[serde(default)]
    pub reranking_enabled: bool,
    #[serde(default)]
    pub reranking_pool_size: Option<usize>,
    #[serde(default)]
    pub fastembed_cache_dir: Option<String>,

    /// Unix socket the daemon listens on; defaults under `data_dir`.
    #[serde(default)]
    pub daemon_socket: Option<String>,
    #[serde(default)]
    pub daemon_tcp_port: Option<u16>,

    /// Documents ingested between automatic consolidation passes.
    #[serde(default = "default_consolidation_threshold")]
    pub consolidation_threshold: u64,
    /// Watchdog poll interval in seconds.
    #[serde(default = "default_watchdog_poll_secs")]
    pub watchdog_poll_secs: u64,
    /// Days a soft-deleted chunk survives before vacuum may remove it.
    #[serde(default = "default_grace_period_days")]
    pub vacuum_grace_days: i64,
}

fn default_surrealdb_address() -> String {
    "ws://127.0.0.1:8000".to_string()
}

fn default_surrealdb_credential() -> String {
    "root".to_string()
}

fn default_surrealdb_scope() -> String {
    "atlas".to_string()
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_embedding_backend() -> String {
    "fastembed".to_string()
}

fn default_llm_backend() -> String {
    "openai:gpt-4o-mini".to_string()
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_ollama_url() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_voyage_base_url() -> String {
    "https://api.voyageai.com/v1".to_string()
}

fn default_embedding_dimension() -> usize {
    384
}

fn default_contextualized_token_limit() -> usize {
    100_000
}

fn default_consolidation_threshold() -> u64 {
    100
}

fn default_watchdog_poll_secs() -> u64 {
    30
}

fn default_grace_period_days() -> i64 {
    14
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::with_prefix("ATLAS"))
        .build()?;

    config.try_deserialize()
}

#[cfg(any(test, feature = "test-utils"))]
impl AppConfig {
    /// Offline configuration for tests: in-memory database, hashed embeddings.
    pub fn for_tests() -> Self {
        Self {
            surrealdb_address: "mem://".into(),
            surrealdb_username: "root".into(),
            surrealdb_password: "root".into(),
            surrealdb_namespace: "atlas_test".into(),
            surrealdb_database: "atlas_test".into(),
            data_dir: std::env::temp_dir()
                .join("atlas-test")
                .to_string_lossy()
                .into_owned(),
            embedding_backend: "hashed".into(),
            code_embedding_backend: None,
            llm_backend: "openai:gpt-4o-mini".into(),
            openai_api_key: None,
            openai_base_url: default_openai_base_url(),
            ollama_url: default_ollama_url(),
            voyage_key: None,
            voyage_base_url: default_voyage_base_url(),
            embedding_dimension: 16,
            contextualized_safe_token_limit: default_contextualized_token_limit(),
            reranking_enabled: false,
            reranking_pool_size: None,
            fastembed_cache_dir: None,
            daemon_socket: None,
            daemon_tcp_port: None,
            consolidation_threshold: default_consolidation_threshold(),
            watchdog_poll_secs: default_watchdog_poll_secs(),
            vacuum_grace_days: default_grace_period_days(),
        }
    }
}
