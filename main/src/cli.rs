use clap::{Args, Parser, Subcommand, ValueEnum};

/// Persistent context-management engine: ingest developer artifacts, search
/// them semantically, consolidate what accumulates.
#[derive(Debug, Parser)]
#[command(name = "atlas", version, about)]
pub struct Cli {
    /// SurrealDB endpoint, e.g. ws://127.0.0.1:8000
    #[arg(long, global = true)]
    pub db_url: Option<String>,

    /// Voyage API key (overrides config/environment)
    #[arg(long, global = true)]
    pub voyage_key: Option<String>,

    /// Ollama endpoint, e.g. http://localhost:11434/v1
    #[arg(long, global = true)]
    pub ollama_url: Option<String>,

    /// Log level: error, warn, info, debug, trace
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// Per-module log directives, e.g. "ingestion_pipeline=debug"
    #[arg(long, global = true)]
    pub log_modules: Option<String>,

    /// Embedding/key-generation concurrency
    #[arg(short = 'j', long, global = true)]
    pub jobs: Option<usize>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Ingest files or directories
    Ingest(IngestArgs),
    /// Semantic search over stored chunks
    Search(SearchArgs),
    /// Chronological view of stored chunks
    Timeline(TimelineArgs),
    /// Run a consolidation pass
    Consolidate(ConsolidateArgs),
    /// Vector-store administration
    #[command(subcommand)]
    Store(StoreCommand),
    /// Run the daemon in the foreground (or detached)
    Daemon(DaemonArgs),
    /// Ask a running daemon to shut down
    #[command(name = "daemon:stop")]
    DaemonStop,
    /// Show a running daemon's task and lock state
    #[command(name = "daemon:status")]
    DaemonStatus,
    /// Probe external collaborators and report readiness
    Doctor,
    /// Watch paths and ingest files as they change
    Watch(WatchArgs),
    /// File-tracker inspection
    #[command(subcommand)]
    Tracking(TrackingCommand),
}

#[derive(Debug, Args)]
pub struct IngestArgs {
    /// Files or directories to ingest
    #[arg(required = true)]
    pub paths: Vec<String>,

    /// Recurse into directories
    #[arg(long)]
    pub recursive: bool,

    /// Suppress per-file progress output
    #[arg(long)]
    pub quiet: bool,

    /// Embedding backend, provider[:model]
    #[arg(long)]
    pub embedding: Option<String>,

    /// LLM backend, provider[:model]
    #[arg(long)]
    pub llm: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "lowercase")]
pub enum TemperatureArg {
    Hot,
    Warm,
    Cold,
}

#[derive(Debug, Args)]
pub struct SearchArgs {
    pub query: String,

    #[arg(long, default_value_t = 10)]
    pub limit: usize,

    /// Only chunks created at or after this ISO-8601 instant
    #[arg(long)]
    pub since: Option<String>,

    /// Exact QNTM key match
    #[arg(long = "qntm")]
    pub qntm_key: Option<String>,

    #[arg(long)]
    pub rerank: bool,

    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=3))]
    pub consolidation_level: Option<u8>,

    /// text, code or media
    #[arg(long)]
    pub content_type: Option<String>,

    #[arg(long)]
    pub agent_role: Option<String>,

    #[arg(long, value_enum)]
    pub temperature: Option<TemperatureArg>,

    /// Embedding backend, provider[:model]
    #[arg(long)]
    pub embedding: Option<String>,

    /// Force the local reranker on
    #[arg(long)]
    pub reranker: bool,
}

#[derive(Debug, Args)]
pub struct TimelineArgs {
    /// ISO-8601 start of the window
    #[arg(long)]
    pub since: String,

    #[arg(long, default_value_t = 100)]
    pub limit: usize,

    /// Embedding backend, provider[:model]
    #[arg(long)]
    pub embedding: Option<String>,
}

#[derive(Debug, Args)]
pub struct ConsolidateArgs {
    /// Report candidates without mutating anything
    #[arg(long)]
    pub dry_run: bool,

    /// Similarity threshold override
    #[arg(long)]
    pub threshold: Option<f32>,

    /// LLM backend, provider[:model]
    #[arg(long)]
    pub llm: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum StoreCommand {
    /// Drop the active collection
    Drop {
        /// Required confirmation
        #[arg(long)]
        yes: bool,
    },
    /// Toggle the HNSW indexes
    Hnsw {
        #[arg(value_parser = ["on", "off"])]
        state: String,
    },
    /// Hard-delete chunks whose soft-delete grace has elapsed
    Vacuum {
        #[arg(long)]
        force: bool,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[derive(Debug, Args)]
pub struct DaemonArgs {
    /// Fork into the background
    #[arg(long)]
    pub detach: bool,

    /// Watch ingested roots for changes
    #[arg(long)]
    pub watch: bool,

    /// Also listen on localhost TCP
    #[arg(long)]
    pub tcp: Option<u16>,
}

#[derive(Debug, Args)]
pub struct WatchArgs {
    /// Paths to watch (default: current directory)
    #[arg(long = "path")]
    pub paths: Vec<String>,

    /// Only react to files whose name contains this pattern
    #[arg(long)]
    pub pattern: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum TrackingCommand {
    /// Source and chunk counts
    Status,
    /// Remove superseded chunk records past the grace period
    Vacuum {
        #[arg(long)]
        dry_run: bool,
    },
    /// Explain whether a path would be re-ingested
    Check { path: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn ingest_requires_paths() {
        let result = Cli::try_parse_from(["atlas", "ingest"]);
        assert!(result.is_err());
    }

    #[test]
    fn search_parses_the_full_flag_surface() {
        let cli = Cli::try_parse_from([
            "atlas",
            "search",
            "authentication",
            "--limit",
            "5",
            "--since",
            "2025-01-01T00:00:00Z",
            "--qntm",
            "auth.session",
            "--rerank",
            "--consolidation-level",
            "1",
            "--content-type",
            "code",
            "--temperature",
            "hot",
        ])
        .expect("parse");

        match cli.command {
            Command::Search(args) => {
                assert_eq!(args.query, "authentication");
                assert_eq!(args.limit, 5);
                assert_eq!(args.consolidation_level, Some(1));
                assert_eq!(args.temperature, Some(TemperatureArg::Hot));
                assert!(args.rerank);
            }
            other => panic!("expected search, got {other:?}"),
        }
    }

    #[test]
    fn consolidation_level_rejects_out_of_range() {
        assert!(Cli::try_parse_from([
            "atlas",
            "search",
            "q",
            "--consolidation-level",
            "4"
        ])
        .is_err());
    }

    #[test]
    fn daemon_colon_subcommands_parse() {
        assert!(matches!(
            Cli::try_parse_from(["atlas", "daemon:stop"]).expect("parse").command,
            Command::DaemonStop
        ));
        assert!(matches!(
            Cli::try_parse_from(["atlas", "daemon:status"]).expect("parse").command,
            Command::DaemonStatus
        ));
    }

    #[test]
    fn store_subcommands_parse() {
        assert!(matches!(
            Cli::try_parse_from(["atlas", "store", "hnsw", "off"])
                .expect("parse")
                .command,
            Command::Store(StoreCommand::Hnsw { .. })
        ));
        assert!(matches!(
            Cli::try_parse_from(["atlas", "store", "vacuum", "--dry-run"])
                .expect("parse")
                .command,
            Command::Store(StoreCommand::Vacuum { dry_run: true, .. })
        ));
    }
}
