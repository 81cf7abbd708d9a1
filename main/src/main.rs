mod bootstrap;
mod cli;
mod client;
mod commands;
mod doctor;
mod watch;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use common::error::AppError;
use common::events::AtlasEvent;
use daemon::{DaemonRouter, DaemonServer, DaemonState};
use ingestion_pipeline::watchdog::{ConsolidationRunner, WatchdogConfig};
use ingestion_pipeline::ConsolidationWatchdog;

use crate::bootstrap::{build_context, daemon_socket, load_config, CliOverrides};
use crate::cli::{Cli, Command, DaemonArgs};

fn init_tracing(level: &str, modules: Option<&str>) {
    let mut directives = level.to_string();
    if let Some(modules) = modules {
        directives.push(',');
        directives.push_str(modules);
    }
    let filter = EnvFilter::try_new(directives).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .ok();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_modules.as_deref());

    let code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            error!("{err}");
            eprintln!("error: {err}");
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32, AppError> {
    let mut overrides = CliOverrides {
        db_url: cli.db_url,
        voyage_key: cli.voyage_key,
        ollama_url: cli.ollama_url,
        jobs: cli.jobs,
        ..CliOverrides::default()
    };

    match cli.command {
        Command::Ingest(args) => {
            overrides.embedding = args.embedding.clone();
            overrides.llm = args.llm.clone();
            let ctx = build_context(&overrides).await?;
            commands::ingest(&ctx, args).await
        }
        Command::Search(args) => {
            overrides.embedding = args.embedding.clone();
            overrides.force_reranker = args.reranker;
            let ctx = build_context(&overrides).await?;
            commands::search(&ctx, args).await
        }
        Command::Timeline(args) => {
            overrides.embedding = args.embedding.clone();
            let ctx = build_context(&overrides).await?;
            commands::timeline(&ctx, args).await
        }
        Command::Consolidate(args) => {
            overrides.llm = args.llm.clone();
            let ctx = build_context(&overrides).await?;
            commands::consolidate(&ctx, args).await
        }
        Command::Store(command) => {
            let ctx = build_context(&overrides).await?;
            commands::store(&ctx, command).await
        }
        Command::Daemon(args) => run_daemon(overrides, args).await,
        Command::DaemonStop => {
            let config = load_config(&overrides)?;
            let result = client::call(
                &daemon_socket(&config),
                "atlas.daemon.stop",
                serde_json::json!({}),
            )
            .await?;
            println!("daemon stopping: {}", result["stopping"] == true);
            Ok(0)
        }
        Command::DaemonStatus => {
            let config = load_config(&overrides)?;
            let socket = daemon_socket(&config);
            let status =
                client::call(&socket, "atlas.daemon.status", serde_json::json!({})).await?;
            let tasks =
                client::call(&socket, "atlas.ingest.status", serde_json::json!({})).await?;
            println!(
                "tasks: {}, consolidation locked: {}, watches: {}",
                status["tasks"], status["consolidationLocked"], status["watches"]
            );
            if let Some(tasks) = tasks.as_array() {
                for task in tasks {
                    println!(
                        "  {} {} files={} chunks={}",
                        task["taskId"].as_str().unwrap_or("?"),
                        task["status"].as_str().unwrap_or("?"),
                        task["filesProcessed"],
                        task["chunksStored"]
                    );
                }
            }
            Ok(0)
        }
        Command::Doctor => {
            let ctx = build_context(&overrides).await?;
            Ok(doctor::run(&ctx).await)
        }
        Command::Watch(args) => {
            let ctx = build_context(&overrides).await?;
            let roots = if args.paths.is_empty() {
                vec![std::env::current_dir()?]
            } else {
                args.paths.iter().map(std::path::PathBuf::from).collect()
            };
            watch::run_watch(ctx.pipeline(), ctx.events.clone(), roots, args.pattern).await?;
            Ok(0)
        }
        Command::Tracking(command) => {
            let ctx = build_context(&overrides).await?;
            commands::tracking(&ctx, command).await
        }
    }
}

async fn run_daemon(overrides: CliOverrides, args: DaemonArgs) -> Result<i32, AppError> {
    if args.detach {
        return detach_daemon();
    }

    let ctx = build_context(&overrides).await?;
    let socket = daemon_socket(&ctx.config);

    let watchdog = ConsolidationWatchdog::new(
        ctx.pause.clone(),
        WatchdogConfig {
            poll_interval: Duration::from_secs(ctx.config.watchdog_poll_secs),
            threshold: ctx.config.consolidation_threshold,
        },
        Arc::clone(&ctx.engine) as Arc<dyn ConsolidationRunner>,
    );
    let pipeline = ctx.pipeline_with_watchdog(Some(Arc::clone(&watchdog)));

    let state = Arc::new(DaemonState::new());
    let router = DaemonRouter::new(
        Arc::clone(&pipeline),
        Arc::clone(&ctx.search),
        Arc::clone(&ctx.engine),
        Arc::clone(&ctx.services),
        Arc::clone(&state),
        ctx.events.clone(),
        std::env::current_dir()?,
    );
    let server = DaemonServer::new(Arc::clone(&router));

    let unix_task = tokio::spawn(Arc::clone(&server).serve_unix(socket.clone()));
    let tcp_task = args
        .tcp
        .map(|port| tokio::spawn(Arc::clone(&server).serve_tcp(port)));
    let watchdog_task = tokio::spawn(Arc::clone(&watchdog).run());
    let watch_task = if args.watch {
        let roots = vec![std::env::current_dir()?];
        Some(tokio::spawn(watch::run_watch(
            Arc::clone(&pipeline),
            ctx.events.clone(),
            roots,
            None,
        )))
    } else {
        None
    };

    info!(socket = %socket.display(), "daemon running; ctrl-c to stop");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received");
        }
        _ = state.wait_shutdown() => {
            info!("shutdown requested over rpc");
        }
    }

    ctx.events.emit(AtlasEvent::DaemonStopping);
    // Give subscribers one beat to see the stopping event.
    tokio::time::sleep(Duration::from_millis(50)).await;

    unix_task.abort();
    if let Some(task) = tcp_task {
        task.abort();
    }
    watchdog_task.abort();
    if let Some(task) = watch_task {
        task.abort();
    }
    daemon::server::cleanup_socket(&socket);

    Ok(0)
}

/// Re-exec ourselves in the background without `--detach`.
fn detach_daemon() -> Result<i32, AppError> {
    let exe = std::env::current_exe()?;
    let args: Vec<String> = std::env::args()
        .skip(1)
        .filter(|arg| arg != "--detach")
        .collect();

    let child = std::process::Command::new(exe)
        .args(args)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()?;

    println!("daemon started with pid {}", child.id());
    Ok(0)
}
