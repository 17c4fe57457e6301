// SPDX-License-Identifier: GPL-3.0-or-later
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::serve;
use clap::{Parser, Subcommand};
use reelwright_api::{router, ApiState};
use reelwright_application::{ResolutionDecision, ResolutionOverrides, Services};
use reelwright_config::{load as load_config, AppConfig, TelemetryConfig};
use reelwright_domain::{PipelineState, ReleaseId, SourceRef};
use reelwright_infrastructure::{init_database, ReleaseRepository, SqliteReleaseRepository};
use reelwright_scheduler::Scheduler;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "reelwright", version, about = "Film acquisition and library placement pipeline")]
struct Cli {
    /// TOML configuration file; REELWRIGHT_* variables override it.
    #[arg(short, long, env = "REELWRIGHT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the workers and the HTTP API (default).
    Serve,
    /// List releases awaiting intervention.
    Pending,
    /// Send a release awaiting intervention back to a stage.
    Resume {
        id: String,
        /// Stage to resume at, e.g. `resolving` or `downloading`.
        stage: String,
        /// Replacement source reference.
        #[arg(long)]
        source_ref: Option<String>,
    },
    /// Abandon a release awaiting intervention.
    Abandon { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    init_tracing(&config.telemetry);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve_all(config).await,
        Command::Pending => list_pending(&config).await,
        Command::Resume {
            id,
            stage,
            source_ref,
        } => {
            let target: PipelineState = stage.parse().with_context(|| format!("unknown stage {stage}"))?;
            let decision = ResolutionDecision {
                overrides: ResolutionOverrides {
                    source_ref: source_ref.map(SourceRef::new),
                    spec: None,
                },
                ..ResolutionDecision::resume(target)
            };
            resolve(&config, &id, decision).await
        }
        Command::Abandon { id } => resolve(&config, &id, ResolutionDecision::abandon()).await,
    }
}

async fn services(config: &AppConfig, shutdown: CancellationToken) -> Result<Services> {
    let pool = init_database(config).await?;
    let store: Arc<dyn ReleaseRepository> = Arc::new(SqliteReleaseRepository::new(pool));
    Services::from_config(config, store, shutdown)
}

async fn serve_all(config: AppConfig) -> Result<()> {
    let shutdown = CancellationToken::new();
    let services = services(&config, shutdown.clone()).await?;

    let scheduler = Scheduler::new(&config, services.clone());
    scheduler.register_jobs().await;
    let scheduler_handle = scheduler.start(shutdown.clone());

    let listener = TcpListener::bind(bind_addr(&config.http)?).await?;
    let addr = listener.local_addr()?;
    info!(target: "cli", "listening on {}", addr);

    let state = ApiState::new(services, config.http.api_key.clone());
    serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    // The server can also stop on its own; make sure the workers follow.
    shutdown.cancel();
    scheduler_handle.await??;
    info!(target: "cli", "shutdown complete");
    Ok(())
}

async fn list_pending(config: &AppConfig) -> Result<()> {
    let services = services(config, CancellationToken::new()).await?;
    let pending = services.coordinator.list_pending().await?;
    if pending.is_empty() {
        println!("no releases awaiting intervention");
    }
    for release in pending {
        let (stage, reason, message) = release
            .failure
            .as_ref()
            .map(|f| (f.stage.to_string(), f.reason.to_string(), f.message.clone()))
            .unwrap_or_default();
        println!(
            "{}  {}  {} at {}: {}",
            release.id, release.metadata.title, reason, stage, message
        );
    }
    Ok(())
}

async fn resolve(config: &AppConfig, id: &str, decision: ResolutionDecision) -> Result<()> {
    let id = ReleaseId::parse(id).with_context(|| format!("invalid release id {id}"))?;
    let services = services(config, CancellationToken::new()).await?;
    let release = services.coordinator.resolve(id, decision).await?;
    println!("{} is now {}", release.id, release.state);
    Ok(())
}

fn init_tracing(telemetry: &TelemetryConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&telemetry.log_level));

    let registry = tracing_subscriber::registry().with(env_filter);
    if telemetry.json {
        registry
            .with(fmt::layer().json().with_target(true).with_current_span(true))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_names(true).with_level(true))
            .init();
    }
}

fn bind_addr(http: &reelwright_config::HttpConfig) -> Result<SocketAddr> {
    let addr = format!("{}:{}", http.host, http.port);
    addr.parse()
        .with_context(|| format!("invalid listen address {addr}"))
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = terminate.recv() => {},
                    _ = shutdown.cancelled() => {},
                }
            }
            Err(err) => {
                warn!(target: "cli", error = %err, "cannot listen for SIGTERM");
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = shutdown.cancelled() => {},
                }
            }
        }
    }

    #[cfg(not(unix))]
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = shutdown.cancelled() => {},
    }

    info!(target: "cli", "shutdown signal received");
    shutdown.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_addr_parsing() {
        let http = reelwright_config::HttpConfig {
            host: "127.0.0.1".to_string(),
            port: 5160,
            api_key: None,
        };
        let addr = bind_addr(&http).unwrap();
        assert_eq!(addr.port(), 5160);
        assert!(addr.is_ipv4());
    }

    #[test]
    fn bind_addr_ipv6() {
        let http = reelwright_config::HttpConfig {
            host: "[::1]".to_string(),
            port: 8080,
            api_key: None,
        };
        assert!(bind_addr(&http).unwrap().is_ipv6());
    }

    #[test]
    fn bind_addr_rejects_hostnames() {
        let http = reelwright_config::HttpConfig {
            host: "media-box".to_string(),
            port: 8080,
            api_key: None,
        };
        assert!(bind_addr(&http).is_err());
    }

    #[test]
    fn serve_is_the_default_command() {
        let cli = Cli::try_parse_from(["reelwright"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn resume_takes_an_optional_source() {
        let cli = Cli::try_parse_from([
            "reelwright",
            "--config",
            "reelwright.toml",
            "resume",
            "3f2b",
            "resolving",
            "--source-ref",
            "https://mirror.example/f",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("reelwright.toml")));
        match cli.command {
            Some(Command::Resume {
                stage, source_ref, ..
            }) => {
                assert_eq!(stage, "resolving");
                assert_eq!(source_ref.as_deref(), Some("https://mirror.example/f"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
