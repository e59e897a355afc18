//! otx-connector entry point.
//!
//! Loads config, sets up tracing, optionally starts the status server, and
//! hands control to the scheduler until it completes or a signal arrives.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use otx_audit::{open_units, verify_chain, ChainCheck};
use otx_daemon::{
    bootstrap,
    cli::{AuditCmd, Cli, Commands},
    routes, state,
};
use otx_runtime::SchedulerExit;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{info, warn, Level};

#[tokio::main]
async fn main() -> Result<()> {
    // Silent if absent; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    let cli = Cli::parse();

    match cli.command() {
        Commands::Run { once } => run(&cli, once).await,
        Commands::CheckConfig => check_config(&cli),
        Commands::Audit { cmd } => audit(cmd),
    }
}

async fn run(cli: &Cli, once: bool) -> Result<()> {
    let boot = bootstrap::load(&cli.config, |k| std::env::var(k).ok())?;
    init_tracing(&boot.snapshot.connector.log_level);

    let c = &boot.snapshot.connector;
    info!(
        connector = %c.id,
        config_hash = %boot.loaded.config_hash,
        cadence = %boot.snapshot.cadence,
        "config loaded"
    );
    for pointer in &boot.unknown.unknown_leaf_pointers {
        warn!(pointer = %pointer, "unknown config key ignored");
    }

    let scheduler = bootstrap::build_scheduler(&boot.snapshot, once)?;

    if let Some(addr) = c.status_addr {
        let shared = Arc::new(state::AppState::new(scheduler.subscribe()));
        let app = routes::build_router(shared).layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        );
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind status server {addr}"))?;
        info!("status server listening on http://{}", addr);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!(error = %e, "status server crashed");
            }
        });
    }

    match scheduler.run(shutdown_signal()).await {
        SchedulerExit::Completed => info!("run-once tick finished, exiting"),
        SchedulerExit::Terminated => info!("shutdown signal received, exiting"),
    }
    Ok(())
}

fn check_config(cli: &Cli) -> Result<()> {
    let boot = bootstrap::load(&cli.config, |k| std::env::var(k).ok())?;
    println!("config_hash={}", boot.loaded.config_hash);
    println!("cadence={}", boot.snapshot.cadence);
    println!("{:#?}", boot.snapshot);
    if !boot.unknown.is_clean() {
        println!("unknown_keys:");
        for pointer in &boot.unknown.unknown_leaf_pointers {
            println!("  {pointer}");
        }
    }
    Ok(())
}

fn audit(cmd: AuditCmd) -> Result<()> {
    match cmd {
        AuditCmd::OpenUnits { work_log } => {
            let units = open_units(&work_log)?;
            println!("{}", serde_json::to_string_pretty(&units)?);
        }
        AuditCmd::Verify { work_log } => match verify_chain(&work_log)? {
            ChainCheck::Intact { records } => println!("work_log=ok records={records}"),
            ChainCheck::Broken { line, reason } => {
                bail!("work log hash chain broken at line {line}: {reason}")
            }
        },
    }
    Ok(())
}

/// RUST_LOG wins over the configured level.
fn init_tracing(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "ctrl_c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
