use std::sync::Arc;

use anyhow::Context;

use outreach::app::{Collaborators, Outreach};
use outreach::config::OutreachConfig;
use outreach::sequence::{SequenceDefinition, parse_schedule, spawn_cron_ticker};
use outreach::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = OutreachConfig::from_env().context("invalid configuration")?;

    eprintln!("Outreach v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Sequence: {}", config.sequence_path.display());
    eprintln!("   Scheduler cron: {}", config.scheduler_cron);
    eprintln!("   Supervisor every {}s", config.supervisor_interval.as_secs());
    if config.dry_run {
        eprintln!("   Dry run: SMS and EMAIL are logged, not sent");
    }

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", config.db_path.display()))?,
    );

    // ── Sequence ─────────────────────────────────────────────────────────
    let sequence = SequenceDefinition::load(&config.sequence_path).with_context(|| {
        format!(
            "failed to load sequence from {}",
            config.sequence_path.display()
        )
    })?;
    tracing::info!(name = %sequence.name, steps = sequence.len(), "Sequence loaded");

    let schedule = parse_schedule(&config.scheduler_cron)?;
    let outreach = Outreach::new(
        &config,
        Arc::clone(&db),
        sequence,
        Collaborators::from_config(&config),
    );

    // ── Background drivers ───────────────────────────────────────────────
    let _ticker = spawn_cron_ticker(Arc::clone(&outreach.scheduler), schedule);
    let supervisor = Arc::clone(&outreach.supervisor).start();

    // ── HTTP ─────────────────────────────────────────────────────────────
    let app = outreach.router();
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.http_port))
        .await
        .with_context(|| format!("failed to bind port {}", config.http_port))?;
    tracing::info!(port = config.http_port, "HTTP server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Could not listen for shutdown signal");
            }
        })
        .await
        .context("HTTP server failed")?;

    tracing::info!("Shutting down");
    supervisor.stop().await;
    Ok(())
}
