use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use cron_worker::{
    build_scheduler, run_once_gated, LogNotifier, PgStore, WebhookNotifier, WorkerConfig,
    WorkerStores,
};
use oncall_coordination::{NotificationSender, SchedulerGate, SystemClock};

/// Runs the escalation cron scheduler against the incident database
#[derive(Debug, Parser)]
#[command(name = "cron-worker", version)]
struct Args {
    /// TOML configuration file
    #[arg(long, env = "CRON_WORKER_CONFIG")]
    config: Option<PathBuf>,

    /// Postgres connection string; overrides the config file and DATABASE_URL
    #[arg(long)]
    database_url: Option<String>,

    /// Run a single tick and exit
    #[arg(long)]
    once: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Create the worker-owned tables before starting
    #[arg(long)]
    apply_schema: bool,
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let mut config =
        WorkerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(url) = args.database_url {
        config.database_url = Some(url);
    }
    config.apply_schema |= args.apply_schema;
    config.validate().context("Invalid configuration")?;

    let store = PgStore::connect(config.database_url()?)
        .await
        .context("Failed to connect to Postgres")?;
    if config.apply_schema {
        store
            .apply_schema()
            .await
            .context("Failed to apply worker schema")?;
    }

    let sender: Arc<dyn NotificationSender> = match &config.notify.webhook_url {
        Some(url) => Arc::new(
            WebhookNotifier::new(url.clone(), &config.notify)
                .context("Failed to build webhook notifier")?,
        ),
        None => {
            tracing::warn!("NOTIFY_WEBHOOK_URL not set; pages will only be logged");
            Arc::new(LogNotifier)
        }
    };

    let scheduler = build_scheduler(
        WorkerStores::postgres(store),
        sender,
        SystemClock::shared(),
        &config,
    );

    let gate = SchedulerGate::from_env();
    if args.once {
        let Some(report) = run_once_gated(&scheduler, &gate).await else {
            return Ok(());
        };
        info!(
            acquired_lock = report.acquired_lock,
            jobs = report.jobs.len(),
            failures = report.failures.len(),
            "Single tick finished"
        );
        if !report.failures.is_empty() {
            anyhow::bail!("tick failed: {}", report.failures.join("; "));
        }
        return Ok(());
    }

    if !scheduler.start(&gate) {
        info!(reason = gate.refusal().unwrap_or("unknown"), "Scheduler not started");
        return Ok(());
    }
    let worker_id = scheduler.status().worker_id.unwrap_or_default();
    info!(worker_id = %worker_id, "Cron worker running");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");
    scheduler.stop().await;

    let status = scheduler.status();
    info!(
        last_run_at = ?status.last_run_at,
        last_error = ?status.last_error,
        "Cron worker stopped"
    );
    Ok(())
}
