//! Cron worker process
//!
//! Wires the escalation core from `oncall_coordination` to Postgres and a
//! webhook notification provider, then runs the lock-coordinated scheduler
//! until the process is told to stop.

pub mod app;
pub mod config;
pub mod notifier;
pub mod postgres;
pub mod schema;
pub mod sweeps;

pub use app::{build_scheduler, run_once_gated, WorkerStores};
pub use config::WorkerConfig;
pub use notifier::{LogNotifier, WebhookNotifier};
pub use postgres::PgStore;
pub use sweeps::{standard_sweeps, SqlSweep};
