//! hookwire batch entrypoint.
//!
//! Runs one batch and exits: new messages are fanned out to their listeners,
//! then failed deliveries are retried or given up. Intended to be started by
//! a scheduler such as cron.
//!
//! Exit codes: `0` when the batch completed or was skipped because another
//! run holds the lease, `1` on an unrecoverable error, `2` when the batch
//! completed but some messages reference an unregistered subject type.

use std::{process::ExitCode, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use hookwire_core::{
    storage::{run_migrations, Storage},
    NoOpEventHandler, RealClock,
};
use hookwire_delivery::{BatchReport, DeliveryEngine, PostgresDeliveryStorage};
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info, warn};

mod config;

use config::Config;

const EXIT_UNREGISTERED_TYPES: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            init_tracing(&Config::default().rust_log);
            error!("invalid configuration: {e:#}");
            return ExitCode::FAILURE;
        },
    };
    init_tracing(&config.rust_log);

    match run(&config).await {
        Ok(report) => exit_code(&report),
        Err(e) => {
            error!("batch failed: {e:#}");
            ExitCode::FAILURE
        },
    }
}

async fn run(config: &Config) -> Result<BatchReport> {
    info!(
        database_url = %config.database_url_masked(),
        webhooks = config.webhooks.len(),
        concurrency = config.delivery_concurrency,
        "starting hookwire batch"
    );

    let registry = Arc::new(config.build_registry()?);
    if registry.is_empty() {
        warn!("no webhooks are registered");
    }

    let pool = create_database_pool(config).await?;
    run_migrations(&pool).await.context("failed to run migrations")?;

    let subjects = Arc::new(config.build_subject_resolver(Arc::new(pool.clone()))?);
    let storage = Arc::new(PostgresDeliveryStorage::new(Arc::new(Storage::new(pool.clone()))));

    let engine = DeliveryEngine::new(
        storage,
        subjects,
        registry,
        Arc::new(NoOpEventHandler),
        Arc::new(RealClock),
        config.to_delivery_config(),
    )
    .context("failed to build delivery engine")?;

    let report = engine.run_once().await.context("batch aborted")?;
    pool.close().await;
    Ok(report)
}

fn exit_code(report: &BatchReport) -> ExitCode {
    if report.skipped {
        info!("batch skipped");
        return ExitCode::SUCCESS;
    }
    if report.has_unregistered_types() {
        warn!(
            messages = report.processing.unregistered(),
            "messages reference unregistered subject types"
        );
        return ExitCode::from(EXIT_UNREGISTERED_TYPES);
    }
    ExitCode::SUCCESS
}

/// Initializes tracing; `RUST_LOG` takes precedence over the configured
/// filter.
fn init_tracing(fallback: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer().with_target(true).with_file(true).with_line_number(true);

    let _ = tracing_subscriber::registry().with(filter).with(fmt_layer).try_init();
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 3;
    const RETRY_DELAY: Duration = Duration::from_secs(2);
    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .execute(&pool)
                    .await
                    .context("failed to verify database connection")?;
                return Ok(pool);
            },
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                warn!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "database connection failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("failed to connect to the database after retries");
            },
        }
    }
}
