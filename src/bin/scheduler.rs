//! Scheduler binary — runs one scheduling pass per feed on a fixed
//! interval, then idles until shutdown.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use diamond_ingest::bus::nats::NatsBus;
use diamond_ingest::config::Config;
use diamond_ingest::db::DatabaseManager;
use diamond_ingest::feed::nivoda::NivodaFeedAdapter;
use diamond_ingest::feed::FeedAdapter;
use diamond_ingest::health::spawn_health_server;
use diamond_ingest::models::RunType;
use diamond_ingest::scheduler::run_scheduler_once;

/// Long-lived scheduler process. Normally resolves full-vs-incremental
/// from the persisted watermark on its own; `--run-type` lets an operator
/// force a one-off full backfill without touching the watermark store.
#[derive(Debug, Parser)]
struct Args {
    #[arg(long, env = "SCHEDULER_RUN_TYPE", value_enum)]
    run_type: Option<RunTypeArg>,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum RunTypeArg {
    Full,
    Incremental,
}

impl From<RunTypeArg> for RunType {
    fn from(value: RunTypeArg) -> Self {
        match value {
            RunTypeArg::Full => RunType::Full,
            RunTypeArg::Incremental => RunType::Incremental,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();
    let requested_run_type = args.run_type.map(RunType::from);

    let config = Config::from_env();
    tracing::info!(?config, run_type_override = ?requested_run_type, "scheduler starting");

    let db = DatabaseManager::new(config.database.clone()).await?;
    db.migrate().await?;
    let bus = NatsBus::connect(&config.bus).await?;

    let nivoda_api_key = std::env::var("NIVODA_API_KEY").unwrap_or_default();
    let nivoda_base_url =
        std::env::var("NIVODA_BASE_URL").unwrap_or_else(|_| "https://api.nivoda.net".to_string());
    let adapter: Arc<dyn FeedAdapter> = Arc::new(NivodaFeedAdapter::new(
        nivoda_base_url,
        nivoda_api_key,
        config.rate_limiter.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let health_handle = spawn_health_server(shutdown_rx.clone());

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received shutdown signal");
            let _ = shutdown_tx.send(true);
        }
    });

    let mut shutdown_rx = shutdown_rx;
    let poll_interval = Duration::from_secs(60);
    // The CLI/env override only forces the very first pass; once a run has
    // been dispatched the scheduler resumes resolving full-vs-incremental
    // from the watermark on its own, same as if it had never been passed.
    let mut run_type_override = requested_run_type;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        match run_scheduler_once(
            adapter.feed_id(),
            adapter.clone(),
            run_type_override.take(),
            config.heatmap.clone(),
            &config.run,
            &db.runs(),
            &db.partition_progress(),
            &db.watermarks(),
            &bus,
        )
        .await
        {
            Ok(outcome) => {
                tracing::info!(
                    run_id = ?outcome.run_id,
                    partitions = outcome.partitions_dispatched,
                    total_records = outcome.total_records,
                    "scheduling pass complete"
                );
            }
            Err(err) => {
                tracing::error!(error = %err, "scheduling pass failed");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {},
            _ = shutdown_rx.changed() => break,
        }
    }

    tracing::info!("scheduler shutting down");
    health_handle.abort();
    db.close().await;
    Ok(())
}
