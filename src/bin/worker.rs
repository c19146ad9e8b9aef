//! Worker binary — a pool of tasks, each long-polling `work_items` and
//! running `process_one_message` to completion, ack/nak'ing based on the
//! outcome. Each task watches a shutdown signal between polls so the pool
//! drains cleanly on Ctrl-C instead of dropping in-flight deliveries.

use std::sync::Arc;
use std::time::Duration;

use diamond_ingest::bus::nats::NatsBus;
use diamond_ingest::bus::MessageBus;
use diamond_ingest::config::Config;
use diamond_ingest::db::DatabaseManager;
use diamond_ingest::feed::nivoda::NivodaFeedAdapter;
use diamond_ingest::feed::FeedAdapter;
use diamond_ingest::health::spawn_health_server;
use diamond_ingest::worker::{process_one_message, MessageOutcome};

const BACKOFF_MS_IDLE: u64 = 1_000;
const BACKOFF_MS_ERROR: u64 = 5_000;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config = Config::from_env();
    tracing::info!(?config, "worker starting");

    let db = DatabaseManager::new(config.database.clone()).await?;
    db.migrate().await?;
    let bus: Arc<dyn MessageBus> = Arc::new(NatsBus::connect(&config.bus).await?);

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

    let concurrency = config.run.worker_concurrency.max(1);
    tracing::info!(concurrency, "spawning worker tasks");

    let mut tasks = Vec::with_capacity(concurrency);
    for task_index in 0..concurrency {
        let worker_id = format!("worker-{}-{task_index}", std::process::id());
        let adapter = adapter.clone();
        let bus = bus.clone();
        let partition_progress = db.partition_progress();
        let worker_runs = db.worker_runs();
        let raw_records = db.raw_records(adapter.raw_table_name());
        let runs = db.runs();
        let run_config = config.run.clone();
        let mut shutdown_rx = shutdown_rx.clone();

        tasks.push(tokio::spawn(async move {
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                let delivery = match bus.receive_work_item().await {
                    Ok(Some(delivery)) => delivery,
                    Ok(None) => {
                        tokio::select! {
                            _ = tokio::time::sleep(Duration::from_millis(BACKOFF_MS_IDLE)) => {},
                            _ = shutdown_rx.changed() => break,
                        }
                        continue;
                    }
                    Err(err) => {
                        tracing::error!(worker_id = %worker_id, error = %err, "failed to poll work_items, backing off");
                        tokio::select! {
                            _ = tokio::time::sleep(Duration::from_millis(BACKOFF_MS_ERROR)) => {},
                            _ = shutdown_rx.changed() => break,
                        }
                        continue;
                    }
                };

                let outcome = process_one_message(
                    &worker_id,
                    &delivery.payload,
                    None,
                    adapter.clone(),
                    &partition_progress,
                    &worker_runs,
                    &raw_records,
                    &runs,
                    bus.as_ref(),
                    &run_config,
                )
                .await;

                match outcome {
                    Ok(MessageOutcome::Skipped) | Ok(MessageOutcome::Continued) | Ok(MessageOutcome::PartitionCompleted) => {
                        if let Err(err) = delivery.handle.complete().await {
                            tracing::warn!(worker_id = %worker_id, error = %err, "failed to ack work item");
                        }
                    }
                    Ok(MessageOutcome::PartitionFailed) | Ok(MessageOutcome::ContinuationEnqueueFailed) => {
                        if let Err(err) = delivery.handle.abandon().await {
                            tracing::warn!(worker_id = %worker_id, error = %err, "failed to abandon work item");
                        }
                    }
                    Err(err) => {
                        tracing::error!(worker_id = %worker_id, error = %err, "unhandled error processing work item");
                        if let Err(err) = delivery.handle.abandon().await {
                            tracing::warn!(worker_id = %worker_id, error = %err, "failed to abandon work item after error");
                        }
                    }
                }
            }

            tracing::info!(worker_id = %worker_id, "worker task stopped");
        }));
    }

    for task in tasks {
        let _ = task.await;
    }

    tracing::info!("worker shutting down");
    health_handle.abort();
    db.close().await;
    Ok(())
}
