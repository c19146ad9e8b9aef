//! Consolidator binary — long-polls the `consolidate` queue and runs each
//! message to completion against the feed's raw table and the shared
//! `diamonds` table, resolving the feed's adapter through a `FeedRegistry`
//! the same way the scheduler and worker resolve it directly.

use std::sync::Arc;
use std::time::Duration;

use diamond_ingest::bus::nats::NatsBus;
use diamond_ingest::bus::MessageBus;
use diamond_ingest::config::Config;
use diamond_ingest::consolidator::consolidate;
use diamond_ingest::db::DatabaseManager;
use diamond_ingest::feed::nivoda::NivodaFeedAdapter;
use diamond_ingest::feed::{FeedAdapter, FeedRegistry};
use diamond_ingest::health::spawn_health_server;

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
    tracing::info!(?config, "consolidator starting");

    let db = DatabaseManager::new(config.database.clone()).await?;
    db.migrate().await?;
    let bus = NatsBus::connect(&config.bus).await?;

    let nivoda_api_key = std::env::var("NIVODA_API_KEY").unwrap_or_default();
    let nivoda_base_url =
        std::env::var("NIVODA_BASE_URL").unwrap_or_else(|_| "https://api.nivoda.net".to_string());
    let nivoda: Arc<dyn FeedAdapter> = Arc::new(NivodaFeedAdapter::new(
        nivoda_base_url,
        nivoda_api_key,
        config.rate_limiter.clone(),
    ));
    let mut registry = FeedRegistry::new();
    registry.register(nivoda);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let health_handle = spawn_health_server(shutdown_rx.clone());

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received shutdown signal");
            let _ = shutdown_tx.send(true);
        }
    });

    let diamonds = db.diamonds();
    let watermarks = db.watermarks();
    let runs = db.runs();
    let page_size = config.run.worker_page_size;

    let mut shutdown_rx = shutdown_rx;
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let delivery = match bus.receive_consolidate().await {
            Ok(Some(delivery)) => delivery,
            Ok(None) => {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(BACKOFF_MS_IDLE)) => {},
                    _ = shutdown_rx.changed() => break,
                }
                continue;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to poll consolidate queue, backing off");
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(BACKOFF_MS_ERROR)) => {},
                    _ = shutdown_rx.changed() => break,
                }
                continue;
            }
        };

        let adapter = match registry.get(&delivery.payload.feed) {
            Ok(adapter) => adapter,
            Err(err) => {
                tracing::error!(feed = %delivery.payload.feed, error = %err, "unknown feed, abandoning message");
                let _ = delivery.handle.abandon().await;
                continue;
            }
        };
        let raw_records = db.raw_records(adapter.raw_table_name());

        match consolidate(&delivery.payload, &raw_records, &diamonds, &runs, &watermarks, page_size).await {
            Ok(outcome) => {
                tracing::info!(
                    run_id = %delivery.payload.run_id,
                    processed = outcome.processed,
                    wrote = outcome.wrote,
                    suppressed_no_op = outcome.suppressed_no_op,
                    errors = outcome.errors,
                    "consolidation pass finished"
                );
                if let Err(err) = delivery.handle.complete().await {
                    tracing::warn!(error = %err, "failed to ack consolidate message");
                }
            }
            Err(err) => {
                tracing::error!(run_id = %delivery.payload.run_id, error = %err, "consolidation pass failed");
                if let Err(err) = delivery.handle.abandon().await {
                    tracing::warn!(error = %err, "failed to abandon consolidate message after error");
                }
            }
        }
    }

    tracing::info!("consolidator shutting down");
    health_handle.abort();
    db.close().await;
    Ok(())
}
