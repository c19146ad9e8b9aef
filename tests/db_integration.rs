//! Database-backed integration tests.
//!
//! Gated behind the `database` feature, mirroring
//! `examples/adamtc007-ob-poc/rust/tests/db_integration.rs`'s
//! `#[cfg(feature = "database")] mod db_tests` split: these need a live
//! Postgres (`TEST_DATABASE_URL` or `DATABASE_URL`) and are skipped by a
//! plain `cargo test`.

#[cfg(feature = "database")]
mod db_tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use sqlx::PgPool;
    use uuid::Uuid;

    use diamond_ingest::bus::memory::InMemoryBus;
    use diamond_ingest::bus::MessageBus;
    use diamond_ingest::config::{HeatmapConfig, RunConfig};
    use diamond_ingest::consolidator::consolidate;
    use diamond_ingest::db::diamonds_store::DiamondRecord;
    use diamond_ingest::db::DatabaseManager;
    use diamond_ingest::error::IngestError;
    use diamond_ingest::feed::{FeedAdapter, FeedQuery, SearchPage, SortOrder};
    use diamond_ingest::models::{ItemIdentity, RunStatus, RunType};
    use diamond_ingest::scheduler::run_scheduler_once;
    use diamond_ingest::worker::{process_one_message, MessageOutcome};

    // -----------------------------------------------------------------
    // Test infrastructure
    // -----------------------------------------------------------------

    struct TestDb {
        manager: DatabaseManager,
        feed: String,
    }

    impl TestDb {
        async fn new(feed_prefix: &str) -> Self {
            let url = std::env::var("TEST_DATABASE_URL")
                .or_else(|_| std::env::var("DATABASE_URL"))
                .unwrap_or_else(|_| "postgresql://localhost/diamond_ingest".to_string());

            let manager = DatabaseManager::new(diamond_ingest::config::DatabaseConfig {
                database_url: url,
                max_connections: 5,
                connection_timeout: std::time::Duration::from_secs(10),
                idle_timeout: None,
                max_lifetime: None,
            })
            .await
            .expect("connect to test database");
            manager.migrate().await.expect("run migrations");

            let feed = format!("{feed_prefix}_{}", &Uuid::new_v4().to_string()[..8]);
            Self { manager, feed }
        }

        fn pool(&self) -> &PgPool {
            self.manager.pool()
        }

        async fn cleanup(&self, run_ids: &[Uuid]) {
            for run_id in run_ids {
                sqlx::query("DELETE FROM worker_runs WHERE run_id = $1").bind(run_id).execute(self.pool()).await.ok();
                sqlx::query("DELETE FROM partition_progress WHERE run_id = $1").bind(run_id).execute(self.pool()).await.ok();
                sqlx::query("DELETE FROM raw_nivoda_stones WHERE run_id = $1").bind(run_id).execute(self.pool()).await.ok();
                sqlx::query("DELETE FROM run_metadata WHERE run_id = $1").bind(run_id).execute(self.pool()).await.ok();
            }
            sqlx::query("DELETE FROM diamonds WHERE feed = $1").bind(&self.feed).execute(self.pool()).await.ok();
            sqlx::query("DELETE FROM watermarks WHERE feed = $1").bind(&self.feed).execute(self.pool()).await.ok();
        }
    }

    // -----------------------------------------------------------------
    // Synthetic feed adapter: an in-memory price/id list, no network.
    // -----------------------------------------------------------------

    struct SyntheticItem {
        id: String,
        price: i64,
        updated_at: DateTime<Utc>,
    }

    struct SyntheticAdapter {
        feed: String,
        items: Vec<SyntheticItem>,
        page_size: i64,
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl FeedAdapter for SyntheticAdapter {
        fn feed_id(&self) -> &str {
            &self.feed
        }
        fn raw_table_name(&self) -> &str {
            "raw_nivoda_stones"
        }
        fn watermark_blob_name(&self) -> &str {
            "synthetic-watermark"
        }
        fn max_page_size(&self) -> i64 {
            500
        }
        fn worker_page_size(&self) -> i64 {
            self.page_size
        }
        fn price_granularity(&self) -> i64 {
            1
        }
        fn build_base_query(
            &self,
            _updated_from: Option<DateTime<Utc>>,
            _updated_to: Option<DateTime<Utc>>,
        ) -> FeedQuery {
            FeedQuery(serde_json::json!({}))
        }
        fn with_price_range(&self, _query: &FeedQuery, min: i64, max: i64) -> FeedQuery {
            FeedQuery(serde_json::json!({ "min": min, "max": max }))
        }
        async fn count(&self, query: &FeedQuery) -> Result<i64, IngestError> {
            let min = query.0["min"].as_i64().unwrap();
            let max = query.0["max"].as_i64().unwrap();
            Ok(self.items.iter().filter(|i| i.price >= min && i.price < max).count() as i64)
        }
        async fn search(
            &self,
            query: &FeedQuery,
            offset: i64,
            limit: i64,
            _order: SortOrder,
        ) -> Result<SearchPage, IngestError> {
            *self.calls.lock().unwrap() += 1;
            let min = query.0["min"].as_i64().unwrap();
            let max = query.0["max"].as_i64().unwrap();
            let mut matching: Vec<&SyntheticItem> =
                self.items.iter().filter(|i| i.price >= min && i.price < max).collect();
            matching.sort_by(|a, b| a.id.cmp(&b.id));
            let page: Vec<serde_json::Value> = matching
                .into_iter()
                .skip(offset as usize)
                .take(limit as usize)
                .map(|i| serde_json::json!({ "id": i.id, "price": i.price, "updated_at": i.updated_at }))
                .collect();
            Ok(SearchPage { total_count: None, items: page })
        }
        fn extract_identity(&self, item: &serde_json::Value) -> Result<ItemIdentity, IngestError> {
            Ok(ItemIdentity {
                supplier_stone_id: item["id"].as_str().unwrap().to_string(),
                offer_id: None,
                payload: item.clone(),
                source_updated_at: item["updated_at"].as_str().and_then(|s| {
                    DateTime::parse_from_rfc3339(s).ok().map(|d| d.with_timezone(&Utc))
                }),
            })
        }
    }

    fn heatmap_config() -> HeatmapConfig {
        HeatmapConfig {
            min_price: 0,
            max_price: 1_000,
            dense_zone_threshold: 1_000,
            dense_zone_step: 100,
            initial_step: 100,
            target_records_per_chunk: 4,
            concurrency: 2,
            max_workers: 10,
            min_records_per_worker: 1,
            use_two_pass: false,
            coarse_step: 500,
            price_granularity: 1,
        }
    }

    // -----------------------------------------------------------------
    // partition_progress_store: CAS semantics
    // -----------------------------------------------------------------

    #[tokio::test]
    async fn partition_progress_cas_semantics() {
        let db = TestDb::new("partprog").await;
        let runs = db.manager.runs();
        let progress = db.manager.partition_progress();

        let run = runs.create(&db.feed, RunType::Full, 1, None).await.unwrap();
        progress.seed(run.run_id, &["p0".to_string()]).await.unwrap();

        // advance only succeeds against the exact expected offset.
        assert!(progress.advance(run.run_id, "p0", 0, 50).await.unwrap());
        assert!(!progress.advance(run.run_id, "p0", 0, 999).await.unwrap(), "stale offset must not win the race");

        assert!(progress.complete(run.run_id, "p0", 50).await.unwrap());
        // A redelivered completion at the same offset is a no-op success.
        assert!(progress.complete(run.run_id, "p0", 50).await.unwrap());

        let row = progress.get(run.run_id, "p0").await.unwrap().unwrap();
        assert!(row.completed);
        assert_eq!(row.next_offset, 50);

        let counts = progress.counts_for_run(run.run_id).await.unwrap();
        assert_eq!((counts.total, counts.completed, counts.failed), (1, 1, 0));

        db.cleanup(&[run.run_id]).await;
    }

    #[tokio::test]
    async fn partition_progress_failed_partition_can_be_reset_for_retry() {
        let db = TestDb::new("partprog").await;
        let runs = db.manager.runs();
        let progress = db.manager.partition_progress();

        let run = runs.create(&db.feed, RunType::Incremental, 1, None).await.unwrap();
        progress.seed(run.run_id, &["p0".to_string()]).await.unwrap();

        assert!(progress.mark_failed(run.run_id, "p0").await.unwrap());
        // advance must refuse once a partition is terminal.
        assert!(!progress.advance(run.run_id, "p0", 0, 10).await.unwrap());

        assert!(progress.reset_for_retry(run.run_id, "p0").await.unwrap());
        let row = progress.get(run.run_id, "p0").await.unwrap().unwrap();
        assert!(!row.failed && !row.completed && row.next_offset == 0);

        db.cleanup(&[run.run_id]).await;
    }

    // -----------------------------------------------------------------
    // diamonds_store: update suppression + updated_at bump
    // -----------------------------------------------------------------

    #[tokio::test]
    async fn diamonds_upsert_suppresses_stale_writes_but_bumps_on_genuine_updates() {
        let db = TestDb::new("diamonds").await;
        let diamonds = db.manager.diamonds();

        let t0 = Utc::now() - chrono::Duration::minutes(10);
        let t1 = Utc::now();

        let base = DiamondRecord {
            feed: db.feed.clone(),
            supplier_stone_id: "stone-1".to_string(),
            source_updated_at: Some(t0),
            feed_price: Some(100),
            status: "active".to_string(),
        };
        assert!(diamonds.upsert_if_newer(&base).await.unwrap());
        let first = diamonds.get(&db.feed, "stone-1").await.unwrap().unwrap();

        // Same source_updated_at again: suppressed as a no-op.
        assert!(!diamonds.upsert_if_newer(&base).await.unwrap());
        let unchanged = diamonds.get(&db.feed, "stone-1").await.unwrap().unwrap();
        assert_eq!(unchanged.feed_price, first.feed_price);

        // A genuinely newer record must write through.
        let newer = DiamondRecord {
            source_updated_at: Some(t1),
            feed_price: Some(150),
            ..base
        };
        assert!(diamonds.upsert_if_newer(&newer).await.unwrap());
        let updated = diamonds.get(&db.feed, "stone-1").await.unwrap().unwrap();
        assert_eq!(updated.feed_price, Some(150));

        sqlx::query("DELETE FROM diamonds WHERE feed = $1").bind(&db.feed).execute(db.pool()).await.unwrap();
    }

    // -----------------------------------------------------------------
    // End-to-end: scheduler -> worker -> coordinator -> consolidator
    // -----------------------------------------------------------------

    #[tokio::test]
    async fn full_pipeline_consolidates_every_record_and_advances_the_watermark() {
        let db = TestDb::new("e2e").await;
        let bus = InMemoryBus::new();

        let items: Vec<SyntheticItem> = (0..10)
            .map(|i| SyntheticItem {
                id: format!("stone-{i:02}"),
                price: 100 + (i % 3) * 50,
                updated_at: Utc::now(),
            })
            .collect();
        let adapter: Arc<dyn FeedAdapter> = Arc::new(SyntheticAdapter {
            feed: db.feed.clone(),
            items,
            page_size: 3,
            calls: Mutex::new(0),
        });

        let run_config = RunConfig {
            auto_consolidation_success_threshold: 0.70,
            auto_consolidation_delay_minutes: 5,
            incremental_run_safety_buffer_minutes: 15,
            run_stall_threshold_minutes: 30,
            worker_page_size: 3,
            worker_concurrency: 1,
        };

        let outcome = run_scheduler_once(
            adapter.feed_id(),
            adapter.clone(),
            Some(RunType::Full),
            heatmap_config(),
            &run_config,
            &db.manager.runs(),
            &db.manager.partition_progress(),
            &db.manager.watermarks(),
            &bus,
        )
        .await
        .unwrap();

        let run_id = outcome.run_id.expect("non-empty synthetic feed must start a run");
        assert_eq!(outcome.total_records, 10);

        let partition_progress = db.manager.partition_progress();
        let worker_runs = db.manager.worker_runs();
        let raw_records = db.manager.raw_records(adapter.raw_table_name());
        let runs = db.manager.runs();

        let worker_id = "test-worker-0";
        loop {
            let Some(delivery) = bus.receive_work_item().await.unwrap() else {
                break;
            };
            let outcome = process_one_message(
                worker_id,
                &delivery.payload,
                None,
                adapter.clone(),
                &partition_progress,
                &worker_runs,
                &raw_records,
                &runs,
                &bus,
                &run_config,
            )
            .await
            .unwrap();
            delivery.handle.complete().await.unwrap();
            assert!(!matches!(outcome, MessageOutcome::PartitionFailed));
        }

        // Every partition's worker loop finalizes into coordinator::evaluate_run,
        // which (full success) should have queued exactly one consolidate message.
        let delivery = bus.receive_consolidate().await.unwrap().expect("consolidate message queued");
        assert_eq!(delivery.payload.run_id, run_id);
        assert!(!delivery.payload.force);

        let diamonds = db.manager.diamonds();
        let watermarks = db.manager.watermarks();
        let consolidation = consolidate(&delivery.payload, &raw_records, &diamonds, &runs, &watermarks, 100)
            .await
            .unwrap();
        delivery.handle.complete().await.unwrap();

        assert_eq!(consolidation.errors, 0);
        assert_eq!(consolidation.wrote, 10);

        let watermark = watermarks.get(&db.feed).await.unwrap().expect("watermark written on success");
        assert_eq!(watermark.last_run_id, run_id.to_string());

        let run = runs.get(run_id).await.unwrap().unwrap();
        assert!(run.completed_at.is_some(), "consolidate() must transition the run to completed");

        let status: String = sqlx::query_scalar("SELECT status FROM run_metadata WHERE run_id = $1")
            .bind(run_id)
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(RunStatus::parse(&status), Some(RunStatus::Completed));

        db.cleanup(&[run_id]).await;
    }
}
