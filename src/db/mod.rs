//! Database connection management and per-entity stores.
//!
//! All SQL here is runtime-checked (`sqlx::query`/`query_as`, never
//! `sqlx::query!`), following `sem_os_postgres::store`'s rule: compiling
//! this crate must never require a live database connection.

pub mod diamonds_store;
pub mod partition_progress_store;
pub mod raw_store;
pub mod run_store;
pub mod watermark_store;
pub mod worker_run_store;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::config::{mask_database_url, DatabaseConfig};

/// Owns the Postgres connection pool and hands out per-entity stores.
pub struct DatabaseManager {
    pool: PgPool,
}

impl DatabaseManager {
    pub async fn new(config: DatabaseConfig) -> Result<Self, sqlx::Error> {
        info!(
            database_url = %mask_database_url(&config.database_url),
            "connecting to database"
        );

        let mut pool_options = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.connection_timeout);

        if let Some(idle_timeout) = config.idle_timeout {
            pool_options = pool_options.idle_timeout(idle_timeout);
        }
        if let Some(max_lifetime) = config.max_lifetime {
            pool_options = pool_options.max_lifetime(max_lifetime);
        }

        let pool = pool_options
            .connect(&config.database_url)
            .await
            .map_err(|e| {
                warn!(error = %e, "failed to connect to database");
                e
            })?;

        info!("database connection pool created");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn test_connection(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.map(|_| ())
    }

    /// Applies the embedded `migrations/` directory, matching
    /// `bpmn-lite-core::PostgresProcessStore::migrate`'s
    /// `sqlx::migrate!(...)`-on-startup idiom. Idempotent: already-applied
    /// migrations are skipped by sqlx's own bookkeeping table.
    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        info!("running database migrations");
        sqlx::migrate!("./migrations").run(&self.pool).await
    }

    pub fn runs(&self) -> run_store::RunStore {
        run_store::RunStore::new(self.pool.clone())
    }

    pub fn partition_progress(&self) -> partition_progress_store::PartitionProgressStore {
        partition_progress_store::PartitionProgressStore::new(self.pool.clone())
    }

    pub fn worker_runs(&self) -> worker_run_store::WorkerRunStore {
        worker_run_store::WorkerRunStore::new(self.pool.clone())
    }

    pub fn watermarks(&self) -> watermark_store::WatermarkStore {
        watermark_store::WatermarkStore::new(self.pool.clone())
    }

    pub fn raw_records(&self, table_name: &str) -> raw_store::RawStore {
        raw_store::RawStore::new(self.pool.clone(), table_name.to_string())
    }

    pub fn diamonds(&self) -> diamonds_store::DiamondsStore {
        diamonds_store::DiamondsStore::new(self.pool.clone())
    }

    pub fn connection_stats(&self) -> ConnectionStats {
        ConnectionStats {
            size: self.pool.size(),
            num_idle: self.pool.num_idle() as u32,
        }
    }

    pub async fn close(self) {
        info!("closing database connection pool");
        self.pool.close().await;
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionStats {
    pub size: u32,
    pub num_idle: u32,
}

impl std::fmt::Display for ConnectionStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pool size: {}, idle: {}", self.size, self.num_idle)
    }
}
