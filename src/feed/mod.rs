//! Feed adapter contract — the boundary between the pipeline core and any
//! particular supplier API.
//!
//! Modeled as an `async_trait` port: core pipeline logic (scanner,
//! scheduler, worker) depends only on `FeedAdapter`, never on a concrete
//! HTTP client. Registry lookup by `feed_id` is a pure map, not dynamic
//! dispatch through object identity.

pub mod nivoda;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::IngestError;
use crate::models::ItemIdentity;

/// Sort order requested from the adapter's `search` call. The adapter's
/// underlying query must break ties on a unique stable key (e.g. a
/// monotonic stone identifier) — otherwise repeated calls with the same
/// `(query, offset, limit, order)` can silently reshuffle pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    CreatedAtAsc,
}

/// An opaque, adapter-specific query built from a price range and an
/// optional updated-at window. Core code never inspects its contents.
#[derive(Debug, Clone)]
pub struct FeedQuery(pub serde_json::Value);

/// One page of results from `FeedAdapter::search`.
pub struct SearchPage {
    pub items: Vec<serde_json::Value>,
    pub total_count: Option<i64>,
}

#[async_trait]
pub trait FeedAdapter: Send + Sync {
    fn feed_id(&self) -> &str;
    fn raw_table_name(&self) -> &str;
    fn watermark_blob_name(&self) -> &str;
    fn max_page_size(&self) -> i64;
    fn worker_page_size(&self) -> i64;
    /// Supplier price granularity (ε), used to translate the pipeline's
    /// half-open `[min, max)` ranges into the supplier's inclusive
    /// `[min, max - ε]` range queries.
    fn price_granularity(&self) -> i64;

    async fn initialize(&self) -> Result<(), IngestError> {
        Ok(())
    }

    async fn dispose(&self) -> Result<(), IngestError> {
        Ok(())
    }

    fn build_base_query(
        &self,
        updated_from: Option<DateTime<Utc>>,
        updated_to: Option<DateTime<Utc>>,
    ) -> FeedQuery;

    /// Narrows a base query to a `[min, max)` price range for counting or
    /// paginating a single chunk/partition.
    fn with_price_range(&self, query: &FeedQuery, min_price: i64, max_price: i64) -> FeedQuery;

    async fn count(&self, query: &FeedQuery) -> Result<i64, IngestError>;

    async fn search(
        &self,
        query: &FeedQuery,
        offset: i64,
        limit: i64,
        order: SortOrder,
    ) -> Result<SearchPage, IngestError>;

    fn extract_identity(&self, item: &serde_json::Value) -> Result<ItemIdentity, IngestError>;
}

/// Pure map from `feed_id` to its adapter. No dynamic plugin loading.
#[derive(Clone, Default)]
pub struct FeedRegistry {
    adapters: HashMap<String, Arc<dyn FeedAdapter>>,
}

impl FeedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn FeedAdapter>) {
        self.adapters.insert(adapter.feed_id().to_string(), adapter);
    }

    pub fn get(&self, feed_id: &str) -> Result<Arc<dyn FeedAdapter>, IngestError> {
        self.adapters
            .get(feed_id)
            .cloned()
            .ok_or_else(|| IngestError::Fatal(format!("unknown feed id: {feed_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubAdapter;

    #[async_trait]
    impl FeedAdapter for StubAdapter {
        fn feed_id(&self) -> &str {
            "stub"
        }
        fn raw_table_name(&self) -> &str {
            "raw_stub"
        }
        fn watermark_blob_name(&self) -> &str {
            "stub-watermark"
        }
        fn max_page_size(&self) -> i64 {
            100
        }
        fn worker_page_size(&self) -> i64 {
            100
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
        fn with_price_range(&self, _query: &FeedQuery, _min: i64, _max: i64) -> FeedQuery {
            FeedQuery(serde_json::json!({}))
        }
        async fn count(&self, _query: &FeedQuery) -> Result<i64, IngestError> {
            Ok(0)
        }
        async fn search(
            &self,
            _query: &FeedQuery,
            _offset: i64,
            _limit: i64,
            _order: SortOrder,
        ) -> Result<SearchPage, IngestError> {
            Ok(SearchPage {
                items: vec![],
                total_count: Some(0),
            })
        }
        fn extract_identity(&self, _item: &serde_json::Value) -> Result<ItemIdentity, IngestError> {
            unimplemented!()
        }
    }

    #[test]
    fn registry_lookup_is_a_pure_map() {
        let mut registry = FeedRegistry::new();
        registry.register(Arc::new(StubAdapter));
        assert!(registry.get("stub").is_ok());
        assert!(registry.get("missing").is_err());
    }
}
