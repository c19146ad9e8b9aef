//! Concrete `FeedAdapter` for the Nivoda diamond supplier API.
//!
//! Owns its own [`RateLimiter`] instance, matching the "rate limiter is a
//! process-local singleton per outbound endpoint" design note — the
//! scanner and worker never construct one directly, they call through
//! this adapter.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;

use super::{FeedAdapter, FeedQuery, SearchPage, SortOrder};
use crate::config::RateLimiterConfig;
use crate::error::IngestError;
use crate::models::ItemIdentity;
use crate::ratelimit::RateLimiter;

pub struct NivodaFeedAdapter {
    client: Client,
    base_url: String,
    api_key: String,
    rate_limiter: Arc<RateLimiter>,
    worker_page_size: i64,
    max_page_size: i64,
}

impl NivodaFeedAdapter {
    pub fn new(base_url: String, api_key: String, rate_limiter_config: RateLimiterConfig) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_millis(rate_limiter_config.max_wait_ms))
                .build()
                .expect("reqwest client builds"),
            base_url,
            api_key,
            rate_limiter: RateLimiter::new(rate_limiter_config),
            worker_page_size: 100,
            max_page_size: 500,
        }
    }

    async fn post_graphql(&self, body: serde_json::Value) -> Result<serde_json::Value, IngestError> {
        self.rate_limiter.acquire().await?;

        let response = self
            .client
            .post(format!("{}/api/diamonds", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| IngestError::Transient(e.to_string()))?;

        if response.status().is_server_error() || response.status().as_u16() == 429 {
            return Err(IngestError::Transient(format!(
                "upstream returned {}",
                response.status()
            )));
        }

        if !response.status().is_success() {
            return Err(IngestError::Fatal(format!(
                "upstream returned {}",
                response.status()
            )));
        }

        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| IngestError::Transient(e.to_string()))
    }
}

#[async_trait]
impl FeedAdapter for NivodaFeedAdapter {
    fn feed_id(&self) -> &str {
        "nivoda"
    }

    fn raw_table_name(&self) -> &str {
        "raw_nivoda_stones"
    }

    fn watermark_blob_name(&self) -> &str {
        "nivoda-watermark"
    }

    fn max_page_size(&self) -> i64 {
        self.max_page_size
    }

    fn worker_page_size(&self) -> i64 {
        self.worker_page_size
    }

    fn price_granularity(&self) -> i64 {
        1
    }

    fn build_base_query(
        &self,
        updated_from: Option<DateTime<Utc>>,
        updated_to: Option<DateTime<Utc>>,
    ) -> FeedQuery {
        FeedQuery(serde_json::json!({
            "updated_from": updated_from,
            "updated_to": updated_to,
        }))
    }

    fn with_price_range(&self, query: &FeedQuery, min_price: i64, max_price: i64) -> FeedQuery {
        let mut value = query.0.clone();
        let upper_inclusive = max_price - self.price_granularity();
        if let Some(obj) = value.as_object_mut() {
            obj.insert("min_price".to_string(), serde_json::json!(min_price));
            obj.insert("max_price".to_string(), serde_json::json!(upper_inclusive));
        }
        FeedQuery(value)
    }

    async fn count(&self, query: &FeedQuery) -> Result<i64, IngestError> {
        let body = serde_json::json!({ "op": "count", "filter": query.0 });
        let response = self.post_graphql(body).await?;
        response
            .get("count")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| IngestError::Transient("missing count field in response".to_string()))
    }

    async fn search(
        &self,
        query: &FeedQuery,
        offset: i64,
        limit: i64,
        order: SortOrder,
    ) -> Result<SearchPage, IngestError> {
        let order_str = match order {
            SortOrder::CreatedAtAsc => "created_at_asc",
        };
        let body = serde_json::json!({
            "op": "search",
            "filter": query.0,
            "offset": offset,
            "limit": limit,
            "order": order_str,
        });
        let response = self.post_graphql(body).await?;
        let items = response
            .get("items")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        let total_count = response.get("total_count").and_then(|v| v.as_i64());
        Ok(SearchPage { items, total_count })
    }

    fn extract_identity(&self, item: &serde_json::Value) -> Result<ItemIdentity, IngestError> {
        let supplier_stone_id = item
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| IngestError::Fatal("item missing id".to_string()))?
            .to_string();
        let offer_id = item
            .get("offer_id")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let source_updated_at = item
            .get("updated_at")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));

        Ok(ItemIdentity {
            supplier_stone_id,
            offer_id,
            // Normalize lab/carat representation into a canonical payload
            // shape here, entirely inside the adapter boundary; core code
            // treats this as opaque.
            payload: normalize_payload(item),
            source_updated_at,
        })
    }
}

fn normalize_payload(item: &serde_json::Value) -> serde_json::Value {
    let mut normalized = item.clone();
    if let Some(obj) = normalized.as_object_mut() {
        if let Some(lab) = obj.get("lab").and_then(|v| v.as_str()) {
            obj.insert("lab".to_string(), serde_json::json!(lab.to_uppercase()));
        }
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_price_range_uses_inclusive_upper_bound() {
        let adapter = NivodaFeedAdapter::new(
            "https://example.invalid".to_string(),
            "key".to_string(),
            RateLimiterConfig {
                max_requests_per_window: 10,
                window_ms: 1000,
                max_wait_ms: 1000,
            },
        );
        let base = adapter.build_base_query(None, None);
        let ranged = adapter.with_price_range(&base, 100, 200);
        assert_eq!(ranged.0["min_price"], 100);
        assert_eq!(ranged.0["max_price"], 199);
    }

    #[test]
    fn normalize_payload_uppercases_lab() {
        let item = serde_json::json!({"id": "s1", "lab": "gia"});
        let normalized = normalize_payload(&item);
        assert_eq!(normalized["lab"], "GIA");
    }
}
