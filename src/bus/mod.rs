//! Message Bus Gateway — three logical queues (`work_items`, `work_done`,
//! `consolidate`) over a broker, abstracted behind a trait so the
//! pipeline core never depends on a concrete client.
//!
//! At-least-once delivery, no ordering guarantee. `receive` returns `None`
//! when nothing is queued; callers poll with a backoff sleep rather than
//! blocking indefinitely, since a scheduled (delayed) message must still
//! be observable as "not yet available" to a receiver that arrives early.

pub mod memory;
pub mod nats;

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::IngestError;
use crate::models::{Consolidate, WorkDone, WorkItem};

/// A received message paired with a broker-specific handle used to
/// acknowledge or abandon it. The handle is opaque to core logic.
pub struct Delivery<T> {
    pub payload: T,
    pub handle: DeliveryHandle,
}

/// Type-erased ack/nak handle. Concrete bus implementations stash whatever
/// they need (a NATS `Message`, an in-memory queue index) behind this.
pub struct DeliveryHandle(pub Box<dyn DeliveryHandleImpl>);

#[async_trait]
pub trait DeliveryHandleImpl: Send + Sync {
    async fn complete(self: Box<Self>) -> Result<(), IngestError>;
    async fn abandon(self: Box<Self>) -> Result<(), IngestError>;
}

impl DeliveryHandle {
    pub async fn complete(self) -> Result<(), IngestError> {
        self.0.complete().await
    }

    pub async fn abandon(self) -> Result<(), IngestError> {
        self.0.abandon().await
    }
}

/// A queue over one message type. Separate traits per queue (rather than
/// one generic `publish<T>`) keep the three logical queues' names and
/// payload types from being accidentally crossed at a call site.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish_work_item(&self, item: &WorkItem) -> Result<(), IngestError>;
    async fn receive_work_item(&self) -> Result<Option<Delivery<WorkItem>>, IngestError>;

    async fn publish_work_done(&self, done: &WorkDone) -> Result<(), IngestError>;
    async fn receive_work_done(&self) -> Result<Option<Delivery<WorkDone>>, IngestError>;

    async fn publish_consolidate(&self, msg: &Consolidate) -> Result<(), IngestError>;
    /// Publishes a `consolidate` message that only becomes visible to
    /// receivers after `delay`, used for the delayed force-consolidate.
    async fn publish_consolidate_delayed(
        &self,
        msg: &Consolidate,
        delay: ChronoDuration,
    ) -> Result<(), IngestError>;
    async fn receive_consolidate(&self) -> Result<Option<Delivery<Consolidate>>, IngestError>;
}

/// Serializes a message payload the same way across every concrete bus
/// implementation, so wire format is defined once, not per-adapter.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, IngestError> {
    serde_json::to_vec(value).map_err(|e| IngestError::Fatal(format!("encode failure: {e}")))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, IngestError> {
    serde_json::from_slice(bytes).map_err(|e| IngestError::Fatal(format!("decode failure: {e}")))
}
