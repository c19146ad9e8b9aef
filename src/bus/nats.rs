//! NATS JetStream-backed `MessageBus`.
//!
//! JetStream gives durable, at-least-once, consumer-group delivery for
//! free, which is exactly what the three logical queues need.
//!
//! Delayed delivery (the force-consolidate scheduling need) has no native
//! "deliver after" primitive in JetStream, so it's modeled the way
//! delayed job queues commonly are on top of at-least-once brokers: the
//! payload carries a `not_before` timestamp, and a receiver that pops a
//! message before its time naks it with a redelivery delay and reports
//! "nothing available" to the caller, rather than handing back a message
//! the caller isn't meant to act on yet.

use async_nats::jetstream::{self, consumer::PullConsumer, Context};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::StreamExt;
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration as StdDuration;

use super::{decode, encode, Delivery, DeliveryHandle, DeliveryHandleImpl, MessageBus};
use crate::config::BusConfig;
use crate::error::IngestError;
use crate::models::{Consolidate, WorkDone, WorkItem};

/// Wraps a payload with an optional "not visible before" timestamp, used
/// only by the `consolidate` queue's delayed-delivery emulation.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct Envelope<T> {
    not_before: Option<DateTime<Utc>>,
    body: T,
}

pub struct NatsBus {
    jetstream: Context,
    work_items_stream: String,
    work_done_stream: String,
    consolidate_stream: String,
}

impl NatsBus {
    pub async fn connect(config: &BusConfig) -> Result<Self, IngestError> {
        let client = async_nats::connect(&config.nats_url)
            .await
            .map_err(|e| IngestError::Transient(format!("nats connect failed: {e}")))?;
        let jetstream = jetstream::new(client);

        for stream_name in [
            &config.work_items_stream,
            &config.work_done_stream,
            &config.consolidate_stream,
        ] {
            jetstream
                .get_or_create_stream(jetstream::stream::Config {
                    name: stream_name.clone(),
                    subjects: vec![stream_name.clone()],
                    ..Default::default()
                })
                .await
                .map_err(|e| IngestError::Fatal(format!("failed to ensure stream {stream_name}: {e}")))?;
        }

        Ok(Self {
            jetstream,
            work_items_stream: config.work_items_stream.clone(),
            work_done_stream: config.work_done_stream.clone(),
            consolidate_stream: config.consolidate_stream.clone(),
        })
    }

    async fn publish_envelope<T: Serialize + Clone>(
        &self,
        subject: &str,
        body: &T,
        not_before: Option<DateTime<Utc>>,
    ) -> Result<(), IngestError> {
        let envelope = Envelope {
            not_before,
            body: body.clone(),
        };
        let payload = encode(&envelope)?;
        self.jetstream
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| IngestError::Transient(format!("nats publish failed: {e}")))?
            .await
            .map_err(|e| IngestError::Transient(format!("nats publish ack failed: {e}")))?;
        Ok(())
    }

    async fn receive_envelope<T: DeserializeOwned + Serialize + Clone + Send + Sync + 'static>(
        &self,
        stream_name: &str,
        durable_name: &str,
    ) -> Result<Option<Delivery<T>>, IngestError> {
        let stream = self
            .jetstream
            .get_stream(stream_name)
            .await
            .map_err(|e| IngestError::Fatal(format!("stream {stream_name} missing: {e}")))?;

        let consumer: PullConsumer = stream
            .get_or_create_consumer(
                durable_name,
                jetstream::consumer::pull::Config {
                    durable_name: Some(durable_name.to_string()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| IngestError::Fatal(format!("consumer {durable_name} unavailable: {e}")))?;

        let mut messages = consumer
            .fetch()
            .max_messages(1)
            .messages()
            .await
            .map_err(|e| IngestError::Transient(format!("nats fetch failed: {e}")))?;

        let Some(message) = messages.next().await else {
            return Ok(None);
        };
        let message = message.map_err(|e| IngestError::Transient(format!("nats message error: {e}")))?;

        let envelope: Envelope<T> = decode(&message.payload)?;

        if let Some(not_before) = envelope.not_before {
            if not_before > Utc::now() {
                let delay = (not_before - Utc::now())
                    .to_std()
                    .unwrap_or(StdDuration::from_secs(1));
                message
                    .ack_with(jetstream::AckKind::Nak(Some(delay)))
                    .await
                    .map_err(|e| IngestError::Transient(format!("nats nak failed: {e}")))?;
                return Ok(None);
            }
        }

        Ok(Some(Delivery {
            payload: envelope.body.clone(),
            handle: DeliveryHandle(Box::new(NatsHandle { message })),
        }))
    }
}

struct NatsHandle {
    message: jetstream::Message,
}

#[async_trait]
impl DeliveryHandleImpl for NatsHandle {
    async fn complete(self: Box<Self>) -> Result<(), IngestError> {
        self.message
            .ack()
            .await
            .map_err(|e| IngestError::Transient(format!("nats ack failed: {e}")))
    }

    async fn abandon(self: Box<Self>) -> Result<(), IngestError> {
        self.message
            .ack_with(jetstream::AckKind::Nak(None))
            .await
            .map_err(|e| IngestError::Transient(format!("nats nak failed: {e}")))
    }
}

#[async_trait]
impl MessageBus for NatsBus {
    async fn publish_work_item(&self, item: &WorkItem) -> Result<(), IngestError> {
        self.publish_envelope(&self.work_items_stream, item, None).await
    }

    async fn receive_work_item(&self) -> Result<Option<Delivery<WorkItem>>, IngestError> {
        self.receive_envelope(&self.work_items_stream, "worker").await
    }

    async fn publish_work_done(&self, done: &WorkDone) -> Result<(), IngestError> {
        self.publish_envelope(&self.work_done_stream, done, None).await
    }

    async fn receive_work_done(&self) -> Result<Option<Delivery<WorkDone>>, IngestError> {
        self.receive_envelope(&self.work_done_stream, "coordinator").await
    }

    async fn publish_consolidate(&self, msg: &Consolidate) -> Result<(), IngestError> {
        self.publish_envelope(&self.consolidate_stream, msg, None).await
    }

    async fn publish_consolidate_delayed(
        &self,
        msg: &Consolidate,
        delay: ChronoDuration,
    ) -> Result<(), IngestError> {
        let not_before = Utc::now() + delay;
        self.publish_envelope(&self.consolidate_stream, msg, Some(not_before)).await
    }

    async fn receive_consolidate(&self) -> Result<Option<Delivery<Consolidate>>, IngestError> {
        self.receive_envelope(&self.consolidate_stream, "consolidator").await
    }
}
