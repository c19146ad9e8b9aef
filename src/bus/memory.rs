//! In-memory `MessageBus` test double — no broker required.
//!
//! Backs unit and integration tests that need publish/receive/ack
//! semantics without a running NATS server. Abandoned messages are pushed
//! back to the front of their queue so the next `receive` redelivers them,
//! approximating at-least-once delivery under test.

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{Delivery, DeliveryHandle, DeliveryHandleImpl, MessageBus};
use crate::error::IngestError;
use crate::models::{Consolidate, WorkDone, WorkItem};

struct InMemoryQueue<T> {
    ready: Mutex<VecDeque<T>>,
    delayed: Mutex<Vec<(Instant, T)>>,
}

impl<T: Clone + Send + 'static> InMemoryQueue<T> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            ready: Mutex::new(VecDeque::new()),
            delayed: Mutex::new(Vec::new()),
        })
    }

    async fn push(&self, item: T) {
        self.ready.lock().await.push_back(item);
    }

    async fn push_delayed(&self, item: T, delay: ChronoDuration) {
        let delay_std = delay.to_std().unwrap_or(std::time::Duration::ZERO);
        self.delayed.lock().await.push((Instant::now() + delay_std, item));
    }

    async fn push_front(&self, item: T) {
        self.ready.lock().await.push_front(item);
    }

    async fn pop(&self) -> Option<T> {
        self.promote_due().await;
        self.ready.lock().await.pop_front()
    }

    async fn promote_due(&self) {
        let now = Instant::now();
        let mut delayed = self.delayed.lock().await;
        let due: Vec<usize> = delayed
            .iter()
            .enumerate()
            .filter(|(_, (at, _))| *at <= now)
            .map(|(i, _)| i)
            .collect();
        if due.is_empty() {
            return;
        }
        let mut ready = self.ready.lock().await;
        for &i in due.iter().rev() {
            let (_, item) = delayed.remove(i);
            ready.push_back(item);
        }
    }
}

struct InMemoryHandle<T> {
    queue: Arc<InMemoryQueue<T>>,
    item: T,
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> DeliveryHandleImpl for InMemoryHandle<T> {
    async fn complete(self: Box<Self>) -> Result<(), IngestError> {
        Ok(())
    }

    async fn abandon(self: Box<Self>) -> Result<(), IngestError> {
        self.queue.push_front(self.item).await;
        Ok(())
    }
}

/// Three independent in-memory queues, one per logical bus queue.
pub struct InMemoryBus {
    work_items: Arc<InMemoryQueue<WorkItem>>,
    work_done: Arc<InMemoryQueue<WorkDone>>,
    consolidate: Arc<InMemoryQueue<Consolidate>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self {
            work_items: InMemoryQueue::new(),
            work_done: InMemoryQueue::new(),
            consolidate: InMemoryQueue::new(),
        }
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish_work_item(&self, item: &WorkItem) -> Result<(), IngestError> {
        self.work_items.push(item.clone()).await;
        Ok(())
    }

    async fn receive_work_item(&self) -> Result<Option<Delivery<WorkItem>>, IngestError> {
        Ok(self.work_items.pop().await.map(|item| Delivery {
            payload: item.clone(),
            handle: DeliveryHandle(Box::new(InMemoryHandle {
                queue: self.work_items.clone(),
                item,
            })),
        }))
    }

    async fn publish_work_done(&self, done: &WorkDone) -> Result<(), IngestError> {
        self.work_done.push(done.clone()).await;
        Ok(())
    }

    async fn receive_work_done(&self) -> Result<Option<Delivery<WorkDone>>, IngestError> {
        Ok(self.work_done.pop().await.map(|item| Delivery {
            payload: item.clone(),
            handle: DeliveryHandle(Box::new(InMemoryHandle {
                queue: self.work_done.clone(),
                item,
            })),
        }))
    }

    async fn publish_consolidate(&self, msg: &Consolidate) -> Result<(), IngestError> {
        self.consolidate.push(msg.clone()).await;
        Ok(())
    }

    async fn publish_consolidate_delayed(
        &self,
        msg: &Consolidate,
        delay: ChronoDuration,
    ) -> Result<(), IngestError> {
        self.consolidate.push_delayed(msg.clone(), delay).await;
        Ok(())
    }

    async fn receive_consolidate(&self) -> Result<Option<Delivery<Consolidate>>, IngestError> {
        Ok(self.consolidate.pop().await.map(|item| Delivery {
            payload: item.clone(),
            handle: DeliveryHandle(Box::new(InMemoryHandle {
                queue: self.consolidate.clone(),
                item,
            })),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn sample_work_item() -> WorkItem {
        WorkItem {
            feed: "nivoda".to_string(),
            run_id: Uuid::new_v4(),
            trace_id: Uuid::new_v4(),
            partition_id: "partition-0".to_string(),
            min_price: 0,
            max_price: 100,
            estimated_records: 10,
            offset: 0,
            limit: 100,
            updated_from: None,
            updated_to: None,
        }
    }

    #[tokio::test]
    async fn receive_returns_none_when_empty() {
        let bus = InMemoryBus::new();
        assert!(bus.receive_work_item().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn publish_then_receive_round_trips() {
        let bus = InMemoryBus::new();
        let item = sample_work_item();
        bus.publish_work_item(&item).await.unwrap();
        let delivery = bus.receive_work_item().await.unwrap().unwrap();
        assert_eq!(delivery.payload.partition_id, item.partition_id);
        delivery.handle.complete().await.unwrap();
        assert!(bus.receive_work_item().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn abandon_redelivers() {
        let bus = InMemoryBus::new();
        bus.publish_work_item(&sample_work_item()).await.unwrap();
        let delivery = bus.receive_work_item().await.unwrap().unwrap();
        delivery.handle.abandon().await.unwrap();
        let redelivered = bus.receive_work_item().await.unwrap();
        assert!(redelivered.is_some());
    }

    #[tokio::test]
    async fn delayed_consolidate_is_not_immediately_visible() {
        let bus = InMemoryBus::new();
        let msg = Consolidate {
            feed: "nivoda".to_string(),
            run_id: Uuid::new_v4(),
            trace_id: Uuid::new_v4(),
            force: true,
        };
        bus.publish_consolidate_delayed(&msg, ChronoDuration::milliseconds(50))
            .await
            .unwrap();
        assert!(bus.receive_consolidate().await.unwrap().is_none());
        tokio::time::sleep(std::time::Duration::from_millis(80)).await;
        assert!(bus.receive_consolidate().await.unwrap().is_some());
    }
}
