use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use rdkafka::producer::{FutureProducer, FutureRecord};
use shared::OutboxEvent;
use tokio::sync::watch;
use tokio::time;
use tracing::{debug, error, info};

use crate::store::{Store, StoreTx};

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &OutboxEvent) -> Result<()>;
}

pub struct KafkaPublisher {
    producer: FutureProducer,
    topic: String,
}

impl KafkaPublisher {
    pub fn new(producer: FutureProducer, topic: impl Into<String>) -> Self {
        Self {
            producer,
            topic: topic.into(),
        }
    }
}

#[async_trait]
impl EventPublisher for KafkaPublisher {
    async fn publish(&self, event: &OutboxEvent) -> Result<()> {
        let json = serde_json::to_string(&event.event_data)?;
        let key = event.aggregate_id.to_string();
        let record = FutureRecord::to(&self.topic)
            .payload(&json)
            .key(&key);

        self.producer
            .send(record, Duration::from_secs(5))
            .await
            .map_err(|(e, _)| anyhow::anyhow!("Failed to publish event: {}", e))?;

        Ok(())
    }
}

pub struct OutboxProcessor<S> {
    store: Arc<S>,
    publisher: Arc<dyn EventPublisher>,
    interval: Duration,
    batch_size: i64,
}

impl<S: Store> OutboxProcessor<S> {
    pub fn new(store: Arc<S>, publisher: Arc<dyn EventPublisher>, interval: Duration) -> Self {
        Self {
            store,
            publisher,
            interval,
            batch_size: 100,
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = time::interval(self.interval);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("Outbox processor stopping");
                    return;
                }
                _ = interval.tick() => {}
            }

            if let Err(e) = self.process_once().await {
                error!("Error processing outbox events: {}", e);
            }
        }
    }

    /// Publishes one batch in creation order and returns how many went out.
    /// Stops at the first publish failure so per-booking ordering holds.
    pub async fn process_once(&self) -> Result<usize> {
        let pending = {
            let mut tx = self.store.begin().await?;
            tx.pending_outbox_events(self.batch_size).await?
        };

        let mut published = 0;
        for event in pending {
            if let Err(e) = self.publisher.publish(&event).await {
                error!("Failed to publish event {}: {}", event.id, e);
                break;
            }

            let mut tx = self.store.begin().await?;
            tx.mark_outbox_published(event.id).await?;
            tx.commit().await?;

            debug!(event_id = %event.id, event_type = %event.event_type, "Published outbox event");
            published += 1;
        }

        Ok(published)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::Utc;
    use shared::BookingEvent;
    use std::sync::Mutex;
    use uuid::Uuid;

    #[derive(Default)]
    struct Recording {
        published: Mutex<Vec<String>>,
        fail_after: Option<usize>,
    }

    #[async_trait]
    impl EventPublisher for Recording {
        async fn publish(&self, event: &OutboxEvent) -> Result<()> {
            let mut published = self.published.lock().unwrap();
            if self.fail_after == Some(published.len()) {
                anyhow::bail!("broker unavailable");
            }
            published.push(event.event_type.clone());
            Ok(())
        }
    }

    async fn store_with_events() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        let booking_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        let events = [
            BookingEvent::BookingCancelled { booking_id, user_id },
            BookingEvent::BookingExpired { booking_id: Uuid::new_v4(), user_id },
        ];

        let mut tx = store.begin().await.unwrap();
        for event in &events {
            let outbox = OutboxEvent::from_booking_event(event, Utc::now()).unwrap();
            tx.insert_outbox_event(&outbox).await.unwrap();
        }
        tx.commit().await.unwrap();
        store
    }

    #[tokio::test]
    async fn publishes_pending_events_once() {
        let store = store_with_events().await;
        let publisher = Arc::new(Recording::default());
        let processor = OutboxProcessor::new(store.clone(), publisher.clone(), Duration::from_secs(5));

        assert_eq!(processor.process_once().await.unwrap(), 2);
        assert_eq!(processor.process_once().await.unwrap(), 0);

        assert_eq!(
            *publisher.published.lock().unwrap(),
            ["BookingCancelled", "BookingExpired"]
        );
        assert!(store.outbox().await.iter().all(|e| e.processed));
    }

    #[tokio::test]
    async fn failed_publish_is_retried_next_round() {
        let store = store_with_events().await;
        let flaky = Arc::new(Recording {
            fail_after: Some(1),
            ..Recording::default()
        });
        let processor = OutboxProcessor::new(store.clone(), flaky, Duration::from_secs(5));

        assert_eq!(processor.process_once().await.unwrap(), 1);
        let pending: Vec<_> = store.outbox().await.into_iter().filter(|e| !e.processed).collect();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].event_type, "BookingExpired");

        let healthy = Arc::new(Recording::default());
        let processor = OutboxProcessor::new(store.clone(), healthy.clone(), Duration::from_secs(5));
        assert_eq!(processor.process_once().await.unwrap(), 1);
        assert_eq!(*healthy.published.lock().unwrap(), ["BookingExpired"]);
    }
}
