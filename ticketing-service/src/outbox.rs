use anyhow::Result;
use async_trait::async_trait;
use rdkafka::producer::{FutureProducer, FutureRecord};
use shared::OutboxEvent;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{error, info};

use crate::store::TicketingStore;

/// Where queued ticket deliveries go. The email sender consumes the other end.
#[async_trait]
pub trait DeliveryPublisher: Send + Sync {
    async fn publish(&self, event: &OutboxEvent) -> Result<()>;
}

pub struct KafkaPublisher {
    producer: FutureProducer,
    topic: String,
}

impl KafkaPublisher {
    pub fn new(producer: FutureProducer, topic: String) -> Self {
        Self { producer, topic }
    }
}

#[async_trait]
impl DeliveryPublisher for KafkaPublisher {
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

pub struct OutboxProcessor {
    store: Arc<dyn TicketingStore>,
    publisher: Arc<dyn DeliveryPublisher>,
    interval: Duration,
}

impl OutboxProcessor {
    pub fn new(
        store: Arc<dyn TicketingStore>,
        publisher: Arc<dyn DeliveryPublisher>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            publisher,
            interval,
        }
    }

    pub async fn run(&self) {
        let mut interval = time::interval(self.interval);

        loop {
            interval.tick().await;

            if let Err(e) = self.process_outbox_events().await {
                error!("Error processing outbox events: {}", e);
            }
        }
    }

    /// Publishes every pending row, oldest first. A row is only marked once the broker has
    /// acknowledged it, so delivery is at-least-once.
    pub async fn process_outbox_events(&self) -> Result<usize> {
        let pending = self.store.pending_outbox(100).await?;
        let mut published = 0;

        for event in pending {
            if let Err(e) = self.publisher.publish(&event).await {
                error!("Failed to publish event {}: {}", event.id, e);
                continue;
            }

            self.store.mark_outbox_processed(event.id).await?;
            published += 1;
            info!(event_type = %event.event_type, order_id = %event.aggregate_id, "Published outbox event: {}", event.id);
        }

        Ok(published)
    }
}
