//! Kafka delivery for push notifications.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rota_core::Notifier;
use rota_shared::{Notification, NotificationKind, UserId};
use tracing::{error, info};

use crate::app_config::KafkaConfig;

#[derive(Clone)]
pub struct KafkaNotifier {
    producer: FutureProducer,
    topic: String,
}

impl KafkaNotifier {
    pub fn new(config: &KafkaConfig) -> Result<Self, rdkafka::error::KafkaError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("message.timeout.ms", "5000")
            .create()?;

        Ok(Self {
            producer,
            topic: config.topic.clone(),
        })
    }

    async fn publish(&self, key: &str, payload: &str) -> Result<(), rdkafka::error::KafkaError> {
        let record = FutureRecord::to(&self.topic).key(key).payload(payload);

        match self.producer.send(record, Timeout::After(Duration::from_secs(0))).await {
            Ok(delivery) => {
                info!(
                    "Sent notification to {}/{}: partition {} offset {}",
                    self.topic, key, delivery.partition, delivery.offset
                );
                Ok(())
            }
            Err((e, _msg)) => {
                error!("Failed to send notification to {}: {}", self.topic, e);
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Notifier for KafkaNotifier {
    async fn notify(
        &self,
        user_id: UserId,
        kind: NotificationKind,
        context: serde_json::Value,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let notification = Notification {
            user_id,
            kind,
            context,
            timestamp: Utc::now(),
        };
        let payload = serde_json::to_string(&notification)?;
        self.publish(&user_id.to_string(), &payload).await?;
        Ok(())
    }
}
