use anyhow::Context;
use async_trait::async_trait;
use common_kafka::kafka_producer::send_json;
use common_kafka::stats::KafkaContext;
use common_kafka::{ConsumedMessage, MessageHandler};
use rdkafka::producer::FutureProducer;
use tracing::{debug, info};

use crate::station::{Station, TransformedStation};

/// Republishes every station row as a `TransformedStation` keyed by its
/// `station_id`, so the output topic reads as a table of stations.
pub struct StationTransformHandler {
    producer: FutureProducer<KafkaContext>,
    topic: String,
}

impl StationTransformHandler {
    pub fn new(producer: FutureProducer<KafkaContext>, topic: impl Into<String>) -> Self {
        Self {
            producer,
            topic: topic.into(),
        }
    }
}

#[async_trait]
impl MessageHandler<Station> for StationTransformHandler {
    async fn handle(&self, message: ConsumedMessage<Station>) -> anyhow::Result<()> {
        let transformed = TransformedStation::from(message.payload);
        let key = transformed.station_id.to_string();

        send_json(&self.producer, &self.topic, Some(key.as_str()), &transformed)
            .await
            .with_context(|| format!("failed to publish station {key} to {}", self.topic))?;

        debug!(
            station_id = transformed.station_id,
            line = %transformed.line,
            "Published transformed station"
        );
        Ok(())
    }
}

/// Logs each record of a topic nobody transforms.
pub struct LoggingHandler;

#[async_trait]
impl MessageHandler<Vec<u8>> for LoggingHandler {
    async fn handle(&self, message: ConsumedMessage<Vec<u8>>) -> anyhow::Result<()> {
        info!(
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            key = ?message.key.as_deref().map(String::from_utf8_lossy),
            "{}",
            String::from_utf8_lossy(&message.payload)
        );
        Ok(())
    }
}
