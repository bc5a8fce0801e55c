use std::time::Duration;

use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::ClientContext;
use serde::Serialize;
use serde_json::error::Error as SerdeError;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::config::KafkaConfig;
use crate::stats::{KafkaContext, STATISTICS_INTERVAL_MS};

/// Creates a batching producer and checks the brokers are reachable.
pub async fn create_kafka_producer(
    config: &KafkaConfig,
) -> Result<FutureProducer<KafkaContext>, KafkaError> {
    let mut client_config = config.client_config();
    client_config
        .set("linger.ms", config.kafka_producer_linger_ms.to_string())
        .set(
            "batch.num.messages",
            config.kafka_producer_batch_messages.to_string(),
        )
        .set(
            "message.timeout.ms",
            config.kafka_message_timeout_ms.to_string(),
        )
        .set(
            "compression.codec",
            config.kafka_compression_codec.to_owned(),
        )
        .set("statistics.interval.ms", STATISTICS_INTERVAL_MS);

    debug!("rdkafka configuration: {:?}", client_config);
    let api: FutureProducer<KafkaContext> = client_config.create_with_context(KafkaContext)?;

    // "Ping" the Kafka brokers by requesting metadata
    match api
        .client()
        .fetch_metadata(None, std::time::Duration::from_secs(15))
    {
        Ok(metadata) => {
            info!(
                "Successfully connected to Kafka brokers. Found {} topics.",
                metadata.topics().len()
            );
        }
        Err(error) => {
            error!("Failed to fetch metadata from Kafka brokers: {:?}", error);
            return Err(error);
        }
    }

    Ok(api)
}

#[derive(Error, Debug)]
pub enum KafkaProduceError {
    #[error("failed to serialize: {error}")]
    SerializationError { error: SerdeError },
    #[error("failed to produce to kafka: {error}")]
    KafkaProduceError { error: KafkaError },
    #[error("failed to produce to kafka (timeout)")]
    KafkaProduceCanceled,
}

/// Serializes `value` as JSON and waits for the broker to acknowledge it.
pub async fn send_json<T, C>(
    kafka_producer: &FutureProducer<C>,
    topic: &str,
    key: Option<&str>,
    value: &T,
) -> Result<(), KafkaProduceError>
where
    T: Serialize + ?Sized,
    C: ClientContext + 'static,
{
    let payload = serde_json::to_string(value)
        .map_err(|e| KafkaProduceError::SerializationError { error: e })?;

    let record = FutureRecord {
        topic,
        key,
        payload: Some(&payload),
        timestamp: None,
        partition: None,
        headers: None,
    };

    let delivery = kafka_producer
        .send_result(record)
        .map_err(|(e, _)| KafkaProduceError::KafkaProduceError { error: e })?;

    match delivery.await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err((e, _))) => Err(KafkaProduceError::KafkaProduceError { error: e }),
        Err(_) => Err(KafkaProduceError::KafkaProduceCanceled),
    }
}

/// Waits for in-flight records before the producer is dropped.
pub fn flush<C: ClientContext + 'static>(kafka_producer: &FutureProducer<C>, timeout: Duration) {
    if let Err(e) = kafka_producer.flush(timeout) {
        error!("Failed to flush producer: {}", e);
    }
}
