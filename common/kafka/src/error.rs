use rdkafka::error::KafkaError;
use thiserror::Error;

use crate::decoder::DecodeError;

/// Errors surfaced by the consumption loop and its broker clients.
///
/// Only the ones raised while constructing and subscribing are fatal, the
/// loop itself logs everything else and keeps going.
#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("invalid subscription: {0}")]
    InvalidSubscription(String),
    #[error("client is already subscribed to {0}")]
    AlreadySubscribed(String),
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("failed to acknowledge assignment of {partitions} partitions: {reason}")]
    Assignment { partitions: usize, reason: String },
    #[error("failed to release broker client: {0}")]
    Shutdown(String),
    #[error("broker client is closed")]
    Closed,
}

/// Why a single poll did not yield a message.
#[derive(Debug, Error)]
pub enum ConsumeError {
    #[error("poll failed: {0}")]
    Poll(#[from] KafkaError),
    #[error("failed to decode record {topic}/{partition}@{offset}: {source}")]
    Decode {
        topic: String,
        partition: i32,
        offset: i64,
        #[source]
        source: DecodeError,
    },
}
