use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use rdkafka::ClientConfig;
use thiserror::Error;

use crate::error::ConsumerError;
use crate::types::{LoopConfig, OffsetReset, Subscription};

#[derive(Envconfig, Clone)]
pub struct KafkaConfig {
    #[envconfig(default = "1000")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic

    #[envconfig(default = "100")]
    pub kafka_producer_batch_messages: u32, // Maximum number of messages batched in one request

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message: 20 seconds

    #[envconfig(default = "lz4")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "station-stream")]
    pub kafka_client_id: String,
}

impl KafkaConfig {
    /// Connection settings shared by consumers, producers and admin clients.
    /// Statistics stay off here: only clients whose context records them
    /// turn them on.
    pub fn client_config(&self) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &self.kafka_hosts)
            .set("client.id", &self.kafka_client_id);

        if self.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        client_config
    }
}

#[derive(Envconfig, Clone)]
pub struct ConsumerConfig {
    pub kafka_consumer_group: String,
    pub kafka_consumer_topic: String,

    // Only applies when the group has no committed offsets, except that "earliest"
    // also rewinds every partition on assignment
    #[envconfig(default = "latest")]
    pub kafka_consumer_offset_reset: OffsetReset,

    #[envconfig(default = "1000")]
    pub kafka_consumer_idle_backoff_ms: EnvMsDuration,

    #[envconfig(default = "1000")]
    pub kafka_consumer_poll_timeout_ms: EnvMsDuration,

    #[envconfig(default = "10000")]
    pub kafka_consumer_session_timeout_ms: u32,
}

impl ConsumerConfig {
    pub fn subscription(&self) -> Result<Subscription, ConsumerError> {
        Subscription::new(
            self.kafka_consumer_topic.clone(),
            self.kafka_consumer_group.clone(),
            self.kafka_consumer_offset_reset,
        )
    }

    pub fn loop_config(&self) -> LoopConfig {
        LoopConfig {
            idle_backoff: self.kafka_consumer_idle_backoff_ms.0,
            poll_timeout: self.kafka_consumer_poll_timeout_ms.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq, Error)]
#[error("expected a duration in milliseconds")]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}
