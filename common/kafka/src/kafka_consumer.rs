use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::{
    consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer},
    error::{KafkaError, KafkaResult, RDKafkaErrorCode},
    ClientConfig, ClientContext, Message, Statistics, TopicPartitionList,
};
use tracing::{debug, error, info, warn};

use crate::assignment::{AssignmentHandler, PartitionAssigner};
use crate::client::BrokerClient;
use crate::config::KafkaConfig;
use crate::decoder::{JsonPayload, PayloadDecoder, RawPayload};
use crate::error::{ConsumeError, ConsumerError};
use crate::metrics_consts::CONSUMER_ASSIGNMENTS;
use crate::stats::{record_statistics, STATISTICS_INTERVAL_MS};
use crate::types::{ConsumeOutcome, ConsumedMessage, PartitionAssignment, Subscription};

/// Routes librdkafka's rebalance callbacks to the assignment handler installed
/// at subscription time.
#[derive(Default)]
pub struct AssignmentContext {
    handler: OnceLock<Arc<dyn AssignmentHandler>>,
}

impl ClientContext for AssignmentContext {
    fn stats(&self, statistics: Statistics) {
        record_statistics("consumer", &statistics);
    }
}

impl ConsumerContext for AssignmentContext {
    fn post_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(partitions) => {
                let Some(handler) = self.handler.get() else {
                    warn!("Received an assignment before subscribing, ignoring it");
                    return;
                };

                let proposed: Vec<PartitionAssignment> = partitions
                    .elements()
                    .into_iter()
                    .map(|elem| {
                        PartitionAssignment::new(elem.topic(), elem.partition(), elem.offset().into())
                    })
                    .collect();
                let count = proposed.len();

                // The handler re-assigns on top of the default assignment librdkafka
                // just made, which is how we override the start offsets
                match handler.on_assign(base_consumer, proposed) {
                    Ok(()) => {
                        metrics::counter!(CONSUMER_ASSIGNMENTS, "outcome" => "acknowledged")
                            .increment(1);
                    }
                    Err(e) => {
                        error!(
                            partitions = count,
                            "Assignment was not acknowledged, no partitions until the next rebalance: {}",
                            e
                        );
                        metrics::counter!(CONSUMER_ASSIGNMENTS, "outcome" => "failed")
                            .increment(1);
                        if let Err(e) = base_consumer.unassign() {
                            error!("Failed to drop unacknowledged assignment: {}", e);
                        }
                    }
                }
            }
            Rebalance::Revoke(partitions) => {
                info!(partitions = partitions.count(), "Partitions revoked");
            }
            Rebalance::Error(e) => {
                error!("Rebalance error: {}", e);
            }
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(()) => debug!(partitions = offsets.count(), "Offsets committed"),
            Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => {}
            Err(e) => warn!(partitions = offsets.count(), "Failed to commit offsets: {}", e),
        }
    }
}

impl<C: ConsumerContext + 'static> PartitionAssigner for BaseConsumer<C> {
    fn assign(&self, partitions: &[PartitionAssignment]) -> Result<(), ConsumerError> {
        let mut list = TopicPartitionList::with_capacity(partitions.len());
        for partition in partitions {
            list.add_partition_offset(
                partition.topic(),
                partition.partition(),
                partition.offset.into(),
            )?;
        }

        Consumer::assign(self, &list).map_err(|e| ConsumerError::Assignment {
            partitions: partitions.len(),
            reason: e.to_string(),
        })
    }
}

fn consumer_client_config(
    kafka: &KafkaConfig,
    subscription: &Subscription,
    session_timeout_ms: u32,
) -> ClientConfig {
    let mut client_config = kafka.client_config();
    client_config
        .set("group.id", subscription.group_id())
        .set("auto.offset.reset", subscription.offset_reset().as_str())
        .set("session.timeout.ms", session_timeout_ms.to_string())
        .set("statistics.interval.ms", STATISTICS_INTERVAL_MS)
        .set("enable.partition.eof", "false")
        .set("enable.auto.commit", "true")
        // Offsets are stored by the loop once the handler is done with a record
        .set("enable.auto.offset.store", "false");
    client_config
}

/// Broker client backed by an rdkafka `StreamConsumer`. The decoder decides
/// what the message handler receives.
pub struct KafkaBrokerClient<D> {
    consumer: StreamConsumer<AssignmentContext>,
    decoder: D,
    closed: bool,
}

/// Hands raw payload bytes to the handler.
pub type RawKafkaClient = KafkaBrokerClient<RawPayload>;

/// Hands JSON-decoded payloads to the handler.
pub type JsonKafkaClient<T> = KafkaBrokerClient<JsonPayload<T>>;

impl<D: PayloadDecoder> KafkaBrokerClient<D> {
    /// Connects to the brokers as a member of the subscription's group.
    /// Fails if the brokers can't be reached.
    pub fn new(
        kafka: &KafkaConfig,
        subscription: &Subscription,
        session_timeout_ms: u32,
        decoder: D,
    ) -> Result<Self, ConsumerError> {
        let client_config = consumer_client_config(kafka, subscription, session_timeout_ms);
        debug!("rdkafka configuration: {:?}", client_config);
        let consumer: StreamConsumer<AssignmentContext> =
            client_config.create_with_context(AssignmentContext::default())?;

        // "Ping" the Kafka brokers by requesting metadata
        match consumer.fetch_metadata(None, Duration::from_secs(15)) {
            Ok(metadata) => {
                info!(
                    "Successfully connected to Kafka brokers. Found {} topics.",
                    metadata.topics().len()
                );
            }
            Err(error) => {
                error!("Failed to fetch metadata from Kafka brokers: {:?}", error);
                return Err(error.into());
            }
        }

        Ok(Self {
            consumer,
            decoder,
            closed: false,
        })
    }
}

#[async_trait]
impl<D: PayloadDecoder> BrokerClient for KafkaBrokerClient<D> {
    type Payload = D::Output;

    fn subscribe(
        &mut self,
        topic_pattern: &str,
        handler: Arc<dyn AssignmentHandler>,
    ) -> Result<(), ConsumerError> {
        if self.closed {
            return Err(ConsumerError::Closed);
        }
        if self.consumer.context().handler.set(handler).is_err() {
            return Err(ConsumerError::AlreadySubscribed(topic_pattern.to_owned()));
        }

        self.consumer.subscribe(&[topic_pattern])?;
        info!(topic = topic_pattern, "Subscribed");
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> ConsumeOutcome<D::Output> {
        if self.closed {
            return ConsumeOutcome::Empty;
        }

        let message = match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Ok(Ok(message)) => message,
            Ok(Err(e)) => return ConsumeOutcome::Error(ConsumeError::Poll(e)),
            Err(_) => return ConsumeOutcome::Empty,
        };

        match self.decoder.decode(message.payload()) {
            Ok(payload) => ConsumeOutcome::Message(ConsumedMessage {
                topic: message.topic().to_owned(),
                partition: message.partition(),
                offset: message.offset(),
                key: message.key().map(<[u8]>::to_vec),
                payload,
            }),
            Err(source) => ConsumeOutcome::Error(ConsumeError::Decode {
                topic: message.topic().to_owned(),
                partition: message.partition(),
                offset: message.offset(),
                source,
            }),
        }
    }

    fn store_offset(
        &mut self,
        topic: &str,
        partition: i32,
        offset: i64,
    ) -> Result<(), ConsumerError> {
        self.consumer.store_offset(topic, partition, offset)?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), ConsumerError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        // Must not block a runtime worker. The commit completes while the
        // dropped consumer leaves its group.
        let committed = self.consumer.commit_consumer_state(CommitMode::Async);
        self.consumer.unsubscribe();

        match committed {
            // Nothing was stored since the last auto-commit
            Ok(()) | Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => Ok(()),
            Err(e) => Err(ConsumerError::Shutdown(e.to_string())),
        }
    }
}
