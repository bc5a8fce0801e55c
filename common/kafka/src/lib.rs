pub mod assignment;
pub mod client;
pub mod config;
pub mod connect;
pub mod consumer;
pub mod decoder;
pub mod error;
pub mod kafka_consumer;
pub mod kafka_producer;
pub mod metrics_consts;
pub mod provisioning;
pub mod stats;
pub mod types;

// Used in "mod tests" here and by the tests of dependent crates
pub mod test_utils;

pub use assignment::{AssignmentHandler, OffsetResetHook, PartitionAssigner};
pub use client::BrokerClient;
pub use consumer::{MessageHandler, TopicConsumer};
pub use error::{ConsumeError, ConsumerError};
pub use types::{
    ConsumeOutcome, ConsumedMessage, LoopConfig, OffsetReset, PartitionAssignment, StartOffset,
    Subscription,
};
