use std::time::Duration;

use async_trait::async_trait;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::error::KafkaError;
use rdkafka::types::RDKafkaErrorCode;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::config::KafkaConfig;
use crate::metrics_consts::TOPICS_CREATED;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("topic {0} already exists")]
    AlreadyExists(String),
    #[error("failed to create topic {topic}: {code}")]
    Create {
        topic: String,
        code: RDKafkaErrorCode,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provisioned {
    AlreadyExists,
    Created,
}

/// Shape of a topic to provision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSpec {
    pub name: String,
    pub partitions: i32,
    pub replication_factor: i32,
    pub config: Vec<(String, String)>,
}

impl TopicSpec {
    /// Short-retention, lz4 compressed topic.
    pub fn new(name: impl Into<String>, partitions: i32, replication_factor: i32) -> Self {
        Self {
            name: name.into(),
            partitions,
            replication_factor,
            config: vec![
                ("cleanup.policy".to_owned(), "delete".to_owned()),
                ("compression.type".to_owned(), "lz4".to_owned()),
                ("delete.retention.ms".to_owned(), "2000".to_owned()),
                ("file.delete.delay.ms".to_owned(), "2000".to_owned()),
            ],
        }
    }

    /// Overrides or adds a topic level setting.
    pub fn with_config(mut self, key: &str, value: impl Into<String>) -> Self {
        let value = value.into();
        match self.config.iter_mut().find(|(k, _)| k.as_str() == key) {
            Some(entry) => entry.1 = value,
            None => self.config.push((key.to_owned(), value)),
        }
        self
    }
}

/// Administrative operations the provisioner needs.
#[async_trait]
pub trait TopicAdmin: Send + Sync {
    async fn topic_exists(&self, name: &str) -> Result<bool, ProvisionError>;

    /// Must report a topic someone else created first as `AlreadyExists`.
    async fn create_topic(&self, spec: &TopicSpec) -> Result<(), ProvisionError>;
}

/// Creates the topic unless it exists. Safe to call from any number of
/// processes: losing a creation race counts as the topic already existing.
pub async fn ensure_topic<A>(admin: &A, spec: &TopicSpec) -> Result<Provisioned, ProvisionError>
where
    A: TopicAdmin + ?Sized,
{
    if admin.topic_exists(&spec.name).await? {
        info!(topic = %spec.name, "Topic already exists, skipping creation");
        return Ok(Provisioned::AlreadyExists);
    }

    match admin.create_topic(spec).await {
        Ok(()) => {
            info!(
                topic = %spec.name,
                partitions = spec.partitions,
                replication_factor = spec.replication_factor,
                "Topic created"
            );
            metrics::counter!(TOPICS_CREATED).increment(1);
            Ok(Provisioned::Created)
        }
        Err(ProvisionError::AlreadyExists(_)) => {
            debug!(topic = %spec.name, "Topic was created concurrently");
            Ok(Provisioned::AlreadyExists)
        }
        Err(e) => {
            error!(topic = %spec.name, "Failed to create topic: {}", e);
            Err(e)
        }
    }
}

pub struct KafkaTopicAdmin {
    admin: AdminClient<DefaultClientContext>,
    timeout: Duration,
}

impl KafkaTopicAdmin {
    pub fn new(config: &KafkaConfig, timeout: Duration) -> Result<Self, ProvisionError> {
        let admin: AdminClient<DefaultClientContext> = config.client_config().create()?;
        Ok(Self { admin, timeout })
    }
}

#[async_trait]
impl TopicAdmin for KafkaTopicAdmin {
    async fn topic_exists(&self, name: &str) -> Result<bool, ProvisionError> {
        let metadata = self.admin.inner().fetch_metadata(None, self.timeout)?;
        Ok(metadata.topics().iter().any(|topic| topic.name() == name))
    }

    async fn create_topic(&self, spec: &TopicSpec) -> Result<(), ProvisionError> {
        let mut new_topic = NewTopic::new(
            &spec.name,
            spec.partitions,
            TopicReplication::Fixed(spec.replication_factor),
        );
        for (key, value) in &spec.config {
            new_topic = new_topic.set(key, value);
        }

        let options = AdminOptions::new().operation_timeout(Some(self.timeout));
        let results = self.admin.create_topics([&new_topic], &options).await?;

        for result in results {
            match result {
                Ok(_) => {}
                Err((topic, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    return Err(ProvisionError::AlreadyExists(topic))
                }
                Err((topic, code)) => return Err(ProvisionError::Create { topic, code }),
            }
        }
        Ok(())
    }
}
