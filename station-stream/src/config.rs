use common_kafka::config::{ConsumerConfig, EnvMsDuration, KafkaConfig};
use common_kafka::connect::{ConnectorDefinition, JdbcSourceConfig};
use common_kafka::provisioning::TopicSpec;
use common_kafka::{ConsumerError, Subscription};
use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3310")]
    pub port: u16,

    // text or json
    #[envconfig(default = "text")]
    pub log_format: String,

    // Empty to skip connector registration
    #[envconfig(default = "http://localhost:8083")]
    pub connect_url: String,

    #[envconfig(default = "5000")]
    pub connect_timeout_ms: EnvMsDuration,

    #[envconfig(default = "stations")]
    pub connector_name: String,

    #[envconfig(default = "jdbc:postgresql://localhost:5432/cta")]
    pub jdbc_url: String,

    #[envconfig(default = "cta_admin")]
    pub jdbc_user: String,

    #[envconfig(default = "chicago")]
    pub jdbc_password: String,

    #[envconfig(default = "stations")]
    pub jdbc_table: String,

    #[envconfig(default = "stop_id")]
    pub jdbc_incrementing_column: String,

    #[envconfig(default = "cta.connect.")]
    pub jdbc_topic_prefix: String,

    #[envconfig(default = "org.chicago.cta.stations.table.v1")]
    pub output_topic: String,

    #[envconfig(default = "1")]
    pub output_topic_partitions: i32,

    #[envconfig(default = "1")]
    pub output_topic_replication_factor: i32,

    // Comma separated raw topics to log, each consumed by its own loop
    #[envconfig(default = "")]
    pub extra_topics: String,

    #[envconfig(default = "10000")]
    pub shutdown_flush_timeout_ms: EnvMsDuration,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub consumer: ConsumerConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connector(&self) -> Option<ConnectorDefinition> {
        if self.connect_url.trim().is_empty() {
            return None;
        }

        Some(ConnectorDefinition {
            name: self.connector_name.clone(),
            config: JdbcSourceConfig::incrementing(
                &self.jdbc_url,
                &self.jdbc_user,
                &self.jdbc_password,
                &self.jdbc_table,
                &self.jdbc_incrementing_column,
                &self.jdbc_topic_prefix,
            ),
        })
    }

    pub fn output_topic(&self) -> TopicSpec {
        TopicSpec::new(
            &self.output_topic,
            self.output_topic_partitions,
            self.output_topic_replication_factor,
        )
    }

    pub fn extra_topics(&self) -> Vec<String> {
        self.extra_topics
            .split(',')
            .map(str::trim)
            .filter(|topic| !topic.is_empty())
            .map(str::to_owned)
            .collect()
    }

    /// One subscription per extra topic, each in a group of its own
    /// (`<group>.<topic>`) so that starting or stopping them never rebalances
    /// the stations consumer.
    pub fn extra_subscriptions(&self) -> Result<Vec<Subscription>, ConsumerError> {
        self.extra_topics()
            .into_iter()
            .map(|topic| {
                let group = format!("{}.{}", self.consumer.kafka_consumer_group, topic);
                Subscription::new(topic, group, self.consumer.kafka_consumer_offset_reset)
            })
            .collect()
    }
}
