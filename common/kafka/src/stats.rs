use metrics::gauge;
use rdkafka::{ClientContext, Statistics};

use crate::metrics_consts::{
    KAFKA_ASSIGNMENT_SIZE, KAFKA_CONSUMER_LAG, KAFKA_QUEUE_BYTES, KAFKA_QUEUE_DEPTH,
    KAFKA_REPLY_QUEUE_DEPTH,
};

/// How often librdkafka reports statistics to the client context.
pub const STATISTICS_INTERVAL_MS: &str = "10000";

/// Exports librdkafka's periodic statistics as gauges labelled with the
/// client role.
pub fn record_statistics(role: &'static str, stats: &Statistics) {
    gauge!(KAFKA_REPLY_QUEUE_DEPTH, "role" => role).set(stats.replyq as f64);
    gauge!(KAFKA_QUEUE_DEPTH, "role" => role).set(stats.msg_cnt as f64);
    gauge!(KAFKA_QUEUE_BYTES, "role" => role).set(stats.msg_size as f64);

    if let Some(cgrp) = &stats.cgrp {
        gauge!(KAFKA_ASSIGNMENT_SIZE, "role" => role).set(cgrp.assignment_size as f64);
    }

    for (topic, topic_stats) in &stats.topics {
        for (partition, partition_stats) in &topic_stats.partitions {
            // -1 is librdkafka's internal unassigned partition, and a negative
            // lag means it is not known yet
            if *partition < 0 || partition_stats.consumer_lag < 0 {
                continue;
            }
            gauge!(
                KAFKA_CONSUMER_LAG,
                "role" => role,
                "topic" => topic.clone(),
                "partition" => partition.to_string()
            )
            .set(partition_stats.consumer_lag as f64);
        }
    }
}

/// Context of the producer: statistics become gauges instead of log lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct KafkaContext;

impl ClientContext for KafkaContext {
    fn stats(&self, statistics: Statistics) {
        record_statistics("producer", &statistics);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use metrics_exporter_prometheus::PrometheusBuilder;
    use rdkafka::statistics::{ConsumerGroup, Partition, Topic};

    use super::*;

    fn gauge_value(rendered: &str, name: &str, labels: &[&str]) -> Option<f64> {
        rendered
            .lines()
            .filter(|line| line.starts_with(&format!("{name}{{")))
            .find(|line| labels.iter().all(|label| line.contains(label)))
            .and_then(|line| line.rsplit(' ').next())
            .and_then(|value| value.parse().ok())
    }

    #[test]
    fn statistics_become_gauges() {
        let mut partitions = HashMap::new();
        partitions.insert(
            0,
            Partition {
                partition: 0,
                consumer_lag: 42,
                ..Default::default()
            },
        );
        partitions.insert(
            -1,
            Partition {
                partition: -1,
                consumer_lag: 7,
                ..Default::default()
            },
        );
        partitions.insert(
            1,
            Partition {
                partition: 1,
                consumer_lag: -1,
                ..Default::default()
            },
        );
        let mut topics = HashMap::new();
        topics.insert(
            "orders".to_owned(),
            Topic {
                topic: "orders".to_owned(),
                partitions,
                ..Default::default()
            },
        );
        let stats = Statistics {
            replyq: 3,
            msg_cnt: 12,
            cgrp: Some(ConsumerGroup {
                assignment_size: 2,
                ..Default::default()
            }),
            topics,
            ..Default::default()
        };

        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || record_statistics("consumer", &stats));
        let rendered = handle.render();

        assert_eq!(
            gauge_value(&rendered, KAFKA_REPLY_QUEUE_DEPTH, &[r#"role="consumer""#]),
            Some(3.0)
        );
        assert_eq!(
            gauge_value(&rendered, KAFKA_QUEUE_DEPTH, &[r#"role="consumer""#]),
            Some(12.0)
        );
        assert_eq!(
            gauge_value(&rendered, KAFKA_ASSIGNMENT_SIZE, &[r#"role="consumer""#]),
            Some(2.0)
        );
        assert_eq!(
            gauge_value(
                &rendered,
                KAFKA_CONSUMER_LAG,
                &[r#"topic="orders""#, r#"partition="0""#]
            ),
            Some(42.0)
        );
        assert_eq!(
            gauge_value(&rendered, KAFKA_CONSUMER_LAG, &[r#"partition="-1""#]),
            None
        );
        assert_eq!(
            gauge_value(&rendered, KAFKA_CONSUMER_LAG, &[r#"partition="1""#]),
            None
        );
    }
}
