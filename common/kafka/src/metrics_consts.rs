// ==== Consumption loop metrics ====
/// Counter for records dispatched to a message handler
pub const CONSUMER_MESSAGES: &str = "consumer_messages_total";

/// Counter for records a message handler rejected
pub const CONSUMER_HANDLER_FAILURES: &str = "consumer_handler_failures_total";

/// Counter for polls that failed at the broker level
pub const CONSUMER_POLL_ERRORS: &str = "consumer_poll_errors_total";

/// Counter for records skipped because they could not be decoded
pub const CONSUMER_DECODE_ERRORS: &str = "consumer_decode_errors_total";

/// Counter for idle backoffs taken after an empty poll
pub const CONSUMER_IDLE_BACKOFFS: &str = "consumer_idle_backoffs_total";

/// Histogram for message handler latency
pub const CONSUMER_HANDLER_DURATION: &str = "consumer_handler_duration_seconds";

// ==== Rebalance metrics ====
/// Counter for partition assignments, labelled by outcome
pub const CONSUMER_ASSIGNMENTS: &str = "consumer_assignments_total";

// ==== Provisioning metrics ====
/// Counter for topics created by the provisioner
pub const TOPICS_CREATED: &str = "kafka_topics_created_total";

// ==== librdkafka statistics ====
/// Gauge for events waiting in the client's reply queue
pub const KAFKA_REPLY_QUEUE_DEPTH: &str = "kafka_client_reply_queue_depth";

/// Gauge for messages held in the client's queues
pub const KAFKA_QUEUE_DEPTH: &str = "kafka_client_queue_depth";

/// Gauge for bytes held in the client's queues
pub const KAFKA_QUEUE_BYTES: &str = "kafka_client_queue_bytes";

/// Gauge for partitions assigned to the consumer group member
pub const KAFKA_ASSIGNMENT_SIZE: &str = "kafka_consumer_assignment_size";

/// Gauge for the lag of each consumed partition
pub const KAFKA_CONSUMER_LAG: &str = "kafka_consumer_lag";
