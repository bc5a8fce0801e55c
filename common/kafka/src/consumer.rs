use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::assignment::{AssignmentHandler, OffsetResetHook};
use crate::client::BrokerClient;
use crate::error::{ConsumeError, ConsumerError};
use crate::metrics_consts::{
    CONSUMER_DECODE_ERRORS, CONSUMER_HANDLER_DURATION, CONSUMER_HANDLER_FAILURES,
    CONSUMER_IDLE_BACKOFFS, CONSUMER_MESSAGES, CONSUMER_POLL_ERRORS,
};
use crate::types::{ConsumeOutcome, ConsumedMessage, LoopConfig, Subscription};

/// Business logic run for every consumed record.
///
/// Records are delivered at least once: a failure leaves the offset unstored,
/// so the record may come back after a restart or rebalance. Handlers must be
/// idempotent or own their durability. Must not block indefinitely.
#[async_trait]
pub trait MessageHandler<P>: Send + Sync {
    async fn handle(&self, message: ConsumedMessage<P>) -> anyhow::Result<()>;
}

enum Polled {
    Message,
    Idle,
    Closed,
}

/// Drains one subscription through a message handler, backing off while the
/// topic is idle.
///
/// The loop owns its broker client. It is released by `close`, by `run`
/// returning, or at the latest when the loop is dropped.
pub struct TopicConsumer<C, H>
where
    C: BrokerClient,
    H: MessageHandler<C::Payload>,
{
    client: Option<C>,
    handler: H,
    subscription: Subscription,
    config: LoopConfig,
    shutdown: CancellationToken,
}

impl<C, H> TopicConsumer<C, H>
where
    C: BrokerClient,
    H: MessageHandler<C::Payload>,
{
    /// Subscribes `client` with an assignment hook that applies the
    /// subscription's offset reset policy. Subscription failures are fatal.
    pub fn new(
        client: C,
        subscription: Subscription,
        handler: H,
        config: LoopConfig,
        shutdown: CancellationToken,
    ) -> Result<Self, ConsumerError> {
        let hook = Arc::new(OffsetResetHook::new(
            subscription.topic_pattern(),
            subscription.offset_reset(),
        ));
        Self::with_assignment_handler(client, subscription, handler, hook, config, shutdown)
    }

    /// Like `new`, with a caller-supplied assignment hook.
    pub fn with_assignment_handler(
        mut client: C,
        subscription: Subscription,
        handler: H,
        assignment_handler: Arc<dyn AssignmentHandler>,
        config: LoopConfig,
        shutdown: CancellationToken,
    ) -> Result<Self, ConsumerError> {
        client.subscribe(subscription.topic_pattern(), assignment_handler)?;

        Ok(Self {
            client: Some(client),
            handler,
            subscription,
            config,
            shutdown,
        })
    }

    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    pub fn is_closed(&self) -> bool {
        self.client.is_none()
    }

    /// Runs until the shutdown token is cancelled, then closes the client.
    pub async fn run(mut self) -> Result<(), ConsumerError> {
        info!(
            topic = %self.subscription.topic_pattern(),
            group = %self.subscription.group_id(),
            "Starting consumption loop"
        );

        'consume: while !self.shutdown.is_cancelled() {
            // Drain whatever is immediately available before paying for a backoff
            loop {
                match self.consume_once().await {
                    Polled::Message if self.shutdown.is_cancelled() => break 'consume,
                    Polled::Message => {}
                    Polled::Idle => break,
                    Polled::Closed => break 'consume,
                }
            }

            metrics::counter!(CONSUMER_IDLE_BACKOFFS, "topic" => self.topic_label())
                .increment(1);
            tokio::select! {
                _ = self.shutdown.cancelled() => break 'consume,
                _ = tokio::time::sleep(self.config.idle_backoff) => {}
            }
        }

        info!(
            topic = %self.subscription.topic_pattern(),
            "Consumption loop stopped"
        );
        self.close()
    }

    async fn consume_once(&mut self) -> Polled {
        let topic_label = self.topic_label();
        let Some(client) = self.client.as_mut() else {
            return Polled::Closed;
        };

        match client.poll(self.config.poll_timeout).await {
            ConsumeOutcome::Empty => {
                debug!(topic = %topic_label, "No message available");
                Polled::Idle
            }
            ConsumeOutcome::Error(e @ ConsumeError::Poll(_)) => {
                warn!(topic = %topic_label, "Error while polling: {}", e);
                metrics::counter!(CONSUMER_POLL_ERRORS, "topic" => topic_label).increment(1);
                Polled::Idle
            }
            ConsumeOutcome::Error(ConsumeError::Decode {
                topic,
                partition,
                offset,
                source,
            }) => {
                warn!(
                    topic = %topic,
                    partition,
                    offset,
                    "Skipping record that could not be decoded: {}",
                    source
                );
                metrics::counter!(CONSUMER_DECODE_ERRORS, "topic" => topic_label).increment(1);
                // Poison pills are stored so they don't come back after a restart
                if let Err(e) = client.store_offset(&topic, partition, offset) {
                    warn!(topic = %topic, partition, offset, "Failed to store offset: {}", e);
                }
                Polled::Idle
            }
            ConsumeOutcome::Message(message) => {
                let topic = message.topic.clone();
                let (partition, offset) = (message.partition, message.offset);
                metrics::counter!(CONSUMER_MESSAGES, "topic" => topic_label.clone()).increment(1);

                let start = Instant::now();
                match self.handler.handle(message).await {
                    Ok(()) => {
                        debug!(topic = %topic, partition, offset, "Message handled");
                        if let Err(e) = client.store_offset(&topic, partition, offset) {
                            warn!(topic = %topic, partition, offset, "Failed to store offset: {}", e);
                        }
                    }
                    Err(e) => {
                        error!(
                            topic = %topic,
                            partition,
                            offset,
                            "Message handler failed: {:#}",
                            e
                        );
                        metrics::counter!(CONSUMER_HANDLER_FAILURES, "topic" => topic_label.clone())
                            .increment(1);
                    }
                }
                metrics::histogram!(CONSUMER_HANDLER_DURATION, "topic" => topic_label)
                    .record(start.elapsed().as_secs_f64());

                Polled::Message
            }
        }
    }

    /// Unsubscribes and releases the broker client. Only the first call does
    /// anything. A failure is logged and returned, but the client is gone
    /// either way.
    pub fn close(&mut self) -> Result<(), ConsumerError> {
        let Some(mut client) = self.client.take() else {
            return Ok(());
        };

        info!(topic = %self.subscription.topic_pattern(), "Closing broker client");
        let result = client.close().map_err(|e| match e {
            ConsumerError::Shutdown(_) => e,
            other => ConsumerError::Shutdown(other.to_string()),
        });
        drop(client);

        if let Err(e) = &result {
            warn!(
                topic = %self.subscription.topic_pattern(),
                "Broker client was not released cleanly: {}",
                e
            );
        }
        result
    }

    fn topic_label(&self) -> String {
        self.subscription.topic_pattern().to_owned()
    }
}

impl<C, H> Drop for TopicConsumer<C, H>
where
    C: BrokerClient,
    H: MessageHandler<C::Payload>,
{
    fn drop(&mut self) {
        if self.client.is_some() {
            warn!(
                topic = %self.subscription.topic_pattern(),
                "Consumption loop dropped without being closed"
            );
            if let Err(e) = self.close() {
                debug!("Release on drop failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::test_utils::{
        assert_or_retry, decode_error, message, partitions, transient_error, RecordingHandler,
        ScriptedClient,
    };
    use crate::types::{OffsetReset, PartitionAssignment, StartOffset};

    fn subscription(offset_reset: OffsetReset) -> Subscription {
        Subscription::new("orders", "orders-group", offset_reset).unwrap()
    }

    fn loop_config(idle_backoff_ms: u64) -> LoopConfig {
        LoopConfig {
            idle_backoff: Duration::from_millis(idle_backoff_ms),
            poll_timeout: Duration::from_millis(10),
        }
    }

    fn payloads(seen: &[ConsumedMessage<&'static str>]) -> Vec<&'static str> {
        seen.iter().map(|m| m.payload).collect()
    }

    #[tokio::test]
    async fn drains_available_messages_before_backing_off() {
        let (client, script) = ScriptedClient::new(
            vec![
                message("orders", 0, 0, "a"),
                message("orders", 0, 1, "b"),
                message("orders", 0, 2, "c"),
            ],
            partitions("orders", 1, StartOffset::Stored),
        );
        let handler = RecordingHandler::<&'static str>::new();
        let seen = handler.seen();
        let shutdown = CancellationToken::new();

        let consumer = TopicConsumer::new(
            client,
            subscription(OffsetReset::Earliest),
            handler,
            loop_config(500),
            shutdown.clone(),
        )
        .unwrap();
        let task = tokio::spawn(consumer.run());

        assert_or_retry(|| script.poll_count() >= 4, Duration::from_secs(1)).await;

        // Three messages and the empty poll ran back to back, and the loop is
        // now sitting in its backoff
        let polls = script.polls();
        assert!(polls[3] - polls[0] < Duration::from_millis(500));
        assert_eq!(script.poll_count(), 4);
        assert_eq!(payloads(&seen.lock().unwrap()), vec!["a", "b", "c"]);

        shutdown.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(script.close_calls(), 1);
    }

    #[tokio::test]
    async fn orders_scenario_spaces_empty_polls_by_the_backoff() {
        let (client, script) = ScriptedClient::new(
            vec![
                message("orders", 0, 0, "o1"),
                message("orders", 1, 0, "o2"),
                message("orders", 0, 1, "o3"),
            ],
            partitions("orders", 2, StartOffset::Unset),
        );
        let handler = RecordingHandler::<&'static str>::new();
        let seen = handler.seen();
        let shutdown = CancellationToken::new();

        let consumer = TopicConsumer::new(
            client,
            subscription(OffsetReset::Earliest),
            handler,
            loop_config(10),
            shutdown.clone(),
        )
        .unwrap();
        let task = tokio::spawn(consumer.run());

        assert_or_retry(|| script.poll_count() >= 10, Duration::from_secs(2)).await;
        shutdown.cancel();
        task.await.unwrap().unwrap();

        assert_eq!(seen.lock().unwrap().len(), 3);
        let polls = script.polls();
        for pair in polls[3..].windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(10));
        }
        assert!(script
            .assignments()
            .iter()
            .flatten()
            .all(|p| p.offset == StartOffset::Beginning));
    }

    #[tokio::test]
    async fn earliest_rewinds_every_assigned_partition() {
        let proposed = vec![
            PartitionAssignment::new("orders", 0, StartOffset::Stored),
            PartitionAssignment::new("orders", 1, StartOffset::At(42)),
            PartitionAssignment::new("orders", 2, StartOffset::End),
        ];
        let (client, script) = ScriptedClient::<&'static str>::new(vec![], proposed);

        let _consumer = TopicConsumer::new(
            client,
            subscription(OffsetReset::Earliest),
            RecordingHandler::new(),
            loop_config(10),
            CancellationToken::new(),
        )
        .unwrap();

        let assignments = script.assignments();
        assert_eq!(assignments.len(), 1);
        assert_eq!(assignments[0].len(), 3);
        assert!(assignments[0]
            .iter()
            .all(|p| p.offset == StartOffset::Beginning));

        // Later rebalances go through the same hook
        script
            .rebalance(partitions("orders", 2, StartOffset::End))
            .unwrap();
        assert_eq!(
            script.assignments()[1],
            partitions("orders", 2, StartOffset::Beginning)
        );
    }

    #[tokio::test]
    async fn latest_keeps_the_proposed_offsets() {
        let proposed = vec![
            PartitionAssignment::new("orders", 0, StartOffset::Stored),
            PartitionAssignment::new("orders", 1, StartOffset::At(42)),
        ];
        let (client, script) = ScriptedClient::<&'static str>::new(vec![], proposed.clone());

        let _consumer = TopicConsumer::new(
            client,
            subscription(OffsetReset::Latest),
            RecordingHandler::new(),
            loop_config(10),
            CancellationToken::new(),
        )
        .unwrap();

        assert_eq!(script.assignments(), vec![proposed]);
    }

    #[tokio::test]
    async fn refused_assignment_leaves_the_consumer_without_partitions() {
        let (client, script) = ScriptedClient::<&'static str>::new(
            vec![],
            partitions("orders", 3, StartOffset::Unset),
        );
        script.refuse_assignments();

        let consumer = TopicConsumer::new(
            client,
            subscription(OffsetReset::Earliest),
            RecordingHandler::new(),
            loop_config(10),
            CancellationToken::new(),
        );

        assert!(consumer.is_ok());
        assert!(script.assignments().is_empty());
        assert!(matches!(
            script.rebalance(partitions("orders", 1, StartOffset::Unset)),
            Err(ConsumerError::Assignment { partitions: 1, .. })
        ));
    }

    #[tokio::test]
    async fn skips_records_that_fail_to_decode() {
        let (client, script) = ScriptedClient::new(
            vec![
                message("orders", 0, 0, "valid-1"),
                decode_error("orders", 0, 1),
                message("orders", 0, 2, "valid-2"),
            ],
            partitions("orders", 1, StartOffset::Unset),
        );
        let handler = RecordingHandler::<&'static str>::new();
        let seen = handler.seen();
        let shutdown = CancellationToken::new();

        let consumer = TopicConsumer::new(
            client,
            subscription(OffsetReset::Earliest),
            handler,
            loop_config(10),
            shutdown.clone(),
        )
        .unwrap();
        let task = tokio::spawn(consumer.run());

        assert_or_retry(|| seen.lock().unwrap().len() == 2, Duration::from_secs(1)).await;
        // Still polling after the bad record
        let polled = script.poll_count();
        assert_or_retry(|| script.poll_count() > polled, Duration::from_secs(1)).await;
        assert!(!task.is_finished());

        shutdown.cancel();
        task.await.unwrap().unwrap();

        assert_eq!(
            payloads(&seen.lock().unwrap()),
            vec!["valid-1", "valid-2"]
        );
        assert_eq!(
            script.stored_offsets(),
            vec![
                ("orders".to_owned(), 0, 0),
                ("orders".to_owned(), 0, 1),
                ("orders".to_owned(), 0, 2),
            ]
        );
    }

    #[tokio::test]
    async fn recovers_from_transient_poll_errors() {
        let (client, script) = ScriptedClient::new(
            vec![transient_error(), message("orders", 0, 0, "after-error")],
            partitions("orders", 1, StartOffset::Unset),
        );
        let handler = RecordingHandler::<&'static str>::new();
        let seen = handler.seen();
        let shutdown = CancellationToken::new();

        let consumer = TopicConsumer::new(
            client,
            subscription(OffsetReset::Latest),
            handler,
            loop_config(20),
            shutdown.clone(),
        )
        .unwrap();
        let task = tokio::spawn(consumer.run());

        assert_or_retry(|| seen.lock().unwrap().len() == 1, Duration::from_secs(1)).await;
        shutdown.cancel();
        task.await.unwrap().unwrap();

        let polls = script.polls();
        assert!(polls[1] - polls[0] >= Duration::from_millis(20));
        assert_eq!(payloads(&seen.lock().unwrap()), vec!["after-error"]);
    }

    #[tokio::test]
    async fn handler_failures_do_not_stop_the_loop() {
        let (client, script) = ScriptedClient::new(
            vec![
                message("orders", 0, 0, "a"),
                message("orders", 0, 1, "poison"),
                message("orders", 0, 2, "c"),
            ],
            partitions("orders", 1, StartOffset::Unset),
        );
        let handler = RecordingHandler::rejecting("poison");
        let seen = handler.seen();
        let shutdown = CancellationToken::new();

        let consumer = TopicConsumer::new(
            client,
            subscription(OffsetReset::Earliest),
            handler,
            loop_config(10),
            shutdown.clone(),
        )
        .unwrap();
        let task = tokio::spawn(consumer.run());

        assert_or_retry(|| seen.lock().unwrap().len() == 3, Duration::from_secs(1)).await;
        shutdown.cancel();
        task.await.unwrap().unwrap();

        // The rejected record's offset is never stored
        assert_eq!(
            script.stored_offsets(),
            vec![("orders".to_owned(), 0, 0), ("orders".to_owned(), 0, 2)]
        );
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_backoff() {
        let (client, script) = ScriptedClient::<&'static str>::new(
            vec![],
            partitions("orders", 1, StartOffset::Unset),
        );
        let shutdown = CancellationToken::new();

        let consumer = TopicConsumer::new(
            client,
            subscription(OffsetReset::Latest),
            RecordingHandler::new(),
            loop_config(60_000),
            shutdown.clone(),
        )
        .unwrap();
        let task = tokio::spawn(consumer.run());

        assert_or_retry(|| script.poll_count() == 1, Duration::from_secs(1)).await;
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("loop did not stop within the timeout")
            .unwrap()
            .unwrap();
        assert_eq!(script.close_calls(), 1);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (client, script) = ScriptedClient::<&'static str>::new(
            vec![],
            partitions("orders", 1, StartOffset::Unset),
        );

        let mut consumer = TopicConsumer::new(
            client,
            subscription(OffsetReset::Latest),
            RecordingHandler::new(),
            loop_config(10),
            CancellationToken::new(),
        )
        .unwrap();

        consumer.close().unwrap();
        consumer.close().unwrap();
        assert!(consumer.is_closed());

        drop(consumer);
        assert_eq!(script.close_calls(), 1);
        assert_eq!(script.subscribed(), None);
    }

    #[tokio::test]
    async fn close_failures_are_reported_once() {
        let (client, script) = ScriptedClient::<&'static str>::new(
            vec![],
            partitions("orders", 1, StartOffset::Unset),
        );
        script.fail_close();

        let mut consumer = TopicConsumer::new(
            client,
            subscription(OffsetReset::Latest),
            RecordingHandler::new(),
            loop_config(10),
            CancellationToken::new(),
        )
        .unwrap();

        assert!(matches!(consumer.close(), Err(ConsumerError::Shutdown(_))));
        assert!(consumer.close().is_ok());
        assert_eq!(script.close_calls(), 1);
    }

    #[tokio::test]
    async fn dropping_the_loop_releases_the_client() {
        let (client, script) = ScriptedClient::<&'static str>::new(
            vec![],
            partitions("orders", 1, StartOffset::Unset),
        );

        let consumer = TopicConsumer::new(
            client,
            subscription(OffsetReset::Latest),
            RecordingHandler::new(),
            loop_config(10),
            CancellationToken::new(),
        )
        .unwrap();
        drop(consumer);

        assert_eq!(script.close_calls(), 1);
    }

    #[tokio::test]
    async fn dropping_the_loop_tolerates_close_failures() {
        let (client, script) = ScriptedClient::<&'static str>::new(
            vec![],
            partitions("orders", 1, StartOffset::Unset),
        );
        script.fail_close();

        let consumer = TopicConsumer::new(
            client,
            subscription(OffsetReset::Latest),
            RecordingHandler::new(),
            loop_config(10),
            CancellationToken::new(),
        )
        .unwrap();
        drop(consumer);

        assert_eq!(script.close_calls(), 1);
        assert_eq!(script.subscribed(), None);
    }

    #[tokio::test]
    async fn aborted_run_still_releases_the_client() {
        let (client, script) = ScriptedClient::<&'static str>::new(
            vec![],
            partitions("orders", 1, StartOffset::Unset),
        );

        let consumer = TopicConsumer::new(
            client,
            subscription(OffsetReset::Latest),
            RecordingHandler::new(),
            loop_config(60_000),
            CancellationToken::new(),
        )
        .unwrap();
        let task = tokio::spawn(consumer.run());

        assert_or_retry(|| script.poll_count() == 1, Duration::from_secs(1)).await;
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        assert_eq!(script.close_calls(), 1);
    }

    #[tokio::test]
    async fn subscription_failures_are_fatal() {
        let (mut client, _script) = ScriptedClient::<&'static str>::new(
            vec![],
            partitions("orders", 1, StartOffset::Unset),
        );
        client
            .subscribe(
                "payments",
                Arc::new(OffsetResetHook::new("payments", OffsetReset::Latest)),
            )
            .unwrap();

        let result = TopicConsumer::new(
            client,
            subscription(OffsetReset::Latest),
            RecordingHandler::new(),
            loop_config(10),
            CancellationToken::new(),
        );

        assert!(matches!(result, Err(ConsumerError::AlreadySubscribed(_))));
    }
}
