use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::assignment::AssignmentHandler;
use crate::error::ConsumerError;
use crate::types::ConsumeOutcome;

/// Capabilities the consumption loop needs from a broker client.
///
/// A client is owned by exactly one loop, which never has more than one call
/// in flight: most client libraries are not safe to drive from several threads.
#[async_trait]
pub trait BrokerClient: Send {
    type Payload: Send + 'static;

    /// Subscribe to a topic or topic pattern. `handler` runs on every
    /// partition assignment. A client accepts a single subscription.
    fn subscribe(
        &mut self,
        topic_pattern: &str,
        handler: Arc<dyn AssignmentHandler>,
    ) -> Result<(), ConsumerError>;

    /// Wait at most `timeout` for the next record.
    async fn poll(&mut self, timeout: Duration) -> ConsumeOutcome<Self::Payload>;

    /// Mark a record as processed, so the next offset commit moves past it.
    fn store_offset(&mut self, topic: &str, partition: i32, offset: i64)
        -> Result<(), ConsumerError>;

    /// Unsubscribe and flush pending offsets. Dropping the client afterwards
    /// releases the connection and the group membership.
    fn close(&mut self) -> Result<(), ConsumerError>;
}
