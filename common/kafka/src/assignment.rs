use tracing::info;

use crate::error::ConsumerError;
use crate::types::{OffsetReset, PartitionAssignment, StartOffset};

/// The part of a broker client that accepts a partition assignment.
pub trait PartitionAssigner {
    fn assign(&self, partitions: &[PartitionAssignment]) -> Result<(), ConsumerError>;
}

/// Invoked by the broker client every time partitions are (re)assigned.
///
/// Implementations may rewrite the proposed start offsets, and must finish by
/// handing the final list to `assigner.assign`. Skipping that step leaves the
/// consumer without partitions until the next rebalance, and it will silently
/// receive nothing.
///
/// Called from librdkafka's callback thread: keep it fast and non-blocking.
pub trait AssignmentHandler: Send + Sync {
    fn on_assign(
        &self,
        assigner: &dyn PartitionAssigner,
        partitions: Vec<PartitionAssignment>,
    ) -> Result<(), ConsumerError>;
}

/// Rewinds every assigned partition when the policy is `Earliest`, otherwise
/// keeps whatever the broker proposed.
pub fn apply_offset_reset(policy: OffsetReset, partitions: &mut [PartitionAssignment]) {
    if policy == OffsetReset::Earliest {
        for partition in partitions.iter_mut() {
            partition.offset = StartOffset::Beginning;
        }
    }
}

/// Default assignment hook of a consumption loop.
#[derive(Debug, Clone)]
pub struct OffsetResetHook {
    topic_pattern: String,
    policy: OffsetReset,
}

impl OffsetResetHook {
    pub fn new(topic_pattern: impl Into<String>, policy: OffsetReset) -> Self {
        Self {
            topic_pattern: topic_pattern.into(),
            policy,
        }
    }
}

impl AssignmentHandler for OffsetResetHook {
    fn on_assign(
        &self,
        assigner: &dyn PartitionAssigner,
        mut partitions: Vec<PartitionAssignment>,
    ) -> Result<(), ConsumerError> {
        apply_offset_reset(self.policy, &mut partitions);

        info!(
            topic = %self.topic_pattern,
            partitions = partitions.len(),
            offset_reset = %self.policy,
            "partitions assigned"
        );

        assigner.assign(&partitions)
    }
}
