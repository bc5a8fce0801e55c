use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use rdkafka::Offset;
use thiserror::Error;

use crate::error::{ConsumeError, ConsumerError};

/// Where a consumer group without committed offsets starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OffsetReset {
    Earliest,
    #[default]
    Latest,
}

impl OffsetReset {
    pub fn as_str(&self) -> &'static str {
        match self {
            OffsetReset::Earliest => "earliest",
            OffsetReset::Latest => "latest",
        }
    }
}

impl fmt::Display for OffsetReset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, PartialEq, Eq, Error)]
#[error("unknown offset reset policy {0}, must be earliest or latest")]
pub struct ParseOffsetResetError(String);

impl FromStr for OffsetReset {
    type Err = ParseOffsetResetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "earliest" => Ok(OffsetReset::Earliest),
            "latest" => Ok(OffsetReset::Latest),
            _ => Err(ParseOffsetResetError(s.to_owned())),
        }
    }
}

/// What a consumption loop reads, and as whom. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    topic_pattern: String,
    group_id: String,
    offset_reset: OffsetReset,
}

impl Subscription {
    /// `topic_pattern` is either a plain topic name or, when it starts with `^`,
    /// a regex matched against every topic in the cluster.
    pub fn new(
        topic_pattern: impl Into<String>,
        group_id: impl Into<String>,
        offset_reset: OffsetReset,
    ) -> Result<Self, ConsumerError> {
        let topic_pattern = topic_pattern.into();
        let group_id = group_id.into();

        if topic_pattern.trim().is_empty() {
            return Err(ConsumerError::InvalidSubscription(
                "topic pattern must not be empty".to_owned(),
            ));
        }
        if group_id.trim().is_empty() {
            return Err(ConsumerError::InvalidSubscription(
                "consumer group must not be empty".to_owned(),
            ));
        }

        Ok(Self {
            topic_pattern,
            group_id,
            offset_reset,
        })
    }

    pub fn topic_pattern(&self) -> &str {
        &self.topic_pattern
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn offset_reset(&self) -> OffsetReset {
        self.offset_reset
    }
}

/// Timing knobs of the drain loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopConfig {
    /// Pause after a poll that yielded no message
    pub idle_backoff: Duration,
    /// Upper bound on how long a single poll may wait
    pub poll_timeout: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            idle_backoff: Duration::from_secs(1),
            poll_timeout: Duration::from_secs(1),
        }
    }
}

/// Starting position of an assigned partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StartOffset {
    Beginning,
    End,
    Stored,
    /// Nothing negotiated, the broker falls back to the group's reset policy
    Unset,
    At(i64),
    /// That many records before the end
    Tail(i64),
}

impl From<Offset> for StartOffset {
    fn from(offset: Offset) -> Self {
        match offset {
            Offset::Beginning => StartOffset::Beginning,
            Offset::End => StartOffset::End,
            Offset::Stored => StartOffset::Stored,
            Offset::Invalid => StartOffset::Unset,
            Offset::Offset(n) => StartOffset::At(n),
            Offset::OffsetTail(n) => StartOffset::Tail(n),
        }
    }
}

impl From<StartOffset> for Offset {
    fn from(offset: StartOffset) -> Self {
        match offset {
            StartOffset::Beginning => Offset::Beginning,
            StartOffset::End => Offset::End,
            StartOffset::Stored => Offset::Stored,
            StartOffset::Unset => Offset::Invalid,
            StartOffset::At(n) => Offset::Offset(n),
            StartOffset::Tail(n) => Offset::OffsetTail(n),
        }
    }
}

/// One (topic, partition) pair proposed by a rebalance, with the offset the
/// assignment hook may rewrite before acknowledging it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionAssignment {
    topic: String,
    partition: i32,
    pub offset: StartOffset,
}

impl PartitionAssignment {
    pub fn new(topic: impl Into<String>, partition: i32, offset: StartOffset) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }
}

/// A record handed to the message handler.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumedMessage<P> {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: P,
}

/// Result of one poll attempt.
#[derive(Debug)]
pub enum ConsumeOutcome<P> {
    Message(ConsumedMessage<P>),
    Empty,
    Error(ConsumeError),
}
