use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use async_trait::async_trait;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};

use crate::assignment::{AssignmentHandler, PartitionAssigner};
use crate::client::BrokerClient;
use crate::consumer::MessageHandler;
use crate::decoder::DecodeError;
use crate::error::{ConsumeError, ConsumerError};
use crate::types::{ConsumeOutcome, ConsumedMessage, PartitionAssignment, StartOffset};

/// Test utilities for the consumption loop: an in-memory broker client that
/// replays a script of poll outcomes, and a handler that records what it saw.
struct ScriptState<P> {
    script: VecDeque<ConsumeOutcome<P>>,
    proposed: Vec<PartitionAssignment>,
    assignments: Vec<Vec<PartitionAssignment>>,
    refuse_assignments: bool,
    assignment_handler: Option<Arc<dyn AssignmentHandler>>,
    subscribed: Option<String>,
    polls: Vec<Instant>,
    stored: Vec<(String, i32, i64)>,
    close_calls: usize,
    fail_close: bool,
}

pub struct ScriptedClient<P> {
    state: Arc<Mutex<ScriptState<P>>>,
}

/// Inspects and drives a `ScriptedClient` after it moved into a loop.
pub struct ScriptHandle<P> {
    state: Arc<Mutex<ScriptState<P>>>,
}

impl<P> Clone for ScriptHandle<P> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<P: Send + 'static> ScriptedClient<P> {
    /// Polls return the scripted outcomes in order, then `Empty` forever.
    /// Subscribing triggers an assignment of `proposed`.
    pub fn new(
        script: Vec<ConsumeOutcome<P>>,
        proposed: Vec<PartitionAssignment>,
    ) -> (Self, ScriptHandle<P>) {
        let state = Arc::new(Mutex::new(ScriptState {
            script: script.into(),
            proposed,
            assignments: Vec::new(),
            refuse_assignments: false,
            assignment_handler: None,
            subscribed: None,
            polls: Vec::new(),
            stored: Vec::new(),
            close_calls: 0,
            fail_close: false,
        }));
        (
            Self {
                state: state.clone(),
            },
            ScriptHandle { state },
        )
    }
}

impl<P> ScriptHandle<P> {
    pub fn refuse_assignments(&self) {
        self.state.lock().unwrap().refuse_assignments = true;
    }

    pub fn fail_close(&self) {
        self.state.lock().unwrap().fail_close = true;
    }

    pub fn push(&self, outcome: ConsumeOutcome<P>) {
        self.state.lock().unwrap().script.push_back(outcome);
    }

    /// Simulates a group rebalance handing `partitions` to the client.
    pub fn rebalance(&self, partitions: Vec<PartitionAssignment>) -> Result<(), ConsumerError> {
        let handler = self
            .state
            .lock()
            .unwrap()
            .assignment_handler
            .clone()
            .ok_or(ConsumerError::Closed)?;
        let assigner = Assigner {
            state: self.state.clone(),
        };
        handler.on_assign(&assigner, partitions)
    }

    pub fn subscribed(&self) -> Option<String> {
        self.state.lock().unwrap().subscribed.clone()
    }

    pub fn assignments(&self) -> Vec<Vec<PartitionAssignment>> {
        self.state.lock().unwrap().assignments.clone()
    }

    pub fn polls(&self) -> Vec<Instant> {
        self.state.lock().unwrap().polls.clone()
    }

    pub fn poll_count(&self) -> usize {
        self.state.lock().unwrap().polls.len()
    }

    pub fn stored_offsets(&self) -> Vec<(String, i32, i64)> {
        self.state.lock().unwrap().stored.clone()
    }

    pub fn close_calls(&self) -> usize {
        self.state.lock().unwrap().close_calls
    }
}

struct Assigner<P> {
    state: Arc<Mutex<ScriptState<P>>>,
}

impl<P> PartitionAssigner for Assigner<P> {
    fn assign(&self, partitions: &[PartitionAssignment]) -> Result<(), ConsumerError> {
        let mut state = self.state.lock().unwrap();
        if state.refuse_assignments {
            return Err(ConsumerError::Assignment {
                partitions: partitions.len(),
                reason: "refused by script".to_owned(),
            });
        }
        state.assignments.push(partitions.to_vec());
        Ok(())
    }
}

#[async_trait]
impl<P: Send + 'static> BrokerClient for ScriptedClient<P> {
    type Payload = P;

    fn subscribe(
        &mut self,
        topic_pattern: &str,
        handler: Arc<dyn AssignmentHandler>,
    ) -> Result<(), ConsumerError> {
        let proposed = {
            let mut state = self.state.lock().unwrap();
            if state.subscribed.is_some() {
                return Err(ConsumerError::AlreadySubscribed(topic_pattern.to_owned()));
            }
            state.subscribed = Some(topic_pattern.to_owned());
            state.assignment_handler = Some(handler.clone());
            state.proposed.clone()
        };

        // Like librdkafka, a failed acknowledgement does not fail the subscription
        let assigner = Assigner {
            state: self.state.clone(),
        };
        if let Err(e) = handler.on_assign(&assigner, proposed) {
            tracing::warn!("scripted assignment was not acknowledged: {}", e);
        }
        Ok(())
    }

    async fn poll(&mut self, _timeout: Duration) -> ConsumeOutcome<P> {
        let mut state = self.state.lock().unwrap();
        state.polls.push(Instant::now());
        state.script.pop_front().unwrap_or(ConsumeOutcome::Empty)
    }

    fn store_offset(
        &mut self,
        topic: &str,
        partition: i32,
        offset: i64,
    ) -> Result<(), ConsumerError> {
        self.state
            .lock()
            .unwrap()
            .stored
            .push((topic.to_owned(), partition, offset));
        Ok(())
    }

    fn close(&mut self) -> Result<(), ConsumerError> {
        let mut state = self.state.lock().unwrap();
        state.close_calls += 1;
        state.subscribed = None;
        if state.fail_close {
            return Err(ConsumerError::Shutdown("scripted close failure".to_owned()));
        }
        Ok(())
    }
}

pub fn message<P>(topic: &str, partition: i32, offset: i64, payload: P) -> ConsumeOutcome<P> {
    ConsumeOutcome::Message(ConsumedMessage {
        topic: topic.to_owned(),
        partition,
        offset,
        key: None,
        payload,
    })
}

pub fn decode_error<P>(topic: &str, partition: i32, offset: i64) -> ConsumeOutcome<P> {
    ConsumeOutcome::Error(ConsumeError::Decode {
        topic: topic.to_owned(),
        partition,
        offset,
        source: DecodeError::Empty,
    })
}

pub fn transient_error<P>() -> ConsumeOutcome<P> {
    ConsumeOutcome::Error(ConsumeError::Poll(KafkaError::MessageConsumption(
        RDKafkaErrorCode::BrokerTransportFailure,
    )))
}

pub fn partitions(topic: &str, count: i32, offset: StartOffset) -> Vec<PartitionAssignment> {
    (0..count)
        .map(|partition| PartitionAssignment::new(topic, partition, offset))
        .collect()
}

/// Records every message it is handed, failing the ones whose payload
/// matches `reject`.
pub struct RecordingHandler<P> {
    seen: Arc<Mutex<Vec<ConsumedMessage<P>>>>,
    reject: Option<P>,
}

impl<P: Clone> RecordingHandler<P> {
    pub fn new() -> Self {
        Self {
            seen: Default::default(),
            reject: None,
        }
    }

    pub fn rejecting(payload: P) -> Self {
        Self {
            seen: Default::default(),
            reject: Some(payload),
        }
    }

    pub fn seen(&self) -> Arc<Mutex<Vec<ConsumedMessage<P>>>> {
        self.seen.clone()
    }
}

impl<P: Clone> Default for RecordingHandler<P> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<P> MessageHandler<P> for RecordingHandler<P>
where
    P: Clone + PartialEq + Send + Sync + 'static,
{
    async fn handle(&self, message: ConsumedMessage<P>) -> anyhow::Result<()> {
        let rejected = self.reject.as_ref() == Some(&message.payload);
        self.seen.lock().unwrap().push(message);
        if rejected {
            return Err(anyhow!("rejected by test handler"));
        }
        Ok(())
    }
}

/// Polls `check` until it holds or `timeout` elapses, then asserts it.
pub async fn assert_or_retry<F>(check: F, timeout: Duration)
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + timeout;
    while !check() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(check())
}
