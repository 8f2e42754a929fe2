//! Test utilities for pipeline tests

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::{AckError, PipelineError};
use crate::receiver::{ReceiverOffset, ReceiverRecord};
use crate::types::{Partition, RawRecord};

/// What happened to a record's upstream offset
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OffsetEvent {
    Committed(Partition, i64),
    Failed(Partition, i64),
}

/// Shared log of upstream commits and failures, in call order
#[derive(Debug, Clone, Default)]
pub struct OffsetLog {
    events: Arc<Mutex<Vec<OffsetEvent>>>,
}

impl OffsetLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<OffsetEvent> {
        self.events.lock().clone()
    }

    /// Offsets committed for `partition`, in commit order
    pub fn committed(&self, partition: &Partition) -> Vec<i64> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                OffsetEvent::Committed(p, offset) if p == partition => Some(*offset),
                _ => None,
            })
            .collect()
    }

    /// Offsets failed for `partition`, in call order
    pub fn failed(&self, partition: &Partition) -> Vec<i64> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                OffsetEvent::Failed(p, offset) if p == partition => Some(*offset),
                _ => None,
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    fn push(&self, event: OffsetEvent) {
        self.events.lock().push(event);
    }
}

/// Offset handle recording into an [`OffsetLog`]
pub struct RecordingOffset {
    log: OffsetLog,
    partition: Partition,
    offset: i64,
    commit_error: Option<String>,
}

impl RecordingOffset {
    pub fn new(log: &OffsetLog, partition: Partition, offset: i64) -> Self {
        Self {
            log: log.clone(),
            partition,
            offset,
            commit_error: None,
        }
    }

    /// Make the commit primitive fail with `reason`
    pub fn failing_commit(mut self, reason: impl Into<String>) -> Self {
        self.commit_error = Some(reason.into());
        self
    }
}

impl ReceiverOffset for RecordingOffset {
    fn acknowledge(&self) -> Result<(), AckError> {
        if let Some(reason) = &self.commit_error {
            return Err(AckError::commit(
                self.partition.clone(),
                self.offset,
                reason,
            ));
        }

        self.log
            .push(OffsetEvent::Committed(self.partition.clone(), self.offset));
        Ok(())
    }

    fn fail(&self, _error: &AckError) {
        self.log
            .push(OffsetEvent::Failed(self.partition.clone(), self.offset));
    }
}

/// A received record whose payload is its offset
pub fn receiver_record(
    log: &OffsetLog,
    topic: &str,
    partition: i32,
    offset: i64,
) -> ReceiverRecord<i64> {
    let partition = Partition::new(topic, partition);
    ReceiverRecord::new(
        RawRecord::new(partition.clone(), offset, offset),
        RecordingOffset::new(log, partition, offset),
    )
}

pub type SourceItem<T> = Result<ReceiverRecord<T>, PipelineError>;

/// A record source fed through the returned sender. The source ends when the
/// sender is dropped.
pub fn channel_source<T>() -> (
    mpsc::UnboundedSender<SourceItem<T>>,
    UnboundedReceiverStream<SourceItem<T>>,
) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (sender, UnboundedReceiverStream::new(receiver))
}
