//! Acknowledgement strategies and the bounding operator they install
//!
//! The operator sits between a subscription's merged record stream and the
//! consumer. It emits a record only when the record's partition has a free
//! in-flight slot, holds it back otherwise, and re-binds every emitted record so
//! that resolving it frees the slot.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::num::NonZeroUsize;
use std::str::FromStr;

use futures::stream::{BoxStream, Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::acknowledgeable::AcknowledgeableRecord;
use crate::error::{ConfigError, PipelineError};
use crate::metrics_consts::{RECORDS_DISCARDED, RECORDS_WITHHELD};
use crate::types::Partition;
use crate::window::{CloseOnDrop, Completion, InFlightWindow, SlotId};

/// How resolutions of emitted records reach the upstream commit primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AcknowledgementStrategy {
    /// Commits run in offset order per partition; a resolved record keeps its
    /// slot until every earlier record of the partition is resolved
    #[default]
    Ordered,
    /// Commits run as soon as a record is resolved
    Unordered,
}

impl AcknowledgementStrategy {
    /// The bounding operator for this strategy and limit
    pub fn wrap(self, max_in_flight: MaxInFlight) -> BoundingOperator {
        BoundingOperator {
            strategy: self,
            max_in_flight,
            overflow_policy: OverflowPolicy::default(),
        }
    }
}

impl FromStr for AcknowledgementStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ordered" => Ok(AcknowledgementStrategy::Ordered),
            "unordered" => Ok(AcknowledgementStrategy::Unordered),
            _ => Err(ConfigError::InvalidValue {
                key: "acknowledgement.strategy".to_string(),
                value: s.to_string(),
                reason: "expected one of: ordered, unordered".to_string(),
            }),
        }
    }
}

impl fmt::Display for AcknowledgementStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcknowledgementStrategy::Ordered => write!(f, "ordered"),
            AcknowledgementStrategy::Unordered => write!(f, "unordered"),
        }
    }
}

/// What the operator does with a record whose partition is at its limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Hold the record until a slot frees
    #[default]
    Block,
    /// Terminate the subscription with [`PipelineError::InFlightLimitExceeded`]
    Reject,
}

impl FromStr for OverflowPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "block" => Ok(OverflowPolicy::Block),
            "reject" => Ok(OverflowPolicy::Reject),
            _ => Err(ConfigError::InvalidValue {
                key: "overflow.policy".to_string(),
                value: s.to_string(),
                reason: "expected one of: block, reject".to_string(),
            }),
        }
    }
}

/// Per-partition limit on emitted but unresolved records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MaxInFlight(Option<NonZeroUsize>);

impl MaxInFlight {
    pub fn unbounded() -> Self {
        Self(None)
    }

    pub fn limited(max: usize) -> Result<Self, ConfigError> {
        NonZeroUsize::new(max)
            .map(|max| Self(Some(max)))
            .ok_or(ConfigError::ZeroMaxInFlight)
    }

    pub fn get(&self) -> Option<usize> {
        self.0.map(NonZeroUsize::get)
    }

    pub fn is_unbounded(&self) -> bool {
        self.0.is_none()
    }

    /// Whether one more record may be emitted with `in_flight` outstanding
    pub fn admits(&self, in_flight: usize) -> bool {
        self.0.map_or(true, |max| in_flight < max.get())
    }
}

impl fmt::Display for MaxInFlight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(max) => write!(f, "{max}"),
            None => write!(f, "unbounded"),
        }
    }
}

/// Stream operator bounding in-flight records per partition
#[derive(Debug, Clone, Copy)]
pub struct BoundingOperator {
    strategy: AcknowledgementStrategy,
    max_in_flight: MaxInFlight,
    overflow_policy: OverflowPolicy,
}

/// Records pulled from upstream but not yet emitted, per partition. Whatever
/// is still held when the subscription ends is discarded without callbacks:
/// downstream never saw those records.
struct Held<T>(HashMap<Partition, VecDeque<AcknowledgeableRecord<T>>>);

impl<T> Default for Held<T> {
    fn default() -> Self {
        Self(HashMap::new())
    }
}

impl<T> Deref for Held<T> {
    type Target = HashMap<Partition, VecDeque<AcknowledgeableRecord<T>>>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> DerefMut for Held<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl<T> Drop for Held<T> {
    fn drop(&mut self) {
        let discarded: usize = self.0.values().map(VecDeque::len).sum();
        if discarded == 0 {
            return;
        }

        self.0
            .drain()
            .flat_map(|(_, queue)| queue)
            .for_each(AcknowledgeableRecord::discard);
        metrics::counter!(RECORDS_DISCARDED, "reason" => "cancelled").increment(discarded as u64);
        debug!(discarded_records = discarded, "Discarded held records on subscription end");
    }
}

impl BoundingOperator {
    pub fn with_overflow_policy(mut self, overflow_policy: OverflowPolicy) -> Self {
        self.overflow_policy = overflow_policy;
        self
    }

    pub fn strategy(&self) -> AcknowledgementStrategy {
        self.strategy
    }

    pub fn max_in_flight(&self) -> MaxInFlight {
        self.max_in_flight
    }

    pub fn overflow_policy(&self) -> OverflowPolicy {
        self.overflow_policy
    }

    /// Apply the operator to a subscription's merged stream.
    ///
    /// The in-flight window is created when the returned stream is first polled
    /// and closed when it is dropped. Records keep their per-partition order;
    /// records of other partitions pass held ones freely. Partitions received on
    /// `revocations` lose their held records and in-flight slots.
    pub fn apply<T, S>(
        self,
        merged: S,
        mut revocations: mpsc::UnboundedReceiver<Partition>,
    ) -> BoxStream<'static, Result<AcknowledgeableRecord<T>, PipelineError>>
    where
        T: Send + 'static,
        S: Stream<Item = Result<AcknowledgeableRecord<T>, PipelineError>> + Send + 'static,
    {
        let mut merged = Box::pin(merged);

        async_stream::stream! {
            let window = InFlightWindow::new(self.strategy, self.max_in_flight);
            let _close_on_drop = CloseOnDrop::new(window.clone());
            let mut held: Held<T> = Held::default();
            let mut upstream_done = false;
            let mut revocations_open = true;

            debug!(
                strategy = %self.strategy,
                max_in_flight = %self.max_in_flight,
                "Subscription started"
            );

            loop {
                while let Some(record) = next_admissible(&window, &mut held) {
                    yield Ok(record);
                }

                if upstream_done && held.is_empty() {
                    break;
                }

                tokio::select! {
                    biased;

                    partition = revocations.recv(), if revocations_open => {
                        match partition {
                            Some(partition) => revoke(&window, &mut held, &partition),
                            None => revocations_open = false,
                        }
                    }

                    item = merged.next(), if !upstream_done => {
                        match item {
                            Some(Ok(record)) => {
                                let partition = record.partition().clone();
                                let blocked = held.get(&partition).is_some_and(|queue| !queue.is_empty())
                                    || !window.has_capacity(&partition);

                                if blocked && self.overflow_policy == OverflowPolicy::Reject {
                                    warn!(
                                        partition = %partition,
                                        max_in_flight = %self.max_in_flight,
                                        "In-flight limit reached, rejecting subscription"
                                    );
                                    record.discard();
                                    metrics::counter!(RECORDS_DISCARDED, "reason" => "rejected").increment(1);
                                    yield Err(PipelineError::InFlightLimitExceeded {
                                        partition,
                                        max_in_flight: self.max_in_flight.get().unwrap_or(usize::MAX),
                                    });
                                    break;
                                }

                                if blocked {
                                    metrics::counter!(RECORDS_WITHHELD).increment(1);
                                }
                                held.entry(partition).or_default().push_back(record);
                            }
                            Some(Err(error)) => {
                                yield Err(error);
                                break;
                            }
                            None => upstream_done = true,
                        }
                    }

                    _ = window.released() => {}
                }
            }

            debug!("Subscription ended");
        }
        .boxed()
    }
}

/// Pop the first held record whose partition has a free slot and bind it to
/// that slot
fn next_admissible<T: Send + 'static>(
    window: &InFlightWindow,
    held: &mut Held<T>,
) -> Option<AcknowledgeableRecord<T>> {
    let partition = held
        .keys()
        .find(|partition| window.has_capacity(partition))
        .cloned()?;

    let queue = held.get_mut(&partition)?;
    let record = queue.pop_front()?;
    if queue.is_empty() {
        held.remove(&partition);
    }

    match window.try_acquire(&partition) {
        Some(slot) => Some(attach_slot(window, slot, record)),
        None => {
            held.entry(partition).or_default().push_front(record);
            None
        }
    }
}

/// Re-bind a record so that resolving it releases `slot` through the window
fn attach_slot<T: Send + 'static>(
    window: &InFlightWindow,
    slot: SlotId,
    record: AcknowledgeableRecord<T>,
) -> AcknowledgeableRecord<T> {
    let (record, callbacks) = record.into_parts();
    let ack_window = window.clone();
    let ack_slot = slot.clone();
    let fail_window = window.clone();

    AcknowledgeableRecord::new(
        record,
        Box::new(move || {
            ack_window.resolve(&ack_slot, Completion::Acknowledged(callbacks.acknowledger))
        }),
        Box::new(move |error| {
            fail_window.resolve(&slot, Completion::Failed(callbacks.nacker, error))
        }),
    )
}

fn revoke<T>(window: &InFlightWindow, held: &mut Held<T>, partition: &Partition) {
    let discarded = held.remove(partition).map_or(0, |queue| {
        let discarded = queue.len();
        queue.into_iter().for_each(AcknowledgeableRecord::discard);
        discarded
    });

    let released = window.revoke(partition);
    metrics::counter!(RECORDS_DISCARDED, "reason" => "revoked").increment(discarded as u64);
    info!(
        partition = %partition,
        discarded_records = discarded,
        released_slots = released,
        "Partition revoked"
    );
}
