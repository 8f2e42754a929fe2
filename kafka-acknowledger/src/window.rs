//! In-flight window - per-partition accounting of emitted but unresolved records
//!
//! One window exists per subscription and is owned by that subscription's
//! bounding operator. Slots are acquired by the operator when it emits a record
//! and released by the record's acknowledge/fail callbacks, which may run on any
//! thread. Every acquire and release happens under the window lock, so the
//! per-partition limit check and the count update are a single atomic step.
//!
//! The window also decides when the upstream commit/fail primitive of a
//! resolved record runs:
//! - `Unordered`: immediately, and the slot is freed immediately.
//! - `Ordered`: only once every earlier record of the same partition has been
//!   resolved. Until then the resolved slot keeps counting against the limit.
//!   Completions are run by a single drainer at a time, in offset order.
//!
//! Upstream primitives never run while the lock is held.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::mem;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::acknowledgeable::{Acknowledger, Nacker};
use crate::error::{AckError, WindowError};
use crate::metrics_consts::{
    DOUBLE_RESOLUTIONS, IGNORED_RESOLUTIONS, OUT_OF_ORDER_RESOLUTIONS, PARTITION_IN_FLIGHT_SLOTS,
    RECORDS_EMITTED, REVOKED_SLOTS,
};
use crate::strategy::{AcknowledgementStrategy, MaxInFlight};
use crate::types::Partition;

/// The upstream action a resolution will eventually run
pub enum Completion {
    Acknowledged(Acknowledger),
    Failed(Nacker, AckError),
}

impl Completion {
    fn run(self) {
        match self {
            Completion::Acknowledged(acknowledger) => acknowledger(),
            Completion::Failed(nacker, error) => nacker(error),
        }
    }
}

/// Identifies one acquired in-flight slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotId {
    partition: Partition,
    sequence: u64,
}

impl SlotId {
    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The slot was freed and its completion has run (or is queued to run)
    Released,
    /// Ordered only: resolved, but waiting on an earlier record of the partition
    Deferred,
    /// The subscription or the partition is gone; the completion was dropped
    Ignored,
}

enum SlotState {
    Outstanding,
    Resolved(Completion),
}

type PartitionSlots = BTreeMap<u64, SlotState>;

#[derive(Default)]
struct WindowState {
    closed: bool,
    next_sequence: u64,
    partitions: HashMap<Partition, PartitionSlots>,
    /// Sequences below the boundary belong to a revoked assignment of the partition
    revoked_before: HashMap<Partition, u64>,
    /// Ordered completions ready to run, in offset order
    ready: VecDeque<Completion>,
    draining: bool,
}

impl WindowState {
    fn in_flight(&self, partition: &Partition) -> usize {
        self.partitions.get(partition).map_or(0, BTreeMap::len)
    }

    fn unknown_slot(&self, slot: &SlotId) -> Result<ReleaseOutcome, WindowError> {
        let revoked = self
            .revoked_before
            .get(&slot.partition)
            .is_some_and(|boundary| slot.sequence < *boundary);

        if revoked {
            debug!(
                partition = %slot.partition,
                sequence = slot.sequence,
                "Ignoring resolution for revoked partition"
            );
            metrics::counter!(IGNORED_RESOLUTIONS, "reason" => "revoked").increment(1);
            return Ok(ReleaseOutcome::Ignored);
        }

        Err(double_resolution(slot))
    }
}

struct WindowShared {
    strategy: AcknowledgementStrategy,
    max_in_flight: MaxInFlight,
    state: Mutex<WindowState>,
    released: Notify,
}

/// Per-subscription in-flight slot map. Clones share the same window.
#[derive(Clone)]
pub struct InFlightWindow {
    shared: Arc<WindowShared>,
}

impl InFlightWindow {
    pub fn new(strategy: AcknowledgementStrategy, max_in_flight: MaxInFlight) -> Self {
        Self {
            shared: Arc::new(WindowShared {
                strategy,
                max_in_flight,
                state: Mutex::new(WindowState::default()),
                released: Notify::new(),
            }),
        }
    }

    pub fn strategy(&self) -> AcknowledgementStrategy {
        self.shared.strategy
    }

    pub fn max_in_flight(&self) -> MaxInFlight {
        self.shared.max_in_flight
    }

    /// Acquire a slot for `partition` if it is below its limit
    pub fn try_acquire(&self, partition: &Partition) -> Option<SlotId> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return None;
        }

        let in_flight = state.in_flight(partition);
        if !self.shared.max_in_flight.admits(in_flight) {
            return None;
        }

        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state
            .partitions
            .entry(partition.clone())
            .or_default()
            .insert(sequence, SlotState::Outstanding);
        drop(state);

        record_in_flight(partition, in_flight + 1);
        metrics::counter!(RECORDS_EMITTED).increment(1);

        Some(SlotId {
            partition: partition.clone(),
            sequence,
        })
    }

    pub fn has_capacity(&self, partition: &Partition) -> bool {
        let state = self.shared.state.lock();
        !state.closed
            && self
                .shared
                .max_in_flight
                .admits(state.in_flight(partition))
    }

    /// Slots held for `partition`, including ordered slots that are resolved
    /// but still waiting on an earlier record
    pub fn in_flight(&self, partition: &Partition) -> usize {
        self.shared.state.lock().in_flight(partition)
    }

    pub fn total_in_flight(&self) -> usize {
        self.shared
            .state
            .lock()
            .partitions
            .values()
            .map(BTreeMap::len)
            .sum()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Resolve a slot.
    ///
    /// Releasing a slot that was already resolved is a contract violation: it is
    /// reported as [`WindowError::AlreadyResolved`] and leaves the counts
    /// untouched. Releasing after the window closed, or after the slot's
    /// partition was revoked, is ignored.
    pub fn release(
        &self,
        slot: &SlotId,
        completion: Completion,
    ) -> Result<ReleaseOutcome, WindowError> {
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;

        if state.closed {
            debug!(
                partition = %slot.partition,
                sequence = slot.sequence,
                "Ignoring resolution after subscription closed"
            );
            metrics::counter!(IGNORED_RESOLUTIONS, "reason" => "closed").increment(1);
            return Ok(ReleaseOutcome::Ignored);
        }

        let Some(slots) = state.partitions.get_mut(&slot.partition) else {
            return state.unknown_slot(slot);
        };

        if slots.keys().next() != Some(&slot.sequence) && slots.contains_key(&slot.sequence) {
            metrics::counter!(OUT_OF_ORDER_RESOLUTIONS).increment(1);
        }

        match self.shared.strategy {
            AcknowledgementStrategy::Unordered => {
                if slots.remove(&slot.sequence).is_none() {
                    return state.unknown_slot(slot);
                }
                let remaining = slots.len();
                if remaining == 0 {
                    state.partitions.remove(&slot.partition);
                }
                drop(guard);

                record_in_flight(&slot.partition, remaining);
                self.shared.released.notify_one();
                completion.run();

                Ok(ReleaseOutcome::Released)
            }
            AcknowledgementStrategy::Ordered => {
                match slots.get_mut(&slot.sequence) {
                    Some(SlotState::Resolved(_)) => return Err(double_resolution(slot)),
                    Some(entry) => *entry = SlotState::Resolved(completion),
                    None => return state.unknown_slot(slot),
                }

                let mut freed = 0;
                while let Some(entry) = slots.first_entry() {
                    if !matches!(entry.get(), SlotState::Resolved(_)) {
                        break;
                    }
                    if let SlotState::Resolved(completion) = entry.remove() {
                        state.ready.push_back(completion);
                    }
                    freed += 1;
                }

                let remaining = slots.len();
                if remaining == 0 {
                    state.partitions.remove(&slot.partition);
                }
                drop(guard);

                if freed == 0 {
                    return Ok(ReleaseOutcome::Deferred);
                }

                record_in_flight(&slot.partition, remaining);
                self.shared.released.notify_one();
                self.drain_ready();

                Ok(ReleaseOutcome::Released)
            }
        }
    }

    /// [`release`](Self::release) for use inside record callbacks, where a
    /// contract violation can only be logged
    pub(crate) fn resolve(&self, slot: &SlotId, completion: Completion) {
        match self.release(slot, completion) {
            Ok(ReleaseOutcome::Deferred) => debug!(
                partition = %slot.partition(),
                sequence = slot.sequence(),
                "Resolution deferred until earlier records resolve"
            ),
            Ok(_) => {}
            Err(error) => warn!(error = %error, "Dropping invalid resolution"),
        }
    }

    /// Release every slot of a partition that was permanently removed from this
    /// consumer. Completions waiting on earlier records are dropped and later
    /// resolutions for the partition's current records are ignored.
    pub fn revoke(&self, partition: &Partition) -> usize {
        let removed = {
            let mut state = self.shared.state.lock();
            let boundary = state.next_sequence;
            state.revoked_before.insert(partition.clone(), boundary);
            state.partitions.remove(partition)
        };

        let released = removed.as_ref().map_or(0, BTreeMap::len);
        drop(removed);

        if released > 0 {
            info!(
                partition = %partition,
                released_slots = released,
                "Released in-flight slots for revoked partition"
            );
            metrics::counter!(REVOKED_SLOTS).increment(released as u64);
        }
        record_in_flight(partition, 0);
        self.shared.released.notify_one();

        released
    }

    /// Close the window: every slot is released and all later resolutions
    /// become no-ops.
    pub fn close(&self) {
        let partitions = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            mem::take(&mut state.partitions)
        };

        let released: usize = partitions.values().map(BTreeMap::len).sum();
        for partition in partitions.keys() {
            record_in_flight(partition, 0);
        }
        drop(partitions);

        debug!(released_slots = released, "Closed in-flight window");
        self.shared.released.notify_one();
    }

    /// Resolves when a slot may have been freed since the last call
    pub fn released(&self) -> Notified<'_> {
        self.shared.released.notified()
    }

    /// Run ready ordered completions. Only one caller drains at a time; others
    /// leave their completions in the queue for the active drainer.
    fn drain_ready(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.draining {
                return;
            }
            state.draining = true;
        }

        loop {
            let batch = {
                let mut state = self.shared.state.lock();
                if state.ready.is_empty() {
                    state.draining = false;
                    return;
                }
                mem::take(&mut state.ready)
            };

            for completion in batch {
                completion.run();
            }
        }
    }
}

/// Closes the window when dropped
pub struct CloseOnDrop(InFlightWindow);

impl CloseOnDrop {
    pub fn new(window: InFlightWindow) -> Self {
        Self(window)
    }
}

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        self.0.close();
    }
}

fn double_resolution(slot: &SlotId) -> WindowError {
    error!(
        partition = %slot.partition,
        sequence = slot.sequence,
        "In-flight slot resolved more than once"
    );
    metrics::counter!(DOUBLE_RESOLUTIONS).increment(1);

    WindowError::AlreadyResolved {
        partition: slot.partition.clone(),
        sequence: slot.sequence,
    }
}

fn record_in_flight(partition: &Partition, in_flight: usize) {
    metrics::gauge!(
        PARTITION_IN_FLIGHT_SLOTS,
        "topic" => partition.topic().to_string(),
        "partition" => partition.partition_number().to_string()
    )
    .set(in_flight as f64);
}
