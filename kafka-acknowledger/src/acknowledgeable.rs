use std::fmt;
use std::time::Instant;

use tracing::{debug, error, warn};

use crate::error::AckError;
use crate::metrics_consts::{RECORDS_AUTO_FAILED, RECORDS_RESOLVED, RECORD_RESOLUTION_DURATION};
use crate::types::{Partition, RawRecord};

/// Callback run when a record is acknowledged
pub type Acknowledger = Box<dyn FnOnce() + Send + 'static>;

/// Callback run when a record fails
pub type Nacker = Box<dyn FnOnce(AckError) + Send + 'static>;

pub(crate) struct Callbacks {
    pub(crate) acknowledger: Acknowledger,
    pub(crate) nacker: Nacker,
}

impl Callbacks {
    fn noop() -> Self {
        Self {
            acknowledger: Box::new(|| {}),
            nacker: Box::new(|_| {}),
        }
    }
}

/// Owns the one-shot callbacks of a record and fails the record if it is
/// dropped while still unresolved.
struct Resolver {
    callbacks: Option<Callbacks>,
    partition: Partition,
    offset: i64,
    created_at: Instant,
}

impl Resolver {
    fn acknowledge(mut self) {
        let Some(callbacks) = self.callbacks.take() else {
            warn!(partition = %self.partition, offset = self.offset, "Record already resolved");
            return;
        };

        (callbacks.acknowledger)();
        self.record_resolution("acknowledged");

        debug!(
            partition = %self.partition,
            offset = self.offset,
            "Acknowledged record"
        );
    }

    fn fail(mut self, error: AckError) {
        let Some(callbacks) = self.callbacks.take() else {
            warn!(partition = %self.partition, offset = self.offset, "Record already resolved");
            return;
        };

        debug!(
            partition = %self.partition,
            offset = self.offset,
            error = %error,
            "Failed record"
        );

        (callbacks.nacker)(error);
        self.record_resolution("failed");
    }

    fn disarm(mut self) -> Callbacks {
        self.callbacks.take().unwrap_or_else(Callbacks::noop)
    }

    fn record_resolution(&self, status: &'static str) {
        metrics::counter!(RECORDS_RESOLVED, "status" => status).increment(1);
        metrics::histogram!(RECORD_RESOLUTION_DURATION, "status" => status)
            .record(self.created_at.elapsed().as_secs_f64());
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        let Some(callbacks) = self.callbacks.take() else {
            return;
        };

        error!(
            topic = self.partition.topic(),
            partition = self.partition.partition_number(),
            offset = self.offset,
            "RECORD DROPPED WITHOUT ACK - auto-failing"
        );

        (callbacks.nacker)(AckError::Dropped {
            partition: self.partition.clone(),
            offset: self.offset,
        });

        metrics::counter!(RECORDS_AUTO_FAILED).increment(1);
        self.record_resolution("auto_failed");
    }
}

/// A record paired with the operations that resolve it.
///
/// Exactly one of [`acknowledge`](Self::acknowledge) or [`fail`](Self::fail)
/// must be called. Both consume the record, so resolving twice is impossible
/// through this type. A record dropped without being resolved fails itself with
/// [`AckError::Dropped`] so its in-flight slot is released.
pub struct AcknowledgeableRecord<T> {
    record: RawRecord<T>,
    resolver: Resolver,
}

impl<T> AcknowledgeableRecord<T> {
    pub(crate) fn new(record: RawRecord<T>, acknowledger: Acknowledger, nacker: Nacker) -> Self {
        let resolver = Resolver {
            callbacks: Some(Callbacks {
                acknowledger,
                nacker,
            }),
            partition: record.partition().clone(),
            offset: record.offset(),
            created_at: Instant::now(),
        };

        Self { record, resolver }
    }

    pub fn record(&self) -> &RawRecord<T> {
        &self.record
    }

    pub fn partition(&self) -> &Partition {
        self.record.partition()
    }

    pub fn offset(&self) -> i64 {
        self.record.offset()
    }

    pub fn payload(&self) -> &T {
        self.record.payload()
    }

    /// Signal successful processing. Permits the record's offset to be committed.
    pub fn acknowledge(self) {
        self.resolver.acknowledge();
    }

    /// Signal failed processing
    pub fn fail(self, error: impl Into<AckError>) {
        self.resolver.fail(error.into());
    }

    /// Transform the payload while keeping the same acknowledgement callbacks
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> AcknowledgeableRecord<U> {
        AcknowledgeableRecord {
            record: self.record.map(f),
            resolver: self.resolver,
        }
    }

    /// Take the record apart without resolving it
    pub(crate) fn into_parts(self) -> (RawRecord<T>, Callbacks) {
        (self.record, self.resolver.disarm())
    }

    /// Throw the record away without running either callback
    pub(crate) fn discard(self) {
        drop(self.into_parts());
    }
}

impl<T: fmt::Debug> fmt::Debug for AcknowledgeableRecord<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcknowledgeableRecord")
            .field("record", &self.record)
            .field("resolved", &self.resolver.callbacks.is_none())
            .finish()
    }
}
