use tracing::warn;

use crate::error::AckError;
use crate::types::{Partition, RawRecord};

/// Upstream binding for a single received record.
///
/// The log client hands one of these out with every record. `acknowledge` is the
/// commit primitive (advance the partition's offset past this record), `fail` is
/// the error-reporting primitive. Both may be called from any thread.
pub trait ReceiverOffset: Send + Sync + 'static {
    /// Commit, or store for the next commit, this record's offset.
    fn acknowledge(&self) -> Result<(), AckError>;

    /// Report that processing of this record failed.
    fn fail(&self, error: &AckError) {
        warn!(error = %error, "Record processing failed");
    }
}

/// A record as received from the log client, paired with its offset handle
pub struct ReceiverRecord<T> {
    record: RawRecord<T>,
    offset: Box<dyn ReceiverOffset>,
}

impl<T> ReceiverRecord<T> {
    pub fn new(record: RawRecord<T>, offset: impl ReceiverOffset) -> Self {
        Self {
            record,
            offset: Box::new(offset),
        }
    }

    pub fn record(&self) -> &RawRecord<T> {
        &self.record
    }

    pub fn partition(&self) -> &Partition {
        self.record.partition()
    }

    pub fn into_parts(self) -> (RawRecord<T>, Box<dyn ReceiverOffset>) {
        (self.record, self.offset)
    }
}

impl<T> std::fmt::Debug for ReceiverRecord<T>
where
    T: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiverRecord")
            .field("record", &self.record)
            .finish_non_exhaustive()
    }
}
