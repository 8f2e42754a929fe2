use crate::acknowledgeable::AcknowledgeableRecord;
use crate::error::AckError;
use crate::types::RawRecord;

/// Builds [`AcknowledgeableRecord`]s from raw records and the commit/fail
/// primitives supplied by the log client binding.
///
/// Construction never fails and performs no I/O. The factory holds no state, so
/// one instance can be shared by every subscription.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcknowledgementFactory;

impl AcknowledgementFactory {
    pub fn new() -> Self {
        Self
    }

    pub fn create<T, A, F>(
        &self,
        record: RawRecord<T>,
        on_acknowledge: A,
        on_fail: F,
    ) -> AcknowledgeableRecord<T>
    where
        A: FnOnce() + Send + 'static,
        F: FnOnce(AckError) + Send + 'static,
    {
        AcknowledgeableRecord::new(record, Box::new(on_acknowledge), Box::new(on_fail))
    }
}
