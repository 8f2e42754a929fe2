use std::fmt::Display;

use rdkafka::error::KafkaError;
use thiserror::Error;

use crate::types::Partition;

/// Reason a record was resolved with `fail`, or why its acknowledgement
/// could not be applied upstream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AckError {
    #[error("processing failed: {0}")]
    Processing(String),

    #[error("offset commit failed for {partition} at offset {offset}: {reason}")]
    Commit {
        partition: Partition,
        offset: i64,
        reason: String,
    },

    #[error("record {partition} at offset {offset} was dropped without being acknowledged")]
    Dropped { partition: Partition, offset: i64 },
}

impl AckError {
    pub fn processing(error: impl Display) -> Self {
        AckError::Processing(error.to_string())
    }

    pub fn commit(partition: Partition, offset: i64, reason: impl Display) -> Self {
        AckError::Commit {
            partition,
            offset,
            reason: reason.to_string(),
        }
    }
}

impl From<String> for AckError {
    fn from(error: String) -> Self {
        AckError::Processing(error)
    }
}

impl From<&str> for AckError {
    fn from(error: &str) -> Self {
        AckError::Processing(error.to_string())
    }
}

impl From<anyhow::Error> for AckError {
    fn from(error: anyhow::Error) -> Self {
        // Alternate formatting keeps the whole cause chain
        AckError::Processing(format!("{error:#}"))
    }
}

/// Terminal error of an acknowledgeable record stream. Once one of these is
/// yielded the stream ends.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("acknowledgement failed: {0}")]
    Acknowledgement(#[source] AckError),

    #[error("record source failed: {0}")]
    Source(String),

    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),

    #[error("in-flight limit of {max_in_flight} reached for {partition}")]
    InFlightLimitExceeded {
        partition: Partition,
        max_in_flight: usize,
    },
}

/// Contract violations detected while releasing in-flight slots
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WindowError {
    #[error("slot {sequence} for {partition} was already resolved")]
    AlreadyResolved { partition: Partition, sequence: u64 },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max in-flight per partition must be greater than zero")]
    ZeroMaxInFlight,

    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}
