//! Bounded acknowledgement tracking for partitioned log consumers.
//!
//! Every consumed record is wrapped as an [`AcknowledgeableRecord`] that must be
//! resolved exactly once, with `acknowledge` or `fail`. A [`RecordTransformer`]
//! assembles one independent pipeline per subscription:
//!
//! raw source -> wrap via [`AcknowledgementFactory`] -> merge with the
//! [`ErrorInjectionBus`] -> bounding operator -> caller.
//!
//! The bounding operator caps emitted-but-unresolved records per partition.
//! Asynchronous failures (an offset commit that fails after `acknowledge`)
//! travel through the bus and terminate the subscription.
//!
//! ## Error logging (anyhow)
//!
//! `fail` accepts an `anyhow::Error` and keeps its whole cause chain
//! (`{e:#}`), so root causes stay visible when the failure is logged upstream.

pub mod acknowledgeable;
pub mod bus;
pub mod config;
pub mod error;
pub mod factory;
pub mod kafka;
pub mod metrics_consts;
pub mod pipeline;
pub mod receiver;
pub mod strategy;
pub mod test_utils;
pub mod types;
pub mod window;

// Re-export commonly used types for convenience
pub use acknowledgeable::AcknowledgeableRecord;
pub use bus::{ErrorInjectionBus, ErrorInjector};
pub use config::{AcknowledgementConfig, KafkaConsumerConfig};
pub use error::{AckError, ConfigError, PipelineError, WindowError};
pub use factory::AcknowledgementFactory;
pub use pipeline::{AcknowledgeableStream, PartitionRevoker, RecordTransformer};
pub use receiver::{ReceiverOffset, ReceiverRecord};
pub use strategy::{AcknowledgementStrategy, BoundingOperator, MaxInFlight, OverflowPolicy};
pub use types::{Partition, RawRecord};
