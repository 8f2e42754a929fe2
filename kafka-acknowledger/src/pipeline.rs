//! Per-subscription acknowledgement pipeline
//!
//! raw source -> wrap each record as acknowledgeable -> merge with the error
//! bus -> bounding operator -> caller.
//!
//! Nothing is shared between two calls to [`RecordTransformer::transform`]:
//! each returned stream builds its own bus and in-flight window the first time
//! it is polled, so a record can only ever report into the subscription that
//! emitted it.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::acknowledgeable::AcknowledgeableRecord;
use crate::bus::{ErrorInjectionBus, ErrorInjector};
use crate::config::AcknowledgementConfig;
use crate::error::{ConfigError, PipelineError};
use crate::factory::AcknowledgementFactory;
use crate::receiver::{ReceiverOffset, ReceiverRecord};
use crate::strategy::{AcknowledgementStrategy, MaxInFlight, OverflowPolicy};
use crate::types::Partition;

/// Assembles acknowledgement pipelines. Cheap to copy; holds configuration only.
#[derive(Debug, Clone, Copy)]
pub struct RecordTransformer {
    factory: AcknowledgementFactory,
    strategy: AcknowledgementStrategy,
    max_in_flight: MaxInFlight,
    overflow_policy: OverflowPolicy,
    fail_fast_on_record_failure: bool,
}

impl RecordTransformer {
    pub fn new(strategy: AcknowledgementStrategy, max_in_flight: MaxInFlight) -> Self {
        Self {
            factory: AcknowledgementFactory::new(),
            strategy,
            max_in_flight,
            overflow_policy: OverflowPolicy::default(),
            fail_fast_on_record_failure: false,
        }
    }

    pub fn from_config(config: &AcknowledgementConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(config.strategy()?, config.max_in_flight()?)
            .with_overflow_policy(config.overflow_policy()?)
            .with_fail_fast_on_record_failure(config.fail_fast_on_record_failure))
    }

    pub fn with_overflow_policy(mut self, overflow_policy: OverflowPolicy) -> Self {
        self.overflow_policy = overflow_policy;
        self
    }

    /// Also terminate the subscription when a record is failed, not only when a
    /// commit fails
    pub fn with_fail_fast_on_record_failure(mut self, fail_fast: bool) -> Self {
        self.fail_fast_on_record_failure = fail_fast;
        self
    }

    pub fn strategy(&self) -> AcknowledgementStrategy {
        self.strategy
    }

    pub fn max_in_flight(&self) -> MaxInFlight {
        self.max_in_flight
    }

    /// Build one subscription over `source`.
    ///
    /// The returned stream ends with the first error it yields. Otherwise it ends
    /// once `source` has ended and every emitted record has been resolved.
    /// Dropping it cancels the subscription: late resolutions of its records
    /// commit nothing.
    pub fn transform<T, S>(&self, source: S) -> AcknowledgeableStream<T>
    where
        T: Send + 'static,
        S: Stream<Item = Result<ReceiverRecord<T>, PipelineError>> + Send + 'static,
    {
        let (revoker, revocations) = mpsc::unbounded_channel();
        let factory = self.factory;
        let fail_fast = self.fail_fast_on_record_failure;

        let merged = stream::once(future::lazy(move |_| {
            let (bus, injector) = ErrorInjectionBus::new();
            let records = source
                .map(move |item| item.map(|record| bind(&factory, record, &injector, fail_fast)));
            bus.merge_with(records)
        }))
        .flatten();

        let inner = self
            .strategy
            .wrap(self.max_in_flight)
            .with_overflow_policy(self.overflow_policy)
            .apply(merged, revocations);

        AcknowledgeableStream {
            inner,
            revoker: PartitionRevoker::from_sender(revoker),
        }
    }
}

/// Wrap a received record so that resolving it reaches the upstream offset
/// handle, and commit failures reach the subscription's bus
fn bind<T>(
    factory: &AcknowledgementFactory,
    record: ReceiverRecord<T>,
    injector: &ErrorInjector,
    fail_fast: bool,
) -> AcknowledgeableRecord<T> {
    let (record, offset) = record.into_parts();
    let offset: Arc<dyn ReceiverOffset> = Arc::from(offset);
    let fail_offset = offset.clone();
    let ack_injector = injector.clone();
    let fail_injector = injector.clone();

    factory.create(
        record,
        move || {
            if let Err(e) = offset.acknowledge() {
                error!(error = %e, "Failed to acknowledge record upstream");
                if !ack_injector.inject(e) {
                    warn!("Commit failure arrived after its subscription ended");
                }
            }
        },
        move |e| {
            fail_offset.fail(&e);
            if fail_fast {
                fail_injector.inject(e);
            }
        },
    )
}

/// Output of one subscription
pub struct AcknowledgeableStream<T> {
    inner: BoxStream<'static, Result<AcknowledgeableRecord<T>, PipelineError>>,
    revoker: PartitionRevoker,
}

impl<T> AcknowledgeableStream<T> {
    /// Handle for telling this subscription that partitions were taken away
    pub fn revoker(&self) -> PartitionRevoker {
        self.revoker.clone()
    }
}

impl<T> Stream for AcknowledgeableStream<T> {
    type Item = Result<AcknowledgeableRecord<T>, PipelineError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

/// Reports partition revocations to a subscription. Held records of a revoked
/// partition are discarded and its in-flight slots released.
#[derive(Debug, Clone)]
pub struct PartitionRevoker {
    sender: mpsc::UnboundedSender<Partition>,
}

impl PartitionRevoker {
    pub(crate) fn from_sender(sender: mpsc::UnboundedSender<Partition>) -> Self {
        Self { sender }
    }

    /// Returns `false` if the subscription is gone
    pub fn revoke(&self, partition: Partition) -> bool {
        self.sender.send(partition).is_ok()
    }

    pub fn revoke_all(&self, partitions: impl IntoIterator<Item = Partition>) -> bool {
        partitions.into_iter().all(|partition| self.revoke(partition))
    }
}
