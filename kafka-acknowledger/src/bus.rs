//! Error injection bus - per-subscription side channel for asynchronous failures
//!
//! Acknowledgement failures that happen outside the record flow (a commit that
//! fails after `acknowledge` was called, or a record failing while fail-fast is
//! enabled) are injected here and merged into the subscription's output, which
//! then terminates with that error.

use futures::stream::{BoxStream, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

use crate::acknowledgeable::AcknowledgeableRecord;
use crate::error::{AckError, PipelineError};
use crate::metrics_consts::{BUS_ERRORS_DETACHED, BUS_ERRORS_INJECTED};

/// Read side of the bus. Create one per subscription, never share it.
pub struct ErrorInjectionBus {
    receiver: mpsc::UnboundedReceiver<AckError>,
}

/// Write side of the bus. Cheap to clone and safe to call from any thread;
/// injecting never blocks.
#[derive(Clone, Debug)]
pub struct ErrorInjector {
    sender: mpsc::UnboundedSender<AckError>,
}

impl ErrorInjectionBus {
    pub fn new() -> (Self, ErrorInjector) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { receiver }, ErrorInjector { sender })
    }

    /// The bus as a stream. It yields at most one error and then ends; it also
    /// ends, without an error, once every injector has been dropped.
    pub fn into_stream(self) -> impl Stream<Item = AckError> + Send + Unpin + 'static {
        UnboundedReceiverStream::new(self.receiver).take(1)
    }

    /// Merge the bus into a record stream.
    ///
    /// Injected errors take priority over records and terminate the merged
    /// stream. Otherwise the merged stream ends once the records have ended and
    /// the bus has closed.
    pub fn merge_with<T, S>(
        self,
        records: S,
    ) -> BoxStream<'static, Result<AcknowledgeableRecord<T>, PipelineError>>
    where
        T: Send + 'static,
        S: Stream<Item = Result<AcknowledgeableRecord<T>, PipelineError>> + Send + 'static,
    {
        let mut errors = self.into_stream();
        let mut records = Some(Box::pin(records));
        let mut bus_closed = false;

        async_stream::stream! {
            loop {
                if bus_closed && records.is_none() {
                    break;
                }

                tokio::select! {
                    biased;

                    error = errors.next(), if !bus_closed => {
                        match error {
                            Some(error) => {
                                warn!(error = %error, "Acknowledgement failure injected, terminating subscription");
                                yield Err(PipelineError::Acknowledgement(error));
                                break;
                            }
                            None => {
                                debug!("Error bus closed");
                                bus_closed = true;
                            }
                        }
                    }

                    item = next_record(&mut records), if records.is_some() => {
                        match item {
                            Some(item) => yield item,
                            None => {
                                debug!("Record stream ended");
                                // Dropping the source also drops its injector
                                records = None;
                            }
                        }
                    }
                }
            }
        }
        .boxed()
    }
}

impl ErrorInjector {
    /// Inject `error` into the subscription this injector belongs to.
    ///
    /// Returns `false` when that subscription is gone (cancelled, or already
    /// terminated by an earlier error); the error is then only logged.
    pub fn inject(&self, error: AckError) -> bool {
        match self.sender.send(error) {
            Ok(()) => {
                metrics::counter!(BUS_ERRORS_INJECTED).increment(1);
                true
            }
            Err(mpsc::error::SendError(error)) => {
                debug!(error = %error, "Error injected after subscription ended, ignoring");
                metrics::counter!(BUS_ERRORS_DETACHED).increment(1);
                false
            }
        }
    }

    /// Whether the read side of the bus is gone
    pub fn is_detached(&self) -> bool {
        self.sender.is_closed()
    }
}

async fn next_record<S>(records: &mut Option<S>) -> Option<S::Item>
where
    S: Stream + Unpin,
{
    match records {
        Some(records) => records.next().await,
        None => None,
    }
}
