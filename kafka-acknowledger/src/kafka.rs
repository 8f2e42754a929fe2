//! rdkafka binding: turns a `StreamConsumer` into a receiver record source and
//! forwards rebalance revocations to the live subscription.

use std::sync::{Arc, Weak};

use futures::stream::Stream;
use parking_lot::Mutex;
use rdkafka::consumer::{BaseConsumer, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::OwnedMessage;
use rdkafka::{ClientConfig, ClientContext, Message, TopicPartitionList};
use tracing::{debug, error, info, warn};

use crate::config::KafkaConsumerConfig;
use crate::error::{AckError, PipelineError};
use crate::pipeline::{AcknowledgeableStream, PartitionRevoker, RecordTransformer};
use crate::receiver::{ReceiverOffset, ReceiverRecord};
use crate::types::{Partition, RawRecord};

pub type AcknowledgingConsumer = StreamConsumer<RevocationContext>;

/// Consumer context forwarding revoked partitions to the attached subscription
#[derive(Default)]
pub struct RevocationContext {
    revoker: Mutex<Option<PartitionRevoker>>,
}

impl RevocationContext {
    /// Route later revocations to `revoker`, replacing any previous subscription
    pub fn attach(&self, revoker: PartitionRevoker) {
        *self.revoker.lock() = Some(revoker);
    }

    pub fn detach(&self) {
        self.revoker.lock().take();
    }

    pub fn is_attached(&self) -> bool {
        self.revoker.lock().is_some()
    }

    /// Forward `partitions` to the attached subscription, if any
    pub fn revoke(&self, partitions: &TopicPartitionList) {
        if partitions.count() == 0 {
            debug!("Skipping empty revoke rebalance");
            return;
        }

        let guard = self.revoker.lock();
        let Some(revoker) = guard.as_ref() else {
            debug!("No subscription attached, nothing to revoke");
            return;
        };

        info!("Revoking {} partitions", partitions.count());
        let delivered = revoker.revoke_all(partitions.elements().into_iter().map(Partition::from));
        if !delivered {
            warn!("Subscription ended before revocation could be delivered");
        }
    }
}

impl ClientContext for RevocationContext {}

impl ConsumerContext for RevocationContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => self.revoke(partitions),
            Rebalance::Assign(partitions) => {
                info!("Pre-rebalance assign event for {} partitions", partitions.count());
            }
            Rebalance::Error(e) => {
                error!("Rebalance error: {}", e);
            }
        }
    }
}

/// Create a consumer subscribed to the configured topic. Offsets are only
/// stored when a record is acknowledged.
pub fn create_consumer(
    config: &KafkaConsumerConfig,
) -> Result<Arc<AcknowledgingConsumer>, KafkaError> {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.kafka_hosts)
        .set("statistics.interval.ms", "10000")
        .set("group.id", &config.kafka_consumer_group)
        .set("auto.offset.reset", &config.kafka_consumer_offset_reset)
        .set("enable.auto.commit", "true")
        .set("enable.auto.offset.store", "false");

    if config.kafka_tls {
        client_config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    };

    let consumer: AcknowledgingConsumer =
        client_config.create_with_context(RevocationContext::default())?;
    consumer.subscribe(&[config.kafka_consumer_topic.as_str()])?;

    Ok(Arc::new(consumer))
}

/// Offset handle of one consumed message
pub struct KafkaReceiverOffset {
    consumer: Weak<AcknowledgingConsumer>,
    partition: Partition,
    offset: i64,
}

impl KafkaReceiverOffset {
    pub fn new(consumer: &Arc<AcknowledgingConsumer>, partition: Partition, offset: i64) -> Self {
        Self {
            consumer: Arc::downgrade(consumer),
            partition,
            offset,
        }
    }
}

impl ReceiverOffset for KafkaReceiverOffset {
    fn acknowledge(&self) -> Result<(), AckError> {
        let consumer = self.consumer.upgrade().ok_or_else(|| {
            AckError::commit(self.partition.clone(), self.offset, "consumer gone")
        })?;

        consumer
            .store_offset(
                self.partition.topic(),
                self.partition.partition_number(),
                self.offset,
            )
            .map_err(|e| AckError::commit(self.partition.clone(), self.offset, e))
    }

    fn fail(&self, error: &AckError) {
        warn!(
            partition = %self.partition,
            offset = self.offset,
            error = %error,
            "Record processing failed, offset not stored"
        );
    }
}

/// Messages of `consumer` as receiver records. The first consumer error is
/// yielded and ends the stream.
pub fn receiver_records(
    consumer: Arc<AcknowledgingConsumer>,
) -> impl Stream<Item = Result<ReceiverRecord<OwnedMessage>, PipelineError>> + Send + 'static {
    async_stream::stream! {
        loop {
            let message = match consumer.recv().await {
                Ok(message) => message.detach(),
                Err(e) => {
                    error!("Error receiving message: {}", e);
                    yield Err(PipelineError::Kafka(e));
                    break;
                }
            };

            let partition = Partition::new(message.topic(), message.partition());
            let offset = KafkaReceiverOffset::new(&consumer, partition.clone(), message.offset());
            let record = RawRecord::new(partition, message.offset(), message);

            yield Ok(ReceiverRecord::new(record, offset));
        }
    }
}

/// Subscribe `transformer` to `consumer`, routing the consumer's revocations
/// to the new subscription
pub fn acknowledged_records(
    transformer: &RecordTransformer,
    consumer: Arc<AcknowledgingConsumer>,
) -> AcknowledgeableStream<OwnedMessage> {
    let stream = transformer.transform(receiver_records(consumer.clone()));
    consumer.context().attach(stream.revoker());
    stream
}
