use std::fmt;

use rdkafka::topic_partition_list::TopicPartitionListElem;

/// Partition key of an ordered sub-stream of the log
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Partition {
    topic: String,
    partition_number: i32,
}

impl Partition {
    pub fn new(topic: impl Into<String>, partition_number: i32) -> Self {
        Self {
            topic: topic.into(),
            partition_number,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition_number
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition_number)
    }
}

impl From<TopicPartitionListElem<'_>> for Partition {
    fn from(elem: TopicPartitionListElem<'_>) -> Self {
        Self::new(elem.topic(), elem.partition())
    }
}

/// An immutable record as produced by the log client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord<T> {
    partition: Partition,
    offset: i64,
    payload: T,
}

impl<T> RawRecord<T> {
    pub fn new(partition: Partition, offset: i64, payload: T) -> Self {
        Self {
            partition,
            offset,
            payload,
        }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn topic(&self) -> &str {
        self.partition.topic()
    }

    pub fn partition_number(&self) -> i32 {
        self.partition.partition_number()
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    pub fn into_payload(self) -> T {
        self.payload
    }

    /// Transform the payload, keeping the record's coordinates
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> RawRecord<U> {
        RawRecord {
            partition: self.partition,
            offset: self.offset,
            payload: f(self.payload),
        }
    }
}
