use std::collections::HashMap;
use std::str::FromStr;

use envconfig::Envconfig;

use crate::error::ConfigError;
use crate::strategy::{AcknowledgementStrategy, MaxInFlight, OverflowPolicy};

pub const MAX_IN_FLIGHT_PROPERTY: &str = "max.in.flight.per.topic.partition";
pub const STRATEGY_PROPERTY: &str = "acknowledgement.strategy";
pub const OVERFLOW_POLICY_PROPERTY: &str = "overflow.policy";
pub const FAIL_FAST_PROPERTY: &str = "fail.fast.on.record.failure";

#[derive(Envconfig, Clone, Debug, PartialEq, Eq)]
pub struct AcknowledgementConfig {
    // Unset means unbounded
    pub max_in_flight_per_partition: Option<usize>,

    #[envconfig(default = "ordered")]
    pub acknowledgement_strategy: String, // ordered, unordered

    #[envconfig(default = "block")]
    pub overflow_policy: String, // block, reject

    #[envconfig(default = "false")]
    pub fail_fast_on_record_failure: bool,
}

impl Default for AcknowledgementConfig {
    fn default() -> Self {
        Self {
            max_in_flight_per_partition: None,
            acknowledgement_strategy: AcknowledgementStrategy::default().to_string(),
            overflow_policy: "block".to_string(),
            fail_fast_on_record_failure: false,
        }
    }
}

impl AcknowledgementConfig {
    /// Build from a client property map, the way log client bindings usually
    /// hand configuration over. Missing keys take their defaults.
    pub fn from_properties(properties: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(value) = properties.get(MAX_IN_FLIGHT_PROPERTY) {
            config.max_in_flight_per_partition = Some(parse(MAX_IN_FLIGHT_PROPERTY, value)?);
        }
        if let Some(value) = properties.get(STRATEGY_PROPERTY) {
            config.acknowledgement_strategy = value.clone();
        }
        if let Some(value) = properties.get(OVERFLOW_POLICY_PROPERTY) {
            config.overflow_policy = value.clone();
        }
        if let Some(value) = properties.get(FAIL_FAST_PROPERTY) {
            config.fail_fast_on_record_failure = parse(FAIL_FAST_PROPERTY, value)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check every derived value parses
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.strategy()?;
        self.overflow_policy()?;
        self.max_in_flight()?;
        Ok(())
    }

    pub fn strategy(&self) -> Result<AcknowledgementStrategy, ConfigError> {
        self.acknowledgement_strategy.parse()
    }

    pub fn overflow_policy(&self) -> Result<OverflowPolicy, ConfigError> {
        self.overflow_policy.parse()
    }

    pub fn max_in_flight(&self) -> Result<MaxInFlight, ConfigError> {
        match self.max_in_flight_per_partition {
            Some(max) => MaxInFlight::limited(max),
            None => Ok(MaxInFlight::unbounded()),
        }
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: e.to_string(),
        })
}

#[derive(Envconfig, Clone, Debug)]
pub struct KafkaConsumerConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    pub kafka_consumer_group: String,
    pub kafka_consumer_topic: String,

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest

    #[envconfig(nested = true)]
    pub acknowledgement: AcknowledgementConfig,
}
