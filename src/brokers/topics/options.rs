//! Topic options (what a caller asks for) and the resolved `TopicConfig`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::brokers::topics::errors::TopicError;
use crate::config::SystemTopicConfig;

/// Cost of one element, used for page capacity and backlog accounting.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementCalculator {
    /// Serialized size in bytes.
    #[default]
    Binary,
    /// Every element costs one unit.
    Count,
    #[serde(skip)]
    Custom(Arc<dyn Fn(&Bytes) -> u64 + Send + Sync>),
}

impl ElementCalculator {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&Bytes) -> u64 + Send + Sync + 'static,
    {
        ElementCalculator::Custom(Arc::new(f))
    }

    /// Never returns zero, so every element makes progress against a capacity.
    pub fn cost(&self, value: &Bytes) -> u64 {
        let cost = match self {
            ElementCalculator::Binary => value.len() as u64,
            ElementCalculator::Count => 1,
            ElementCalculator::Custom(f) => f(value),
        };
        cost.max(1)
    }
}

impl PartialEq for ElementCalculator {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ElementCalculator::Binary, ElementCalculator::Binary) => true,
            (ElementCalculator::Count, ElementCalculator::Count) => true,
            (ElementCalculator::Custom(a), ElementCalculator::Custom(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for ElementCalculator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElementCalculator::Binary => write!(f, "Binary"),
            ElementCalculator::Count => write!(f, "Count"),
            ElementCalculator::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TopicOptions {
    pub channel_count: Option<u32>,
    pub partition_count: Option<u32>,
    pub page_capacity: Option<u64>,
    pub storage_capacity: Option<u64>,
    pub retain_consumed: Option<bool>,
    pub calculator: Option<ElementCalculator>,
    pub publisher_max_backlog: Option<u64>,
    pub subscriber_max_backlog: Option<u64>,
    pub subscriber_timeout_ms: Option<u64>,
    pub reconnect_wait_ms: Option<u64>,
    pub prefetch: Option<usize>,
    /// Elements older than this are skipped by readers. `0` disables expiry.
    pub element_expiry_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct TopicConfig {
    pub channel_count: u32,
    pub partition_count: u32,
    pub page_capacity: u64,
    pub storage_capacity: u64,
    pub retain_consumed: bool,
    pub calculator: ElementCalculator,
    pub publisher_max_backlog: u64,
    pub subscriber_max_backlog: u64,
    pub subscriber_timeout: Duration,
    pub reconnect_wait: Duration,
    pub prefetch: usize,
    pub element_expiry: Option<Duration>,
}

impl TopicConfig {
    pub fn from_options(opts: TopicOptions, sys: &SystemTopicConfig) -> Result<Self, TopicError> {
        let config = Self {
            channel_count: opts.channel_count.unwrap_or(sys.default_channels),
            partition_count: opts.partition_count.unwrap_or(sys.default_partitions),
            page_capacity: opts.page_capacity.unwrap_or(sys.page_capacity),
            storage_capacity: opts.storage_capacity.unwrap_or(sys.storage_capacity),
            retain_consumed: opts.retain_consumed.unwrap_or(sys.retain_consumed),
            calculator: opts.calculator.unwrap_or_default(),
            publisher_max_backlog: opts.publisher_max_backlog.unwrap_or(sys.publisher_max_backlog),
            subscriber_max_backlog: opts.subscriber_max_backlog.unwrap_or(sys.subscriber_max_backlog),
            subscriber_timeout: Duration::from_millis(opts.subscriber_timeout_ms.unwrap_or(sys.subscriber_timeout_ms)),
            reconnect_wait: Duration::from_millis(opts.reconnect_wait_ms.unwrap_or(sys.reconnect_wait_ms)),
            prefetch: opts.prefetch.unwrap_or(sys.prefetch),
            element_expiry: match opts.element_expiry_ms.unwrap_or(sys.element_expiry_ms) {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Fully resolved options, so a snapshot can rebuild this exact config.
    /// A `Custom` calculator cannot be saved and comes back as the default.
    pub fn to_options(&self) -> TopicOptions {
        let calculator = match &self.calculator {
            ElementCalculator::Custom(_) => {
                warn!("Custom element calculator is not persisted, the default applies on restore");
                None
            }
            other => Some(other.clone()),
        };
        TopicOptions {
            channel_count: Some(self.channel_count),
            partition_count: Some(self.partition_count),
            page_capacity: Some(self.page_capacity),
            storage_capacity: Some(self.storage_capacity),
            retain_consumed: Some(self.retain_consumed),
            calculator,
            publisher_max_backlog: Some(self.publisher_max_backlog),
            subscriber_max_backlog: Some(self.subscriber_max_backlog),
            subscriber_timeout_ms: Some(self.subscriber_timeout.as_millis() as u64),
            reconnect_wait_ms: Some(self.reconnect_wait.as_millis() as u64),
            prefetch: Some(self.prefetch),
            element_expiry_ms: Some(self.element_expiry.map(|d| d.as_millis() as u64).unwrap_or(0)),
        }
    }

    fn validate(&self) -> Result<(), TopicError> {
        if self.channel_count == 0 {
            return Err(TopicError::InvalidConfig("channel count must be at least 1".into()));
        }
        if self.partition_count == 0 {
            return Err(TopicError::InvalidConfig("partition count must be at least 1".into()));
        }
        if self.page_capacity == 0 {
            return Err(TopicError::InvalidConfig("page capacity must be at least 1".into()));
        }
        if self.prefetch == 0 {
            return Err(TopicError::InvalidConfig("prefetch must be at least 1".into()));
        }
        Ok(())
    }
}
