//! Topic Manager: registry of named topics.
//!
//! With a durability layer configured, every saved topic is restored on
//! startup (warm start) and a destroyed topic's snapshot is removed.

use std::sync::Arc;
use dashmap::DashMap;
use tracing::{error, info};

use crate::brokers::topics::errors::TopicError;
use crate::brokers::topics::options::{TopicConfig, TopicOptions};
use crate::brokers::topics::snapshot::Durability;
use crate::brokers::topics::topic::Topic;
use crate::config::SystemTopicConfig;

pub struct TopicManager {
    topics: DashMap<String, Topic>,
    config: SystemTopicConfig,
    durability: Option<Arc<dyn Durability>>,
}

impl TopicManager {
    pub fn new(config: SystemTopicConfig) -> Self {
        Self { topics: DashMap::new(), config, durability: None }
    }

    /// Manager backed by `durability`; restores every saved topic.
    pub fn with_durability(config: SystemTopicConfig, durability: Arc<dyn Durability>) -> Self {
        let manager = Self { topics: DashMap::new(), config, durability: Some(durability.clone()) };

        let names = match durability.list() {
            Ok(names) => names,
            Err(e) => {
                error!("Warm start: failed to list snapshots: {}", e);
                Vec::new()
            }
        };
        for name in names {
            match durability.load(&name) {
                Ok(Some(snapshot)) => {
                    let options = TopicOptions {
                        channel_count: Some(snapshot.channel_count),
                        ..snapshot.options.clone()
                    };
                    let restored = manager
                        .create_topic(&name, options)
                        .and_then(|topic| topic.restore_storage(snapshot));
                    match restored {
                        Ok(()) => info!(topic = %name, "Warm start: restored topic"),
                        Err(e) => error!(topic = %name, error = %e, "Warm start: restore failed"),
                    }
                }
                Ok(None) => {}
                Err(e) => error!(topic = %name, error = %e, "Warm start: load failed"),
            }
        }
        manager
    }

    /// Returns the existing topic or creates it. Options only apply on creation.
    pub fn create_topic(&self, name: &str, options: TopicOptions) -> Result<Topic, TopicError> {
        if let Some(existing) = self.topics.get(name) {
            return Ok(existing.clone());
        }
        let config = TopicConfig::from_options(options, &self.config)?;
        let topic = self
            .topics
            .entry(name.to_string())
            .or_insert_with(|| Topic::new(name, config, self.durability.clone()))
            .clone();
        Ok(topic)
    }

    pub fn get(&self, name: &str) -> Result<Topic, TopicError> {
        self.topics
            .get(name)
            .map(|t| t.clone())
            .ok_or_else(|| TopicError::TopicNotFound(name.to_string()))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.topics.contains_key(name)
    }

    pub fn destroy_topic(&self, name: &str) -> Result<(), TopicError> {
        let (_, topic) = self
            .topics
            .remove(name)
            .ok_or_else(|| TopicError::TopicNotFound(name.to_string()))?;
        topic.destroy();
        if let Some(durability) = &self.durability {
            durability.remove(name)?;
        }
        Ok(())
    }

    /// Saves every topic through the durability layer.
    pub fn persist_all(&self) -> Result<usize, TopicError> {
        let topics: Vec<Topic> = self.topics.iter().map(|t| t.clone()).collect();
        for topic in &topics {
            topic.persist()?;
        }
        Ok(topics.len())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics.iter().map(|t| t.key().clone()).collect();
        names.sort();
        names
    }
}
