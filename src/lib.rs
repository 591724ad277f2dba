pub mod brokers;
pub mod config;
pub mod utils;

use std::sync::Arc;
use std::time::Instant;
use crate::brokers::topics::{FileDurability, TopicError, TopicManager};
use crate::config::Config;

// ========================================
// ENGINE
// ========================================

/// Entry point holding the topic registry. Cheap to clone.
#[derive(Clone)]
pub struct NexoEngine {
    pub topics: Arc<TopicManager>,
    pub start_time: Instant,
}

impl NexoEngine {
    /// In-memory engine.
    pub fn new(config: &Config) -> Self {
        Self {
            topics: Arc::new(TopicManager::new(config.topic.clone())),
            start_time: Instant::now(),
        }
    }

    /// Engine that snapshots topics under `topic.persistence_path` and
    /// restores them on startup.
    pub fn with_persistence(config: &Config) -> Result<Self, TopicError> {
        let durability = Arc::new(FileDurability::new(&config.topic.persistence_path)?);
        Ok(Self {
            topics: Arc::new(TopicManager::with_durability(config.topic.clone(), durability)),
            start_time: Instant::now(),
        })
    }
}
