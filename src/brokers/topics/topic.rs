//! Topic: wires the page store, ownership manager and durable groups together
//! and owns the lifecycle (destroy, storage loss, restore).
//!
//! `Topic` is a cheap handle (one `Arc`). Publishers and subscribers keep the
//! shared `TopicInner` alive; the heartbeat sweeper only holds a `Weak`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::brokers::topics::errors::TopicError;
use crate::brokers::topics::options::TopicConfig;
use crate::brokers::topics::ownership::OwnershipManager;
use crate::brokers::topics::page_store::PageStore;
use crate::brokers::topics::position::ChannelId;
use crate::brokers::topics::publisher::{Publisher, PublisherOptions};
use crate::brokers::topics::snapshot::{Durability, TopicSnapshot};
use crate::brokers::topics::subscriber::{Subscriber, SubscriberInner, SubscriberOptions};
use crate::brokers::topics::subscription::Subscription;
use crate::utils::utils_time::current_time_ms;

pub(crate) struct TopicInner {
    pub(crate) name: String,
    pub(crate) config: TopicConfig,
    pub(crate) store: PageStore,
    pub(crate) ownership: OwnershipManager,
    pub(crate) subscriptions: DashMap<String, Arc<Subscription>>,
    pub(crate) subscribers: DashMap<Uuid, Weak<SubscriberInner>>,
    active: AtomicBool,
    durability: Option<Arc<dyn Durability>>,
    shutdown: CancellationToken,
}

impl TopicInner {
    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn check_active(&self) -> Result<(), TopicError> {
        if self.is_active() {
            Ok(())
        } else {
            Err(TopicError::NotActive(format!("topic '{}'", self.name)))
        }
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Returns the named group, creating it on first use.
    pub(crate) fn ensure_group(
        &self,
        name: &str,
        filter: Option<&str>,
        converter: Option<&str>,
    ) -> Result<Arc<Subscription>, TopicError> {
        self.check_active()?;
        if let Some(existing) = self.subscriptions.get(name) {
            existing.check_config(filter, converter)?;
            return Ok(existing.clone());
        }
        let entry = self.subscriptions.entry(name.to_string()).or_insert_with(|| {
            info!(topic = %self.name, group = name, "Creating subscriber group");
            Arc::new(Subscription::create(
                name,
                filter.map(str::to_string),
                converter.map(str::to_string),
                &self.store,
                self.config.retain_consumed,
            ))
        });
        entry.check_config(filter, converter)?;
        Ok(entry.clone())
    }

    fn live_subscribers(&self) -> Vec<Arc<SubscriberInner>> {
        self.subscribers.iter().filter_map(|e| e.value().upgrade()).collect()
    }
}

// ==========================================
// TOPIC HANDLE
// ==========================================

#[derive(Clone)]
pub struct Topic {
    inner: Arc<TopicInner>,
}

impl Topic {
    /// Must be called inside a tokio runtime (spawns the heartbeat sweeper).
    pub fn new(name: &str, config: TopicConfig, durability: Option<Arc<dyn Durability>>) -> Self {
        let inner = Arc::new(TopicInner {
            name: name.to_string(),
            store: PageStore::new(name, &config),
            ownership: OwnershipManager::new(name, config.channel_count),
            subscriptions: DashMap::new(),
            subscribers: DashMap::new(),
            active: AtomicBool::new(true),
            durability,
            shutdown: CancellationToken::new(),
            config,
        });
        spawn_heartbeat_sweeper(Arc::downgrade(&inner));
        info!(
            topic = name, channels = inner.config.channel_count,
            partitions = inner.config.partition_count, "Topic created"
        );
        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &TopicConfig {
        &self.inner.config
    }

    pub fn channel_count(&self) -> u32 {
        self.inner.config.channel_count
    }

    pub fn is_active(&self) -> bool {
        self.inner.is_active()
    }

    pub fn is_destroyed(&self) -> bool {
        !self.inner.is_active()
    }

    /// Read-only access to the underlying store, for introspection.
    pub fn page_store(&self) -> &PageStore {
        &self.inner.store
    }

    pub fn create_publisher(&self, options: PublisherOptions) -> Result<Publisher, TopicError> {
        self.inner.check_active()?;
        Ok(Publisher::new(self.inner.clone(), options))
    }

    pub fn create_subscriber(&self, options: SubscriberOptions) -> Result<Subscriber, TopicError> {
        self.inner.check_active()?;
        Subscriber::connect(self.inner.clone(), options)
    }

    pub fn ensure_subscriber_group(&self, name: &str) -> Result<(), TopicError> {
        match self.inner.subscriptions.get(name) {
            Some(_) => Ok(()),
            None => self.inner.ensure_group(name, None, None).map(|_| ()),
        }
    }

    /// Removes the group and its page references. Attached members lose
    /// their membership.
    pub fn destroy_subscriber_group(&self, name: &str) -> bool {
        let lost = self.inner.ownership.drop_group(name);
        match self.inner.subscriptions.remove(name) {
            Some((_, subscription)) => {
                subscription.destroy(&self.inner.store);
                info!(topic = %self.inner.name, group = name, members = lost, "Subscriber group destroyed");
                true
            }
            None => false,
        }
    }

    pub fn subscriber_groups(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.subscriptions.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Elements the group has not consumed yet, over all channels.
    pub fn remaining_messages(&self, group: &str) -> Option<u64> {
        self.inner
            .subscriptions
            .get(group)
            .map(|s| s.remaining(&self.inner.store))
    }

    /// Members of `group` in registration order, with the channels each owns.
    pub fn group_members(&self, group: &str) -> Vec<(Uuid, Vec<ChannelId>)> {
        let ownership = &self.inner.ownership;
        ownership
            .members(group)
            .into_iter()
            .map(|id| {
                let channels = ownership.channels_of(group, &id);
                (id, channels)
            })
            .collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.live_subscribers().len()
    }

    // --- Durability ---

    pub fn snapshot(&self) -> TopicSnapshot {
        let mut groups: Vec<_> = self.inner.subscriptions.iter().map(|e| e.value().snapshot()).collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        TopicSnapshot {
            name: self.inner.name.clone(),
            channel_count: self.inner.config.channel_count,
            options: self.inner.config.to_options(),
            taken_at: current_time_ms(),
            channels: self.inner.store.snapshot_channels(),
            groups,
        }
    }

    pub fn persist(&self) -> Result<(), TopicError> {
        self.inner.check_active()?;
        match &self.inner.durability {
            Some(durability) => durability.save(&self.snapshot()),
            None => Err(TopicError::InvalidConfig(format!(
                "topic '{}' has no durability configured",
                self.inner.name
            ))),
        }
    }

    /// The storage tier is gone: every subscriber disconnects and appends are
    /// held back until `restore_storage`.
    pub fn on_storage_lost(&self) {
        warn!(topic = %self.inner.name, "Storage lost");
        self.inner.store.mark_lost();
        self.inner.ownership.lose_all();
        for subscriber in self.inner.live_subscribers() {
            subscriber.on_storage_lost();
        }
    }

    /// Restores pages and durable groups. Reference counts are re-derived
    /// from the group heads; detached subscribers reconnect on their own.
    pub fn restore_storage(&self, snapshot: TopicSnapshot) -> Result<(), TopicError> {
        self.inner.check_active()?;
        if snapshot.channel_count != self.inner.config.channel_count {
            return Err(TopicError::InvalidConfig(format!(
                "snapshot has {} channels, topic '{}' has {}",
                snapshot.channel_count, self.inner.name, self.inner.config.channel_count
            )));
        }

        self.inner.subscriptions.clear();
        let mut readers = Vec::new();
        for group in &snapshot.groups {
            let subscription = Subscription::from_snapshot(group);
            readers.extend(subscription.heads());
            self.inner.subscriptions.insert(group.name.clone(), Arc::new(subscription));
        }

        self.inner.store.restore(snapshot.channels, &readers);
        for subscriber in self.inner.live_subscribers() {
            subscriber.wake();
        }
        info!(topic = %self.inner.name, groups = snapshot.groups.len(), "Storage restored");
        Ok(())
    }

    /// Tears down pages, groups and subscribers. Every handle becomes
    /// `NotActive`. Idempotent.
    pub fn destroy(&self) {
        if !self.inner.active.swap(false, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown.cancel();
        self.inner.ownership.lose_all();
        self.inner.subscriptions.clear();
        self.inner.store.destroy();
        for subscriber in self.inner.live_subscribers() {
            subscriber.wake();
        }
        info!(topic = %self.inner.name, "Topic destroyed");
    }
}

// ==========================================
// BACKGROUND
// ==========================================

fn spawn_heartbeat_sweeper(topic: Weak<TopicInner>) {
    let (token, timeout) = match topic.upgrade() {
        Some(inner) => (inner.shutdown.clone(), inner.config.subscriber_timeout),
        None => return,
    };
    let period = (timeout / 2).max(Duration::from_millis(10));

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    let inner = match topic.upgrade() {
                        Some(inner) => inner,
                        None => break,
                    };
                    let expired = inner.ownership.expire(timeout);
                    if !expired.is_empty() {
                        debug!(topic = %inner.name, expired = expired.len(), "Heartbeat sweep");
                    }
                }
            }
        }
    });
}
