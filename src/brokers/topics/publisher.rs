//! Publisher: routes each publish to a channel, applies backlog flow control
//! and hands the append to its own actor task, which writes in call order.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::brokers::topics::errors::TopicError;
use crate::brokers::topics::flow_control::FlowControl;
use crate::brokers::topics::position::{ChannelId, Position};
use crate::brokers::topics::router::{ChannelRouter, OrderBy};
use crate::brokers::topics::topic::TopicInner;

#[derive(Clone, Debug, Default)]
pub struct PublisherOptions {
    pub order_by: OrderBy,
    /// Fail with `CapacityExceeded` instead of waiting for space.
    pub fail_on_full: bool,
    /// Overrides the topic's publisher backlog threshold.
    pub max_backlog: Option<u64>,
    /// Admit every publish without waiting on the backlog threshold.
    pub non_blocking: bool,
}

impl PublisherOptions {
    pub fn ordered_by(order_by: OrderBy) -> Self {
        Self { order_by, ..Default::default() }
    }

    pub fn fail_on_full(mut self) -> Self {
        self.fail_on_full = true;
        self
    }

    pub fn non_blocking(mut self) -> Self {
        self.non_blocking = true;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublishStatus {
    pub channel: ChannelId,
    pub position: Position,
}

// ==========================================
// ACTOR
// ==========================================

enum PublisherCommand {
    Publish {
        channel: ChannelId,
        value: Bytes,
        units: u64,
        reply: oneshot::Sender<Result<Position, TopicError>>,
    },
    /// Replies once every command queued before it is done.
    Flush {
        reply: oneshot::Sender<()>,
    },
}

struct PublisherActor {
    topic: Arc<TopicInner>,
    flow: Arc<FlowControl>,
    published: Arc<AtomicU64>,
    fail_on_full: bool,
    rx: mpsc::UnboundedReceiver<PublisherCommand>,
}

impl PublisherActor {
    async fn run(mut self) {
        while let Some(cmd) = self.rx.recv().await {
            match cmd {
                PublisherCommand::Publish { channel, value, units, reply } => {
                    let result = self.append(channel, value).await;
                    if result.is_ok() {
                        self.published.fetch_add(1, Ordering::Relaxed);
                    }
                    self.flow.release(units);
                    let _ = reply.send(result);
                }
                PublisherCommand::Flush { reply } => {
                    let _ = reply.send(());
                }
            }
        }
    }

    /// Appends, waiting out full storage (unless fail-on-full) and storage loss.
    async fn append(&self, channel: ChannelId, value: Bytes) -> Result<Position, TopicError> {
        let store = &self.topic.store;
        loop {
            let removed = store.removals().notified();
            tokio::pin!(removed);
            removed.as_mut().enable();

            match store.append(channel, value.clone()) {
                Err(TopicError::CapacityExceeded { .. }) if !self.fail_on_full && self.topic.is_active() => {
                    debug!(topic = %self.topic.name, channel, "Storage full, waiting for page removal");
                    tokio::select! {
                        _ = &mut removed => {}
                        _ = self.topic.shutdown_token().cancelled() => {}
                    }
                }
                Err(TopicError::NotActive(_)) if self.topic.is_active() && !store.is_available() => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.topic.config.reconnect_wait) => {}
                        _ = self.topic.shutdown_token().cancelled() => {}
                    }
                }
                Err(TopicError::NotActive(_)) if !self.topic.is_active() => {
                    return Err(TopicError::NotActive(format!("topic '{}'", self.topic.name)));
                }
                other => return other,
            }
        }
    }
}

// ==========================================
// PUBLIC HANDLE
// ==========================================

pub struct Publisher {
    id: Uuid,
    topic: Arc<TopicInner>,
    router: ChannelRouter,
    flow: Arc<FlowControl>,
    fail_on_full: bool,
    non_blocking: bool,
    published: Arc<AtomicU64>,
    active: AtomicBool,
    tx: mpsc::UnboundedSender<PublisherCommand>,
}

impl Publisher {
    pub(crate) fn new(topic: Arc<TopicInner>, options: PublisherOptions) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let flow = Arc::new(FlowControl::new(
            options.max_backlog.unwrap_or(topic.config.publisher_max_backlog),
        ));
        let published = Arc::new(AtomicU64::new(0));

        let actor = PublisherActor {
            topic: topic.clone(),
            flow: flow.clone(),
            published: published.clone(),
            fail_on_full: options.fail_on_full,
            rx,
        };
        tokio::spawn(actor.run());

        let id = Uuid::new_v4();
        debug!(topic = %topic.name, publisher = %id, order_by = ?options.order_by, "Publisher created");
        Self {
            id,
            router: ChannelRouter::new(options.order_by, topic.config.channel_count),
            topic,
            flow,
            fail_on_full: options.fail_on_full,
            non_blocking: options.non_blocking,
            published,
            active: AtomicBool::new(true),
            tx,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn order_by(&self) -> &OrderBy {
        self.router.order_by()
    }

    pub fn flow_control(&self) -> &FlowControl {
        &self.flow
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire) && self.topic.is_active()
    }

    /// Number of completed publishes.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub async fn publish(&self, value: Bytes) -> Result<PublishStatus, TopicError> {
        self.send(None, value).await
    }

    /// Routes on `key` (with `OrderBy::Key`), publishes `value`.
    pub async fn publish_keyed(&self, key: &[u8], value: Bytes) -> Result<PublishStatus, TopicError> {
        self.send(Some(key), value).await
    }

    async fn send(&self, key: Option<&[u8]>, value: Bytes) -> Result<PublishStatus, TopicError> {
        if !self.is_active() {
            return Err(TopicError::NotActive(format!("publisher {}", self.id)));
        }
        let channel = self.router.route(key, &value);

        let store = &self.topic.store;
        if self.fail_on_full && store.is_full() {
            return Err(TopicError::CapacityExceeded {
                topic: self.topic.name.clone(),
                capacity: store.storage_capacity(),
            });
        }

        let units = store.calculator().cost(&value);
        if self.non_blocking {
            self.flow.acquire_unchecked(units);
        } else {
            self.flow.acquire(units).await;
        }

        let (reply, rx) = oneshot::channel();
        if self.tx.send(PublisherCommand::Publish { channel, value, units, reply }).is_err() {
            self.flow.release(units);
            return Err(TopicError::NotActive(format!("publisher {}", self.id)));
        }
        let position = rx
            .await
            .map_err(|_| TopicError::NotActive(format!("publisher {}", self.id)))??;
        Ok(PublishStatus { channel, position })
    }

    /// Waits until every publish issued before this call has completed.
    pub async fn flush(&self) -> Result<(), TopicError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PublisherCommand::Flush { reply })
            .map_err(|_| TopicError::NotActive(format!("publisher {}", self.id)))?;
        rx.await.map_err(|_| TopicError::NotActive(format!("publisher {}", self.id)))
    }

    /// Flushes, then rejects further publishes.
    pub async fn close(&self) -> Result<(), TopicError> {
        if !self.active.load(Ordering::Acquire) {
            return Ok(());
        }
        let flushed = self.flush().await;
        self.active.store(false, Ordering::Release);
        if let Err(e) = &flushed {
            warn!(publisher = %self.id, error = %e, "Flush on close failed");
        }
        info!(topic = %self.topic.name, publisher = %self.id, published = self.published(), "Publisher closed");
        flushed
    }
}
