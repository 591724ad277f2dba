//! Subscriber Runtime
//!
//! State machine: `Connecting -> Connected -> Disconnected -> Connected ... -> Closed`.
//!
//! - Group members learn their channels from the ownership manager through an
//!   event stream, drained at the start of every operation.
//! - Anonymous subscribers own all channels (or their explicit subset) and are
//!   page readers themselves while attached.
//! - `receive` registers on every owned channel before looking for data, and
//!   the wake `Notify` is enabled before that, so an append can't slip in
//!   between the check and the wait.
//! - Group members heartbeat on receive and commit, while a receive waits,
//!   and on `heartbeat()`. A member silent for longer than the subscriber
//!   timeout loses its channels.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::brokers::topics::errors::{CommitResult, SeekResult, TopicError};
use crate::brokers::topics::flow_control::FlowControl;
use crate::brokers::topics::ownership::OwnershipEvent;
use crate::brokers::topics::page::Element;
use crate::brokers::topics::page_store::PageStore;
use crate::brokers::topics::position::{ChannelId, Position, ReaderId};
use crate::brokers::topics::subscription::Subscription;
use crate::brokers::topics::topic::TopicInner;
use crate::utils::utils_time::datetime_to_millis;

static NEXT_WAITER_ID: AtomicU64 = AtomicU64::new(1);

// ==========================================
// OPTIONS
// ==========================================

/// Named predicate. Elements it rejects are consumed but never surfaced.
#[derive(Clone)]
pub struct ElementFilter {
    name: String,
    predicate: Arc<dyn Fn(&Element) -> bool + Send + Sync>,
}

impl ElementFilter {
    pub fn new<F>(name: &str, predicate: F) -> Self
    where
        F: Fn(&Element) -> bool + Send + Sync + 'static,
    {
        Self { name: name.to_string(), predicate: Arc::new(predicate) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Named conversion. Returning `None` drops the element like a filter would.
#[derive(Clone)]
pub struct ElementConverter {
    name: String,
    convert: Arc<dyn Fn(Element) -> Option<Element> + Send + Sync>,
}

impl ElementConverter {
    pub fn new<F>(name: &str, convert: F) -> Self
    where
        F: Fn(Element) -> Option<Element> + Send + Sync + 'static,
    {
        Self { name: name.to_string(), convert: Arc::new(convert) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

pub type OwnershipListener = Arc<dyn Fn(&OwnershipEvent) + Send + Sync>;

#[derive(Clone, Default)]
pub struct SubscriberOptions {
    /// Durable group to join. `None` makes the subscriber anonymous.
    pub group: Option<String>,
    /// Explicit channel subset instead of automatic allocation.
    pub channels: Option<BTreeSet<ChannelId>>,
    pub filter: Option<ElementFilter>,
    pub converter: Option<ElementConverter>,
    /// `receive` returns `Ok(None)` instead of waiting when nothing is available.
    pub complete_on_empty: bool,
    /// Admit every receive without waiting on the backlog threshold.
    pub non_blocking: bool,
    pub listener: Option<OwnershipListener>,
}

impl SubscriberOptions {
    pub fn in_group(name: &str) -> Self {
        Self { group: Some(name.to_string()), ..Default::default() }
    }

    pub fn with_channels<I: IntoIterator<Item = ChannelId>>(mut self, channels: I) -> Self {
        self.channels = Some(channels.into_iter().collect());
        self
    }

    pub fn with_filter(mut self, filter: ElementFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_converter(mut self, converter: ElementConverter) -> Self {
        self.converter = Some(converter);
        self
    }

    pub fn complete_on_empty(mut self) -> Self {
        self.complete_on_empty = true;
        self
    }

    pub fn non_blocking(mut self) -> Self {
        self.non_blocking = true;
        self
    }

    pub fn with_listener<F>(mut self, listener: F) -> Self
    where
        F: Fn(&OwnershipEvent) + Send + Sync + 'static,
    {
        self.listener = Some(Arc::new(listener));
        self
    }
}

impl fmt::Debug for SubscriberOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberOptions")
            .field("group", &self.group)
            .field("channels", &self.channels)
            .field("filter", &self.filter.as_ref().map(|x| x.name()))
            .field("converter", &self.converter.as_ref().map(|x| x.name()))
            .field("complete_on_empty", &self.complete_on_empty)
            .field("non_blocking", &self.non_blocking)
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriberState {
    Connecting,
    Connected,
    Disconnected,
    Closed,
}

// ==========================================
// RUNTIME STATE
// ==========================================

struct ChannelCursor {
    /// Next position to fetch from the store (after the buffer).
    next: Position,
    /// Last position handed out on this channel.
    delivered: Position,
    /// Anonymous commit point. Groups keep theirs in the `Subscription`.
    committed: Position,
    buffer: VecDeque<Element>,
}

impl ChannelCursor {
    fn new(next: Position, committed: Position) -> Self {
        Self { next, delivered: committed, committed, buffer: VecDeque::new() }
    }

    /// Where the next surfaced element will come from.
    fn read_head(&self) -> Position {
        self.buffer.front().map(|e| e.position).unwrap_or(self.next)
    }
}

struct RuntimeState {
    state: SubscriberState,
    owned: BTreeSet<ChannelId>,
    cursors: HashMap<ChannelId, ChannelCursor>,
    /// Anonymous read positions kept across disconnects.
    resume: HashMap<ChannelId, Position>,
    next_channel: usize,
    events: Option<mpsc::UnboundedReceiver<OwnershipEvent>>,
    subscription: Option<Arc<Subscription>>,
}

pub(crate) struct SubscriberInner {
    id: Uuid,
    topic: Arc<TopicInner>,
    options: SubscriberOptions,
    reader: ReaderId,
    wake: Arc<Notify>,
    cancel: CancellationToken,
    flow: FlowControl,
    runtime: Mutex<RuntimeState>,
    reconnecting: AtomicBool,
}

impl SubscriberInner {
    fn store(&self) -> &PageStore {
        &self.topic.store
    }

    pub(crate) fn wake(&self) {
        self.wake.notify_waiters();
    }

    fn heartbeat_period(&self) -> Duration {
        (self.topic.config.subscriber_timeout / 3).max(Duration::from_millis(5))
    }

    fn heartbeat(&self) {
        if let Some(group) = &self.options.group {
            if self.runtime.lock().state == SubscriberState::Connected {
                self.topic.ownership.heartbeat(group, &self.id);
            }
        }
    }

    fn ensure_open(&self) -> Result<(), TopicError> {
        if self.runtime.lock().state == SubscriberState::Closed {
            return Err(TopicError::NotActive(format!("subscriber {}", self.id)));
        }
        self.topic.check_active()
    }

    // --- Connection ---

    fn try_connect(&self) -> Result<(), TopicError> {
        let mut rt = self.runtime.lock();
        match rt.state {
            SubscriberState::Closed => return Err(TopicError::NotActive(format!("subscriber {}", self.id))),
            SubscriberState::Connected => return Ok(()),
            _ => {}
        }
        self.topic.check_active()?;
        if !self.store().is_available() {
            return Err(TopicError::NotActive(format!("topic '{}' storage", self.topic.name)));
        }

        rt.owned.clear();
        rt.cursors.clear();

        match &self.options.group {
            Some(group) => {
                let subscription = self.topic.ensure_group(
                    group,
                    self.options.filter.as_ref().map(|f| f.name()),
                    self.options.converter.as_ref().map(|c| c.name()),
                )?;
                let events = self.topic.ownership.join(group, self.id, self.options.channels.clone(), self.wake.clone());
                rt.subscription = Some(subscription);
                rt.events = Some(events);
            }
            None => {
                let channel_count = self.topic.config.channel_count;
                let channels: Vec<ChannelId> = match &self.options.channels {
                    Some(explicit) => explicit.iter().copied().filter(|&c| c < channel_count).collect(),
                    None => (0..channel_count).collect(),
                };
                for c in channels {
                    let start = match self.topic.config.retain_consumed {
                        true => rt.resume.get(&c).copied().or_else(|| self.store().head_position(c)),
                        false => self.store().tail_position(c),
                    };
                    let start = start.unwrap_or_else(|| Position::null(c));
                    self.store().add_reference(c, start, &self.reader);
                    rt.cursors.insert(c, ChannelCursor::new(start, Position::null(c)));
                    rt.owned.insert(c);
                }
            }
        }

        rt.state = SubscriberState::Connected;
        info!(topic = %self.topic.name, subscriber = %self.id, group = ?self.options.group, "Subscriber connected");
        Ok(())
    }

    /// Leaves the group (or detaches the anonymous reader) and drops local
    /// channel state. Caller holds the runtime lock.
    fn disconnect_locked(&self, rt: &mut RuntimeState) {
        match &self.options.group {
            Some(group) => {
                self.topic.ownership.leave(group, &self.id);
                rt.events = None;
            }
            None => {
                for (c, cursor) in rt.cursors.iter() {
                    rt.resume.insert(*c, cursor.read_head());
                }
                self.store().detach_all(&self.reader);
            }
        }
        rt.owned.clear();
        rt.cursors.clear();
        if rt.state != SubscriberState::Closed {
            rt.state = SubscriberState::Disconnected;
        }
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        if self.reconnecting.swap(true, Ordering::AcqRel) {
            return;
        }
        let weak: Weak<SubscriberInner> = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let wait = self.topic.config.reconnect_wait;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
                let inner = match weak.upgrade() {
                    Some(inner) => inner,
                    None => return,
                };
                if !inner.topic.is_active() {
                    break;
                }
                match inner.try_connect() {
                    Ok(()) => break,
                    Err(e) => debug!(subscriber = %inner.id, error = %e, "Reconnect attempt failed"),
                }
            }
            if let Some(inner) = weak.upgrade() {
                inner.reconnecting.store(false, Ordering::Release);
                inner.wake();
            }
        });
    }

    pub(crate) fn on_storage_lost(self: &Arc<Self>) {
        {
            let mut rt = self.runtime.lock();
            if rt.state == SubscriberState::Closed {
                return;
            }
            self.disconnect_locked(&mut rt);
        }
        self.schedule_reconnect();
        self.wake();
    }

    // --- Ownership ---

    /// Applies pending ownership events. `Lost` disconnects and schedules a
    /// reconnect.
    fn sync_ownership(self: &Arc<Self>) {
        let (applied, lost) = {
            let mut rt = self.runtime.lock();
            let subscription = rt.subscription.clone();
            let mut applied = Vec::new();
            let mut lost = false;

            while let Some(event) = rt.events.as_mut().and_then(|rx| rx.try_recv().ok()) {
                match &event {
                    OwnershipEvent::Assigned(channels) => {
                        for &c in channels {
                            let (head, committed) = match &subscription {
                                Some(s) => (s.head(c), s.committed(c)),
                                None => (Position::null(c), Position::null(c)),
                            };
                            rt.cursors.insert(c, ChannelCursor::new(head, committed));
                            rt.owned.insert(c);
                        }
                    }
                    OwnershipEvent::Revoked(channels) => {
                        for c in channels {
                            rt.owned.remove(c);
                            rt.cursors.remove(c);
                        }
                    }
                    OwnershipEvent::Lost => lost = true,
                }
                debug!(subscriber = %self.id, event = ?event, "Ownership event");
                applied.push(event);
                if lost {
                    break;
                }
            }

            if lost && rt.state == SubscriberState::Connected {
                warn!(topic = %self.topic.name, subscriber = %self.id, "Group membership lost");
                self.disconnect_locked(&mut rt);
            }
            (applied, lost)
        };

        if let Some(listener) = &self.options.listener {
            for event in &applied {
                listener(event);
            }
        }
        if lost {
            self.schedule_reconnect();
        }
    }

    fn owns_authoritatively(&self, rt: &RuntimeState, channel: ChannelId) -> bool {
        if !rt.owned.contains(&channel) {
            return false;
        }
        match &self.options.group {
            Some(group) => self.topic.ownership.owner_of(group, channel) == Some(self.id),
            None => true,
        }
    }

    // --- Reading ---

    /// Next surfaced element from any owned channel, round-robin.
    fn next_element(&self, registration: &mut Registration<'_>) -> Option<Element> {
        let mut rt = self.runtime.lock();
        if rt.state != SubscriberState::Connected {
            return None;
        }
        let owned: Vec<ChannelId> = rt.owned.iter().copied().collect();
        if owned.is_empty() {
            return None;
        }

        for &c in &owned {
            self.store().register_waiter(c, registration.id, &self.wake);
        }
        registration.channels = owned.clone();

        let n = owned.len();
        let start = rt.next_channel % n;
        for i in 0..n {
            let c = owned[(start + i) % n];
            while let Some(element) = self.pull(&mut rt, c) {
                if let Some(out) = self.surface(element) {
                    rt.next_channel = (start + i + 1) % n;
                    return Some(out);
                }
            }
        }
        None
    }

    /// Takes the next raw element of a channel, refilling the prefetch buffer.
    fn pull(&self, rt: &mut RuntimeState, channel: ChannelId) -> Option<Element> {
        let cursor = rt.cursors.get_mut(&channel)?;
        if cursor.buffer.is_empty() {
            let (batch, next) = self.store().read_batch(channel, cursor.next, self.topic.config.prefetch);
            let advanced = next != cursor.next;
            cursor.next = next;
            cursor.buffer.extend(batch);
            if advanced && rt.subscription.is_none() {
                self.store().release_before(channel, next, &self.reader);
            }
            if cursor.buffer.is_empty() {
                return None;
            }
        }
        let element = cursor.buffer.pop_front()?;
        cursor.delivered = element.position;
        Some(element)
    }

    fn surface(&self, element: Element) -> Option<Element> {
        if let Some(filter) = &self.options.filter {
            if !(filter.predicate)(&element) {
                return None;
            }
        }
        match &self.options.converter {
            Some(converter) => (converter.convert)(element),
            None => Some(element),
        }
    }

    // --- Positioning ---

    fn seek_with<F>(self: &Arc<Self>, channel: ChannelId, target: F) -> SeekResult
    where
        F: FnOnce(&PageStore) -> Option<Position>,
    {
        if let Err(e) = self.ensure_open() {
            return SeekResult::Rejected(e);
        }
        if channel >= self.topic.config.channel_count {
            return SeekResult::Rejected(TopicError::InvalidPosition { channel, position: Position::null(channel) });
        }
        self.sync_ownership();

        let mut rt = self.runtime.lock();
        if !self.owns_authoritatively(&rt, channel) {
            return SeekResult::Rejected(TopicError::OwnershipRejected { channel });
        }

        let store = self.store();
        let target = target(store).unwrap_or_else(|| Position::null(channel));
        let head = store.resolve(channel, target);
        let committed = store.previous_position(channel, head);

        match &rt.subscription {
            Some(subscription) => subscription.seek(store, channel, committed, head),
            None => store.add_reference(channel, head, &self.reader),
        }
        if let Some(cursor) = rt.cursors.get_mut(&channel) {
            cursor.buffer.clear();
            cursor.next = head;
            cursor.delivered = committed;
            cursor.committed = committed;
        }
        debug!(subscriber = %self.id, channel, head = %head, "Seeked");
        SeekResult::Seeked { committed, head }
    }

    fn close(&self) {
        {
            let mut rt = self.runtime.lock();
            if rt.state == SubscriberState::Closed {
                return;
            }
            self.cancel.cancel();
            self.disconnect_locked(&mut rt);
            rt.state = SubscriberState::Closed;
        }
        self.topic.subscribers.remove(&self.id);
        self.wake();
        info!(topic = %self.topic.name, subscriber = %self.id, "Subscriber closed");
    }
}

/// Store waiter registrations of one receive call; removed on drop.
struct Registration<'a> {
    inner: &'a SubscriberInner,
    id: u64,
    channels: Vec<ChannelId>,
}

impl<'a> Registration<'a> {
    fn new(inner: &'a SubscriberInner) -> Self {
        Self { inner, id: NEXT_WAITER_ID.fetch_add(1, Ordering::Relaxed), channels: Vec::new() }
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        for &c in &self.channels {
            self.inner.store().cancel_waiter(c, self.id);
        }
    }
}

struct ReceivePermit<'a>(&'a FlowControl);

impl Drop for ReceivePermit<'_> {
    fn drop(&mut self) {
        self.0.release(1);
    }
}

// ==========================================
// PUBLIC HANDLE
// ==========================================

/// Closing happens on `close()` or drop.
pub struct Subscriber {
    inner: Arc<SubscriberInner>,
}

impl Subscriber {
    pub(crate) fn connect(topic: Arc<TopicInner>, options: SubscriberOptions) -> Result<Self, TopicError> {
        let channel_count = topic.config.channel_count;
        if let Some(channels) = &options.channels {
            if let Some(bad) = channels.iter().find(|&&c| c >= channel_count) {
                return Err(TopicError::InvalidConfig(format!(
                    "channel {} out of range (topic has {} channels)",
                    bad, channel_count
                )));
            }
        }

        let id = Uuid::new_v4();
        let reader = match &options.group {
            Some(group) => ReaderId::Group(group.clone()),
            None => ReaderId::Anonymous(id),
        };
        let inner = Arc::new(SubscriberInner {
            id,
            reader,
            wake: Arc::new(Notify::new()),
            cancel: CancellationToken::new(),
            flow: FlowControl::new(topic.config.subscriber_max_backlog),
            runtime: Mutex::new(RuntimeState {
                state: SubscriberState::Connecting,
                owned: BTreeSet::new(),
                cursors: HashMap::new(),
                resume: HashMap::new(),
                next_channel: 0,
                events: None,
                subscription: None,
            }),
            reconnecting: AtomicBool::new(false),
            options,
            topic,
        });

        match inner.try_connect() {
            Ok(()) => {}
            Err(TopicError::NotActive(_)) if inner.topic.is_active() => {
                // storage currently lost: come up disconnected and keep trying
                inner.runtime.lock().state = SubscriberState::Disconnected;
                inner.schedule_reconnect();
            }
            Err(e) => return Err(e),
        }

        inner.topic.subscribers.insert(id, Arc::downgrade(&inner));
        Ok(Self { inner })
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn group(&self) -> Option<&str> {
        self.inner.options.group.as_deref()
    }

    pub fn flow_control(&self) -> &FlowControl {
        &self.inner.flow
    }

    pub fn is_active(&self) -> bool {
        self.inner.ensure_open().is_ok()
    }

    pub fn state(&self) -> SubscriberState {
        self.inner.sync_ownership();
        self.inner.runtime.lock().state
    }

    pub fn channels(&self) -> Vec<ChannelId> {
        self.inner.sync_ownership();
        self.inner.runtime.lock().owned.iter().copied().collect()
    }

    /// Waits for the next element of an owned channel.
    ///
    /// `Ok(None)` only with `complete_on_empty`. `Err(Cancelled)` when the
    /// subscriber is closed while waiting, `Err(NotActive)` after close or
    /// topic destruction.
    pub async fn receive(&self) -> Result<Option<Element>, TopicError> {
        let inner = &self.inner;
        inner.ensure_open()?;
        if inner.options.non_blocking {
            inner.flow.acquire_unchecked(1);
        } else {
            inner.flow.acquire(1).await;
        }
        let _permit = ReceivePermit(&inner.flow);
        let mut registration = Registration::new(inner);

        loop {
            let notified = inner.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if inner.cancel.is_cancelled() {
                return Err(TopicError::Cancelled);
            }
            inner.topic.check_active()?;
            inner.heartbeat();
            inner.sync_ownership();

            if let Some(element) = inner.next_element(&mut registration) {
                return Ok(Some(element));
            }
            if inner.options.complete_on_empty && inner.runtime.lock().state == SubscriberState::Connected {
                return Ok(None);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = inner.cancel.cancelled() => return Err(TopicError::Cancelled),
                _ = tokio::time::sleep(inner.heartbeat_period()), if inner.options.group.is_some() => {}
            }
        }
    }

    /// Waits for one element, then takes whatever else is ready, up to `max`.
    pub async fn receive_batch(&self, max: usize) -> Result<Vec<Element>, TopicError> {
        let first = match self.receive().await? {
            Some(element) => element,
            None => return Ok(Vec::new()),
        };
        let mut out = vec![first];
        let mut registration = Registration::new(&self.inner);
        while out.len() < max {
            match self.inner.next_element(&mut registration) {
                Some(element) => out.push(element),
                None => break,
            }
        }
        Ok(out)
    }

    pub fn commit(&self, channel: ChannelId, position: Position) -> CommitResult {
        let inner = &self.inner;
        if let Err(e) = inner.ensure_open() {
            return CommitResult::Rejected(e);
        }
        if position.channel != channel || channel >= inner.topic.config.channel_count {
            return CommitResult::Rejected(TopicError::InvalidPosition { channel, position });
        }
        inner.heartbeat();
        inner.sync_ownership();

        let mut rt = inner.runtime.lock();
        if !inner.owns_authoritatively(&rt, channel) {
            return CommitResult::Rejected(TopicError::OwnershipRejected { channel });
        }
        let delivered = match rt.cursors.get(&channel) {
            Some(cursor) => cursor.delivered,
            None => return CommitResult::Rejected(TopicError::OwnershipRejected { channel }),
        };

        if let Some(subscription) = rt.subscription.clone() {
            return subscription.commit(inner.store(), channel, position, delivered);
        }

        let cursor = match rt.cursors.get_mut(&channel) {
            Some(cursor) => cursor,
            None => return CommitResult::Rejected(TopicError::OwnershipRejected { channel }),
        };
        if position <= cursor.committed {
            return CommitResult::AlreadyCommitted(cursor.committed);
        }
        if position > delivered {
            return CommitResult::Rejected(TopicError::InvalidPosition { channel, position });
        }
        cursor.committed = position;
        CommitResult::Committed(position)
    }

    pub fn commit_element(&self, element: &Element) -> CommitResult {
        self.commit(element.channel(), element.position)
    }

    /// Commits the newest element of each channel in `batch`.
    pub fn commit_batch(&self, batch: &[Element]) -> Vec<(ChannelId, CommitResult)> {
        let mut newest = BTreeMap::new();
        for element in batch {
            let entry = newest.entry(element.channel()).or_insert(element.position);
            if element.position > *entry {
                *entry = element.position;
            }
        }
        newest
            .into_iter()
            .map(|(channel, position)| (channel, self.commit(channel, position)))
            .collect()
    }

    /// Repositions so that the next receive on `channel` returns the element
    /// right after `position`.
    pub fn seek(&self, channel: ChannelId, position: Position) -> SeekResult {
        if position.channel != channel {
            return SeekResult::Rejected(TopicError::InvalidPosition { channel, position });
        }
        self.inner.seek_with(channel, |store| Some(store.resolve(channel, position.next_offset())))
    }

    /// Next receive returns the first element published at or after `at`.
    pub fn seek_to_timestamp(&self, channel: ChannelId, at: DateTime<Utc>) -> SeekResult {
        let ts = datetime_to_millis(at);
        self.inner.seek_with(channel, |store| store.find_by_timestamp(channel, ts))
    }

    pub fn seek_to_head(&self, channel: ChannelId) -> SeekResult {
        self.inner.seek_with(channel, |store| store.head_position(channel))
    }

    pub fn seek_to_tail(&self, channel: ChannelId) -> SeekResult {
        self.inner.seek_with(channel, |store| store.tail_position(channel))
    }

    pub fn last_committed(&self, channel: ChannelId) -> Position {
        let rt = self.inner.runtime.lock();
        match &rt.subscription {
            Some(subscription) => subscription.committed(channel),
            None => rt
                .cursors
                .get(&channel)
                .map(|c| c.committed)
                .unwrap_or_else(|| Position::null(channel)),
        }
    }

    /// Next read position of every owned channel.
    pub fn heads(&self) -> BTreeMap<ChannelId, Position> {
        self.inner.sync_ownership();
        let rt = self.inner.runtime.lock();
        rt.cursors
            .iter()
            .map(|(&c, cursor)| (c, self.inner.store().resolve(c, cursor.read_head())))
            .collect()
    }

    /// Tail of every owned channel.
    pub fn tails(&self) -> BTreeMap<ChannelId, Position> {
        self.inner.sync_ownership();
        let rt = self.inner.runtime.lock();
        rt.owned
            .iter()
            .filter_map(|&c| self.inner.store().tail_position(c).map(|p| (c, p)))
            .collect()
    }

    /// Elements left to read on the owned channels.
    pub fn remaining_messages(&self) -> u64 {
        self.heads()
            .into_iter()
            .map(|(c, head)| self.inner.store().count_from(c, head))
            .sum()
    }

    /// Drops ownership (or page references) and reconnects after the
    /// configured wait.
    pub fn disconnect(&self) {
        {
            let mut rt = self.inner.runtime.lock();
            if rt.state != SubscriberState::Connected {
                return;
            }
            self.inner.disconnect_locked(&mut rt);
        }
        info!(topic = %self.inner.topic.name, subscriber = %self.inner.id, "Subscriber disconnected");
        self.inner.schedule_reconnect();
        self.inner.wake();
    }

    /// Keeps group membership alive during long processing between receives.
    pub fn heartbeat(&self) {
        self.inner.heartbeat();
    }

    /// Cancels pending receives and leaves the group. Idempotent.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.inner.close();
    }
}
