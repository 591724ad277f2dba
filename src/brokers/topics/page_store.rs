//! Page Store: the paged log of a topic.
//!
//! Structure:
//! - One `ChannelLog` per channel, each behind its own lock. Appends to
//!   different channels never contend; appends to one channel are serialized.
//! - Pages are addressed by `(channel, page number)`. Page `n` of channel `c`
//!   is homed on partition `(c + n) % P` and linked to its neighbours in that
//!   partition (`prev`/`next`).
//! - Every reader (durable group or attached anonymous subscriber) references
//!   each page from its `from_page` onward. Pages are reclaimed oldest-first
//!   once sealed and unreferenced.
//! - Readers that find no data park a `Weak<Notify>` on the channel; the next
//!   append drains and wakes them.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::brokers::topics::errors::TopicError;
use crate::brokers::topics::options::{ElementCalculator, TopicConfig};
use crate::brokers::topics::page::{Element, Page, PageInfo, StoredElement};
use crate::brokers::topics::position::{ChannelId, PageNumber, Position, ReaderId, FIRST_PAGE, NULL_PAGE};
use crate::brokers::topics::snapshot::{ChannelSnapshot, PageSnapshot};
use crate::utils::utils_time::current_time_ms;

// ==========================================
// CHANNEL LOG (Pure State, guarded per channel)
// ==========================================

#[derive(Clone, Copy, Debug, Default)]
struct PartitionUsage {
    head: PageNumber,
    tail: PageNumber,
    max: PageNumber,
}

struct ChannelLog {
    id: ChannelId,
    partition_count: u32,
    pages: BTreeMap<PageNumber, Page>,
    /// Next page number to allocate.
    next_page: PageNumber,
    /// Current tail page, NULL_PAGE when the channel holds no pages.
    tail_page: PageNumber,
    usage: Vec<PartitionUsage>,
    /// Reader -> first page it still references.
    readers: HashMap<ReaderId, PageNumber>,
    waiters: Vec<(u64, Weak<Notify>)>,
    last_timestamp: u64,
}

impl ChannelLog {
    fn new(id: ChannelId, partition_count: u32) -> Self {
        Self {
            id,
            partition_count,
            pages: BTreeMap::new(),
            next_page: FIRST_PAGE,
            tail_page: NULL_PAGE,
            usage: vec![PartitionUsage::default(); partition_count as usize],
            readers: HashMap::new(),
            waiters: Vec::new(),
            last_timestamp: 0,
        }
    }

    fn partition_of(&self, page: PageNumber) -> u32 {
        ((self.id as u64 + page) % self.partition_count as u64) as u32
    }

    fn head_position(&self) -> Position {
        match self.pages.keys().next() {
            Some(&first) => Position::start_of(self.id, first),
            None => Position::start_of(self.id, self.next_page),
        }
    }

    /// Position the next append will occupy (or the start of the next page).
    fn tail_position(&self) -> Position {
        match self.pages.get(&self.tail_page) {
            Some(page) if !page.sealed => Position::new(self.id, page.number, page.write_offset()),
            _ => Position::start_of(self.id, self.next_page),
        }
    }

    fn last_position(&self) -> Option<Position> {
        self.pages
            .values()
            .rev()
            .find_map(|p| p.tail().map(|t| Position::new(self.id, p.number, t)))
    }

    fn resolve(&self, pos: Position) -> Position {
        let mut pos = Position::new(self.id, pos.page, pos.offset);
        loop {
            if pos.page >= self.next_page {
                return self.tail_position();
            }
            let page = match self.pages.range(pos.page..).next() {
                Some((_, page)) => page,
                None => return self.tail_position(),
            };
            if page.number != pos.page {
                // removed (or never existed); round forward
                pos = Position::start_of(self.id, page.number);
            }
            if pos.offset < page.write_offset() {
                return pos;
            }
            if page.sealed {
                pos = Position::start_of(self.id, page.number + 1);
                continue;
            }
            return Position::new(self.id, page.number, page.write_offset());
        }
    }

    fn element_at(&self, pos: Position) -> Option<Element> {
        let page = self.pages.get(&pos.page)?;
        let stored = page.element(pos.offset)?;
        Some(Element { position: pos, timestamp: stored.timestamp, value: stored.value.clone() })
    }

    /// Elements with a timestamp below `expired_before` are stepped over.
    fn read(&self, pos: Position, expired_before: u64) -> Option<(Element, Position)> {
        let mut at = self.resolve(pos);
        loop {
            let element = self.element_at(at)?;
            let next = self.resolve(at.next_offset());
            if element.timestamp >= expired_before {
                return Some((element, next));
            }
            at = next;
        }
    }

    fn read_batch(&self, pos: Position, max: usize, expired_before: u64) -> (Vec<Element>, Position) {
        let mut out = Vec::new();
        let mut cursor = self.resolve(pos);
        while out.len() < max {
            match self.element_at(cursor) {
                Some(element) => {
                    if element.timestamp >= expired_before {
                        out.push(element);
                    }
                    cursor = self.resolve(cursor.next_offset());
                }
                None => break,
            }
        }
        (out, cursor)
    }

    fn previous_position(&self, pos: Position) -> Position {
        let at = self.resolve(pos);
        if at.offset > 0 && self.pages.contains_key(&at.page) {
            return Position::new(self.id, at.page, at.offset - 1);
        }
        self.pages
            .range(..at.page)
            .rev()
            .find_map(|(_, p)| p.tail().map(|t| Position::new(self.id, p.number, t)))
            .unwrap_or_else(|| Position::null(self.id))
    }

    fn find_by_timestamp(&self, ts: u64) -> Position {
        for page in self.pages.values() {
            for (offset, element) in page.elements.iter().enumerate() {
                if element.timestamp >= ts {
                    return Position::new(self.id, page.number, offset as u32);
                }
            }
        }
        self.tail_position()
    }

    fn count_from(&self, pos: Position) -> u64 {
        let at = self.resolve(pos);
        self.pages
            .range(at.page..)
            .map(|(&n, p)| {
                let len = p.elements.len() as u64;
                if n == at.page { len.saturating_sub(at.offset as u64) } else { len }
            })
            .sum()
    }

    // --- Allocation ---

    fn allocate_page(&mut self) -> PageNumber {
        let number = self.next_page;
        self.next_page += 1;

        let partition = self.partition_of(number);
        let mut page = Page::new(self.id, number, partition);

        let usage = &mut self.usage[partition as usize];
        if usage.tail == NULL_PAGE {
            usage.head = number;
        } else {
            page.prev = usage.tail;
            let prev_tail = usage.tail;
            if let Some(prev) = self.pages.get_mut(&prev_tail) {
                prev.next = number;
            }
        }
        let usage = &mut self.usage[partition as usize];
        usage.tail = number;
        usage.max = number;

        // readers parked at or before this page hold a reference from birth
        page.ref_count = self.readers.values().filter(|&&from| from <= number).count() as u32;

        self.pages.insert(number, page);
        self.tail_page = number;
        number
    }

    fn append(&mut self, value: Bytes, units: u64, page_capacity: u64) -> Option<Position> {
        let needs_new_page = match self.pages.get_mut(&self.tail_page) {
            None => true,
            Some(page) if page.sealed => true,
            Some(page) if !page.is_empty() && page.units + units > page_capacity => {
                page.sealed = true;
                true
            }
            Some(_) => false,
        };
        if needs_new_page {
            self.allocate_page();
        }

        let timestamp = current_time_ms().max(self.last_timestamp);
        self.last_timestamp = timestamp;

        let tail = self.tail_page;
        let channel = self.id;
        let page = self.pages.get_mut(&tail)?;
        let offset = page.push(StoredElement { timestamp, value }, units);
        if page.units >= page_capacity {
            page.sealed = true;
        }
        Some(Position::new(channel, tail, offset))
    }

    // --- References ---

    fn adjust(&mut self, from: PageNumber, to_exclusive: Option<PageNumber>, delta: i64) {
        let end = to_exclusive.unwrap_or(PageNumber::MAX);
        if end <= from {
            return;
        }
        for (_, page) in self.pages.range_mut(from..end) {
            if delta > 0 {
                page.ref_count += delta as u32;
            } else {
                debug_assert!(page.ref_count as i64 >= -delta, "page ref count underflow");
                page.ref_count = page.ref_count.saturating_sub((-delta) as u32);
            }
        }
    }

    fn add_reference(&mut self, reader: &ReaderId, from_page: PageNumber) {
        match self.readers.get(reader).copied() {
            None => {
                self.adjust(from_page, None, 1);
                self.readers.insert(reader.clone(), from_page);
            }
            Some(current) if from_page < current => {
                self.adjust(from_page, Some(current), 1);
                self.readers.insert(reader.clone(), from_page);
            }
            Some(current) if from_page > current => {
                self.release(reader, from_page - 1);
            }
            Some(_) => {}
        }
    }

    fn release(&mut self, reader: &ReaderId, through_page: PageNumber) {
        if let Some(current) = self.readers.get(reader).copied() {
            if through_page >= current {
                self.adjust(current, Some(through_page + 1), -1);
                self.readers.insert(reader.clone(), through_page + 1);
            }
        }
    }

    fn detach(&mut self, reader: &ReaderId) {
        if let Some(from) = self.readers.remove(reader) {
            self.adjust(from, None, -1);
        }
    }

    /// Removes reclaimable pages, oldest first. Returns (pages, bytes) freed.
    fn reclaim(&mut self) -> (usize, u64) {
        let mut removed = 0;
        let mut freed = 0;
        loop {
            let number = match self.pages.iter().next() {
                Some((&n, page)) if page.sealed && page.ref_count == 0 => n,
                _ => break,
            };
            if let Some(page) = self.pages.remove(&number) {
                let usage = &mut self.usage[page.partition as usize];
                if usage.tail == number {
                    usage.head = NULL_PAGE;
                    usage.tail = NULL_PAGE;
                } else {
                    usage.head = page.next;
                }
                if page.next != NULL_PAGE {
                    if let Some(next) = self.pages.get_mut(&page.next) {
                        next.prev = NULL_PAGE;
                    }
                }
                if self.tail_page == number {
                    self.tail_page = NULL_PAGE;
                }
                removed += 1;
                freed += page.bytes;
            }
        }
        (removed, freed)
    }

    fn take_waiters(&mut self) -> Vec<Arc<Notify>> {
        std::mem::take(&mut self.waiters)
            .into_iter()
            .filter_map(|(_, weak)| weak.upgrade())
            .collect()
    }

    fn partition_chain(&self, partition: u32) -> Vec<PageNumber> {
        let mut chain = Vec::new();
        let mut cursor = match self.usage.get(partition as usize) {
            Some(usage) => usage.head,
            None => return chain,
        };
        while cursor != NULL_PAGE {
            chain.push(cursor);
            cursor = self.pages.get(&cursor).map(|p| p.next).unwrap_or(NULL_PAGE);
        }
        chain
    }

    fn clear(&mut self) {
        self.pages.clear();
        self.readers.clear();
        self.tail_page = NULL_PAGE;
        for usage in self.usage.iter_mut() {
            *usage = PartitionUsage::default();
        }
    }
}

// ==========================================
// PAGE STORE
// ==========================================

pub struct PageStore {
    topic: String,
    channel_count: u32,
    page_capacity: u64,
    storage_capacity: u64,
    retain_consumed: bool,
    calculator: ElementCalculator,
    element_expiry: Option<Duration>,
    channels: Vec<Mutex<ChannelLog>>,
    storage_bytes: AtomicU64,
    /// Woken whenever pages are removed (publishers waiting for capacity).
    removals: Notify,
    active: AtomicBool,
    available: AtomicBool,
}

impl PageStore {
    pub fn new(topic: &str, config: &TopicConfig) -> Self {
        let channels = (0..config.channel_count)
            .map(|c| Mutex::new(ChannelLog::new(c, config.partition_count)))
            .collect();
        Self {
            topic: topic.to_string(),
            channel_count: config.channel_count,
            page_capacity: config.page_capacity,
            storage_capacity: config.storage_capacity,
            retain_consumed: config.retain_consumed,
            calculator: config.calculator.clone(),
            element_expiry: config.element_expiry,
            channels,
            storage_bytes: AtomicU64::new(0),
            removals: Notify::new(),
            active: AtomicBool::new(true),
            available: AtomicBool::new(true),
        }
    }

    pub fn channel_count(&self) -> u32 {
        self.channel_count
    }

    pub fn calculator(&self) -> &ElementCalculator {
        &self.calculator
    }

    fn log(&self, channel: ChannelId) -> Option<&Mutex<ChannelLog>> {
        self.channels.get(channel as usize)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn is_available(&self) -> bool {
        self.is_active() && self.available.load(Ordering::Acquire)
    }

    pub fn is_full(&self) -> bool {
        self.storage_capacity > 0 && self.storage_bytes() >= self.storage_capacity
    }

    pub fn storage_bytes(&self) -> u64 {
        self.storage_bytes.load(Ordering::Acquire)
    }

    pub fn storage_capacity(&self) -> u64 {
        self.storage_capacity
    }

    /// Notify fired on page removal. Callers enable a `notified()` future
    /// before re-checking `is_full`.
    pub fn removals(&self) -> &Notify {
        &self.removals
    }

    // --- Write path ---

    pub fn append(&self, channel: ChannelId, value: Bytes) -> Result<Position, TopicError> {
        if !self.is_available() {
            return Err(TopicError::NotActive(format!("topic '{}' storage", self.topic)));
        }
        let log = self.log(channel).ok_or(TopicError::InvalidPosition {
            channel,
            position: Position::null(channel),
        })?;
        if self.is_full() {
            return Err(TopicError::CapacityExceeded {
                topic: self.topic.clone(),
                capacity: self.storage_capacity,
            });
        }

        let units = self.calculator.cost(&value);
        let bytes = value.len() as u64;

        let (position, waiters, freed) = {
            let mut log = log.lock();
            let position = log
                .append(value, units, self.page_capacity)
                .ok_or(TopicError::InvalidPosition { channel, position: Position::null(channel) })?;
            let waiters = log.take_waiters();
            let freed = if self.retain_consumed { (0, 0) } else { log.reclaim() };
            (position, waiters, freed)
        };

        self.storage_bytes.fetch_add(bytes, Ordering::AcqRel);
        self.after_reclaim(channel, freed);
        for waiter in waiters {
            waiter.notify_waiters();
        }
        Ok(position)
    }

    // --- Read path ---

    /// Publish timestamp below which elements count as expired (0 when
    /// expiry is off).
    fn expired_before(&self) -> u64 {
        match self.element_expiry {
            Some(expiry) => current_time_ms().saturating_sub(expiry.as_millis() as u64),
            None => 0,
        }
    }

    /// Element at or after `position` (expired ones skipped) and the position
    /// right after it.
    pub fn read(&self, channel: ChannelId, position: Position) -> Option<(Element, Position)> {
        let expired_before = self.expired_before();
        self.log(channel)?.lock().read(position, expired_before)
    }

    /// Up to `max` live elements. The returned cursor also moves past the
    /// expired elements it stepped over.
    pub fn read_batch(&self, channel: ChannelId, position: Position, max: usize) -> (Vec<Element>, Position) {
        let expired_before = self.expired_before();
        match self.log(channel) {
            Some(log) => log.lock().read_batch(position, max, expired_before),
            None => (Vec::new(), position),
        }
    }

    pub fn resolve(&self, channel: ChannelId, position: Position) -> Position {
        match self.log(channel) {
            Some(log) => log.lock().resolve(position),
            None => position,
        }
    }

    pub fn head_position(&self, channel: ChannelId) -> Option<Position> {
        self.log(channel).map(|log| log.lock().head_position())
    }

    pub fn tail_position(&self, channel: ChannelId) -> Option<Position> {
        self.log(channel).map(|log| log.lock().tail_position())
    }

    /// Position of the newest retained element.
    pub fn last_position(&self, channel: ChannelId) -> Option<Position> {
        self.log(channel).and_then(|log| log.lock().last_position())
    }

    /// The element position immediately before `position`, or null.
    pub fn previous_position(&self, channel: ChannelId, position: Position) -> Position {
        match self.log(channel) {
            Some(log) => log.lock().previous_position(position),
            None => Position::null(channel),
        }
    }

    /// First retained element with a timestamp `>= ts`, or the tail.
    pub fn find_by_timestamp(&self, channel: ChannelId, ts: u64) -> Option<Position> {
        self.log(channel).map(|log| log.lock().find_by_timestamp(ts))
    }

    /// Number of retained elements at or after `position`.
    pub fn count_from(&self, channel: ChannelId, position: Position) -> u64 {
        self.log(channel).map(|log| log.lock().count_from(position)).unwrap_or(0)
    }

    // --- References ---

    pub fn add_reference(&self, channel: ChannelId, from: Position, reader: &ReaderId) {
        let freed = match self.log(channel) {
            Some(log) => {
                let mut log = log.lock();
                let from = log.resolve(from);
                log.add_reference(reader, from.page);
                self.reclaim_locked(&mut log)
            }
            None => return,
        };
        self.after_reclaim(channel, freed);
    }

    /// Releases the reader's references up to and including `through_page`.
    pub fn release(&self, channel: ChannelId, through_page: PageNumber, reader: &ReaderId) {
        let freed = match self.log(channel) {
            Some(log) => {
                let mut log = log.lock();
                log.release(reader, through_page);
                self.reclaim_locked(&mut log)
            }
            None => return,
        };
        self.after_reclaim(channel, freed);
    }

    /// Releases every page before the one `next_read` resolves to.
    pub fn release_before(&self, channel: ChannelId, next_read: Position, reader: &ReaderId) {
        let freed = match self.log(channel) {
            Some(log) => {
                let mut log = log.lock();
                let at = log.resolve(next_read);
                if at.page > FIRST_PAGE {
                    log.release(reader, at.page - 1);
                }
                self.reclaim_locked(&mut log)
            }
            None => return,
        };
        self.after_reclaim(channel, freed);
    }

    pub fn detach(&self, channel: ChannelId, reader: &ReaderId) {
        let freed = match self.log(channel) {
            Some(log) => {
                let mut log = log.lock();
                log.detach(reader);
                self.reclaim_locked(&mut log)
            }
            None => return,
        };
        self.after_reclaim(channel, freed);
    }

    pub fn detach_all(&self, reader: &ReaderId) {
        for channel in 0..self.channel_count {
            self.detach(channel, reader);
        }
    }

    fn reclaim_locked(&self, log: &mut ChannelLog) -> (usize, u64) {
        if self.retain_consumed {
            (0, 0)
        } else {
            log.reclaim()
        }
    }

    fn after_reclaim(&self, channel: ChannelId, (removed, freed): (usize, u64)) {
        if removed == 0 {
            return;
        }
        self.storage_bytes.fetch_sub(freed, Ordering::AcqRel);
        debug!(topic = %self.topic, channel, removed, freed, "Reclaimed pages");
        self.removals.notify_waiters();
    }

    // --- Notification ---

    /// Parks `notify` on the channel until the next append. Re-registering the
    /// same id replaces the previous registration.
    pub fn register_waiter(&self, channel: ChannelId, waiter_id: u64, notify: &Arc<Notify>) {
        if let Some(log) = self.log(channel) {
            let mut log = log.lock();
            log.waiters.retain(|(id, weak)| *id != waiter_id && weak.strong_count() > 0);
            log.waiters.push((waiter_id, Arc::downgrade(notify)));
        }
    }

    pub fn cancel_waiter(&self, channel: ChannelId, waiter_id: u64) {
        if let Some(log) = self.log(channel) {
            log.lock().waiters.retain(|(id, _)| *id != waiter_id);
        }
    }

    pub fn waiter_count(&self, channel: ChannelId) -> usize {
        self.log(channel).map(|log| log.lock().waiters.len()).unwrap_or(0)
    }

    // --- Introspection ---

    pub fn page_info(&self, channel: ChannelId, page: PageNumber) -> Option<PageInfo> {
        self.log(channel)?.lock().pages.get(&page).map(Page::info)
    }

    pub fn page_numbers(&self, channel: ChannelId) -> Vec<PageNumber> {
        self.log(channel)
            .map(|log| log.lock().pages.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Pages of `channel` homed on `partition`, following the chain links.
    pub fn partition_chain(&self, channel: ChannelId, partition: u32) -> Vec<PageNumber> {
        self.log(channel).map(|log| log.lock().partition_chain(partition)).unwrap_or_default()
    }

    // --- Lifecycle ---

    /// Drops all content and wakes every parked reader and publisher.
    pub fn destroy(&self) {
        self.active.store(false, Ordering::Release);
        self.wipe();
        info!(topic = %self.topic, "Page store destroyed");
    }

    /// Storage tier lost: content is gone until `restore` is called.
    pub fn mark_lost(&self) {
        self.available.store(false, Ordering::Release);
        self.wipe();
        info!(topic = %self.topic, "Page store lost");
    }

    fn wipe(&self) {
        let mut woken = Vec::new();
        for log in &self.channels {
            let mut log = log.lock();
            log.clear();
            woken.extend(log.take_waiters());
        }
        self.storage_bytes.store(0, Ordering::Release);
        for waiter in woken {
            waiter.notify_waiters();
        }
        self.removals.notify_waiters();
    }

    pub fn snapshot_channels(&self) -> Vec<ChannelSnapshot> {
        self.channels
            .iter()
            .map(|log| {
                let log = log.lock();
                ChannelSnapshot {
                    channel: log.id,
                    next_page: log.next_page,
                    last_timestamp: log.last_timestamp,
                    pages: log
                        .pages
                        .values()
                        .map(|p| PageSnapshot {
                            number: p.number,
                            sealed: p.sealed,
                            elements: p.elements.clone(),
                        })
                        .collect(),
                }
            })
            .collect()
    }

    /// Rebuilds pages and chains from a snapshot, then re-derives every
    /// reference count from the readers' start positions.
    pub fn restore(&self, snapshot: Vec<ChannelSnapshot>, readers: &[(ReaderId, Position)]) {
        let mut total_bytes = 0;
        for channel in snapshot {
            let log = match self.log(channel.channel) {
                Some(log) => log,
                None => continue,
            };
            let mut log = log.lock();
            log.clear();
            log.next_page = FIRST_PAGE;
            for page in channel.pages {
                // replay allocation so partition chains come out identical
                log.next_page = page.number;
                let number = log.allocate_page();
                if let Some(restored) = log.pages.get_mut(&number) {
                    for element in page.elements {
                        let units = self.calculator.cost(&element.value);
                        restored.push(element, units);
                    }
                    restored.sealed = page.sealed;
                    total_bytes += restored.bytes;
                }
            }
            log.next_page = log.next_page.max(channel.next_page);
            log.last_timestamp = channel.last_timestamp;
        }
        self.storage_bytes.store(total_bytes, Ordering::Release);

        for (reader, from) in readers {
            if let Some(log) = self.log(from.channel) {
                let mut log = log.lock();
                let at = log.resolve(*from);
                log.add_reference(reader, at.page);
            }
        }
        self.reclaim_all();
        self.available.store(true, Ordering::Release);
        info!(topic = %self.topic, bytes = self.storage_bytes(), readers = readers.len(), "Page store restored");
    }

    fn reclaim_all(&self) {
        for channel in 0..self.channel_count {
            let freed = match self.log(channel) {
                Some(log) => self.reclaim_locked(&mut log.lock()),
                None => continue,
            };
            self.after_reclaim(channel, freed);
        }
    }
}

// ==========================================
// TESTS
// ==========================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brokers::topics::options::TopicOptions;
    use crate::config::SystemTopicConfig;

    fn store_with(opts: TopicOptions) -> PageStore {
        let config = TopicConfig::from_options(opts, &SystemTopicConfig::default()).unwrap();
        PageStore::new("test-topic", &config)
    }

    /// 1 channel, 2 partitions, 3 elements per page.
    fn small_store(retain: bool) -> PageStore {
        store_with(TopicOptions {
            channel_count: Some(1),
            partition_count: Some(2),
            page_capacity: Some(3),
            calculator: Some(ElementCalculator::Count),
            retain_consumed: Some(retain),
            ..Default::default()
        })
    }

    fn group(name: &str) -> ReaderId {
        ReaderId::Group(name.to_string())
    }

    #[test]
    fn test_append_rolls_pages_and_links_partitions() {
        let store = small_store(true);
        for i in 0..7 {
            store.append(0, Bytes::from(format!("m{}", i))).unwrap();
        }

        assert_eq!(store.page_numbers(0), vec![1, 2, 3]);
        let p1 = store.page_info(0, 1).unwrap();
        let p3 = store.page_info(0, 3).unwrap();
        assert!(p1.sealed);
        assert!(!p3.sealed);
        assert_eq!(p3.tail, Some(0));

        // pages alternate between the two partitions: 1,3 on one, 2 on the other
        assert_eq!(p1.partition, p3.partition);
        assert_eq!(store.partition_chain(0, p1.partition), vec![1, 3]);
        assert_eq!(p1.next, 3);
        assert_eq!(p3.prev, 1);
    }

    #[test]
    fn test_read_walks_across_pages_in_order() {
        let store = small_store(true);
        let mut written = Vec::new();
        for i in 0..5 {
            written.push(store.append(0, Bytes::from(format!("m{}", i))).unwrap());
        }

        let mut cursor = store.head_position(0).unwrap();
        let mut seen = Vec::new();
        while let Some((element, next)) = store.read(0, cursor) {
            seen.push(element.position);
            cursor = next;
        }
        assert_eq!(seen, written);
        assert_eq!(cursor, store.tail_position(0).unwrap());
        assert!(store.read(0, cursor).is_none());
    }

    #[test]
    fn test_oversized_element_gets_its_own_sealed_page() {
        let store = store_with(TopicOptions {
            channel_count: Some(1),
            partition_count: Some(1),
            page_capacity: Some(10),
            retain_consumed: Some(true),
            ..Default::default()
        });
        store.append(0, Bytes::from_static(b"abc")).unwrap();
        let big = store.append(0, Bytes::from(vec![7u8; 64])).unwrap();
        let after = store.append(0, Bytes::from_static(b"x")).unwrap();

        assert_eq!(big, Position::new(0, 2, 0));
        let info = store.page_info(0, 2).unwrap();
        assert!(info.sealed);
        assert_eq!(info.tail, Some(0));
        assert_eq!(info.bytes, 64);
        assert_eq!(after.page, 3);
        assert!(store.page_info(0, 1).unwrap().sealed);
    }

    #[test]
    fn test_unreferenced_sealed_pages_are_reclaimed_without_retention() {
        let store = small_store(false);
        for i in 0..7 {
            store.append(0, Bytes::from(format!("m{}", i))).unwrap();
        }
        // no readers: only the open tail page survives
        assert_eq!(store.page_numbers(0), vec![3]);
        assert_eq!(store.page_info(0, 3).unwrap().prev, NULL_PAGE);
        assert_eq!(store.storage_bytes(), 2);
    }

    #[test]
    fn test_references_hold_pages_until_released_in_order() {
        let store = small_store(false);
        let a = group("a");
        let b = group("b");
        store.add_reference(0, Position::start_of(0, FIRST_PAGE), &a);
        store.add_reference(0, Position::start_of(0, FIRST_PAGE), &b);

        for i in 0..9 {
            store.append(0, Bytes::from(format!("m{}", i))).unwrap();
        }
        assert_eq!(store.page_numbers(0), vec![1, 2, 3]);
        assert_eq!(store.page_info(0, 1).unwrap().ref_count, 2);

        // b releases page 2 first: page 1 is still held by a, so nothing goes
        store.release(0, 2, &b);
        assert_eq!(store.page_info(0, 1).unwrap().ref_count, 1);
        assert_eq!(store.page_info(0, 2).unwrap().ref_count, 1);
        assert_eq!(store.page_numbers(0), vec![1, 2, 3]);

        // a releases page 1 only: page 1 goes, page 2 is still held by a
        store.release(0, 1, &a);
        assert_eq!(store.page_numbers(0), vec![2, 3]);
        assert_eq!(store.page_info(0, 2).unwrap().ref_count, 1);

        store.release(0, 2, &a);
        assert_eq!(store.page_numbers(0), vec![3]);
    }

    #[test]
    fn test_detach_drops_every_reference_of_the_reader() {
        let store = small_store(false);
        let a = group("a");
        store.add_reference(0, Position::start_of(0, FIRST_PAGE), &a);
        for i in 0..7 {
            store.append(0, Bytes::from(format!("m{}", i))).unwrap();
        }
        // a second reader that only ever saw page 2 onward
        let b = group("b");
        store.add_reference(0, Position::start_of(0, 2), &b);
        store.release(0, 2, &b);
        assert_eq!(store.page_info(0, 2).unwrap().ref_count, 1);

        // detaching a makes 1 and 2 free; removal happens head first
        store.detach(0, &a);
        assert_eq!(store.page_numbers(0), vec![3]);
    }

    #[test]
    fn test_new_pages_count_parked_readers() {
        let store = small_store(false);
        let a = group("a");
        // parked at the next page before anything exists
        store.add_reference(0, store.tail_position(0).unwrap(), &a);
        store.append(0, Bytes::from_static(b"x")).unwrap();
        assert_eq!(store.page_info(0, 1).unwrap().ref_count, 1);
    }

    #[test]
    fn test_moving_reference_backwards_re_references_pages() {
        let store = small_store(true);
        let a = group("a");
        for i in 0..7 {
            store.append(0, Bytes::from(format!("m{}", i))).unwrap();
        }
        store.add_reference(0, Position::start_of(0, 3), &a);
        assert_eq!(store.page_info(0, 1).unwrap().ref_count, 0);

        store.add_reference(0, Position::start_of(0, 1), &a);
        assert_eq!(store.page_info(0, 1).unwrap().ref_count, 1);
        assert_eq!(store.page_info(0, 2).unwrap().ref_count, 1);
        assert_eq!(store.page_info(0, 3).unwrap().ref_count, 1);
    }

    #[test]
    fn test_resolve_rounds_to_head_and_tail() {
        let store = small_store(false);
        let a = group("a");
        for i in 0..7 {
            store.append(0, Bytes::from(format!("m{}", i))).unwrap();
        }
        store.add_reference(0, Position::start_of(0, 3), &a);

        // page 1 and 2 are gone: anything before rounds to the head
        assert_eq!(store.resolve(0, Position::new(0, 1, 1)), Position::new(0, 3, 0));
        // far future rounds to the tail
        assert_eq!(store.resolve(0, Position::new(0, 99, 0)), store.tail_position(0).unwrap());
        // past the written part of the open page clamps to the write offset
        assert_eq!(store.resolve(0, Position::new(0, 3, 2)), Position::new(0, 3, 1));
    }

    #[test]
    fn test_capacity_exceeded() {
        let store = store_with(TopicOptions {
            channel_count: Some(1),
            partition_count: Some(1),
            storage_capacity: Some(10),
            retain_consumed: Some(true),
            ..Default::default()
        });
        store.append(0, Bytes::from(vec![0u8; 6])).unwrap();
        store.append(0, Bytes::from(vec![0u8; 6])).unwrap();
        assert!(store.is_full());
        let err = store.append(0, Bytes::from_static(b"x")).unwrap_err();
        assert_eq!(err.label(), "capacity_exceeded");
    }

    #[test]
    fn test_timestamps_and_previous_positions() {
        let store = small_store(true);
        let p0 = store.append(0, Bytes::from_static(b"a")).unwrap();
        let p1 = store.append(0, Bytes::from_static(b"b")).unwrap();
        let (e1, _) = store.read(0, p1).unwrap();

        assert_eq!(store.find_by_timestamp(0, 0).unwrap(), p0);
        assert_eq!(store.find_by_timestamp(0, u64::MAX).unwrap(), store.tail_position(0).unwrap());
        assert!(store.find_by_timestamp(0, e1.timestamp).unwrap() <= p1);
        assert_eq!(store.previous_position(0, p1), p0);
        assert!(store.previous_position(0, p0).is_null());
        assert_eq!(store.count_from(0, p0), 2);
    }

    #[test]
    fn test_expired_elements_are_skipped_but_passed() {
        let store = store_with(TopicOptions {
            channel_count: Some(1),
            page_capacity: Some(3),
            calculator: Some(ElementCalculator::Count),
            element_expiry_ms: Some(40),
            ..Default::default()
        });
        let old = store.append(0, Bytes::from_static(b"old")).unwrap();
        store.append(0, Bytes::from_static(b"older")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(80));
        let fresh = store.append(0, Bytes::from_static(b"fresh")).unwrap();

        let (batch, next) = store.read_batch(0, old, 10);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].position, fresh);
        assert_eq!(next, store.tail_position(0).unwrap());

        let (element, _) = store.read(0, old).unwrap();
        assert_eq!(element.value, Bytes::from_static(b"fresh"));
        // still stored, only hidden from readers
        assert_eq!(store.count_from(0, old), 3);
    }

    #[test]
    fn test_waiters_are_drained_by_append() {
        let store = small_store(true);
        let notify = Arc::new(Notify::new());
        store.register_waiter(0, 7, &notify);
        store.register_waiter(0, 7, &notify);
        assert_eq!(store.waiter_count(0), 1);

        store.append(0, Bytes::from_static(b"a")).unwrap();
        assert_eq!(store.waiter_count(0), 0);

        store.register_waiter(0, 7, &notify);
        store.cancel_waiter(0, 7);
        assert_eq!(store.waiter_count(0), 0);
    }

    #[test]
    fn test_snapshot_restore_rebuilds_chains() {
        let store = small_store(true);
        for i in 0..8 {
            store.append(0, Bytes::from(format!("m{}", i))).unwrap();
        }
        let snapshot = store.snapshot_channels();
        let before: Vec<_> = store.page_numbers(0).iter().map(|&n| store.page_info(0, n).unwrap()).collect();

        store.mark_lost();
        assert!(store.page_numbers(0).is_empty());
        assert!(store.append(0, Bytes::from_static(b"lost")).is_err());

        store.restore(snapshot, &[]);
        let after: Vec<_> = store.page_numbers(0).iter().map(|&n| store.page_info(0, n).unwrap()).collect();
        assert_eq!(before, after);
        let next = store.append(0, Bytes::from_static(b"again")).unwrap();
        assert_eq!(next, Position::new(0, 3, 2));
    }

    #[test]
    fn test_restore_re_derives_reference_counts() {
        let store = small_store(false);
        let a = group("a");
        let b = group("b");
        store.add_reference(0, Position::start_of(0, FIRST_PAGE), &a);
        store.add_reference(0, Position::start_of(0, FIRST_PAGE), &b);
        for i in 0..8 {
            store.append(0, Bytes::from(format!("m{}", i))).unwrap();
        }
        store.release(0, 1, &b);
        let counts = |s: &PageStore| -> Vec<u32> {
            s.page_numbers(0).iter().map(|&n| s.page_info(0, n).unwrap().ref_count).collect()
        };
        assert_eq!(counts(&store), vec![1, 2, 2]);

        let snapshot = store.snapshot_channels();
        store.mark_lost();
        store.restore(snapshot, &[(a, Position::start_of(0, 1)), (b, Position::start_of(0, 2))]);
        assert_eq!(counts(&store), vec![1, 2, 2]);
        assert!(store.is_available());
    }
}
