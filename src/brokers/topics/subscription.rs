//! Durable subscriber groups.
//!
//! A `Subscription` holds, per channel, the last committed position and the
//! group head (where a newly assigned owner starts reading). Both sit behind
//! the channel's own lock, so commits and seeks on one channel are linearized
//! and never interleave with each other.
//!
//! The group is a page reader in its own right: it references every page
//! from its head onward, whether or not any member is attached.

use parking_lot::Mutex;
use tracing::debug;

use crate::brokers::topics::errors::{CommitResult, TopicError};
use crate::brokers::topics::page_store::PageStore;
use crate::brokers::topics::position::{ChannelId, Position, ReaderId};
use crate::brokers::topics::snapshot::{GroupChannelSnapshot, GroupSnapshot};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct GroupChannel {
    committed: Position,
    head: Position,
}

pub struct Subscription {
    name: String,
    reader: ReaderId,
    filter: Option<String>,
    converter: Option<String>,
    channels: Vec<Mutex<GroupChannel>>,
}

impl Subscription {
    /// New group positioned at the tail (or the head when the topic retains
    /// consumed elements), referencing pages from there on.
    pub fn create(
        name: &str,
        filter: Option<String>,
        converter: Option<String>,
        store: &PageStore,
        retain_consumed: bool,
    ) -> Self {
        let reader = ReaderId::Group(name.to_string());
        let channels = (0..store.channel_count())
            .map(|c| {
                let start = if retain_consumed { store.head_position(c) } else { store.tail_position(c) };
                let head = start.unwrap_or_else(|| Position::null(c));
                store.add_reference(c, head, &reader);
                Mutex::new(GroupChannel { committed: Position::null(c), head })
            })
            .collect();
        debug!(group = name, "Subscription created");
        Self { name: name.to_string(), reader, filter, converter, channels }
    }

    /// Rebuilds a group from a snapshot. Page references are re-derived by the
    /// store restore, not here.
    pub fn from_snapshot(snapshot: &GroupSnapshot) -> Self {
        Self {
            name: snapshot.name.clone(),
            reader: ReaderId::Group(snapshot.name.clone()),
            filter: snapshot.filter.clone(),
            converter: snapshot.converter.clone(),
            channels: snapshot
                .channels
                .iter()
                .map(|c| Mutex::new(GroupChannel { committed: c.committed, head: c.head }))
                .collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn reader(&self) -> &ReaderId {
        &self.reader
    }

    pub fn filter(&self) -> Option<&str> {
        self.filter.as_deref()
    }

    pub fn converter(&self) -> Option<&str> {
        self.converter.as_deref()
    }

    /// Joining with a different filter/converter is a configuration conflict.
    pub fn check_config(&self, filter: Option<&str>, converter: Option<&str>) -> Result<(), TopicError> {
        if self.filter() != filter || self.converter() != converter {
            return Err(TopicError::GroupConfigurationConflict { group: self.name.clone() });
        }
        Ok(())
    }

    pub fn committed(&self, channel: ChannelId) -> Position {
        self.channels
            .get(channel as usize)
            .map(|c| c.lock().committed)
            .unwrap_or_else(|| Position::null(channel))
    }

    pub fn head(&self, channel: ChannelId) -> Position {
        self.channels
            .get(channel as usize)
            .map(|c| c.lock().head)
            .unwrap_or_else(|| Position::null(channel))
    }

    /// Advances the committed position. `delivered` is the furthest position
    /// the committing member has been handed on this channel.
    pub fn commit(
        &self,
        store: &PageStore,
        channel: ChannelId,
        position: Position,
        delivered: Position,
    ) -> CommitResult {
        let slot = match self.channels.get(channel as usize) {
            Some(slot) => slot,
            None => return CommitResult::Rejected(TopicError::InvalidPosition { channel, position }),
        };
        let mut state = slot.lock();
        if position <= state.committed {
            return CommitResult::AlreadyCommitted(state.committed);
        }
        if position > delivered {
            return CommitResult::Rejected(TopicError::InvalidPosition { channel, position });
        }

        state.committed = position;
        state.head = store.resolve(channel, position.next_offset());
        store.release_before(channel, state.head, &self.reader);
        debug!(group = %self.name, channel, position = %position, "Committed");
        CommitResult::Committed(position)
    }

    /// Rewrites committed and head (possibly backwards) and moves the group's
    /// page references to match.
    pub fn seek(&self, store: &PageStore, channel: ChannelId, committed: Position, head: Position) {
        if let Some(slot) = self.channels.get(channel as usize) {
            let mut state = slot.lock();
            state.committed = committed;
            state.head = head;
            store.add_reference(channel, head, &self.reader);
        }
    }

    /// Elements at or after the group head, over all channels.
    pub fn remaining(&self, store: &PageStore) -> u64 {
        (0..self.channels.len() as ChannelId)
            .map(|c| store.count_from(c, self.head(c)))
            .sum()
    }

    pub fn heads(&self) -> Vec<(ReaderId, Position)> {
        self.channels
            .iter()
            .map(|c| (self.reader.clone(), c.lock().head))
            .collect()
    }

    pub fn snapshot(&self) -> GroupSnapshot {
        GroupSnapshot {
            name: self.name.clone(),
            filter: self.filter.clone(),
            converter: self.converter.clone(),
            channels: self
                .channels
                .iter()
                .map(|c| {
                    let state = c.lock();
                    GroupChannelSnapshot { committed: state.committed, head: state.head }
                })
                .collect(),
        }
    }

    /// Drops every page reference of the group.
    pub fn destroy(&self, store: &PageStore) {
        store.detach_all(&self.reader);
    }
}
