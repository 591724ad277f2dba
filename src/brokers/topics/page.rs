//! Pages: bounded, append-only chunks of one channel's log.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::brokers::topics::position::{ChannelId, PageNumber, Position, NULL_PAGE};
use crate::utils::utils_time::millis_to_datetime;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredElement {
    pub timestamp: u64,
    pub value: Bytes,
}

/// An element as handed to readers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Element {
    pub position: Position,
    /// Publish time in unix millis.
    pub timestamp: u64,
    pub value: Bytes,
}

impl Element {
    pub fn channel(&self) -> ChannelId {
        self.position.channel
    }

    pub fn published_at(&self) -> DateTime<Utc> {
        millis_to_datetime(self.timestamp)
    }
}

pub struct Page {
    pub channel: ChannelId,
    pub number: PageNumber,
    pub partition: u32,
    /// Readers that have not advanced past this page.
    pub ref_count: u32,
    pub sealed: bool,
    /// Previous page of this channel in the same partition.
    pub prev: PageNumber,
    /// Next page of this channel in the same partition.
    pub next: PageNumber,
    /// Sum of element costs, in calculator units.
    pub units: u64,
    /// Sum of payload sizes, counted against storage capacity.
    pub bytes: u64,
    pub elements: Vec<StoredElement>,
}

impl Page {
    pub fn new(channel: ChannelId, number: PageNumber, partition: u32) -> Self {
        Self {
            channel,
            number,
            partition,
            ref_count: 0,
            sealed: false,
            prev: NULL_PAGE,
            next: NULL_PAGE,
            units: 0,
            bytes: 0,
            elements: Vec::new(),
        }
    }

    /// Offset of the last written element.
    pub fn tail(&self) -> Option<u32> {
        if self.elements.is_empty() {
            None
        } else {
            Some(self.elements.len() as u32 - 1)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Offset the next append would land on.
    pub fn write_offset(&self) -> u32 {
        self.elements.len() as u32
    }

    pub fn push(&mut self, element: StoredElement, units: u64) -> u32 {
        let offset = self.write_offset();
        self.bytes += element.value.len() as u64;
        self.units += units;
        self.elements.push(element);
        offset
    }

    pub fn element(&self, offset: u32) -> Option<&StoredElement> {
        self.elements.get(offset as usize)
    }

    pub fn info(&self) -> PageInfo {
        PageInfo {
            channel: self.channel,
            number: self.number,
            partition: self.partition,
            ref_count: self.ref_count,
            sealed: self.sealed,
            prev: self.prev,
            next: self.next,
            tail: self.tail(),
            units: self.units,
            bytes: self.bytes,
        }
    }
}

/// Read-only view of a page's bookkeeping.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageInfo {
    pub channel: ChannelId,
    pub number: PageNumber,
    pub partition: u32,
    pub ref_count: u32,
    pub sealed: bool,
    pub prev: PageNumber,
    pub next: PageNumber,
    pub tail: Option<u32>,
    pub units: u64,
    pub bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_tracks_tail_and_sizes() {
        let mut page = Page::new(0, 1, 0);
        assert_eq!(page.tail(), None);

        let off = page.push(StoredElement { timestamp: 1, value: Bytes::from_static(b"abc") }, 3);
        assert_eq!(off, 0);
        let off = page.push(StoredElement { timestamp: 2, value: Bytes::from_static(b"de") }, 2);
        assert_eq!(off, 1);

        assert_eq!(page.tail(), Some(1));
        assert_eq!(page.units, 5);
        assert_eq!(page.bytes, 5);
        assert_eq!(page.element(1).map(|e| e.timestamp), Some(2));
        assert!(page.element(2).is_none());
    }
}
