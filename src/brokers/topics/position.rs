//! Positions: stable locators for elements inside a channel.
//!
//! A position is `(channel, page, offset)`. Within a channel positions are
//! totally ordered by page number, then offset. Page numbers start at 1, so
//! `NULL_PAGE` (0) doubles as the "nothing consumed yet" marker and as the
//! chain sentinel for missing neighbours.

use std::fmt;
use serde::{Deserialize, Serialize};

pub type ChannelId = u32;
pub type PageNumber = u64;

/// Sentinel page number: "no page".
pub const NULL_PAGE: PageNumber = 0;

/// First page number allocated in every channel.
pub const FIRST_PAGE: PageNumber = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
    pub channel: ChannelId,
    pub page: PageNumber,
    pub offset: u32,
}

impl Position {
    pub fn new(channel: ChannelId, page: PageNumber, offset: u32) -> Self {
        Self { channel, page, offset }
    }

    /// The null position of a channel. Sorts before every real position.
    pub fn null(channel: ChannelId) -> Self {
        Self { channel, page: NULL_PAGE, offset: 0 }
    }

    pub fn is_null(&self) -> bool {
        self.page == NULL_PAGE
    }

    /// Position of the next offset in the same page. The store resolves it
    /// onto the following page when this page is sealed and exhausted.
    pub fn next_offset(&self) -> Self {
        Self { channel: self.channel, page: self.page, offset: self.offset + 1 }
    }

    /// First position of the given page in this channel.
    pub fn start_of(channel: ChannelId, page: PageNumber) -> Self {
        Self { channel, page, offset: 0 }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "{}:null", self.channel)
        } else {
            write!(f, "{}:{}:{}", self.channel, self.page, self.offset)
        }
    }
}

// ==========================================
// READERS
// ==========================================

/// Identity of something that holds page references.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReaderId {
    /// A durable subscriber group, keyed by name.
    Group(String),
    /// An attached anonymous subscriber.
    Anonymous(uuid::Uuid),
}

impl fmt::Display for ReaderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReaderId::Group(name) => write!(f, "group:{}", name),
            ReaderId::Anonymous(id) => write!(f, "anon:{}", id),
        }
    }
}
