//! Topic errors and the typed results returned by commit and seek.

use thiserror::Error;

use crate::brokers::topics::position::{ChannelId, Position};

#[derive(Error, Debug)]
pub enum TopicError {
    /// Storage capacity of the topic is exhausted (fail-on-full publishers only).
    #[error("topic '{topic}' is full (capacity {capacity} bytes)")]
    CapacityExceeded { topic: String, capacity: u64 },

    /// Commit or seek on a channel the caller does not own.
    #[error("channel {channel} is not owned by this subscriber")]
    OwnershipRejected { channel: ChannelId },

    /// Position cannot be resolved for the channel.
    #[error("invalid position {position} for channel {channel}")]
    InvalidPosition { channel: ChannelId, position: Position },

    /// Operation on a closed publisher/subscriber or a destroyed topic.
    #[error("{0} is not active")]
    NotActive(String),

    /// Attempt to change an existing durable group's filter or converter.
    #[error("subscriber group '{group}' already exists with a different filter or converter")]
    GroupConfigurationConflict { group: String },

    /// A pending receive was cancelled because its subscriber closed.
    #[error("receive cancelled")]
    Cancelled,

    #[error("topic '{0}' not found")]
    TopicNotFound(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TopicError {
    /// Short stable label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            TopicError::CapacityExceeded { .. } => "capacity_exceeded",
            TopicError::OwnershipRejected { .. } => "ownership_rejected",
            TopicError::InvalidPosition { .. } => "invalid_position",
            TopicError::NotActive(_) => "not_active",
            TopicError::GroupConfigurationConflict { .. } => "group_configuration_conflict",
            TopicError::Cancelled => "cancelled",
            TopicError::TopicNotFound(_) => "topic_not_found",
            TopicError::InvalidConfig(_) => "invalid_config",
            TopicError::Io(_) => "io",
            TopicError::Serialization(_) => "serialization",
        }
    }
}

// ==========================================
// TYPED RESULTS
// ==========================================

#[derive(Debug)]
pub enum CommitResult {
    /// The committed position moved forward to the given position.
    Committed(Position),
    /// The position was at or before the current commit; nothing changed.
    AlreadyCommitted(Position),
    Rejected(TopicError),
}

impl CommitResult {
    pub fn is_success(&self) -> bool {
        matches!(self, CommitResult::Committed(_) | CommitResult::AlreadyCommitted(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, CommitResult::Rejected(_))
    }
}

#[derive(Debug)]
pub enum SeekResult {
    /// `committed` is the position the channel now sits on; `head` is where
    /// the next receive on the channel starts reading.
    Seeked { committed: Position, head: Position },
    Rejected(TopicError),
}

impl SeekResult {
    pub fn is_success(&self) -> bool {
        matches!(self, SeekResult::Seeked { .. })
    }

    pub fn head(&self) -> Option<Position> {
        match self {
            SeekResult::Seeked { head, .. } => Some(*head),
            SeekResult::Rejected(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_and_messages() {
        let err = TopicError::OwnershipRejected { channel: 3 };
        assert_eq!(err.label(), "ownership_rejected");
        assert_eq!(err.to_string(), "channel 3 is not owned by this subscriber");

        let err = TopicError::CapacityExceeded { topic: "orders".into(), capacity: 10 };
        assert_eq!(err.label(), "capacity_exceeded");
    }

    #[test]
    fn test_commit_result_predicates() {
        assert!(CommitResult::Committed(Position::new(0, 1, 0)).is_success());
        assert!(CommitResult::AlreadyCommitted(Position::new(0, 1, 0)).is_success());
        let rejected = CommitResult::Rejected(TopicError::OwnershipRejected { channel: 0 });
        assert!(rejected.is_rejected());
        assert!(!rejected.is_success());
    }
}
