pub mod errors;
pub mod flow_control;
pub mod options;
pub mod ownership;
pub mod page;
pub mod page_store;
pub mod position;
pub mod publisher;
pub mod router;
pub mod snapshot;
pub mod subscriber;
pub mod subscription;
pub mod topic;
pub mod topic_manager;

pub use errors::{CommitResult, SeekResult, TopicError};
pub use options::{ElementCalculator, TopicConfig, TopicOptions};
pub use ownership::OwnershipEvent;
pub use page::Element;
pub use position::{ChannelId, Position};
pub use publisher::{PublishStatus, Publisher, PublisherOptions};
pub use router::OrderBy;
pub use snapshot::{Durability, FileDurability, TopicSnapshot};
pub use subscriber::{ElementConverter, ElementFilter, Subscriber, SubscriberOptions, SubscriberState};
pub use topic::Topic;
pub use topic_manager::TopicManager;
