//! Channel Router: picks the channel a publish goes to.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use bytes::Bytes;

use crate::brokers::topics::position::ChannelId;

/// Ordering policy of a publisher. Fixed for the publisher's lifetime.
#[derive(Clone, Default)]
pub enum OrderBy {
    /// Everything goes to one channel (modulo the channel count).
    Id(u32),
    /// CRC32 of the publish key, or of the payload when no key is given.
    Key,
    /// Application-supplied function of the payload.
    Value(Arc<dyn Fn(&Bytes) -> u64 + Send + Sync>),
    RoundRobin,
    /// Hash of the calling tokio task (of the thread outside a runtime), so
    /// one caller keeps one channel across `.await` points.
    #[default]
    Thread,
    /// No ordering: spread over channels for parallelism.
    None,
}

impl OrderBy {
    pub fn value<F>(f: F) -> Self
    where
        F: Fn(&Bytes) -> u64 + Send + Sync + 'static,
    {
        OrderBy::Value(Arc::new(f))
    }
}

impl fmt::Debug for OrderBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderBy::Id(id) => write!(f, "Id({})", id),
            OrderBy::Key => write!(f, "Key"),
            OrderBy::Value(_) => write!(f, "Value(..)"),
            OrderBy::RoundRobin => write!(f, "RoundRobin"),
            OrderBy::Thread => write!(f, "Thread"),
            OrderBy::None => write!(f, "None"),
        }
    }
}

pub struct ChannelRouter {
    order_by: OrderBy,
    channel_count: u32,
    counter: AtomicU64,
}

impl ChannelRouter {
    pub fn new(order_by: OrderBy, channel_count: u32) -> Self {
        Self {
            order_by,
            channel_count: channel_count.max(1),
            counter: AtomicU64::new(0),
        }
    }

    pub fn order_by(&self) -> &OrderBy {
        &self.order_by
    }

    pub fn route(&self, key: Option<&[u8]>, value: &Bytes) -> ChannelId {
        let raw = match &self.order_by {
            OrderBy::Id(id) => *id as u64,
            OrderBy::Key => crc32fast::hash(key.unwrap_or(value)) as u64,
            OrderBy::Value(f) => f(value),
            OrderBy::RoundRobin | OrderBy::None => self.counter.fetch_add(1, Ordering::Relaxed),
            OrderBy::Thread => {
                let mut hasher = DefaultHasher::new();
                match tokio::task::try_id() {
                    Some(task) => task.hash(&mut hasher),
                    None => std::thread::current().id().hash(&mut hasher),
                }
                hasher.finish()
            }
        };
        (raw % self.channel_count as u64) as ChannelId
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_id_wraps() {
        let router = ChannelRouter::new(OrderBy::Id(9), 4);
        let v = Bytes::from_static(b"x");
        assert_eq!(router.route(None, &v), 1);
        assert_eq!(router.route(Some(b"k"), &v), 1);
    }

    #[test]
    fn test_equal_keys_route_together() {
        let router = ChannelRouter::new(OrderBy::Key, 17);
        let a = router.route(Some(b"customer-42"), &Bytes::from_static(b"one"));
        let b = router.route(Some(b"customer-42"), &Bytes::from_static(b"two"));
        assert_eq!(a, b);

        // without a key the payload is the key
        let c = router.route(None, &Bytes::from_static(b"same"));
        let d = router.route(None, &Bytes::from_static(b"same"));
        assert_eq!(c, d);
    }

    #[test]
    fn test_round_robin_cycles() {
        let router = ChannelRouter::new(OrderBy::RoundRobin, 3);
        let v = Bytes::new();
        let seen: Vec<_> = (0..6).map(|_| router.route(None, &v)).collect();
        assert_eq!(seen, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_value_function_and_thread_are_stable() {
        let router = ChannelRouter::new(OrderBy::value(|v| v.len() as u64), 5);
        assert_eq!(router.route(None, &Bytes::from_static(b"1234567")), 2);

        let router = ChannelRouter::new(OrderBy::Thread, 5);
        let v = Bytes::new();
        let first = router.route(None, &v);
        assert!((0..10).all(|_| router.route(None, &v) == first));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_thread_policy_follows_the_task_across_awaits() {
        let router = Arc::new(ChannelRouter::new(OrderBy::Thread, 64));
        let task = {
            let router = router.clone();
            tokio::spawn(async move {
                let v = Bytes::new();
                let mut seen = std::collections::BTreeSet::new();
                for _ in 0..200 {
                    seen.insert(router.route(None, &v));
                    tokio::task::yield_now().await;
                }
                seen
            })
        };
        assert_eq!(task.await.unwrap().len(), 1);
    }
}
