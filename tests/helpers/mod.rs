use std::sync::Arc;
use std::time::{Duration, Instant};
use nexo_topics::brokers::topics::{
    ElementCalculator, Element, FileDurability, Subscriber, Topic, TopicManager, TopicOptions,
};
use nexo_topics::config::SystemTopicConfig;
use tempfile::TempDir;

pub const RECEIVE_TIMEOUT: Duration = Duration::from_secs(3);

pub fn setup_manager() -> TopicManager {
    TopicManager::new(SystemTopicConfig::default())
}

pub fn setup_durable_manager(dir: &TempDir) -> TopicManager {
    let durability = Arc::new(FileDurability::new(dir.path()).unwrap());
    TopicManager::with_durability(SystemTopicConfig::default(), durability)
}

/// Small pages (4 elements), fast reconnects: page boundaries show up quickly.
pub fn small_options(channels: u32) -> TopicOptions {
    TopicOptions {
        channel_count: Some(channels),
        partition_count: Some(3),
        page_capacity: Some(4),
        calculator: Some(ElementCalculator::Count),
        reconnect_wait_ms: Some(20),
        subscriber_timeout_ms: Some(5_000),
        ..Default::default()
    }
}

pub fn small_topic(manager: &TopicManager, name: &str, channels: u32) -> Topic {
    manager.create_topic(name, small_options(channels)).unwrap()
}

pub async fn recv(subscriber: &Subscriber) -> Element {
    tokio::time::timeout(RECEIVE_TIMEOUT, subscriber.receive())
        .await
        .expect("receive timed out")
        .expect("receive failed")
        .expect("receive completed empty")
}

/// Asserts that nothing arrives within `wait`.
pub async fn assert_pending(subscriber: &Subscriber, wait: Duration) {
    let result = tokio::time::timeout(wait, subscriber.receive()).await;
    assert!(result.is_err(), "expected receive to stay pending, got {:?}", result);
}

pub fn text(element: &Element) -> String {
    String::from_utf8_lossy(&element.value).to_string()
}

pub struct Benchmark {
    pub name: String,
    pub start: Instant,
    pub count: usize,
    pub samples: Vec<Duration>,
}

impl Benchmark {
    pub fn start(name: &str, count: usize) -> Self {
        Self {
            name: name.to_string(),
            start: Instant::now(),
            count,
            samples: Vec::with_capacity(count),
        }
    }

    pub fn record(&mut self, duration: Duration) {
        self.samples.push(duration);
    }

    pub fn stop(mut self) {
        let total_duration = self.start.elapsed();
        let secs = total_duration.as_secs_f64();
        let ops_sec = self.count as f64 / secs;

        self.samples.sort();
        let len = self.samples.len();

        let p50 = self.samples.get(len * 50 / 100).unwrap_or(&Duration::ZERO).as_micros();
        let p95 = self.samples.get(len * 95 / 100).unwrap_or(&Duration::ZERO).as_micros();
        let p99 = self.samples.get(len * 99 / 100).unwrap_or(&Duration::ZERO).as_micros();
        let max = self.samples.last().unwrap_or(&Duration::ZERO).as_micros();

        println!("\n{}", self.name);
        println!(" 🚀 Throughput:  {:.0} ops/sec", ops_sec);
        println!(" ⏱️  Total Time:  {:.2?}", total_duration);
        println!(" 📊 Latency (µs): p50: {} | p95: {} | p99: {} | MAX: {}",
            p50, p95, p99, max);
        println!(" 📦 Count:       {}\n", self.count);
    }
}
