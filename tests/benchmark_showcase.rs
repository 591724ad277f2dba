use nexo_topics::brokers::topics::{OrderBy, PublisherOptions, SubscriberOptions, TopicOptions};
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
mod helpers;
use helpers::*;

// --- BENCHMARKS ---

#[tokio::test]
async fn bench_01_topic_publish() {
    let count = 100_000;
    let manager = setup_manager();
    let topic = manager
        .create_topic("bench_publish", TopicOptions { channel_count: Some(8), ..Default::default() })
        .unwrap();
    let publisher = topic.create_publisher(PublisherOptions::ordered_by(OrderBy::RoundRobin)).unwrap();

    let mut bench = Benchmark::start("TOPIC: 100k PUBLISH operations (8 channels, no readers)", count);
    let payload = Bytes::from("event_topic_data");

    for _ in 0..count {
        let start = Instant::now();
        publisher.publish(payload.clone()).await.unwrap();
        bench.record(start.elapsed());
    }
    bench.stop();
    assert_eq!(publisher.published(), count as u64);
}

#[tokio::test]
async fn bench_02_topic_receive_commit() {
    let count = 100_000;
    let manager = setup_manager();
    let topic = manager
        .create_topic("bench_receive", TopicOptions { channel_count: Some(8), ..Default::default() })
        .unwrap();
    topic.ensure_subscriber_group("bench").unwrap();

    let publisher = topic.create_publisher(PublisherOptions::ordered_by(OrderBy::RoundRobin)).unwrap();
    let payload = Bytes::from("event_topic_data");
    for _ in 0..count {
        publisher.publish(payload.clone()).await.unwrap();
    }

    let subscriber = topic
        .create_subscriber(SubscriberOptions::in_group("bench").complete_on_empty())
        .unwrap();
    let mut bench = Benchmark::start("TOPIC: 100k RECEIVE + COMMIT (1 group member)", count);

    let mut received = 0;
    loop {
        let start = Instant::now();
        match subscriber.receive().await.unwrap() {
            Some(element) => {
                subscriber.commit_element(&element);
                bench.record(start.elapsed());
                received += 1;
            }
            None => break,
        }
    }
    bench.stop();
    assert_eq!(received, count);
    assert_eq!(topic.remaining_messages("bench"), Some(0));
}

#[tokio::test]
async fn bench_03_group_drain_concurrent() {
    let msg_count = 50_000;
    let member_count = 4;
    let manager = setup_manager();
    let topic = manager
        .create_topic("bench_drain", TopicOptions { channel_count: Some(8), ..Default::default() })
        .unwrap();
    topic.ensure_subscriber_group("drain").unwrap();

    let received_count = Arc::new(AtomicUsize::new(0));
    let mut members = Vec::new();
    for _ in 0..member_count {
        let subscriber = topic.create_subscriber(SubscriberOptions::in_group("drain")).unwrap();
        let received_count = received_count.clone();
        members.push(tokio::spawn(async move {
            while let Ok(Some(element)) = subscriber.receive().await {
                subscriber.commit_element(&element);
                received_count.fetch_add(1, Ordering::Relaxed);
            }
        }));
    }

    let publisher = topic.create_publisher(PublisherOptions::ordered_by(OrderBy::RoundRobin)).unwrap();
    let payload = Bytes::from("drain_payload");

    let start_time = Instant::now();
    for _ in 0..msg_count {
        publisher.publish(payload.clone()).await.unwrap();
    }
    let publish_time = start_time.elapsed();

    while received_count.load(Ordering::Relaxed) < msg_count {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if start_time.elapsed() > Duration::from_secs(60) {
            println!("⚠️  TIMEOUT waiting for drain. Received: {}/{}", received_count.load(Ordering::Relaxed), msg_count);
            break;
        }
    }
    let total_duration = start_time.elapsed();

    println!("\n📊 TOPIC: Group drain ({} members, {} msgs)", member_count, msg_count);
    println!("   Ingestion:   {:.0} msg/sec (Publish)", msg_count as f64 / publish_time.as_secs_f64());
    println!("   Drain:       {:.0} msg/sec (Receive + Commit)", msg_count as f64 / total_duration.as_secs_f64());
    println!("   Total Time:  {:.2?}", total_duration);

    assert_eq!(received_count.load(Ordering::Relaxed), msg_count);
    manager.destroy_topic("bench_drain").unwrap();
    for member in members {
        member.await.unwrap();
    }
}
