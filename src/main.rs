use std::time::{Duration, Instant};
use bytes::Bytes;
use futures_util::future::join_all;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use nexo_topics::brokers::topics::{CommitResult, OrderBy, PublisherOptions, SubscriberOptions, TopicError, TopicOptions};
use nexo_topics::config::Config;
use nexo_topics::NexoEngine;

const DEMO_TOPIC: &str = "demo";
const DEMO_MESSAGES: usize = 10_000;

#[tokio::main]
async fn main() {
    let config = Config::global();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&config.log.log_level))
        .init();

    let engine = match NexoEngine::with_persistence(config) {
        Ok(engine) => engine,
        Err(e) => {
            error!("Persistence unavailable ({}), running in memory", e);
            NexoEngine::new(config)
        }
    };
    info!("Nexo topics engine started, {} topic(s) restored", engine.topics.names().len());

    if let Err(e) = run_demo(&engine).await {
        error!("Demo failed: {}", e);
    }
    if let Err(e) = engine.topics.persist_all() {
        error!("Persist failed: {}", e);
    }
    info!("Uptime {:?}", engine.start_time.elapsed());
}

async fn run_demo(engine: &NexoEngine) -> Result<(), TopicError> {
    let topic = engine.topics.create_topic(DEMO_TOPIC, TopicOptions::default())?;
    let subscriber = topic.create_subscriber(SubscriberOptions::in_group("demo-readers"))?;
    let publisher = topic.create_publisher(PublisherOptions::ordered_by(OrderBy::RoundRobin))?;

    let start = Instant::now();
    let sends = (0..DEMO_MESSAGES).map(|i| publisher.publish(Bytes::from(format!("message-{}", i))));
    for result in join_all(sends).await {
        result?;
    }
    publisher.flush().await?;
    let elapsed = start.elapsed();
    info!(
        "Published {} messages in {:?} ({:.0} msg/s)",
        publisher.published(),
        elapsed,
        DEMO_MESSAGES as f64 / elapsed.as_secs_f64()
    );

    let start = Instant::now();
    let mut received = 0;
    while received < DEMO_MESSAGES {
        match tokio::time::timeout(Duration::from_secs(5), subscriber.receive_batch(256)).await {
            Ok(batch) => {
                let batch = batch?;
                for (channel, result) in subscriber.commit_batch(&batch) {
                    if let CommitResult::Rejected(e) = result {
                        warn!(channel, error = %e, "Commit rejected");
                    }
                }
                received += batch.len();
            }
            Err(_) => break,
        }
    }
    let elapsed = start.elapsed();
    info!(
        "Received {} messages in {:?} ({:.0} msg/s), {} left for the group",
        received,
        elapsed,
        received as f64 / elapsed.as_secs_f64(),
        topic.remaining_messages("demo-readers").unwrap_or(0)
    );

    publisher.close().await?;
    subscriber.close();
    Ok(())
}
