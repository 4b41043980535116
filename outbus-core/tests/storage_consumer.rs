use anyhow::Result as AnyResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use outbus_core::backoff::BackoffConfig;
use outbus_core::broker::{Consumer, ConsumerFactory, ConsumptionType, Subscription};
use outbus_core::consumer::{StorageConsumer, StorageConsumerConfig, StorageConsumerFactory};
use outbus_core::error::{MessagingError, MessagingResult};
use outbus_core::inmemory::InMemoryOutboxStorage;
use outbus_core::message::{ConsumerMessage, Message};
use outbus_core::queue::QueueStrategy;
use outbus_core::storage::{AdvisoryLock, BatchQuery, OutboxStorage};
use outbus_core::topic::Topic;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

fn msg(id: &str) -> Message {
    Message::builder().id(id).topic("orders").build()
}

fn config(strategy: QueueStrategy) -> StorageConsumerConfig {
    StorageConsumerConfig {
        topics: vec!["orders".into()],
        batch_size: 10,
        concurrency: 3,
        poll_interval: None,
        strategy,
        backoff: BackoffConfig {
            initial_interval: Duration::from_millis(5),
            max_interval: Duration::from_millis(20),
            multiplier: 2.0,
        },
        ..Default::default()
    }
}

async fn next(stream: &mut BoxStream<'static, ConsumerMessage>) -> ConsumerMessage {
    tokio::time::timeout(Duration::from_secs(3), stream.next())
        .await
        .expect("no delivery in time")
        .expect("stream ended")
}

async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(3), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn started(
    storage: &Arc<InMemoryOutboxStorage>,
    config: StorageConsumerConfig,
) -> AnyResult<(Arc<StorageConsumer>, BoxStream<'static, ConsumerMessage>)> {
    let consumer = Arc::new(StorageConsumer::new("orders-worker", storage.clone(), config)?);
    let stream = consumer.messages().await?;
    consumer.start()?;
    Ok((consumer, stream))
}

#[tokio::test(flavor = "multi_thread")]
async fn acking_one_row_deletes_only_that_row() -> AnyResult<()> {
    let storage = Arc::new(InMemoryOutboxStorage::new());
    storage.store(&[msg("1"), msg("2"), msg("3")], Utc::now()).await?;
    let (consumer, mut stream) = started(&storage, config(QueueStrategy::AckNack)).await?;

    let first = next(&mut stream).await;
    let second = next(&mut stream).await;
    let third = next(&mut stream).await;
    assert_eq!(
        [first.id(), second.id(), third.id()],
        ["1", "2", "3"]
    );
    assert!(second.deadline().is_some());

    consumer.ack(&second).await?;
    assert!(!storage.contains("2"));
    assert!(storage.contains("1"));
    assert!(storage.contains("3"));
    assert_eq!(consumer.in_flight(), 2);

    consumer.ack(&first).await?;
    consumer.ack(&third).await?;
    assert!(storage.is_empty());

    consumer.close().await?;
    assert!(stream.next().await.is_none());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn commit_offset_deletes_contiguous_prefix_only() -> AnyResult<()> {
    let storage = Arc::new(InMemoryOutboxStorage::new());
    storage.store(&[msg("1"), msg("2"), msg("3")], Utc::now()).await?;
    let (consumer, mut stream) = started(&storage, config(QueueStrategy::CommitOffset)).await?;

    let first = next(&mut stream).await;
    let second = next(&mut stream).await;
    let third = next(&mut stream).await;

    consumer.ack(&second).await?;
    assert_eq!(storage.len(), 3);

    consumer.ack(&first).await?;
    assert_eq!(storage.messages(), vec![msg("3")]);

    assert!(matches!(
        consumer.nack(&third).await,
        Err(MessagingError::NackNotSupported { .. })
    ));
    consumer.ack(&third).await?;
    assert!(storage.is_empty());

    consumer.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn timed_out_delivery_is_redelivered() -> AnyResult<()> {
    let storage = Arc::new(InMemoryOutboxStorage::new());
    storage.store(&[msg("1")], Utc::now()).await?;
    let (consumer, mut stream) = started(
        &storage,
        StorageConsumerConfig {
            message_timeout: Duration::from_millis(200),
            ..config(QueueStrategy::AckNack)
        },
    )
    .await?;

    let stuck = next(&mut stream).await;
    assert!(!stuck.is_abandoned());

    let retry = next(&mut stream).await;
    assert_eq!(retry.id(), stuck.id());
    assert!(stuck.is_abandoned());
    assert!(storage.contains("1"));

    // 迟到的确认属于已放弃的投递，不能结算新的投递
    assert!(matches!(
        consumer.ack(&stuck).await,
        Err(MessagingError::Abandoned { .. })
    ));
    assert!(matches!(
        consumer.nack(&stuck).await,
        Err(MessagingError::Abandoned { .. })
    ));
    assert!(storage.contains("1"));
    assert_eq!(consumer.in_flight(), 1);

    consumer.ack(&retry).await?;
    assert!(storage.is_empty());

    consumer.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn nack_leaves_row_for_redelivery() -> AnyResult<()> {
    let storage = Arc::new(InMemoryOutboxStorage::new());
    storage.store(&[msg("1")], Utc::now()).await?;
    let (consumer, mut stream) = started(&storage, config(QueueStrategy::AckNack)).await?;

    let first = next(&mut stream).await;
    consumer.nack(&first).await?;
    assert!(storage.contains("1"));
    assert_eq!(consumer.in_flight(), 0);

    consumer.trigger();
    let again = next(&mut stream).await;
    assert_eq!(again.id(), "1");
    consumer.ack(&again).await?;
    assert!(storage.is_empty());

    consumer.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn trigger_picks_up_new_rows() -> AnyResult<()> {
    let storage = Arc::new(InMemoryOutboxStorage::new());
    let (consumer, mut stream) = started(&storage, config(QueueStrategy::AckOnly)).await?;

    storage.store(&[msg("late")], Utc::now()).await?;
    consumer.trigger();

    let delivery = next(&mut stream).await;
    assert_eq!(delivery.id(), "late");
    assert!(consumer.nack(&delivery).await.is_err());
    consumer.ack(&delivery).await?;
    eventually(|| storage.is_empty()).await;

    consumer.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn bounded_concurrency_holds_back_extra_rows() -> AnyResult<()> {
    let storage = Arc::new(InMemoryOutboxStorage::new());
    storage.store(&[msg("1"), msg("2"), msg("3")], Utc::now()).await?;
    let (consumer, mut stream) = started(
        &storage,
        StorageConsumerConfig {
            concurrency: 2,
            ..config(QueueStrategy::AckNack)
        },
    )
    .await?;

    let first = next(&mut stream).await;
    let _second = next(&mut stream).await;
    assert!(
        tokio::time::timeout(Duration::from_millis(100), stream.next())
            .await
            .is_err()
    );

    consumer.ack(&first).await?;
    let third = next(&mut stream).await;
    assert_eq!(third.id(), "3");

    consumer.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn stream_is_taken_once_and_lifecycle_is_checked() -> AnyResult<()> {
    let storage = Arc::new(InMemoryOutboxStorage::new());
    let (consumer, _stream) = started(&storage, config(QueueStrategy::AckNack)).await?;

    assert!(matches!(
        consumer.messages().await,
        Err(MessagingError::AlreadySubscribed { .. })
    ));
    assert!(matches!(
        consumer.start(),
        Err(MessagingError::AlreadyRunning { .. })
    ));

    consumer.stop().await?;
    assert!(matches!(consumer.start(), Err(MessagingError::Closed { .. })));

    let invalid = StorageConsumer::new(
        "bad",
        storage.clone(),
        StorageConsumerConfig {
            message_timeout: Duration::ZERO,
            ..Default::default()
        },
    );
    assert!(matches!(invalid, Err(MessagingError::InvalidConfig { .. })));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn factory_builds_started_consumers_per_subscription() -> AnyResult<()> {
    let storage = Arc::new(InMemoryOutboxStorage::new());
    let factory = StorageConsumerFactory::new(
        storage.clone(),
        StorageConsumerConfig {
            poll_interval: Some(Duration::from_millis(20)),
            ..config(QueueStrategy::AckNack)
        },
    );

    let subscription = Subscription::new("billing", Topic::from("orders"), ConsumptionType::Shared);
    let consumer = factory.subscribe(&subscription).await?;
    assert_eq!(consumer.name(), "billing@orders");

    let mut stream = consumer.messages().await?;
    let other = Message::builder().id("x").topic("other").build();
    storage.store(&[msg("1"), other], Utc::now()).await?;

    let delivery = next(&mut stream).await;
    assert_eq!(delivery.id(), "1");
    consumer.ack(&delivery).await?;
    assert!(!storage.contains("1"));
    assert!(storage.contains("x"));

    consumer.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn nacked_row_waits_for_the_next_scan() -> AnyResult<()> {
    let storage = Arc::new(InMemoryOutboxStorage::new());
    storage.store(&[msg("poison")], Utc::now()).await?;
    let (consumer, mut stream) = started(
        &storage,
        StorageConsumerConfig {
            poll_interval: Some(Duration::from_millis(200)),
            ..config(QueueStrategy::AckNack)
        },
    )
    .await?;

    // 每次都否认：重投只随周期扫描发生
    let window = Instant::now() + Duration::from_millis(300);
    let mut deliveries = 0;
    while let Ok(Some(delivery)) = tokio::time::timeout_at(window, stream.next()).await {
        deliveries += 1;
        consumer.nack(&delivery).await?;
    }
    assert!((1..=3).contains(&deliveries), "deliveries: {deliveries}");

    consumer.trigger();
    let delivery = next(&mut stream).await;
    consumer.ack(&delivery).await?;
    assert!(storage.is_empty());

    consumer.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn commit_offset_timeout_rewinds_uncommitted_tail() -> AnyResult<()> {
    let storage = Arc::new(InMemoryOutboxStorage::new());
    storage.store(&[msg("1"), msg("2"), msg("3")], Utc::now()).await?;
    let (consumer, mut stream) = started(
        &storage,
        StorageConsumerConfig {
            message_timeout: Duration::from_millis(200),
            ..config(QueueStrategy::CommitOffset)
        },
    )
    .await?;

    let first = next(&mut stream).await;
    let second = next(&mut stream).await;
    let third = next(&mut stream).await;

    consumer.ack(&first).await?;
    consumer.ack(&third).await?;
    assert!(!storage.contains("1"));
    assert!(storage.contains("3"));

    // "2" 超时：它以及其后已处理但未提交的 "3" 一并重投
    let second_again = next(&mut stream).await;
    let third_again = next(&mut stream).await;
    assert_eq!([second_again.id(), third_again.id()], ["2", "3"]);
    assert!(second.is_abandoned());
    assert!(third.is_abandoned());

    let stored: Vec<String> = storage.messages().iter().map(|m| m.id().to_string()).collect();
    assert_eq!(stored, vec!["2", "3"]);

    consumer.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn ordered_scan_holds_lock_until_batch_commits() -> AnyResult<()> {
    let storage = Arc::new(InMemoryOutboxStorage::new());
    storage.store(&[msg("1")], Utc::now()).await?;
    let (consumer, mut stream) = started(&storage, config(QueueStrategy::CommitOffset)).await?;
    let keys = vec!["consumer".to_string(), "orders".to_string()];

    let first = next(&mut stream).await;
    assert!(
        tokio::time::timeout(Duration::from_millis(100), storage.lock(&keys))
            .await
            .is_err()
    );

    // 本轮未提交前，新写入的行不会被投递
    storage.store(&[msg("2")], Utc::now()).await?;
    consumer.trigger();
    assert!(
        tokio::time::timeout(Duration::from_millis(100), stream.next())
            .await
            .is_err()
    );

    consumer.ack(&first).await?;
    let second = next(&mut stream).await;
    assert_eq!(second.id(), "2");
    consumer.ack(&second).await?;
    assert!(storage.is_empty());

    let lock = tokio::time::timeout(Duration::from_secs(1), storage.lock(&keys)).await??;
    lock.release().await?;

    consumer.close().await?;
    Ok(())
}

/// 删除失败前先挂起 `delay`；失败次数用尽后直接委托
struct StallingDelete {
    inner: Arc<InMemoryOutboxStorage>,
    delay: Duration,
    failures: AtomicUsize,
}

#[async_trait]
impl OutboxStorage for StallingDelete {
    async fn lock(&self, keys: &[String]) -> MessagingResult<Box<dyn AdvisoryLock>> {
        self.inner.lock(keys).await
    }

    async fn get_batch(&self, query: &BatchQuery) -> MessagingResult<Vec<Message>> {
        self.inner.get_batch(query).await
    }

    async fn store(&self, messages: &[Message], scheduled_at: DateTime<Utc>) -> MessagingResult<()> {
        self.inner.store(messages, scheduled_at).await
    }

    async fn delete(&self, ids: &[String]) -> MessagingResult<()> {
        let fail = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            tokio::time::sleep(self.delay).await;
            return Err(MessagingError::storage("delete timed out"));
        }
        self.inner.delete(ids).await
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_ack_past_deadline_is_redelivered() -> AnyResult<()> {
    let rows = Arc::new(InMemoryOutboxStorage::new());
    rows.store(&[msg("1")], Utc::now()).await?;
    let storage = Arc::new(StallingDelete {
        inner: rows.clone(),
        delay: Duration::from_millis(300),
        failures: AtomicUsize::new(1),
    });
    let consumer = Arc::new(StorageConsumer::new(
        "orders-worker",
        storage,
        StorageConsumerConfig {
            message_timeout: Duration::from_millis(100),
            ..config(QueueStrategy::AckNack)
        },
    )?);
    let mut stream = consumer.messages().await?;
    consumer.start()?;

    // 删除挂起期间超过时限，随后失败
    let first = next(&mut stream).await;
    let acking = {
        let consumer = consumer.clone();
        let first = first.clone();
        tokio::spawn(async move { consumer.ack(&first).await })
    };

    let retry = next(&mut stream).await;
    assert_eq!(retry.id(), "1");
    assert!(first.is_abandoned());
    assert!(rows.contains("1"));

    consumer.ack(&retry).await?;
    assert!(acking.await?.is_err());
    assert!(rows.is_empty());
    assert_eq!(consumer.in_flight(), 0);

    consumer.close().await?;
    Ok(())
}
