use super::in_flight::InFlight;
use crate::backoff::{BackoffConfig, retry_until_cancelled};
use crate::broker::{Consumer, ConsumerFactory, Subscription};
use crate::error::{MessagingError, MessagingResult as Result};
use crate::lifecycle::Lifecycle;
use crate::message::{ConsumerMessage, Message};
use crate::queue::{AckSink, ProcessingQueue, QueueStrategy};
use crate::storage::{BatchQuery, OutboxStorage};
use async_trait::async_trait;
use futures_core::stream::BoxStream;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 存储消费者配置
#[derive(Clone, Debug)]
pub struct StorageConsumerConfig {
    /// 消费的主题集合；为空表示全部主题
    pub topics: Vec<String>,
    /// 单次查询的行数
    pub batch_size: usize,
    /// 输出管道容量（至少为 1）
    pub buffer: usize,
    /// 单条消息的处理时限，超时后释放并在后续扫描中重新投递
    pub message_timeout: Duration,
    /// 周期扫描间隔；`None` 表示只响应 `trigger()`
    pub poll_interval: Option<Duration>,
    /// 处理队列令牌数（并发上限，0 归一化为 1）
    pub concurrency: usize,
    pub strategy: QueueStrategy,
    pub backoff: BackoffConfig,
}

impl Default for StorageConsumerConfig {
    fn default() -> Self {
        Self {
            topics: Vec::new(),
            batch_size: 100,
            buffer: 1,
            message_timeout: Duration::from_secs(30),
            poll_interval: Some(Duration::from_secs(1)),
            concurrency: 10,
            strategy: QueueStrategy::default(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl StorageConsumerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.message_timeout.is_zero() {
            return Err(MessagingError::InvalidConfig {
                reason: "message_timeout must be greater than zero".into(),
            });
        }
        if self.poll_interval.is_some_and(|d| d.is_zero()) {
            return Err(MessagingError::InvalidConfig {
                reason: "poll_interval must be greater than zero".into(),
            });
        }
        Ok(())
    }
}

/// 确认下游：ack 删除存储行，nack 只移除在途标记，行留在存储中，
/// 由下一次周期扫描或 `trigger()` 重新投递（不主动唤醒，避免立即重投）
struct StorageAckSink {
    storage: Arc<dyn OutboxStorage>,
    in_flight: Arc<InFlight>,
}

#[async_trait]
impl AckSink for StorageAckSink {
    async fn ack(&self, messages: &[Message]) -> Result<()> {
        let ids: Vec<String> = messages.iter().map(|m| m.id().to_string()).collect();
        self.storage.delete(&ids).await?;
        self.in_flight.settle(&ids);
        Ok(())
    }

    async fn nack(&self, message: &Message) -> Result<()> {
        self.in_flight.settle(&[message.id().to_string()]);
        Ok(())
    }
}

/// StorageConsumer：直接从 Outbox 存储表消费
///
/// 每轮扫描在主题级咨询锁内执行：
/// 取到期且不在途的行 → 准入处理队列（无令牌时等待）→ 登记在途 → 送入输出管道（无读者时等待）
/// → 启动超时计时。批次不满即视为本轮排空；有序策略下还需等待本轮在途消息全部提交后才释放锁。
pub struct StorageConsumer {
    name: String,
    storage: Arc<dyn OutboxStorage>,
    config: StorageConsumerConfig,
    queue: Arc<dyn ProcessingQueue>,
    in_flight: Arc<InFlight>,
    wakeup: Arc<Notify>,
    pipe: Mutex<Option<mpsc::Sender<ConsumerMessage>>>,
    output: Mutex<Option<mpsc::Receiver<ConsumerMessage>>>,
    lifecycle: Lifecycle,
}

impl StorageConsumer {
    pub fn new(
        name: impl Into<String>,
        storage: Arc<dyn OutboxStorage>,
        config: StorageConsumerConfig,
    ) -> Result<Self> {
        config.validate()?;

        let in_flight = Arc::new(InFlight::default());
        let wakeup = Arc::new(Notify::new());
        let sink = Arc::new(StorageAckSink {
            storage: storage.clone(),
            in_flight: in_flight.clone(),
        });
        let queue = config.strategy.build(config.concurrency, sink);
        let (tx, rx) = mpsc::channel(config.buffer.max(1));

        Ok(Self {
            name: name.into(),
            storage,
            config,
            queue,
            in_flight,
            wakeup,
            pipe: Mutex::new(Some(tx)),
            output: Mutex::new(Some(rx)),
            lifecycle: Lifecycle::new("storage-consumer"),
        })
    }

    pub fn config(&self) -> &StorageConsumerConfig {
        &self.config
    }

    /// 当前在途（已投递未确认）的消息数
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle.is_running()
    }

    /// 请求立即扫描；多次请求合并
    pub fn trigger(&self) {
        self.wakeup.notify_one();
    }

    /// 启动扫描循环；输出管道关闭后不可再次启动
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut pipe = self.pipe();
        if pipe.is_none() && !self.lifecycle.is_running() {
            return Err(MessagingError::Closed {
                consumer: self.name.clone(),
            });
        }

        let this = self.clone();
        self.lifecycle.start(|token| match pipe.take() {
            Some(sender) => vec![tokio::spawn(this.run(sender, token))],
            None => vec![],
        })?;
        drop(pipe);

        self.wakeup.notify_one();
        info!(consumer = %self.name, strategy = %self.config.strategy, "storage consumer started");
        Ok(())
    }

    /// 停止扫描循环；输出管道随之关闭，未确认的投递被放弃
    pub async fn stop(&self) -> Result<()> {
        self.lifecycle.stop().await?;
        info!(consumer = %self.name, "storage consumer stopped");
        Ok(())
    }

    fn pipe(&self) -> MutexGuard<'_, Option<mpsc::Sender<ConsumerMessage>>> {
        self.pipe.lock().unwrap_or_else(|p| p.into_inner())
    }

    async fn run(self: Arc<Self>, sender: mpsc::Sender<ConsumerMessage>, token: CancellationToken) {
        let mut ticker = self.config.poll_interval.map(|every| {
            // 首次扫描由 start() 的唤醒触发，周期从一个间隔之后开始
            let mut ticker = time::interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker
        });

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = self.wakeup.notified() => {}
                _ = tick(ticker.as_mut()) => {}
            }

            let scanned = retry_until_cancelled(
                &token,
                self.config.backoff,
                || self.scan(&sender, &token),
                |err, delay| {
                    warn!(
                        consumer = %self.name,
                        error = %err,
                        retry_in_ms = delay.as_millis() as u64,
                        "storage scan failed, backing off"
                    );
                },
            )
            .await;

            match scanned {
                Some(0) => {}
                Some(n) => debug!(consumer = %self.name, dispatched = n, "storage scan dispatched"),
                None => break,
            }
        }

        self.in_flight.abandon_all();
    }

    /// 在主题级咨询锁内执行一轮扫描，返回本轮投递的消息数
    async fn scan(
        self: &Arc<Self>,
        sender: &mpsc::Sender<ConsumerMessage>,
        token: &CancellationToken,
    ) -> Result<usize> {
        let keys: Vec<String> = std::iter::once("consumer".to_string())
            .chain(self.config.topics.iter().cloned())
            .collect();
        let lock = self.storage.lock(&keys).await?;

        let result = self.dispatch(sender, token).await;

        if let Err(err) = lock.release().await {
            warn!(consumer = %self.name, error = %err, "failed to release consumer lock");
        }
        result
    }

    async fn dispatch(
        self: &Arc<Self>,
        sender: &mpsc::Sender<ConsumerMessage>,
        token: &CancellationToken,
    ) -> Result<usize> {
        let batch_size = self.config.batch_size.max(1);
        let mut dispatched = 0;

        loop {
            let query = BatchQuery::builder()
                .batch_size(batch_size)
                .topics(self.config.topics.clone())
                .exclude_ids(self.in_flight.ids())
                .build();
            let batch = self.storage.get_batch(&query).await?;
            let found = batch.len();

            for message in batch {
                self.queue.admit(&message, token).await?;

                let (abandon, settled) = self.in_flight.insert(message.id());
                let deadline = Instant::now() + self.config.message_timeout;
                self.watch_deadline(message.id().to_string(), deadline, settled, token.clone());

                let delivery = ConsumerMessage::with_deadline(message, abandon, deadline);
                tokio::select! {
                    _ = token.cancelled() => return Err(MessagingError::Cancelled),
                    sent = sender.send(delivery) => sent.map_err(|_| MessagingError::Closed {
                        consumer: self.name.clone(),
                    })?,
                }
                dispatched += 1;
            }

            if found < batch_size {
                break;
            }
        }

        if self.queue.strategy().is_ordered() {
            self.queue.wait_idle(token).await?;
        }
        Ok(dispatched)
    }

    /// 投递超时：从处理队列释放（有序策略下连同其后的条目），移除在途标记并触发重扫
    fn watch_deadline(
        self: &Arc<Self>,
        id: String,
        deadline: Instant,
        settled: CancellationToken,
        token: CancellationToken,
    ) {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = settled.cancelled() => {}
                _ = token.cancelled() => {}
                _ = time::sleep_until(deadline) => this.expire(&id).await,
            }
        });
    }

    async fn expire(&self, id: &str) {
        match self.queue.release(id).await {
            Ok(released) if released.is_empty() => {}
            Ok(released) => {
                warn!(
                    consumer = %self.name,
                    id = %id,
                    released = released.len(),
                    "message processing timed out, releasing for redelivery"
                );
                self.in_flight.abandon(&released);
                self.wakeup.notify_one();
            }
            Err(err) => {
                warn!(consumer = %self.name, id = %id, error = %err, "failed to release timed out message");
            }
        }
    }
}

#[async_trait]
impl Consumer for StorageConsumer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn messages(&self) -> Result<BoxStream<'static, ConsumerMessage>> {
        let receiver = self
            .output
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
            .ok_or_else(|| MessagingError::AlreadySubscribed {
                consumer: self.name.clone(),
            })?;
        Ok(Box::pin(ReceiverStream::new(receiver)))
    }

    /// 已超时放弃的投递不能再确认，避免作用到同一行的新一次投递上
    async fn ack(&self, message: &ConsumerMessage) -> Result<()> {
        reject_abandoned(message)?;
        self.queue.ack(message.id()).await
    }

    async fn nack(&self, message: &ConsumerMessage) -> Result<()> {
        reject_abandoned(message)?;
        self.queue.nack(message.id()).await
    }

    async fn close(&self) -> Result<()> {
        match self.lifecycle.stop().await {
            Ok(()) | Err(MessagingError::NotRunning { .. }) => {}
            Err(err) => return Err(err),
        }
        self.pipe().take();
        self.in_flight.abandon_all();
        debug!(consumer = %self.name, "storage consumer closed");
        Ok(())
    }
}

/// 以存储消费者满足订阅：每个订阅一个消费者，主题集合即订阅主题
///
/// 存储消费是工作队列语义：同一主题的多个订阅竞争同一组行。
pub struct StorageConsumerFactory {
    storage: Arc<dyn OutboxStorage>,
    config: StorageConsumerConfig,
}

impl StorageConsumerFactory {
    pub fn new(storage: Arc<dyn OutboxStorage>, config: StorageConsumerConfig) -> Self {
        Self { storage, config }
    }
}

#[async_trait]
impl ConsumerFactory for StorageConsumerFactory {
    async fn subscribe(&self, subscription: &Subscription) -> Result<Arc<dyn Consumer>> {
        let config = StorageConsumerConfig {
            topics: vec![subscription.topic.to_string()],
            ..self.config.clone()
        };
        let consumer = Arc::new(StorageConsumer::new(
            subscription.consumer_name(),
            self.storage.clone(),
            config,
        )?);
        consumer.start()?;
        Ok(consumer)
    }
}

fn reject_abandoned(message: &ConsumerMessage) -> Result<()> {
    if message.is_abandoned() {
        return Err(MessagingError::Abandoned {
            id: message.id().to_string(),
        });
    }
    Ok(())
}

async fn tick(ticker: Option<&mut time::Interval>) {
    match ticker {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
