use super::hooks::{NoopOutboxHooks, OutboxHooks};
use crate::backoff::{BackoffConfig, retry_until_cancelled};
use crate::broker::BrokerProducer;
use crate::error::MessagingResult as Result;
use crate::lifecycle::Lifecycle;
use crate::storage::{BatchQuery, OutboxStorage};
use bon::Builder;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outbox 投递配置
#[derive(Clone, Debug)]
pub struct OutboxProducerConfig {
    /// 投递者名称，参与咨询锁命名：同名投递者跨实例互斥
    pub name: String,
    /// 单批读取的消息数
    pub batch_size: usize,
    /// 周期轮询间隔；`None` 表示只响应 `process()` 信号
    pub poll_interval: Option<Duration>,
    /// 只投递这些主题；为空表示全部
    pub topics: Vec<String>,
    pub backoff: BackoffConfig,
}

impl Default for OutboxProducerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            batch_size: 100,
            poll_interval: Some(Duration::from_secs(5)),
            topics: Vec::new(),
            backoff: BackoffConfig::default(),
        }
    }
}

/// OutboxProducer：
/// - 响应 `process()` 信号与周期轮询，排空积压表
/// - 每轮在咨询锁内执行：取批 → 逐条发送 → 删除
#[derive(Builder)]
pub struct OutboxProducer {
    storage: Arc<dyn OutboxStorage>,
    broker: Arc<dyn BrokerProducer>,
    #[builder(default)]
    config: OutboxProducerConfig,
    #[builder(default = noop_hooks())]
    hooks: Arc<dyn OutboxHooks>,
    #[builder(skip = Arc::new(Notify::new()))]
    wakeup: Arc<Notify>,
    #[builder(skip = Lifecycle::new("outbox-producer"))]
    lifecycle: Lifecycle,
}

impl OutboxProducer {
    /// 启动后台投递循环；启动后立即执行一轮
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let this = self.clone();
        self.lifecycle
            .start(move |token| vec![tokio::spawn(this.run(token))])?;
        self.wakeup.notify_one();
        info!(producer = %self.config.name, "outbox producer started");
        Ok(())
    }

    /// 停止后台循环并等待其退出
    pub async fn stop(&self) -> Result<()> {
        self.lifecycle.stop().await?;
        info!(producer = %self.config.name, "outbox producer stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle.is_running()
    }

    /// 请求执行一轮投递；不阻塞，多次请求在下一轮执行前合并为一次
    pub fn process(&self) {
        self.wakeup.notify_one();
    }

    /// 在咨询锁内排空一次积压，返回成功投递的消息数
    pub async fn run_once(&self) -> Result<usize> {
        let keys = [String::from("producer"), self.config.name.clone()];
        let lock = self.storage.lock(&keys).await?;

        let result = self.drain().await;

        if let Err(err) = lock.release().await {
            self.hooks.on_error(&err);
            warn!(producer = %self.config.name, error = %err, "failed to release outbox lock");
        }
        result
    }

    async fn drain(&self) -> Result<usize> {
        let batch_size = self.config.batch_size.max(1);
        let mut delivered = 0;

        loop {
            let query = BatchQuery::builder()
                .batch_size(batch_size)
                .topics(self.config.topics.clone())
                .build();
            let batch = self.storage.get_batch(&query).await?;
            let found = batch.len();
            if found > 0 {
                self.hooks.on_batch_found(found);
            }

            for message in &batch {
                self.broker.produce(message).await?;
                self.hooks.on_message_sent(message);

                self.storage.delete(&[message.id().to_string()]).await?;
                self.hooks.on_message_deleted(message);
                delivered += 1;
            }

            if found < batch_size {
                break;
            }
        }

        Ok(delivered)
    }

    async fn run(self: Arc<Self>, token: CancellationToken) {
        let mut ticker = self.config.poll_interval.map(|every| {
            let mut ticker = time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker
        });

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = self.wakeup.notified() => {}
                _ = tick(ticker.as_mut()) => {}
            }

            let drained = retry_until_cancelled(
                &token,
                self.config.backoff,
                || self.run_once(),
                |err, delay| {
                    self.hooks.on_error(err);
                    warn!(
                        producer = %self.config.name,
                        error = %err,
                        retry_in_ms = delay.as_millis() as u64,
                        "outbox drain failed, backing off"
                    );
                },
            )
            .await;

            match drained {
                Some(0) => {}
                Some(n) => debug!(producer = %self.config.name, delivered = n, "outbox drained"),
                None => break,
            }
        }
    }
}

fn noop_hooks() -> Arc<dyn OutboxHooks> {
    Arc::new(NoopOutboxHooks)
}

async fn tick(ticker: Option<&mut time::Interval>) {
    match ticker {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
