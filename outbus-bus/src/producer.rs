//! 总线生产者（BusProducer）
//!
//! 应用代码唯一的写入口：序列化一批结构化消息，附加元数据，写入 Outbox 存储。
//! - `produce_in`：在调用方持有的存储事务内写入，与业务数据原子提交；
//! - `produce`：通过存储自身的隐式事务写入，写入后通知 Outbox 投递者（若已配置）。
//!
use crate::error::BusResult;
use crate::metadata::{MetadataBuilder, ScopeMetadata};
use crate::observer::{NoopProduceObserver, ProduceObserver, ProduceReport};
use crate::scope::CallScope;
use bon::Builder;
use chrono::{DateTime, Utc};
use outbus_core::envelope::{MessageMetadata, keys};
use outbus_core::error::MessagingResult;
use outbus_core::message::Message;
use outbus_core::outbox::OutboxProducer;
use outbus_core::registry::MessageRegistry;
use outbus_core::storage::{OutboxStorage, TransactionalOutbox};
use outbus_core::structured::StructuredMessage;
use outbus_core::topic::{MessageClass, Topic};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

/// 单次生产的可选项
#[derive(Builder, Debug, Clone, Default)]
pub struct ProduceOptions {
    /// 显式主题；设置后忽略默认主题推导与 `tags`
    #[builder(into)]
    pub topic: Option<Topic>,
    /// 追加在默认主题之后的自定义标签
    #[builder(default)]
    pub tags: Vec<String>,
    /// 计划投递时间；早于当前时刻时按当前时刻处理
    pub scheduled_at: Option<DateTime<Utc>>,
}

#[derive(Builder)]
pub struct BusProducer<S: OutboxStorage + 'static> {
    storage: Arc<S>,
    registry: Arc<MessageRegistry>,
    /// 默认主题的领域段
    #[builder(into)]
    domain: String,
    #[builder(default = default_metadata())]
    metadata: Vec<Arc<dyn MetadataBuilder>>,
    #[builder(default = noop_observer())]
    observer: Arc<dyn ProduceObserver>,
    /// 隐式事务写入后唤醒的投递者
    outbox: Option<Arc<OutboxProducer>>,
}

impl<S: OutboxStorage + 'static> BusProducer<S> {
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// 消息类型在给定类别下的默认主题：领域 + 聚合 + 类别 + 自定义标签
    pub fn topic_for<T: StructuredMessage>(&self, class: MessageClass, options: &ProduceOptions) -> Topic {
        if let Some(topic) = &options.topic {
            return topic.clone();
        }
        Topic::builder(&self.domain)
            .aggregate(T::AGGREGATE)
            .class(class)
            .tags(&options.tags)
            .build()
    }

    /// 在存储自身的事务中写入；零条消息为空操作
    pub async fn produce<T: StructuredMessage>(
        &self,
        scope: &CallScope,
        class: MessageClass,
        messages: &[T],
        options: &ProduceOptions,
    ) -> BusResult<()> {
        if messages.is_empty() {
            return Ok(());
        }

        let (topic, batch) = self.encode(scope, class, messages, options)?;
        let scheduled_at = schedule(options);
        self.observed::<T, _>(&topic, class, batch.len(), self.storage.store(&batch, scheduled_at))
            .await?;

        if let Some(outbox) = &self.outbox {
            outbox.process();
        }
        Ok(())
    }

    /// 编码为存储行：ID 取自消息本身（为空时生成），分区键取自 `partition_key()`
    pub fn encode<T: StructuredMessage>(
        &self,
        scope: &CallScope,
        class: MessageClass,
        messages: &[T],
        options: &ProduceOptions,
    ) -> BusResult<(Topic, Vec<Message>)> {
        let topic = self.topic_for::<T>(class, options);

        let mut metadata = MessageMetadata::new();
        metadata.insert(keys::MESSAGE_CLASS.to_string(), class.as_str().to_string());
        for builder in &self.metadata {
            builder.build(scope, &mut metadata);
        }

        let batch = messages
            .iter()
            .map(|m| -> MessagingResult<Message> {
                let payload = self.registry.encode(m, metadata.clone())?;
                let key = m.partition_key();
                Ok(if m.id().is_empty() {
                    Message::new(&topic, key, payload)
                } else {
                    Message::builder()
                        .id(m.id())
                        .topic(topic.as_str())
                        .key(key)
                        .payload(payload)
                        .build()
                })
            })
            .collect::<MessagingResult<Vec<_>>>()?;

        Ok((topic, batch))
    }

    async fn observed<T, F>(
        &self,
        topic: &Topic,
        class: MessageClass,
        count: usize,
        write: F,
    ) -> BusResult<()>
    where
        T: StructuredMessage,
        F: Future<Output = MessagingResult<()>>,
    {
        let started = Instant::now();
        let result = write.await;
        let report = ProduceReport {
            topic,
            type_name: T::TYPE,
            class,
            count,
            elapsed: started.elapsed(),
        };
        self.observer.on_produced(&report, result.as_ref().err());
        Ok(result?)
    }
}

impl<S: TransactionalOutbox + 'static> BusProducer<S> {
    /// 在调用方事务内写入；事务提交后由调用方决定是否唤醒投递者
    pub async fn produce_in<T: StructuredMessage>(
        &self,
        tx: &mut S::Tx,
        scope: &CallScope,
        class: MessageClass,
        messages: &[T],
        options: &ProduceOptions,
    ) -> BusResult<()> {
        if messages.is_empty() {
            return Ok(());
        }

        let (topic, batch) = self.encode(scope, class, messages, options)?;
        let scheduled_at = schedule(options);
        self.observed::<T, _>(
            &topic,
            class,
            batch.len(),
            self.storage.store_in(tx, &batch, scheduled_at),
        )
        .await
    }
}

fn schedule(options: &ProduceOptions) -> DateTime<Utc> {
    let now = Utc::now();
    options.scheduled_at.map_or(now, |at| at.max(now))
}

fn default_metadata() -> Vec<Arc<dyn MetadataBuilder>> {
    vec![Arc::new(ScopeMetadata)]
}

fn noop_observer() -> Arc<dyn ProduceObserver> {
    Arc::new(NoopProduceObserver)
}
