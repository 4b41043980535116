//! Broker 与消费者（Consumer）协议
//!
//! 核心层对具体 Broker 无感知：任何满足以下契约的实现（内存桩、真实客户端、
//! 或直接读取存储的 `StorageConsumer`）都可以互换。
//!
use crate::{
    error::MessagingResult as Result,
    message::{ConsumerMessage, Message},
    topic::Topic,
};
use async_trait::async_trait;
use futures_core::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Broker 生产者：将消息交付给 Broker
#[async_trait]
pub trait BrokerProducer: Send + Sync {
    async fn produce(&self, message: &Message) -> Result<()>;
}

/// 统一的拉取式消费者接口
#[async_trait]
pub trait Consumer: Send + Sync {
    fn name(&self) -> &str;

    /// 返回 'static 生命周期的投递流；流只能被取走一次
    async fn messages(&self) -> Result<BoxStream<'static, ConsumerMessage>>;

    async fn ack(&self, message: &ConsumerMessage) -> Result<()>;

    async fn nack(&self, message: &ConsumerMessage) -> Result<()>;

    /// 关闭消费者，结束投递流
    async fn close(&self) -> Result<()>;
}

/// 订阅模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumptionType {
    /// 同一订阅只允许一个消费者
    Exclusive,
    /// 同一订阅的多个消费者竞争消费
    Shared,
    /// 主备：同一时刻只有一个消费者活跃
    Failover,
    /// 按 key 分配给同一订阅的不同消费者
    KeyShared,
}

impl fmt::Display for ConsumptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConsumptionType::Exclusive => "exclusive",
            ConsumptionType::Shared => "shared",
            ConsumptionType::Failover => "failover",
            ConsumptionType::KeyShared => "key_shared",
        };
        f.write_str(s)
    }
}

/// 订阅描述：(订阅者, 主题, 订阅模式)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    pub subscriber: String,
    pub topic: Topic,
    pub consumption_type: ConsumptionType,
}

impl Subscription {
    pub fn new(
        subscriber: impl Into<String>,
        topic: Topic,
        consumption_type: ConsumptionType,
    ) -> Self {
        Self {
            subscriber: subscriber.into(),
            topic,
            consumption_type,
        }
    }

    /// 消费者名称：`<subscriber>@<topic>`
    pub fn consumer_name(&self) -> String {
        format!("{}@{}", self.subscriber, self.topic)
    }
}

/// 消费者工厂：按订阅创建并启动消费者
#[async_trait]
pub trait ConsumerFactory: Send + Sync {
    async fn subscribe(&self, subscription: &Subscription) -> Result<Arc<dyn Consumer>>;
}
