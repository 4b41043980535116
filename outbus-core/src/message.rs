//! 消息信封（Message）与消费侧投递（ConsumerMessage）
//!
//! `Message` 是各组件之间共享的不可变值：`id` 由客户端生成并在重试间保持不变，
//! 用于消费端去重与按 ID 幂等删除；`payload` 对核心层不透明（见 `envelope`）。
//!
use bon::Builder;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::topic::Topic;

#[derive(Debug, Clone, PartialEq, Eq, Builder, Serialize, Deserialize)]
pub struct Message {
    /// 消息唯一标识（重试时保持不变）
    #[builder(into)]
    id: String,
    /// 主题（路由与存储分区键）
    #[builder(into)]
    topic: String,
    /// 分区/排序键，允许为空
    #[builder(into, default)]
    key: String,
    /// 载荷（`{type, data, metadata}` 的 JSON 字节）
    #[builder(default)]
    payload: Vec<u8>,
}

impl Message {
    /// 使用随机 UUID 作为 ID 构造消息
    pub fn new(topic: &Topic, key: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            topic: topic.to_string(),
            key: key.into(),
            payload,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// 消费侧的一次投递
///
/// `token` 在投递被放弃（超时释放或消费者关闭）时取消，处理器可据此提前退出；
/// `deadline` 为存储消费者设置的处理截止时间。
#[derive(Debug, Clone)]
pub struct ConsumerMessage {
    message: Message,
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl ConsumerMessage {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn with_deadline(message: Message, token: CancellationToken, deadline: Instant) -> Self {
        Self {
            message,
            token,
            deadline: Some(deadline),
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn id(&self) -> &str {
        self.message.id()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// 投递是否已被放弃
    pub fn is_abandoned(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults_key_and_payload() {
        let msg = Message::builder().id("m-1").topic("shop.order.event").build();
        assert_eq!(msg.id(), "m-1");
        assert_eq!(msg.topic(), "shop.order.event");
        assert_eq!(msg.key(), "");
        assert!(msg.payload().is_empty());
    }

    #[test]
    fn generated_ids_are_unique() {
        let topic = Topic::from("t");
        let a = Message::new(&topic, "", vec![]);
        let b = Message::new(&topic, "", vec![]);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.topic(), "t");
    }

    #[test]
    fn consumer_message_abandonment_follows_token() {
        let cm = ConsumerMessage::new(Message::builder().id("1").topic("t").build());
        assert!(!cm.is_abandoned());
        cm.token().cancel();
        assert!(cm.is_abandoned());
        assert_eq!(cm.id(), "1");
    }
}
