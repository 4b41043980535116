//! 处理队列（ProcessingQueue）策略
//!
//! 位于消费者之后的准入控制与确认簿记：
//! - `CommitOffsetQueue`：保持到达顺序，只提交已处理的最长连续前缀（日志式累积位点）；
//! - `AckNackQueue`：无序，固定令牌池限制并发，每条消息独立 ack/nack；
//! - `AckOnlyQueue`：同上，但拒绝 nack（适用于只有“删除”语义的下游）。
//!
//! 三种策略实现同一 trait，在构造时通过 `QueueStrategy` 选定，调用方不做类型分支。
//!
mod ack_nack;
mod commit_offset;
mod occupancy;

pub use ack_nack::{AckNackQueue, AckOnlyQueue};
pub use commit_offset::CommitOffsetQueue;

use crate::{error::MessagingResult as Result, message::Message};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// 确认下游：队列在消息可提交时通知它（如删除存储行、提交位点）
#[async_trait]
pub trait AckSink: Send + Sync {
    /// 提交一批消息；有序策略下按到达顺序一次性提交
    async fn ack(&self, messages: &[Message]) -> Result<()>;

    /// 负确认单条消息
    async fn nack(&self, message: &Message) -> Result<()>;
}

#[async_trait]
pub trait ProcessingQueue: Send + Sync {
    fn strategy(&self) -> QueueStrategy;

    /// 令牌池大小
    fn capacity(&self) -> usize;

    /// 当前已准入但尚未提交/释放的消息数
    fn in_flight(&self) -> usize;

    /// 立即准入；无空闲令牌返回 `QueueFull`，重复准入返回 `AlreadyQueued`
    fn try_admit(&self, message: &Message) -> Result<()>;

    /// 等待空闲令牌后准入；可被 `token` 取消
    async fn admit(&self, message: &Message, token: &CancellationToken) -> Result<()>;

    async fn ack(&self, id: &str) -> Result<()>;

    async fn nack(&self, id: &str) -> Result<()>;

    /// 放弃一条未确认的消息（例如处理超时），返回随之被释放的全部 ID
    async fn release(&self, id: &str) -> Result<Vec<String>>;

    /// 等待队列清空；可被 `token` 取消
    async fn wait_idle(&self, token: &CancellationToken) -> Result<()>;
}

/// 队列策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStrategy {
    CommitOffset,
    #[default]
    AckNack,
    AckOnly,
}

impl QueueStrategy {
    /// 是否保持到达顺序
    pub fn is_ordered(&self) -> bool {
        matches!(self, QueueStrategy::CommitOffset)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStrategy::CommitOffset => "commit-offset",
            QueueStrategy::AckNack => "ack-nack",
            QueueStrategy::AckOnly => "ack-only",
        }
    }

    /// 按策略构造队列；容量为 0 时归一化为 1
    pub fn build(self, capacity: usize, sink: Arc<dyn AckSink>) -> Arc<dyn ProcessingQueue> {
        match self {
            QueueStrategy::CommitOffset => Arc::new(CommitOffsetQueue::new(capacity, sink)),
            QueueStrategy::AckNack => Arc::new(AckNackQueue::new(capacity, sink)),
            QueueStrategy::AckOnly => Arc::new(AckOnlyQueue::new(capacity, sink)),
        }
    }
}

impl fmt::Display for QueueStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::error::MessagingError;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// 记录 ack/nack 调用的下游
    #[derive(Default)]
    pub struct SpySink {
        pub acked: Mutex<Vec<Vec<String>>>,
        pub nacked: Mutex<Vec<String>>,
        pub fail_acks: AtomicBool,
    }

    impl SpySink {
        pub fn acked_batches(&self) -> Vec<Vec<String>> {
            self.acked.lock().unwrap().clone()
        }

        pub fn nacked_ids(&self) -> Vec<String> {
            self.nacked.lock().unwrap().clone()
        }

        pub fn set_failing(&self, fail: bool) {
            self.fail_acks.store(fail, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl AckSink for SpySink {
        async fn ack(&self, messages: &[Message]) -> Result<()> {
            if self.fail_acks.load(Ordering::SeqCst) {
                return Err(MessagingError::storage("sink unavailable"));
            }
            self.acked
                .lock()
                .unwrap()
                .push(messages.iter().map(|m| m.id().to_string()).collect());
            Ok(())
        }

        async fn nack(&self, message: &Message) -> Result<()> {
            self.nacked.lock().unwrap().push(message.id().to_string());
            Ok(())
        }
    }

    pub fn msg(id: &str) -> Message {
        Message::builder().id(id).topic("t").build()
    }
}
