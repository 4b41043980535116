use super::occupancy::Occupancy;
use super::{AckSink, ProcessingQueue, QueueStrategy};
use crate::error::{MessagingError, MessagingResult as Result};
use crate::message::Message;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

struct Slot {
    message: Message,
    processed: bool,
    _permit: OwnedSemaphorePermit,
}

/// 有序队列：按到达顺序簿记，仅提交已处理的最长连续前缀
///
/// 头部任何一条未确认的消息都会阻塞其后所有消息的提交，
/// 与日志型存储的累积位点语义一致；因此不支持 nack。
pub struct CommitOffsetQueue {
    capacity: usize,
    tokens: Arc<Semaphore>,
    slots: Mutex<VecDeque<Slot>>,
    // 串行化“计算前缀 → 通知下游 → 出队”，保证提交顺序
    commit_gate: tokio::sync::Mutex<()>,
    occupancy: Occupancy,
    sink: Arc<dyn AckSink>,
}

impl CommitOffsetQueue {
    pub fn new(capacity: usize, sink: Arc<dyn AckSink>) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            tokens: Arc::new(Semaphore::new(capacity)),
            slots: Mutex::new(VecDeque::new()),
            commit_gate: tokio::sync::Mutex::new(()),
            occupancy: Occupancy::new(),
            sink,
        }
    }

    fn slots(&self) -> MutexGuard<'_, VecDeque<Slot>> {
        self.slots.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn push(&self, message: &Message, permit: OwnedSemaphorePermit) -> Result<()> {
        let mut slots = self.slots();
        if slots.iter().any(|s| s.message.id() == message.id()) {
            return Err(MessagingError::AlreadyQueued {
                id: message.id().to_string(),
            });
        }
        slots.push_back(Slot {
            message: message.clone(),
            processed: false,
            _permit: permit,
        });
        self.occupancy.set(slots.len());
        Ok(())
    }

    fn contains(&self, id: &str) -> bool {
        self.slots().iter().any(|s| s.message.id() == id)
    }

    /// 标记已处理并返回可提交的连续前缀
    fn mark_processed(&self, id: &str) -> Result<Vec<Message>> {
        let mut slots = self.slots();
        let slot = slots
            .iter_mut()
            .find(|s| s.message.id() == id)
            .ok_or_else(|| MessagingError::NotQueued { id: id.to_string() })?;
        slot.processed = true;

        Ok(slots
            .iter()
            .take_while(|s| s.processed)
            .map(|s| s.message.clone())
            .collect())
    }

    fn pop_committed(&self, committed: &[Message]) {
        let mut slots = self.slots();
        for message in committed {
            if slots.front().is_some_and(|s| s.message.id() == message.id()) {
                slots.pop_front();
            }
        }
        self.occupancy.set(slots.len());
    }
}

#[async_trait]
impl ProcessingQueue for CommitOffsetQueue {
    fn strategy(&self) -> QueueStrategy {
        QueueStrategy::CommitOffset
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn in_flight(&self) -> usize {
        self.occupancy.get()
    }

    fn try_admit(&self, message: &Message) -> Result<()> {
        if self.contains(message.id()) {
            return Err(MessagingError::AlreadyQueued {
                id: message.id().to_string(),
            });
        }

        let permit = self
            .tokens
            .clone()
            .try_acquire_owned()
            .map_err(|_| MessagingError::QueueFull {
                capacity: self.capacity,
            })?;

        self.push(message, permit)
    }

    async fn admit(&self, message: &Message, token: &CancellationToken) -> Result<()> {
        if self.contains(message.id()) {
            return Err(MessagingError::AlreadyQueued {
                id: message.id().to_string(),
            });
        }

        let permit = tokio::select! {
            _ = token.cancelled() => return Err(MessagingError::Cancelled),
            p = self.tokens.clone().acquire_owned() => p.map_err(|_| MessagingError::Cancelled)?,
        };

        self.push(message, permit)
    }

    async fn ack(&self, id: &str) -> Result<()> {
        let _gate = self.commit_gate.lock().await;

        let prefix = self.mark_processed(id)?;
        if prefix.is_empty() {
            return Ok(());
        }

        // 下游失败时条目保持“已处理未提交”，下一次 ack 会连同它们一起重试提交
        self.sink.ack(&prefix).await?;
        self.pop_committed(&prefix);
        Ok(())
    }

    async fn nack(&self, _id: &str) -> Result<()> {
        Err(MessagingError::NackNotSupported {
            strategy: QueueStrategy::CommitOffset.as_str(),
        })
    }

    /// 位点语义下的回退：被放弃的条目及其后所有未提交条目一并释放，
    /// 它们会从被放弃的位置起重新投递
    async fn release(&self, id: &str) -> Result<Vec<String>> {
        let _gate = self.commit_gate.lock().await;

        let mut slots = self.slots();
        let Some(pos) = slots.iter().position(|s| s.message.id() == id) else {
            return Ok(vec![]);
        };

        let released = slots
            .drain(pos..)
            .map(|s| s.message.id().to_string())
            .collect();
        self.occupancy.set(slots.len());
        Ok(released)
    }

    async fn wait_idle(&self, token: &CancellationToken) -> Result<()> {
        self.occupancy.wait_idle(token).await
    }
}
