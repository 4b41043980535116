use super::occupancy::Occupancy;
use super::{AckSink, ProcessingQueue, QueueStrategy};
use crate::error::{MessagingError, MessagingResult as Result};
use crate::message::Message;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

struct Admitted {
    message: Message,
    /// 每次准入递增；确认结束时据此判断条目是否已被释放并重新准入
    generation: u64,
    /// 下游确认进行中；此时条目仍占用令牌，且可被超时释放
    settling: bool,
    _permit: OwnedSemaphorePermit,
}

/// 无序队列：固定令牌池，每条消息独立确认
pub struct AckNackQueue {
    capacity: usize,
    tokens: Arc<Semaphore>,
    admitted: Mutex<HashMap<String, Admitted>>,
    generations: AtomicU64,
    occupancy: Occupancy,
    sink: Arc<dyn AckSink>,
}

impl AckNackQueue {
    pub fn new(capacity: usize, sink: Arc<dyn AckSink>) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            tokens: Arc::new(Semaphore::new(capacity)),
            admitted: Mutex::new(HashMap::new()),
            generations: AtomicU64::new(0),
            occupancy: Occupancy::new(),
            sink,
        }
    }

    fn admitted(&self) -> MutexGuard<'_, HashMap<String, Admitted>> {
        self.admitted.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn insert(&self, message: &Message, permit: OwnedSemaphorePermit) -> Result<()> {
        let mut admitted = self.admitted();
        if admitted.contains_key(message.id()) {
            return Err(MessagingError::AlreadyQueued {
                id: message.id().to_string(),
            });
        }
        admitted.insert(
            message.id().to_string(),
            Admitted {
                message: message.clone(),
                generation: self.generations.fetch_add(1, Ordering::Relaxed),
                settling: false,
                _permit: permit,
            },
        );
        self.occupancy.set(admitted.len());
        Ok(())
    }

    fn take(&self, id: &str) -> Option<Admitted> {
        let mut admitted = self.admitted();
        let entry = admitted.remove(id);
        self.occupancy.set(admitted.len());
        entry
    }

    /// 标记为确认中并返回消息副本；同一条目的并发确认被拒绝
    fn begin_settle(&self, id: &str) -> Result<(Message, u64)> {
        let mut admitted = self.admitted();
        let entry = admitted
            .get_mut(id)
            .filter(|entry| !entry.settling)
            .ok_or_else(|| MessagingError::NotQueued { id: id.to_string() })?;
        entry.settling = true;
        Ok((entry.message.clone(), entry.generation))
    }

    /// 下游成功则移除条目；失败则恢复为待确认，便于调用方重试。
    /// 确认期间条目已被释放（或释放后重新准入）时不做任何改动。
    fn finish_settle(&self, id: &str, generation: u64, settled: bool) {
        let mut admitted = self.admitted();
        if !admitted.get(id).is_some_and(|e| e.generation == generation) {
            return;
        }
        if settled {
            admitted.remove(id);
        } else if let Some(entry) = admitted.get_mut(id) {
            entry.settling = false;
        }
        self.occupancy.set(admitted.len());
    }
}

#[async_trait]
impl ProcessingQueue for AckNackQueue {
    fn strategy(&self) -> QueueStrategy {
        QueueStrategy::AckNack
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn in_flight(&self) -> usize {
        self.occupancy.get()
    }

    fn try_admit(&self, message: &Message) -> Result<()> {
        if self.admitted().contains_key(message.id()) {
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

        self.insert(message, permit)
    }

    async fn admit(&self, message: &Message, token: &CancellationToken) -> Result<()> {
        if self.admitted().contains_key(message.id()) {
            return Err(MessagingError::AlreadyQueued {
                id: message.id().to_string(),
            });
        }

        let permit = tokio::select! {
            _ = token.cancelled() => return Err(MessagingError::Cancelled),
            p = self.tokens.clone().acquire_owned() => p.map_err(|_| MessagingError::Cancelled)?,
        };

        self.insert(message, permit)
    }

    async fn ack(&self, id: &str) -> Result<()> {
        let (message, generation) = self.begin_settle(id)?;
        let result = self.sink.ack(std::slice::from_ref(&message)).await;
        self.finish_settle(id, generation, result.is_ok());
        result
    }

    async fn nack(&self, id: &str) -> Result<()> {
        let (message, generation) = self.begin_settle(id)?;
        let result = self.sink.nack(&message).await;
        self.finish_settle(id, generation, result.is_ok());
        result
    }

    /// 确认中的条目同样被释放，下游之后的结果不再作用于它
    async fn release(&self, id: &str) -> Result<Vec<String>> {
        Ok(self.take(id).map(|_| vec![id.to_string()]).unwrap_or_default())
    }

    async fn wait_idle(&self, token: &CancellationToken) -> Result<()> {
        self.occupancy.wait_idle(token).await
    }
}

/// 只确认队列：与 `AckNackQueue` 相同，但 nack 被视为误用
pub struct AckOnlyQueue {
    inner: AckNackQueue,
}

impl AckOnlyQueue {
    pub fn new(capacity: usize, sink: Arc<dyn AckSink>) -> Self {
        Self {
            inner: AckNackQueue::new(capacity, sink),
        }
    }
}

#[async_trait]
impl ProcessingQueue for AckOnlyQueue {
    fn strategy(&self) -> QueueStrategy {
        QueueStrategy::AckOnly
    }

    fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    fn in_flight(&self) -> usize {
        self.inner.in_flight()
    }

    fn try_admit(&self, message: &Message) -> Result<()> {
        self.inner.try_admit(message)
    }

    async fn admit(&self, message: &Message, token: &CancellationToken) -> Result<()> {
        self.inner.admit(message, token).await
    }

    async fn ack(&self, id: &str) -> Result<()> {
        self.inner.ack(id).await
    }

    async fn nack(&self, _id: &str) -> Result<()> {
        Err(MessagingError::NackNotSupported {
            strategy: QueueStrategy::AckOnly.as_str(),
        })
    }

    async fn release(&self, id: &str) -> Result<Vec<String>> {
        self.inner.release(id).await
    }

    async fn wait_idle(&self, token: &CancellationToken) -> Result<()> {
        self.inner.wait_idle(token).await
    }
}
