use crate::error::{MessagingError, MessagingResult as Result};
use crate::message::Message;
use crate::storage::{AdvisoryLock, BatchQuery, OutboxStorage, TransactionalOutbox, lock_name};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::OwnedMutexGuard;

#[derive(Debug, Clone)]
struct Row {
    message: Message,
    scheduled_at: DateTime<Utc>,
    seq: u64,
}

/// 内存版 Outbox 存储
///
/// - 以消息 ID 为主键，重复写入同一 ID 被忽略（保持首次写入的行）；
/// - 咨询锁按名称互斥，同名锁的获取者排队等待；
/// - `begin()` 开启事务，`commit()` 原子落盘，未提交的事务在 drop 时丢弃。
#[derive(Default)]
pub struct InMemoryOutboxStorage {
    rows: Mutex<HashMap<String, Row>>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    seq: AtomicU64,
    unavailable: AtomicBool,
}

/// 内存事务：缓冲写入，`commit` 时一次性可见
#[derive(Debug, Default)]
pub struct InMemoryTransaction {
    pending: Vec<(Message, DateTime<Utc>)>,
}

impl InMemoryTransaction {
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

impl InMemoryOutboxStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) -> InMemoryTransaction {
        InMemoryTransaction::default()
    }

    pub fn commit(&self, tx: InMemoryTransaction) -> Result<()> {
        self.check_available()?;
        let mut rows = self.rows();
        for (message, scheduled_at) in tx.pending {
            self.insert(&mut rows, message, scheduled_at);
        }
        Ok(())
    }

    /// 模拟存储故障：为 `true` 时所有读写返回 `Storage` 错误
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.rows().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows().is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.rows().contains_key(id)
    }

    /// 按计划时间顺序返回全部行
    pub fn messages(&self) -> Vec<Message> {
        let mut rows: Vec<Row> = self.rows().values().cloned().collect();
        rows.sort_by_key(|r| (r.scheduled_at, r.seq));
        rows.into_iter().map(|r| r.message).collect()
    }

    fn rows(&self) -> MutexGuard<'_, HashMap<String, Row>> {
        self.rows.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn insert(&self, rows: &mut HashMap<String, Row>, message: Message, scheduled_at: DateTime<Utc>) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        rows.entry(message.id().to_string()).or_insert(Row {
            message,
            scheduled_at,
            seq,
        });
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(MessagingError::storage("in-memory storage is unavailable"));
        }
        Ok(())
    }

    fn named_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        locks.entry(name.to_string()).or_default().clone()
    }
}

struct InMemoryLock {
    name: String,
    _guard: OwnedMutexGuard<()>,
}

#[async_trait]
impl AdvisoryLock for InMemoryLock {
    fn name(&self) -> &str {
        &self.name
    }

    async fn release(self: Box<Self>) -> Result<()> {
        drop(self);
        Ok(())
    }
}

#[async_trait]
impl OutboxStorage for InMemoryOutboxStorage {
    async fn lock(&self, keys: &[String]) -> Result<Box<dyn AdvisoryLock>> {
        self.check_available()?;
        let name = lock_name(keys);
        let guard = self.named_lock(&name).lock_owned().await;
        Ok(Box::new(InMemoryLock {
            name,
            _guard: guard,
        }))
    }

    async fn get_batch(&self, query: &BatchQuery) -> Result<Vec<Message>> {
        self.check_available()?;
        let mut due: Vec<Row> = self
            .rows()
            .values()
            .filter(|r| r.scheduled_at <= query.scheduled_before)
            .filter(|r| query.topics.is_empty() || query.topics.iter().any(|t| t == r.message.topic()))
            .filter(|r| !query.exclude_ids.iter().any(|id| id == r.message.id()))
            .cloned()
            .collect();

        due.sort_by_key(|r| (r.scheduled_at, r.seq));
        Ok(due
            .into_iter()
            .take(query.batch_size)
            .map(|r| r.message)
            .collect())
    }

    async fn store(&self, messages: &[Message], scheduled_at: DateTime<Utc>) -> Result<()> {
        self.check_available()?;
        let mut rows = self.rows();
        for message in messages {
            self.insert(&mut rows, message.clone(), scheduled_at);
        }
        Ok(())
    }

    async fn delete(&self, ids: &[String]) -> Result<()> {
        self.check_available()?;
        let mut rows = self.rows();
        for id in ids {
            rows.remove(id);
        }
        Ok(())
    }
}

#[async_trait]
impl TransactionalOutbox for InMemoryOutboxStorage {
    type Tx = InMemoryTransaction;

    async fn store_in(
        &self,
        tx: &mut Self::Tx,
        messages: &[Message],
        scheduled_at: DateTime<Utc>,
    ) -> Result<()> {
        self.check_available()?;
        tx.pending
            .extend(messages.iter().cloned().map(|m| (m, scheduled_at)));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;

    fn msg(id: &str, topic: &str) -> Message {
        Message::builder().id(id).topic(topic).build()
    }

    #[tokio::test]
    async fn batches_follow_schedule_and_filters() {
        let storage = InMemoryOutboxStorage::new();
        let now = Utc::now();
        storage.store(&[msg("late", "a")], now - ChronoDuration::seconds(1)).await.unwrap();
        storage.store(&[msg("early", "a")], now - ChronoDuration::seconds(10)).await.unwrap();
        storage.store(&[msg("other", "b")], now - ChronoDuration::seconds(5)).await.unwrap();
        storage.store(&[msg("future", "a")], now + ChronoDuration::hours(1)).await.unwrap();

        let all = storage
            .get_batch(&BatchQuery::builder().batch_size(10).build())
            .await
            .unwrap();
        let ids: Vec<_> = all.iter().map(|m| m.id()).collect();
        assert_eq!(ids, vec!["early", "other", "late"]);

        let query = BatchQuery::builder()
            .batch_size(10)
            .topics(vec!["a".into()])
            .exclude_ids(vec!["early".into()])
            .build();
        let only_a = storage.get_batch(&query).await.unwrap();
        assert_eq!(only_a.len(), 1);
        assert_eq!(only_a[0].id(), "late");

        let limited = storage
            .get_batch(&BatchQuery::builder().batch_size(1).build())
            .await
            .unwrap();
        assert_eq!(limited[0].id(), "early");
    }

    #[tokio::test]
    async fn transaction_is_invisible_until_commit() {
        let storage = InMemoryOutboxStorage::new();
        let mut tx = storage.begin();
        storage.store_in(&mut tx, &[msg("1", "t")], Utc::now()).await.unwrap();
        assert_eq!(tx.pending(), 1);
        assert!(storage.is_empty());

        storage.commit(tx).unwrap();
        assert!(storage.contains("1"));

        let mut dropped = storage.begin();
        storage.store_in(&mut dropped, &[msg("2", "t")], Utc::now()).await.unwrap();
        drop(dropped);
        assert_eq!(storage.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_ids_keep_first_row_and_delete_is_idempotent() {
        let storage = InMemoryOutboxStorage::new();
        let first = Message::builder().id("1").topic("t").payload(b"a".to_vec()).build();
        let second = Message::builder().id("1").topic("t").payload(b"b".to_vec()).build();
        storage.store(&[first.clone(), second], Utc::now()).await.unwrap();
        assert_eq!(storage.messages(), vec![first]);

        storage.delete(&["1".into(), "missing".into()]).await.unwrap();
        storage.delete(&["1".into()]).await.unwrap();
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn same_named_locks_are_exclusive() {
        let storage = Arc::new(InMemoryOutboxStorage::new());
        let keys = vec!["producer".to_string(), "default".to_string()];
        let held = storage.lock(&keys).await.unwrap();
        assert_eq!(held.name(), "outbus:producer:default");

        let other = storage.lock(&["consumer".to_string()]).await.unwrap();
        other.release().await.unwrap();

        let waiter = {
            let storage = storage.clone();
            let keys = keys.clone();
            tokio::spawn(async move { storage.lock(&keys).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        held.release().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn unavailable_storage_fails_every_call() {
        let storage = InMemoryOutboxStorage::new();
        storage.set_unavailable(true);
        let err = storage.store(&[msg("1", "t")], Utc::now()).await.unwrap_err();
        assert!(matches!(err, MessagingError::Storage { .. }));

        storage.set_unavailable(false);
        storage.store(&[msg("1", "t")], Utc::now()).await.unwrap();
        assert_eq!(storage.len(), 1);
    }
}
