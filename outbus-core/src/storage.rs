//! Outbox 存储（OutboxStorage）协议
//!
//! 持久化待投递消息的积压表，核心层只依赖以下契约：
//! - `lock`：按名称获取跨实例的咨询锁（advisory lock）；
//! - `get_batch`：按计划时间顺序取出一批到期消息（可排除正在处理的 ID）；
//! - `store`：写入消息；`TransactionalOutbox::store_in` 在调用方事务内写入；
//! - `delete`：按 ID 幂等删除。
//!
//! 表的逻辑结构由核心层约定：主键 `(id[, topic])`，列 `topic, key, payload, scheduled_at`，
//! `scheduled_at`（以及多主题消费场景下的 `topic`）上建索引；具体存储引擎由适配器决定。
//!
use crate::{error::MessagingResult as Result, message::Message};
use async_trait::async_trait;
use bon::Builder;
use chrono::{DateTime, Utc};

/// 已获取的咨询锁，需显式释放
#[async_trait]
pub trait AdvisoryLock: Send {
    /// 锁名称（用于日志）
    fn name(&self) -> &str;

    async fn release(self: Box<Self>) -> Result<()>;
}

/// 批量查询条件
#[derive(Debug, Clone, Builder)]
pub struct BatchQuery {
    /// 只返回计划时间不晚于该时刻的消息
    #[builder(default = Utc::now())]
    pub scheduled_before: DateTime<Utc>,
    pub batch_size: usize,
    /// 为空表示不按主题过滤
    #[builder(default)]
    pub topics: Vec<String>,
    /// 需要排除的消息 ID（当前仍在处理中的消息）
    #[builder(default)]
    pub exclude_ids: Vec<String>,
}

#[async_trait]
pub trait OutboxStorage: Send + Sync {
    /// 获取以 `keys` 组合命名的咨询锁；锁被占用时等待
    async fn lock(&self, keys: &[String]) -> Result<Box<dyn AdvisoryLock>>;

    /// 按 `scheduled_at` 升序取出到期消息
    async fn get_batch(&self, query: &BatchQuery) -> Result<Vec<Message>>;

    /// 在存储自身的事务中写入消息
    async fn store(&self, messages: &[Message], scheduled_at: DateTime<Utc>) -> Result<()>;

    /// 按 ID 删除；不存在的 ID 被忽略
    async fn delete(&self, ids: &[String]) -> Result<()>;
}

/// 支持在调用方事务中写入的存储
///
/// 事务类型由适配器静态给出，业务写入与消息写入在同一事务内原子提交。
#[async_trait]
pub trait TransactionalOutbox: OutboxStorage {
    type Tx: Send;

    async fn store_in(
        &self,
        tx: &mut Self::Tx,
        messages: &[Message],
        scheduled_at: DateTime<Utc>,
    ) -> Result<()>;
}

/// 组合锁名称：`outbus:<key1>:<key2>...`
pub fn lock_name(keys: &[String]) -> String {
    std::iter::once("outbus")
        .chain(keys.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_names_are_scoped() {
        assert_eq!(lock_name(&[]), "outbus");
        assert_eq!(
            lock_name(&["producer".into(), "orders".into()]),
            "outbus:producer:orders"
        );
    }

    #[test]
    fn batch_query_defaults() {
        let q = BatchQuery::builder().batch_size(10).build();
        assert_eq!(q.batch_size, 10);
        assert!(q.topics.is_empty());
        assert!(q.exclude_ids.is_empty());
        assert!(q.scheduled_before <= Utc::now());
    }
}
