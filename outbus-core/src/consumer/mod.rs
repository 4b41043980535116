//! 存储消费者（StorageConsumer）
//!
//! 不经过 Broker，直接轮询 Outbox 存储表并以 `Consumer` 契约对外投递：
//! - 并发由处理队列的令牌池限制，确认语义由 `QueueStrategy` 决定；
//! - 在途集合用于查询排除，防止同一行在确认前被重复投递；
//! - 超时未确认的投递被强制释放，行保留在存储中，于后续扫描重新投递。
//!
mod in_flight;
mod storage_consumer;

pub use storage_consumer::{StorageConsumer, StorageConsumerConfig, StorageConsumerFactory};
