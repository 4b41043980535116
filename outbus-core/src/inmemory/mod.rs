//! 内存适配器
//!
//! 满足 `OutboxStorage` / `TransactionalOutbox` / `BrokerProducer` / `ConsumerFactory` 契约的进程内实现，
//! 用于测试、示例与本地开发；不具备持久性。
//!
mod broker;
mod storage;

pub use broker::InMemoryBroker;
pub use storage::{InMemoryOutboxStorage, InMemoryTransaction};
