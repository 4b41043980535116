//! 事务性 Outbox 与消息总线核心库（outbus-core）
//!
//! 以关系型存储为可靠积压、以可插拔 Broker 为传输的消息骨干，提供：
//! - 消息信封（`message`）、主题寻址（`topic`）与载荷信封（`envelope`）
//! - 以类型常量为键的结构化消息注册表（`structured` / `registry`）
//! - 存储与 Broker 的契约（`storage` / `broker`），具体引擎由适配器提供
//! - Outbox 投递循环（`outbox`）：咨询锁内排空积压，失败无限退避重试
//! - 处理队列策略（`queue`）与直接消费存储表的消费者（`consumer`）
//! - 内存适配器（`inmemory`，默认开启），用于测试与本地开发
//!
//! 投递语义为“至少一次”：消息 ID 在重试间保持不变，处理器需要幂等。
//!
//! 典型用法：
//! 1. 用 `#[message(type = "...")]` 定义消息并注册到 `MessageRegistry`；
//! 2. 在业务事务内通过 `TransactionalOutbox::store_in` 写入消息；
//! 3. 启动 `OutboxProducer` 将积压投递到 Broker；
//! 4. 通过 `ConsumerFactory` 订阅主题，或用 `StorageConsumer` 直接消费存储表。
//!
pub mod backoff;
pub mod broker;
pub mod consumer;
pub mod envelope;
pub mod error;
#[cfg(feature = "inmemory")]
pub mod inmemory;
pub mod lifecycle;
pub mod message;
pub mod outbox;
pub mod queue;
pub mod registry;
pub mod storage;
pub mod structured;
pub mod topic;

pub use error::{MessagingError, MessagingResult};
pub use message::{ConsumerMessage, Message};
pub use structured::StructuredMessage;
pub use topic::{MessageClass, Topic};

// 允许在本 crate 内部通过 ::outbus_core 进行自引用，
// 以便过程宏在本 crate 的单元测试中也能解析到 ::outbus_core 路径。
extern crate self as outbus_core;
