//! Outbox 投递（OutboxProducer）
//!
//! 后台循环在跨实例咨询锁保护下，把积压表中到期的消息逐条交付 Broker 后删除：
//! - `process()` 是非阻塞、可合并的“有活要干”信号；
//! - 任意错误释放锁并按指数退避无限重试整轮投递；
//! - 进程在“已发送”与“已删除”之间崩溃时，下一轮会重发（至少一次）。
//!
mod hooks;
mod producer;

pub use hooks::{NoopOutboxHooks, OutboxHooks, TracingOutboxHooks};
pub use producer::{OutboxProducer, OutboxProducerConfig};
