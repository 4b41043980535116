//! 消息总线应用层（outbus-bus）
//!
//! 构建在 `outbus-core` 之上的应用侧 API：
//! - `BusProducer`：在业务事务内写入结构化消息，附加调用范围元数据
//! - `MessageHandler` / `handler_fn`：按具体消息类型编写处理器
//! - `CompositeHandler`：同一主题多个类型、多个处理器的顺序分发
//! - `BusListener`：基于 `ConsumerFactory` 的订阅、并发消费与确认
//! - `ProduceObserver` / `HandleObserver`：生产与消费两侧的观测钩子
//!
//! 示例见 `examples/outbox_roundtrip.rs`。
//!
pub mod composite;
pub mod error;
pub mod handler;
pub mod listener;
pub mod metadata;
pub mod observer;
pub mod producer;
pub mod scope;

pub use composite::{CompositeHandler, Dispatch};
pub use error::{BusError, BusResult};
pub use handler::{FnHandler, MessageContext, MessageHandler, handler_fn};
pub use listener::{
    BusListener, ListenerConfig, ListenerRegistry, Registration, register_event_handler,
    register_message_handler,
};
pub use metadata::{MetadataBuilder, ScopeMetadata, StaticMetadata};
pub use observer::{
    HandleObserver, HandleReport, NoopHandleObserver, NoopProduceObserver, ProduceObserver,
    ProduceReport, TracingHandleObserver, TracingProduceObserver,
};
pub use producer::{BusProducer, ProduceOptions};
pub use scope::CallScope;
