//! 组合处理器（CompositeHandler）
//!
//! 一个主题一个组合处理器：按载荷类型标签解码，再依注册顺序调用该类型的全部处理器。
//! 不认识的类型视为“无匹配处理器”，由调用方确认丢弃。
//!
use crate::error::{BusError, BusResult};
use crate::handler::{ErasedHandler, MessageContext, MessageHandler};
use outbus_core::message::ConsumerMessage;
use outbus_core::registry::{Decoded, MessageRegistry};
use outbus_core::structured::StructuredMessage;
use outbus_core::topic::Topic;
use std::collections::HashMap;
use tracing::{debug, warn};

/// 单条投递的分发结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// 已由 `handlers` 个处理器处理
    Handled { type_name: String, handlers: usize },
    /// 无匹配处理器
    Skipped { type_name: String },
}

impl Dispatch {
    pub fn type_name(&self) -> &str {
        match self {
            Dispatch::Handled { type_name, .. } | Dispatch::Skipped { type_name } => type_name,
        }
    }
}

pub struct CompositeHandler {
    topic: Topic,
    registry: MessageRegistry,
    handlers: HashMap<&'static str, Vec<ErasedHandler>>,
}

impl CompositeHandler {
    pub fn new(topic: Topic) -> Self {
        Self {
            topic,
            registry: MessageRegistry::new(),
            handlers: HashMap::new(),
        }
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// 追加 `T` 的处理器；同一类型下处理器名称不可重复
    pub fn add<T, H>(&mut self, handler: H) -> BusResult<()>
    where
        T: StructuredMessage,
        H: MessageHandler<T> + 'static,
    {
        let erased = ErasedHandler::new::<T, H>(handler);

        let existing = self.handlers.get(T::TYPE);
        if existing.is_some_and(|hs| hs.iter().any(|h| h.handler_name == erased.handler_name)) {
            return Err(BusError::DuplicateHandler {
                topic: self.topic.to_string(),
                type_name: T::TYPE,
                handler: erased.handler_name,
            });
        }

        if !self.registry.is_registered::<T>() {
            self.registry.register::<T>()?;
        }
        self.handlers.entry(T::TYPE).or_default().push(erased);
        Ok(())
    }

    /// 已注册的类型标签
    pub fn type_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.handlers.keys().copied()
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.values().map(Vec::len).sum()
    }

    /// 解码并依次调用处理器；任一处理器失败即返回错误，其后的处理器不再调用
    pub async fn handle(&self, delivery: &ConsumerMessage) -> BusResult<Dispatch> {
        let decoded = match self.registry.decode(delivery.message().payload())? {
            Decoded::Known(decoded) => decoded,
            Decoded::Unknown { type_name, .. } => {
                debug!(
                    topic = %self.topic,
                    message_id = delivery.id(),
                    message_type = %type_name,
                    "no handler for message type"
                );
                return Ok(Dispatch::Skipped { type_name });
            }
        };

        let type_name = decoded.type_name();
        let Some(handlers) = self.handlers.get(type_name) else {
            return Ok(Dispatch::Skipped {
                type_name: type_name.to_string(),
            });
        };

        let ctx = MessageContext::new(delivery, decoded.metadata().clone());
        for handler in handlers {
            if let Err(source) = handler.call(&ctx, &decoded).await {
                warn!(
                    topic = %self.topic,
                    message_id = delivery.id(),
                    message_type = type_name,
                    handler = %handler.handler_name,
                    error = %source,
                    "message handler failed"
                );
                return Err(BusError::Handler {
                    handler: handler.handler_name.clone(),
                    type_name: handler.type_name,
                    source,
                });
            }
        }

        Ok(Dispatch::Handled {
            type_name: type_name.to_string(),
            handlers: handlers.len(),
        })
    }
}

impl std::fmt::Debug for CompositeHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeHandler")
            .field("topic", &self.topic)
            .field("types", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
