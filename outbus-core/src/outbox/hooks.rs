use crate::{error::MessagingError, message::Message};
use tracing::{debug, warn};

/// 投递过程的观测钩子，均为可选；用于日志/指标，不在关键路径上改变结果
pub trait OutboxHooks: Send + Sync {
    fn on_error(&self, _err: &MessagingError) {}

    fn on_batch_found(&self, _size: usize) {}

    fn on_message_sent(&self, _message: &Message) {}

    fn on_message_deleted(&self, _message: &Message) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopOutboxHooks;

impl OutboxHooks for NoopOutboxHooks {}

/// 基于 tracing 的钩子实现
#[derive(Debug, Clone)]
pub struct TracingOutboxHooks {
    producer: String,
}

impl TracingOutboxHooks {
    pub fn new(producer: impl Into<String>) -> Self {
        Self {
            producer: producer.into(),
        }
    }
}

impl OutboxHooks for TracingOutboxHooks {
    fn on_error(&self, err: &MessagingError) {
        warn!(producer = %self.producer, error = %err, "outbox drain failed");
    }

    fn on_batch_found(&self, size: usize) {
        debug!(producer = %self.producer, size, "outbox batch found");
    }

    fn on_message_sent(&self, message: &Message) {
        debug!(
            producer = %self.producer,
            id = %message.id(),
            topic = %message.topic(),
            "outbox message sent"
        );
    }

    fn on_message_deleted(&self, message: &Message) {
        debug!(producer = %self.producer, id = %message.id(), "outbox message deleted");
    }
}
