use crate::error::BusError;
use outbus_core::error::MessagingError;
use outbus_core::topic::{MessageClass, Topic};
use std::time::Duration;
use tracing::{debug, warn};

/// 一次生产调用的摘要
#[derive(Debug, Clone)]
pub struct ProduceReport<'a> {
    pub topic: &'a Topic,
    pub type_name: &'static str,
    pub class: MessageClass,
    pub count: usize,
    /// 存储写入耗时
    pub elapsed: Duration,
}

/// 生产观测：包裹存储写入，只观察结果，不改变结果
pub trait ProduceObserver: Send + Sync {
    fn on_produced(&self, _report: &ProduceReport<'_>, _error: Option<&MessagingError>) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProduceObserver;

impl ProduceObserver for NoopProduceObserver {}

/// 基于 tracing 的观测实现
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingProduceObserver;

impl ProduceObserver for TracingProduceObserver {
    fn on_produced(&self, report: &ProduceReport<'_>, error: Option<&MessagingError>) {
        let elapsed_ms = report.elapsed.as_millis() as u64;
        match error {
            None => debug!(
                topic = %report.topic,
                message_type = report.type_name,
                class = %report.class,
                count = report.count,
                elapsed_ms,
                "messages stored in outbox"
            ),
            Some(err) => warn!(
                topic = %report.topic,
                message_type = report.type_name,
                class = %report.class,
                count = report.count,
                elapsed_ms,
                error = %err,
                "failed to store messages in outbox"
            ),
        }
    }
}

/// 一次消费分发的摘要（确认之前）
#[derive(Debug, Clone)]
pub struct HandleReport<'a> {
    pub topic: &'a Topic,
    pub message_id: &'a str,
    /// 负载无法解码时为 `None`
    pub type_name: Option<&'a str>,
    /// 至少一个处理器成功处理；无匹配处理器或失败时为 false
    pub handled: bool,
    /// 解码与处理器执行耗时
    pub elapsed: Duration,
}

/// 消费观测：监听器在每次分发后、确认或否认前调用
pub trait HandleObserver: Send + Sync {
    fn on_handled(&self, _report: &HandleReport<'_>, _error: Option<&BusError>) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHandleObserver;

impl HandleObserver for NoopHandleObserver {}

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingHandleObserver;

impl HandleObserver for TracingHandleObserver {
    fn on_handled(&self, report: &HandleReport<'_>, error: Option<&BusError>) {
        let elapsed_ms = report.elapsed.as_millis() as u64;
        let message_type = report.type_name.unwrap_or("-");
        match error {
            None => debug!(
                topic = %report.topic,
                id = report.message_id,
                message_type,
                handled = report.handled,
                elapsed_ms,
                "message dispatched"
            ),
            Some(err) => warn!(
                topic = %report.topic,
                id = report.message_id,
                message_type,
                elapsed_ms,
                error = %err,
                "message handling failed"
            ),
        }
    }
}
