//! 总线监听器（BusListener）
//!
//! - 注册期：延迟注册闭包在构造时依次执行，按主题聚合到组合处理器；
//!   同一主题以不同订阅模式注册视为配置错误，此时尚未创建任何消费者。
//! - 运行期：每个主题一个消费者，消费流按 `concurrency` 并发分发；
//!   分发成功（含无匹配处理器）确认，失败否认；确认前先通知 `HandleObserver`。
//!
use crate::composite::{CompositeHandler, Dispatch};
use crate::error::{BusError, BusResult};
use crate::handler::MessageHandler;
use crate::observer::{HandleObserver, HandleReport, NoopHandleObserver};
use dashmap::DashMap;
use futures_core::stream::BoxStream;
use futures_util::StreamExt;
use outbus_core::broker::{Consumer, ConsumerFactory, ConsumptionType, Subscription};
use outbus_core::error::MessagingError;
use outbus_core::lifecycle::Lifecycle;
use outbus_core::message::ConsumerMessage;
use outbus_core::structured::StructuredMessage;
use outbus_core::topic::{MessageClass, Topic};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 监听器配置
#[derive(Clone, Debug)]
pub struct ListenerConfig {
    /// 订阅者名称，与主题共同确定订阅
    pub subscriber: String,
    /// 事件处理器默认主题的领域段
    pub domain: String,
    /// 每个消费者同时处理的消息数；0 按 1 处理
    pub concurrency: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            subscriber: "default".to_string(),
            domain: "default".to_string(),
            concurrency: 8,
        }
    }
}

impl ListenerConfig {
    fn effective_concurrency(&self) -> usize {
        self.concurrency.max(1)
    }
}

/// 延迟注册：在监听器构造时执行
pub type Registration = Box<dyn FnOnce(&mut ListenerRegistry) -> BusResult<()> + Send>;

/// 订阅事件：主题 = 监听器领域 + `T::AGGREGATE` + `event`，共享订阅
pub fn register_event_handler<T, H>(handler: H) -> Registration
where
    T: StructuredMessage,
    H: MessageHandler<T> + 'static,
{
    Box::new(move |registry: &mut ListenerRegistry| {
        let topic = Topic::builder(registry.domain())
            .aggregate(T::AGGREGATE)
            .class(MessageClass::Event)
            .build();
        registry.add::<T, H>(topic, ConsumptionType::Shared, handler)
    })
}

/// 订阅任意主题
pub fn register_message_handler<T, H>(
    topic: impl Into<Topic>,
    consumption_type: ConsumptionType,
    handler: H,
) -> Registration
where
    T: StructuredMessage,
    H: MessageHandler<T> + 'static,
{
    let topic = topic.into();
    Box::new(move |registry: &mut ListenerRegistry| {
        registry.add::<T, H>(topic, consumption_type, handler)
    })
}

struct Route {
    consumption_type: ConsumptionType,
    handler: CompositeHandler,
}

/// 注册表：主题 → (订阅模式, 组合处理器)
pub struct ListenerRegistry {
    domain: String,
    routes: HashMap<Topic, Route>,
}

impl ListenerRegistry {
    fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            routes: HashMap::new(),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn add<T, H>(
        &mut self,
        topic: Topic,
        consumption_type: ConsumptionType,
        handler: H,
    ) -> BusResult<()>
    where
        T: StructuredMessage,
        H: MessageHandler<T> + 'static,
    {
        if let Some(route) = self.routes.get(&topic) {
            if route.consumption_type != consumption_type {
                return Err(BusError::ConflictingConsumption {
                    topic: topic.to_string(),
                    existing: route.consumption_type,
                    requested: consumption_type,
                });
            }
        }

        self.routes
            .entry(topic.clone())
            .or_insert_with(|| Route {
                consumption_type,
                handler: CompositeHandler::new(topic),
            })
            .handler
            .add::<T, H>(handler)
    }
}

struct Binding {
    subscription: Subscription,
    handler: CompositeHandler,
}

pub struct BusListener {
    factory: Arc<dyn ConsumerFactory>,
    config: ListenerConfig,
    bindings: Vec<Arc<Binding>>,
    consumers: DashMap<Topic, Arc<dyn Consumer>>,
    observer: Arc<dyn HandleObserver>,
    lifecycle: Lifecycle,
    /// 串行化 start/stop
    transition: Mutex<()>,
}

impl BusListener {
    /// 执行全部注册；任何冲突在此返回，不会创建消费者
    pub fn new(
        factory: Arc<dyn ConsumerFactory>,
        config: ListenerConfig,
        registrations: Vec<Registration>,
    ) -> BusResult<Self> {
        let mut registry = ListenerRegistry::new(config.domain.clone());
        for register in registrations {
            register(&mut registry)?;
        }

        let mut bindings: Vec<_> = registry
            .routes
            .into_iter()
            .map(|(topic, route)| {
                Arc::new(Binding {
                    subscription: Subscription::new(
                        config.subscriber.clone(),
                        topic,
                        route.consumption_type,
                    ),
                    handler: route.handler,
                })
            })
            .collect();
        bindings.sort_by(|a, b| a.subscription.topic.cmp(&b.subscription.topic));

        let lifecycle = Lifecycle::new(format!("listener:{}", config.subscriber));
        Ok(Self {
            factory,
            config,
            bindings,
            consumers: DashMap::new(),
            observer: Arc::new(NoopHandleObserver),
            lifecycle,
            transition: Mutex::new(()),
        })
    }

    /// 替换消费观测（默认不观测）；在 `start` 之前调用
    pub fn with_observer(mut self, observer: Arc<dyn HandleObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.bindings.iter().map(|b| b.subscription.clone()).collect()
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle.is_running()
    }

    /// 为每个主题创建消费者并启动消费循环；任一订阅失败时关闭已创建的消费者
    pub async fn start(&self) -> BusResult<()> {
        let _transition = self.transition.lock().await;
        if self.lifecycle.is_running() {
            return Err(MessagingError::AlreadyRunning {
                component: self.lifecycle.component().to_string(),
            }
            .into());
        }

        let mut opened: Vec<(Arc<Binding>, Arc<dyn Consumer>, BoxStream<'static, ConsumerMessage>)> =
            Vec::with_capacity(self.bindings.len());
        for binding in &self.bindings {
            match self.open(&binding.subscription).await {
                Ok((consumer, stream)) => opened.push((binding.clone(), consumer, stream)),
                Err(err) => {
                    for (_, consumer, _) in &opened {
                        close_quietly(consumer.as_ref()).await;
                    }
                    return Err(err.into());
                }
            }
        }

        for (binding, consumer, _) in &opened {
            self.consumers
                .insert(binding.subscription.topic.clone(), consumer.clone());
        }

        let concurrency = self.config.effective_concurrency();
        let observer = self.observer.clone();
        self.lifecycle.start(move |token| {
            opened
                .into_iter()
                .map(|(binding, consumer, stream)| {
                    tokio::spawn(consume(
                        binding,
                        consumer,
                        observer.clone(),
                        stream,
                        token.clone(),
                        concurrency,
                    ))
                })
                .collect()
        })?;

        info!(
            subscriber = %self.config.subscriber,
            topics = self.bindings.len(),
            "bus listener started"
        );
        Ok(())
    }

    /// 停止消费循环（等待进行中的处理完成）并关闭全部消费者
    pub async fn stop(&self) -> BusResult<()> {
        let _transition = self.transition.lock().await;
        self.lifecycle.stop().await?;

        let topics: Vec<Topic> = self.consumers.iter().map(|e| e.key().clone()).collect();
        for topic in topics {
            if let Some((_, consumer)) = self.consumers.remove(&topic) {
                close_quietly(consumer.as_ref()).await;
            }
        }

        info!(subscriber = %self.config.subscriber, "bus listener stopped");
        Ok(())
    }

    async fn open(
        &self,
        subscription: &Subscription,
    ) -> Result<(Arc<dyn Consumer>, BoxStream<'static, ConsumerMessage>), MessagingError> {
        let consumer = self.factory.subscribe(subscription).await?;
        match consumer.messages().await {
            Ok(stream) => Ok((consumer, stream)),
            Err(err) => {
                close_quietly(consumer.as_ref()).await;
                Err(err)
            }
        }
    }
}

async fn consume(
    binding: Arc<Binding>,
    consumer: Arc<dyn Consumer>,
    observer: Arc<dyn HandleObserver>,
    stream: BoxStream<'static, ConsumerMessage>,
    token: CancellationToken,
    concurrency: usize,
) {
    stream
        .take_until(token.cancelled_owned())
        .for_each_concurrent(concurrency, |delivery| {
            let binding = binding.clone();
            let consumer = consumer.clone();
            let observer = observer.clone();
            async move { settle(&binding, consumer.as_ref(), observer.as_ref(), delivery).await }
        })
        .await;

    debug!(topic = %binding.subscription.topic, "consume loop exited");
}

async fn settle(
    binding: &Binding,
    consumer: &dyn Consumer,
    observer: &dyn HandleObserver,
    delivery: ConsumerMessage,
) {
    let topic = &binding.subscription.topic;
    let started = Instant::now();
    let outcome = binding.handler.handle(&delivery).await;

    let report = HandleReport {
        topic,
        message_id: delivery.id(),
        type_name: match &outcome {
            Ok(dispatch) => Some(dispatch.type_name()),
            Err(BusError::Handler { type_name, .. }) => Some(*type_name),
            Err(_) => None,
        },
        handled: matches!(outcome, Ok(Dispatch::Handled { .. })),
        elapsed: started.elapsed(),
    };
    observer.on_handled(&report, outcome.as_ref().err());

    match outcome {
        Ok(dispatch) => {
            if let Dispatch::Skipped { type_name } = &dispatch {
                debug!(topic = %topic, id = delivery.id(), message_type = %type_name, "acknowledging unhandled message");
            }
            if let Err(err) = consumer.ack(&delivery).await {
                warn!(topic = %topic, id = delivery.id(), error = %err, "failed to ack message");
            }
        }
        Err(err) => {
            debug!(topic = %topic, id = delivery.id(), error = %err, "nacking message");
            if let Err(err) = consumer.nack(&delivery).await {
                warn!(topic = %topic, id = delivery.id(), error = %err, "failed to nack message");
            }
        }
    }
}

async fn close_quietly(consumer: &dyn Consumer) {
    if let Err(err) = consumer.close().await {
        warn!(error = %err, "failed to close consumer");
    }
}
