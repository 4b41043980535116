//! 消息处理器（MessageHandler）
//!
//! 处理某一具体结构化消息类型；可实现 trait，也可用 `handler_fn` 包装异步闭包。
//! 处理器在“至少一次”语义下运行，需要幂等。
//!
use crate::scope::CallScope;
use async_trait::async_trait;
use outbus_core::envelope::MessageMetadata;
use outbus_core::message::{ConsumerMessage, Message};
use outbus_core::registry::DecodedMessage;
use outbus_core::structured::StructuredMessage;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// 处理器可见的投递上下文
#[derive(Debug, Clone)]
pub struct MessageContext {
    message: Message,
    scope: CallScope,
    metadata: MessageMetadata,
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl MessageContext {
    pub fn new(delivery: &ConsumerMessage, metadata: MessageMetadata) -> Self {
        Self {
            message: delivery.message().clone(),
            scope: CallScope::from_metadata(&metadata),
            metadata,
            token: delivery.token().clone(),
            deadline: delivery.deadline(),
        }
    }

    pub fn message_id(&self) -> &str {
        self.message.id()
    }

    pub fn topic(&self) -> &str {
        self.message.topic()
    }

    pub fn key(&self) -> &str {
        self.message.key()
    }

    /// 生产方写入的调用范围
    pub fn scope(&self) -> &CallScope {
        &self.scope
    }

    pub fn metadata(&self) -> &MessageMetadata {
        &self.metadata
    }

    /// 投递被放弃（超时或关闭）时取消
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

#[async_trait]
pub trait MessageHandler<T: StructuredMessage>: Send + Sync {
    /// 处理器名称（用于日志与重复注册检查）
    fn handler_name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn handle(&self, ctx: &MessageContext, message: &T) -> anyhow::Result<()>;
}

/// 由异步闭包实现的处理器
pub struct FnHandler<T, F> {
    name: String,
    f: F,
    _marker: PhantomData<fn(T)>,
}

/// 以闭包构造处理器；闭包接收上下文与消息的副本
pub fn handler_fn<T, F, Fut>(name: impl Into<String>, f: F) -> FnHandler<T, F>
where
    T: StructuredMessage + Clone,
    F: Fn(MessageContext, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    FnHandler {
        name: name.into(),
        f,
        _marker: PhantomData,
    }
}

#[async_trait]
impl<T, F, Fut> MessageHandler<T> for FnHandler<T, F>
where
    T: StructuredMessage + Clone,
    F: Fn(MessageContext, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn handler_name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, ctx: &MessageContext, message: &T) -> anyhow::Result<()> {
        (self.f)(ctx.clone(), message.clone()).await
    }
}

type HandlerFuture<'a> = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>>;

type HandlerFn =
    Arc<dyn for<'a> Fn(&'a MessageContext, &'a DecodedMessage) -> HandlerFuture<'a> + Send + Sync>;

/// 类型擦除后的处理器：以 `DecodedMessage` 为入参，内部向下转型
#[derive(Clone)]
pub(crate) struct ErasedHandler {
    pub(crate) type_name: &'static str,
    pub(crate) handler_name: String,
    call: HandlerFn,
}

impl ErasedHandler {
    pub(crate) fn new<T, H>(handler: H) -> Self
    where
        T: StructuredMessage,
        H: MessageHandler<T> + 'static,
    {
        let handler = Arc::new(handler);
        let handler_name = handler.handler_name().to_string();

        let call = erase(move |ctx, decoded| {
            let handler = handler.clone();
            Box::pin(async move {
                // 键与闭包同一泛型 T，正常情况下向下转型不会失败
                match decoded.downcast_ref::<T>() {
                    Some(message) => handler.handle(ctx, message).await,
                    None => Err(anyhow::anyhow!(
                        "decoded `{}` is not a `{}`",
                        decoded.type_name(),
                        std::any::type_name::<T>()
                    )),
                }
            })
        });

        Self {
            type_name: T::TYPE,
            handler_name,
            call,
        }
    }

    pub(crate) async fn call(
        &self,
        ctx: &MessageContext,
        decoded: &DecodedMessage,
    ) -> anyhow::Result<()> {
        (self.call)(ctx, decoded).await
    }
}

fn erase<F>(f: F) -> HandlerFn
where
    F: for<'a> Fn(&'a MessageContext, &'a DecodedMessage) -> HandlerFuture<'a> + Send + Sync + 'static,
{
    Arc::new(f)
}
