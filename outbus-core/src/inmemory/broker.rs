use crate::broker::{BrokerProducer, Consumer, ConsumerFactory, ConsumptionType, Subscription};
use crate::error::{MessagingError, MessagingResult as Result};
use crate::message::{ConsumerMessage, Message};
use async_trait::async_trait;
use futures_core::stream::BoxStream;
use futures_util::stream;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// 单个订阅的共享队列；同订阅的消费者竞争消费
struct SubscriptionQueue {
    consumption_type: ConsumptionType,
    pending: Mutex<VecDeque<Message>>,
    notify: Notify,
    consumers: AtomicUsize,
}

impl SubscriptionQueue {
    fn pending(&self) -> MutexGuard<'_, VecDeque<Message>> {
        self.pending.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn push_back(&self, message: Message) {
        self.pending().push_back(message);
        self.notify.notify_one();
    }

    fn push_front(&self, message: Message) {
        self.pending().push_front(message);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Message> {
        self.pending().pop_front()
    }
}

#[derive(Default)]
struct BrokerState {
    subscriptions: Mutex<HashMap<(String, String), Arc<SubscriptionQueue>>>,
    sent: Mutex<Vec<Message>>,
    acked: Mutex<Vec<String>>,
    nacked: Mutex<Vec<String>>,
    failures: AtomicUsize,
}

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// 内存 Broker：同时充当生产者与消费者工厂
///
/// - 消息只投递给发送时已存在的订阅；
/// - `Exclusive` 订阅同一时刻只允许一个消费者；
/// - nack 的消息回到订阅队列头部重新投递。
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 让接下来的 `n` 次发送失败
    pub fn fail_next(&self, n: usize) {
        self.state.failures.store(n, Ordering::SeqCst);
    }

    /// 已成功发送的消息（按发送顺序）
    pub fn sent(&self) -> Vec<Message> {
        locked(&self.state.sent).clone()
    }

    pub fn acked(&self) -> Vec<String> {
        locked(&self.state.acked).clone()
    }

    pub fn nacked(&self) -> Vec<String> {
        locked(&self.state.nacked).clone()
    }

    fn take_failure(&self) -> bool {
        self.state
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl BrokerProducer for InMemoryBroker {
    async fn produce(&self, message: &Message) -> Result<()> {
        if self.take_failure() {
            return Err(MessagingError::broker("in-memory broker rejected the message"));
        }

        locked(&self.state.sent).push(message.clone());

        let targets: Vec<Arc<SubscriptionQueue>> = locked(&self.state.subscriptions)
            .iter()
            .filter(|((_, topic), _)| topic == message.topic())
            .map(|(_, queue)| queue.clone())
            .collect();
        for queue in targets {
            queue.push_back(message.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl ConsumerFactory for InMemoryBroker {
    async fn subscribe(&self, subscription: &Subscription) -> Result<Arc<dyn Consumer>> {
        let key = (
            subscription.subscriber.clone(),
            subscription.topic.to_string(),
        );

        let queue = {
            let mut subscriptions = locked(&self.state.subscriptions);
            let queue = subscriptions
                .entry(key)
                .or_insert_with(|| {
                    Arc::new(SubscriptionQueue {
                        consumption_type: subscription.consumption_type,
                        pending: Mutex::new(VecDeque::new()),
                        notify: Notify::new(),
                        consumers: AtomicUsize::new(0),
                    })
                })
                .clone();

            if queue.consumption_type != subscription.consumption_type {
                return Err(MessagingError::broker(format!(
                    "subscription {} is {}, cannot attach a {} consumer",
                    subscription.consumer_name(),
                    queue.consumption_type,
                    subscription.consumption_type
                )));
            }
            if queue.consumption_type == ConsumptionType::Exclusive
                && queue.consumers.load(Ordering::SeqCst) > 0
            {
                return Err(MessagingError::broker(format!(
                    "exclusive subscription {} already has a consumer",
                    subscription.consumer_name()
                )));
            }
            queue.consumers.fetch_add(1, Ordering::SeqCst);
            queue
        };

        debug!(consumer = %subscription.consumer_name(), "in-memory subscription attached");
        Ok(Arc::new(InMemoryConsumer {
            name: subscription.consumer_name(),
            queue,
            state: self.state.clone(),
            taken: AtomicBool::new(false),
            closed: CancellationToken::new(),
        }))
    }
}

struct InMemoryConsumer {
    name: String,
    queue: Arc<SubscriptionQueue>,
    state: Arc<BrokerState>,
    taken: AtomicBool,
    closed: CancellationToken,
}

#[async_trait]
impl Consumer for InMemoryConsumer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn messages(&self) -> Result<BoxStream<'static, ConsumerMessage>> {
        if self.taken.swap(true, Ordering::SeqCst) {
            return Err(MessagingError::AlreadySubscribed {
                consumer: self.name.clone(),
            });
        }

        let queue = self.queue.clone();
        let closed = self.closed.clone();
        let deliveries = stream::unfold((queue, closed), |(queue, closed)| async move {
            loop {
                if closed.is_cancelled() {
                    return None;
                }
                if let Some(message) = queue.pop() {
                    return Some((ConsumerMessage::new(message), (queue, closed)));
                }
                tokio::select! {
                    _ = closed.cancelled() => return None,
                    _ = queue.notify.notified() => {}
                }
            }
        });
        Ok(Box::pin(deliveries))
    }

    async fn ack(&self, message: &ConsumerMessage) -> Result<()> {
        locked(&self.state.acked).push(message.id().to_string());
        Ok(())
    }

    async fn nack(&self, message: &ConsumerMessage) -> Result<()> {
        locked(&self.state.nacked).push(message.id().to_string());
        self.queue.push_front(message.message().clone());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.is_cancelled() {
            self.closed.cancel();
            self.queue.consumers.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topic::Topic;
    use futures_util::StreamExt;
    use std::time::Duration;

    fn msg(id: &str, topic: &str) -> Message {
        Message::builder().id(id).topic(topic).build()
    }

    #[tokio::test]
    async fn delivers_to_matching_subscriptions_and_redelivers_nacks() {
        let broker = InMemoryBroker::new();
        let sub = Subscription::new("billing", Topic::from("orders"), ConsumptionType::Shared);
        let consumer = broker.subscribe(&sub).await.unwrap();
        let mut stream = consumer.messages().await.unwrap();

        broker.produce(&msg("1", "orders")).await.unwrap();
        broker.produce(&msg("x", "other")).await.unwrap();

        let first = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.id(), "1");
        consumer.nack(&first).await.unwrap();

        let again = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.id(), "1");
        consumer.ack(&again).await.unwrap();

        assert_eq!(broker.sent().len(), 2);
        assert_eq!(broker.nacked(), vec!["1".to_string()]);
        assert_eq!(broker.acked(), vec!["1".to_string()]);

        consumer.close().await.unwrap();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn exclusive_subscription_admits_one_consumer() {
        let broker = InMemoryBroker::new();
        let sub = Subscription::new("audit", Topic::from("orders"), ConsumptionType::Exclusive);
        let first = broker.subscribe(&sub).await.unwrap();
        assert!(broker.subscribe(&sub).await.is_err());

        let shared = Subscription::new("audit", Topic::from("orders"), ConsumptionType::Shared);
        assert!(broker.subscribe(&shared).await.is_err());

        first.close().await.unwrap();
        broker.subscribe(&sub).await.unwrap();
    }

    #[tokio::test]
    async fn stream_can_be_taken_once_and_failures_are_injected() {
        let broker = InMemoryBroker::new();
        let sub = Subscription::new("s", Topic::from("t"), ConsumptionType::Shared);
        let consumer = broker.subscribe(&sub).await.unwrap();
        let _stream = consumer.messages().await.unwrap();
        assert!(matches!(
            consumer.messages().await,
            Err(MessagingError::AlreadySubscribed { .. })
        ));

        broker.fail_next(2);
        assert!(broker.produce(&msg("1", "t")).await.is_err());
        assert!(broker.produce(&msg("1", "t")).await.is_err());
        broker.produce(&msg("1", "t")).await.unwrap();
        assert_eq!(broker.sent().len(), 1);
    }
}
