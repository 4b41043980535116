//! 端到端示例：业务事务内写入 → Outbox 投递 → 内存 Broker → 监听器处理
//!
//! 运行：`RUST_LOG=debug cargo run -p outbus-bus --example outbox_roundtrip`
//!
use anyhow::Result as AnyResult;
use outbus_bus::{
    BusListener, BusProducer, CallScope, ListenerConfig, MessageContext, ProduceOptions,
    TracingHandleObserver, TracingProduceObserver, handler_fn, register_event_handler,
};
use outbus_core::inmemory::{InMemoryBroker, InMemoryOutboxStorage};
use outbus_core::outbox::{OutboxProducer, OutboxProducerConfig, TracingOutboxHooks};
use outbus_core::registry::MessageRegistry;
use outbus_core::topic::MessageClass;
use outbus_macros::message;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[message(type = "duck.hatched", aggregate = "duck", key = pond)]
struct DuckHatched {
    name: String,
    pond: String,
}

#[tokio::main]
async fn main() -> AnyResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let storage = Arc::new(InMemoryOutboxStorage::new());
    let broker = InMemoryBroker::new();
    let registry = Arc::new(MessageRegistry::new().with::<DuckHatched>()?);

    // 监听器先订阅：内存 Broker 只投递给已存在的订阅
    let handled = Arc::new(AtomicUsize::new(0));
    let counter = handled.clone();
    let listener = BusListener::new(
        Arc::new(broker.clone()),
        ListenerConfig {
            subscriber: "nursery".into(),
            domain: "farm".into(),
            ..Default::default()
        },
        vec![register_event_handler::<DuckHatched, _>(handler_fn(
            "greet-duckling",
            move |ctx: MessageContext, duck: DuckHatched| {
                let counter = counter.clone();
                async move {
                    info!(
                        name = %duck.name,
                        pond = %duck.pond,
                        correlation_id = ctx.scope().correlation_id().unwrap_or("-"),
                        "duckling greeted"
                    );
                    counter.fetch_add(1, Ordering::SeqCst);
                    anyhow::Ok(())
                }
            },
        ))],
    )?
    .with_observer(Arc::new(TracingHandleObserver));
    listener.start().await?;

    let outbox = Arc::new(
        OutboxProducer::builder()
            .storage(storage.clone())
            .broker(Arc::new(broker.clone()))
            .hooks(Arc::new(TracingOutboxHooks::new("farm")))
            .config(OutboxProducerConfig {
                name: "farm".into(),
                poll_interval: Some(Duration::from_millis(200)),
                ..Default::default()
            })
            .build(),
    );
    outbox.start()?;

    let producer = BusProducer::builder()
        .storage(storage.clone())
        .registry(registry)
        .domain("farm")
        .observer(Arc::new(TracingProduceObserver))
        .outbox(outbox.clone())
        .build();

    // 业务事务：与业务数据一同提交
    let scope = CallScope::builder()
        .correlation_id("hatch-2024")
        .actor_type("farmer")
        .actor_id("f-1")
        .build();
    let ducks = ["Huey", "Dewey", "Louie"].map(|name| DuckHatched {
        id: String::new(),
        name: name.to_string(),
        pond: "north".to_string(),
    });

    let mut tx = storage.begin();
    producer
        .produce_in(&mut tx, &scope, MessageClass::Event, &ducks, &ProduceOptions::default())
        .await?;
    storage.commit(tx)?;
    outbox.process();

    tokio::time::timeout(Duration::from_secs(5), async {
        while handled.load(Ordering::SeqCst) < ducks.len() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await?;
    info!(handled = handled.load(Ordering::SeqCst), "all ducklings greeted");

    listener.stop().await?;
    outbox.stop().await?;
    Ok(())
}
