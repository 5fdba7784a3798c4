// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Integration tests against a live broker.
//!
//! Ignored by default since they require a running RabbitMQ instance; point
//! them at one with the `AMQP_*` environment variables (localhost defaults
//! otherwise) and run `cargo test -- --ignored`.

use amqp_manager::{
    config::AmqpConfig,
    consumer::{ConsumerHandler, ConsumerMessage, SubscribeOptions},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    manager::{ConnectionManager, ManagerState},
    publisher::PublishOptions,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use opentelemetry::Context;
use serde_json::json;
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::mpsc, time::timeout};
use uuid::Uuid;

fn unique(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4())
}

async fn connected_manager() -> Arc<ConnectionManager> {
    let manager = ConnectionManager::new(AmqpConfig::from_env());
    manager.connect().await.expect("broker reachable");
    manager
}

async fn wait_for_count(counter: &AtomicUsize, at_least: usize) {
    timeout(Duration::from_secs(10), async {
        while counter.load(Ordering::SeqCst) < at_least {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("expected deliveries within the deadline");
}

struct Recording {
    seen: mpsc::UnboundedSender<serde_json::Value>,
}

#[async_trait]
impl ConsumerHandler for Recording {
    async fn handle(&self, _ctx: &Context, msg: &ConsumerMessage) -> Result<(), AmqpError> {
        let payload = msg.json::<serde_json::Value>()?;
        let _ = self.seen.send(payload);
        Ok(())
    }
}

struct Poison {
    deliveries: Arc<AtomicUsize>,
}

#[async_trait]
impl ConsumerHandler for Poison {
    async fn handle(&self, _ctx: &Context, msg: &ConsumerMessage) -> Result<(), AmqpError> {
        self.deliveries.fetch_add(1, Ordering::SeqCst);
        Err(AmqpError::ConsumeError(msg.queue.clone()))
    }
}

struct Sequential {
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
    handled: Arc<AtomicUsize>,
}

#[async_trait]
impl ConsumerHandler for Sequential {
    async fn handle(&self, _ctx: &Context, _msg: &ConsumerMessage) -> Result<(), AmqpError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.handled.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
#[ignore] // requires a running RabbitMQ instance
async fn repeated_connects_reuse_the_session() {
    let manager = connected_manager().await;
    assert!(manager.is_connected());

    manager.connect().await.expect("second connect is a no-op");
    manager.connect().await.expect("third connect is a no-op");
    assert_eq!(manager.state(), ManagerState::Connected);

    manager.disconnect().await.expect("clean shutdown");
    assert_eq!(manager.state(), ManagerState::Disconnected);
}

#[tokio::test]
#[ignore] // requires a running RabbitMQ instance
async fn identical_redeclarations_are_no_ops() {
    let manager = connected_manager().await;

    let exchange_name = unique("orders");
    let exchange = ExchangeDefinition::new(&exchange_name).auto_delete();
    manager.declare_exchange(&exchange).await.expect("first declaration");
    manager.declare_exchange(&exchange).await.expect("identical redeclaration");

    let queue_name = unique("orders.created");
    let queue = QueueDefinition::new(&queue_name).transient().auto_delete();
    manager.declare_queue(&queue).await.expect("first declaration");
    manager.declare_queue(&queue).await.expect("identical redeclaration");

    manager.disconnect().await.expect("clean shutdown");
}

#[tokio::test]
#[ignore] // requires a running RabbitMQ instance
async fn published_payloads_round_trip_to_a_subscriber() {
    let manager = connected_manager().await;

    let exchange_name = unique("orders");
    let queue_name = unique("orders.created");

    manager
        .declare_exchange(&ExchangeDefinition::new(&exchange_name).auto_delete())
        .await
        .expect("exchange declared");
    manager
        .declare_queue(&QueueDefinition::new(&queue_name).transient().auto_delete())
        .await
        .expect("queue declared");
    manager
        .bind_queue(
            &QueueBinding::new(&queue_name)
                .exchange(&exchange_name)
                .routing_key("order.created"),
        )
        .await
        .expect("queue bound");

    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    manager
        .subscribe(
            &queue_name,
            Arc::new(Recording { seen: seen_tx }),
            &SubscribeOptions::default(),
        )
        .await
        .expect("consumer registered");

    let payload = json!({"id": 1, "status": "created"});
    let options = PublishOptions {
        exchange: Some(exchange_name.clone()),
        ..PublishOptions::default()
    };
    let accepted = manager
        .publish("order.created", &payload, &options)
        .await
        .expect("publish accepted");
    assert!(accepted);

    let delivered = timeout(Duration::from_secs(5), seen_rx.recv())
        .await
        .expect("delivery within the deadline")
        .expect("subscription alive");
    assert_eq!(delivered, payload);

    manager.disconnect().await.expect("clean shutdown");
}

#[tokio::test]
#[ignore] // requires a running RabbitMQ instance
async fn failing_handlers_trigger_indefinite_redelivery() {
    let manager = connected_manager().await;

    let queue_name = unique("poison");
    manager
        .declare_queue(&QueueDefinition::new(&queue_name).transient().auto_delete())
        .await
        .expect("queue declared");

    let deliveries = Arc::new(AtomicUsize::new(0));
    manager
        .subscribe(
            &queue_name,
            Arc::new(Poison {
                deliveries: deliveries.clone(),
            }),
            &SubscribeOptions::default(),
        )
        .await
        .expect("consumer registered");

    manager
        .send_to_queue(&queue_name, &json!({"malformed": true}), &PublishOptions::default())
        .await
        .expect("publish accepted");

    // the single message must keep coming back rather than being dropped
    wait_for_count(&deliveries, 3).await;

    manager.disconnect().await.expect("clean shutdown");
}

#[tokio::test]
#[ignore] // requires a running RabbitMQ instance
async fn deliveries_are_dispatched_strictly_one_at_a_time() {
    let manager = connected_manager().await;

    let queue_name = unique("sequential");
    manager
        .declare_queue(&QueueDefinition::new(&queue_name).transient().auto_delete())
        .await
        .expect("queue declared");

    let active = Arc::new(AtomicUsize::new(0));
    let max_active = Arc::new(AtomicUsize::new(0));
    let handled = Arc::new(AtomicUsize::new(0));
    manager
        .subscribe(
            &queue_name,
            Arc::new(Sequential {
                active: active.clone(),
                max_active: max_active.clone(),
                handled: handled.clone(),
            }),
            &SubscribeOptions::default(),
        )
        .await
        .expect("consumer registered");

    for id in 0..3 {
        manager
            .send_to_queue(&queue_name, &json!({"id": id}), &PublishOptions::default())
            .await
            .expect("publish accepted");
    }

    wait_for_count(&handled, 3).await;
    assert_eq!(max_active.load(Ordering::SeqCst), 1);

    manager.disconnect().await.expect("clean shutdown");
}

#[tokio::test]
#[ignore] // requires a running RabbitMQ instance
async fn purge_empties_a_queue_outside_production() {
    let manager = connected_manager().await;

    let queue_name = unique("purgeable");
    manager
        .declare_queue(&QueueDefinition::new(&queue_name).transient().auto_delete())
        .await
        .expect("queue declared");
    manager
        .send_to_queue(&queue_name, &json!({"id": 1}), &PublishOptions::default())
        .await
        .expect("publish accepted");

    manager.purge_queue(&queue_name).await.expect("purge allowed");
    manager.delete_queue(&queue_name).await.expect("delete allowed");

    manager.disconnect().await.expect("clean shutdown");
}
