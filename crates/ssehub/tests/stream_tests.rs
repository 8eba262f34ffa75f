//! End-to-end streaming tests over real sockets, plus fan-out under load.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use ssehub::client::StreamWriter;
use ssehub::{
    Consumer, ConsumerConfig, ConsumerState, Event, Hub, HubConfig, MemoryStore, UserClient,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

mod common;
use common::{spawn_server, test_config, unused_addr, wait_until};

async fn recv_id(rx: &mut mpsc::UnboundedReceiver<Event>) -> String {
    tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("consumer handler dropped")
        .id
}

fn collect(consumer: &Consumer, event_type: &str) -> mpsc::UnboundedReceiver<Event> {
    let (tx, rx) = mpsc::unbounded_channel();
    consumer.on(event_type, move |event| {
        let _ = tx.send(event);
    });
    rx
}

#[tokio::test]
async fn test_reconnect_replays_missed_events_before_live_ones() {
    let store = Arc::new(MemoryStore::new());
    let config = HubConfig {
        resend: true,
        replay_page_size: 2,
        ..test_config()
    };
    let hub = Hub::builder().config(config).store(store).build();
    let addr = spawn_server(&hub).await;

    // Persisted while nobody is connected.
    let history = (1..=7)
        .map(|i| Event::new("message", json!({ "n": i })).with_id(i.to_string()))
        .collect();
    hub.push(&[], history).await.unwrap();

    let consumer = Consumer::new(
        ConsumerConfig::new(format!("http://{addr}/events?uid=resumer")).last_event_id("5"),
    )
    .unwrap();
    let mut events = collect(&consumer, "message");
    consumer.connect().unwrap();

    assert_eq!(recv_id(&mut events).await, "6");
    assert_eq!(recv_id(&mut events).await, "7");

    hub.push(
        &["resumer".to_string()],
        vec![Event::new("message", json!({ "n": 8 })).with_id("8")],
    )
    .await
    .unwrap();
    assert_eq!(recv_id(&mut events).await, "8");
    assert_eq!(consumer.last_event_id().await.as_deref(), Some("8"));
    assert!(consumer.is_connected());

    consumer.disconnect();
    consumer.wait().await;
    hub.close(true).await;
}

#[tokio::test]
async fn test_consumer_gives_up_after_max_retries() {
    let addr = unused_addr().await;
    let consumer = Consumer::new(
        ConsumerConfig::new(format!("http://{addr}/events?uid=x"))
            .initial_backoff(Duration::from_millis(10))
            .max_retries(5),
    )
    .unwrap();

    consumer.connect().unwrap();
    tokio::time::timeout(Duration::from_secs(10), consumer.wait())
        .await
        .expect("consumer should give up");

    assert_eq!(consumer.attempts(), 5);
    assert_eq!(consumer.state(), ConsumerState::Terminated);
    assert!(!consumer.is_connected());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(consumer.attempts(), 5);
}

#[tokio::test]
async fn test_close_event_stops_consumer_without_retry() {
    let hub = Hub::new(test_config());
    let addr = spawn_server(&hub).await;

    let consumer = Consumer::new(
        ConsumerConfig::new(format!("http://{addr}/events?uid=leaver"))
            .initial_backoff(Duration::from_millis(10)),
    )
    .unwrap();
    consumer.connect().unwrap();

    assert!(wait_until(Duration::from_secs(3), || async { hub.online_clients_num() == 1 }).await);
    assert!(wait_until(Duration::from_secs(3), || async { consumer.is_connected() }).await);

    let started = std::time::Instant::now();
    hub.close(false).await;
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(hub.online_clients_num(), 0);

    tokio::time::timeout(Duration::from_secs(3), consumer.wait())
        .await
        .expect("close event should terminate the consumer");
    assert_eq!(consumer.attempts(), 1);
    assert_eq!(consumer.state(), ConsumerState::Terminated);
}

#[tokio::test]
async fn test_custom_event_types_dispatch_to_their_handlers() {
    let hub = Hub::new(test_config());
    let addr = spawn_server(&hub).await;

    let consumer =
        Consumer::new(ConsumerConfig::new(format!("http://{addr}/events?uid=typed"))).unwrap();
    let mut orders = collect(&consumer, "order");
    let mut messages = collect(&consumer, "message");
    consumer.connect().unwrap();
    assert!(wait_until(Duration::from_secs(3), || async { hub.online_clients_num() == 1 }).await);

    hub.push(
        &["typed".to_string()],
        vec![
            Event::new("order", json!({ "sku": "a" })).with_id("o1"),
            Event::new("message", json!("hi")).with_id("m1"),
        ],
    )
    .await
    .unwrap();

    assert_eq!(recv_id(&mut orders).await, "o1");
    assert_eq!(recv_id(&mut messages).await, "m1");

    consumer.disconnect();
    consumer.wait().await;
    hub.close(true).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_broadcasts_reach_every_client_once() {
    const CLIENTS: usize = 50;
    const PUSHES: usize = 1_000;

    let config = HubConfig {
        buffer_size: PUSHES * 2,
        delivery_queue_size: CLIENTS * PUSHES * 2,
        ..test_config()
    };
    let hub = Hub::new(config);

    let mut receivers = Vec::new();
    let mut bodies = Vec::new();
    for i in 0..CLIENTS {
        let (writer, body) = StreamWriter::channel();
        let (client, rx) = UserClient::new(
            format!("client-{i}"),
            hub.config().buffer_size,
            writer,
            CancellationToken::new(),
        );
        hub.register(client).await.unwrap();
        receivers.push(rx);
        bodies.push(body);
    }

    let pushes: Vec<_> = (0..PUSHES)
        .map(|i| {
            let hub = hub.clone();
            tokio::spawn(async move {
                hub.push(&[], vec![Event::new("tick", json!(i))]).await.unwrap();
            })
        })
        .collect();
    for push in pushes {
        push.await.unwrap();
    }

    for rx in &mut receivers {
        let mut seen = HashSet::new();
        for _ in 0..PUSHES {
            let item = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for broadcast")
                .expect("queue closed");
            match item {
                ssehub::client::Outbound::Event(event) => assert!(seen.insert(event.id)),
                other => panic!("unexpected item {other:?}"),
            }
        }
        assert_eq!(seen.len(), PUSHES);
        assert!(rx.try_recv().is_err());
    }

    let stats = hub.push_stats();
    assert_eq!(stats.total, (CLIENTS * PUSHES) as u64);
    assert_eq!(stats.failed, 0);
    hub.close(true).await;
}
