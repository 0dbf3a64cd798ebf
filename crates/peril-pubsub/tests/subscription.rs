//! Integration tests for topology, publishing and subscriptions, run
//! against the in-memory broker.

use std::collections::BTreeMap;
use std::time::Duration;

use peril_broker::{
    BrokerChannel, ExchangeKind, MemoryBroker, MemoryConnection, OutboundMessage,
};
use peril_codec::{CborCodec, JsonCodec};
use peril_pubsub::{
    AckType, Binding, ConsumerEngine, PubSubConfig, PubSubError, Publisher, QueueClass,
    SubscriptionEnd, SubscriptionState,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

// =========================================================================
// Fixtures
// =========================================================================

const DIRECT: &str = "peril_direct";
const TOPIC: &str = "peril_topic";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PlayingState {
    #[serde(rename = "IsPaused")]
    is_paused: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct GameLog {
    username: String,
    message: String,
}

/// A broker with the game's exchanges declared, plus an engine using the
/// default config.
async fn setup() -> (MemoryBroker, MemoryConnection, ConsumerEngine) {
    let broker = MemoryBroker::new();
    let conn = broker.connect();
    let engine = ConsumerEngine::new(PubSubConfig::default());
    let topology = engine.topology();
    topology
        .declare_exchange(&conn, DIRECT, ExchangeKind::Direct)
        .await
        .unwrap();
    topology
        .declare_exchange(&conn, TOPIC, ExchangeKind::Topic)
        .await
        .unwrap();
    (broker, conn, engine)
}

fn pause_binding(username: &str) -> Binding {
    Binding::new(
        DIRECT,
        format!("pause.{username}"),
        "pause",
        QueueClass::Transient,
    )
}

fn logs_binding() -> Binding {
    Binding::new(TOPIC, "game_logs", "game_logs.*", QueueClass::Durable)
}

async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("handler should be called")
        .expect("handler channel open")
}

async fn assert_no_call<T: std::fmt::Debug>(rx: &mut mpsc::UnboundedReceiver<T>) {
    let res = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
    assert!(res.is_err(), "handler should not be called, got {res:?}");
}

/// Polls `check` until it holds or a second passes.
async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

// =========================================================================
// Pause scenario
// =========================================================================

#[tokio::test]
async fn test_pause_state_reaches_transient_subscriber() {
    let (broker, conn, engine) = setup().await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let handle = engine
        .subscribe(&conn, pause_binding("lincoln"), JsonCodec, move |state: PlayingState| {
            tx.send(state).unwrap();
            AckType::Ack
        })
        .await
        .unwrap();
    assert_eq!(handle.queue(), "pause.lincoln");
    assert_eq!(handle.state(), SubscriptionState::Consuming);

    let options = broker.queue_options("pause.lincoln").unwrap();
    assert!(!options.durable);
    assert!(options.exclusive);
    assert!(options.auto_delete);
    assert_eq!(options.dead_letter_exchange.as_deref(), Some("peril_dlx"));

    let publisher = Publisher::open(&conn).await.unwrap();
    publisher
        .publish_json(DIRECT, "pause", &PlayingState { is_paused: true })
        .await
        .unwrap();

    assert_eq!(recv(&mut rx).await, PlayingState { is_paused: true });
    eventually(|| {
        broker.queue_depth("pause.lincoln") == Some(0)
            && broker.unacked_count("pause.lincoln") == Some(0)
    })
    .await;
}

#[tokio::test]
async fn test_transient_queue_goes_away_with_connection() {
    let (broker, conn, engine) = setup().await;
    let client = broker.connect();

    let handle = engine
        .subscribe(&client, pause_binding("grant"), JsonCodec, |_: PlayingState| {
            AckType::Ack
        })
        .await
        .unwrap();
    assert!(broker.has_queue("pause.grant"));

    client.close();
    assert_eq!(handle.join().await.unwrap(), SubscriptionEnd::StreamClosed);
    assert!(!broker.has_queue("pause.grant"));

    // The publisher's connection is unaffected.
    let publisher = Publisher::open(&conn).await.unwrap();
    publisher
        .publish_json(DIRECT, "pause", &PlayingState { is_paused: false })
        .await
        .unwrap();
}

// =========================================================================
// Malformed payloads
// =========================================================================

#[tokio::test]
async fn test_malformed_payload_is_discarded_without_handler_call() {
    let (broker, conn, engine) = setup().await;
    engine
        .topology()
        .declare_dead_letter_route(&conn)
        .await
        .unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let _handle = engine
        .subscribe(&conn, logs_binding(), JsonCodec, move |log: GameLog| {
            tx.send(log).unwrap();
            AckType::Ack
        })
        .await
        .unwrap();

    let publisher = Publisher::open(&conn).await.unwrap();
    publisher
        .channel()
        .publish(
            TOPIC,
            "game_logs.lincoln",
            OutboundMessage {
                payload: b"{not json",
                content_type: "application/json",
                persistent: false,
            },
        )
        .await
        .unwrap();
    assert_no_call(&mut rx).await;

    eventually(|| broker.queue_depth("peril_dlq") == Some(1)).await;
    assert_eq!(broker.queue_depth("game_logs"), Some(0));
    assert_eq!(broker.unacked_count("game_logs"), Some(0));

    // The worker keeps going after a discard.
    let log = GameLog {
        username: "lincoln".into(),
        message: "took the hill".into(),
    };
    publisher
        .publish_json(TOPIC, "game_logs.lincoln", &log)
        .await
        .unwrap();
    assert_eq!(recv(&mut rx).await, log);
}

#[tokio::test]
async fn test_codec_mismatch_is_treated_as_malformed() {
    let (broker, conn, engine) = setup().await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let _handle = engine
        .subscribe(&conn, logs_binding(), JsonCodec, move |log: GameLog| {
            tx.send(log).unwrap();
            AckType::Ack
        })
        .await
        .unwrap();

    let publisher = Publisher::open(&conn).await.unwrap();
    let log = GameLog {
        username: "grant".into(),
        message: "moved".into(),
    };
    publisher
        .publish_cbor(TOPIC, "game_logs.grant", &log)
        .await
        .unwrap();

    assert_no_call(&mut rx).await;
    eventually(|| broker.unacked_count("game_logs") == Some(0)).await;
    assert_eq!(broker.queue_depth("game_logs"), Some(0));
}

// =========================================================================
// Verdicts
// =========================================================================

#[tokio::test]
async fn test_deliveries_are_handled_one_at_a_time_in_order() {
    let (_broker, conn, engine) = setup().await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let _handle = engine
        .subscribe(&conn, logs_binding(), CborCodec, move |n: u32| {
            tx.send(n).unwrap();
            AckType::Ack
        })
        .await
        .unwrap();

    let publisher = Publisher::open(&conn).await.unwrap();
    for n in 0..25u32 {
        publisher
            .publish_cbor(TOPIC, "game_logs.lincoln", &n)
            .await
            .unwrap();
    }

    for expected in 0..25u32 {
        assert_eq!(recv(&mut rx).await, expected);
    }
    assert_no_call(&mut rx).await;
}

#[tokio::test]
async fn test_nack_requeue_redelivers() {
    let (broker, conn, engine) = setup().await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let mut attempts = 0;
    let _handle = engine
        .subscribe(&conn, logs_binding(), JsonCodec, move |log: GameLog| {
            attempts += 1;
            tx.send((attempts, log)).unwrap();
            if attempts == 1 {
                AckType::NackRequeue
            } else {
                AckType::Ack
            }
        })
        .await
        .unwrap();

    let log = GameLog {
        username: "lincoln".into(),
        message: "retreat".into(),
    };
    let publisher = Publisher::open(&conn).await.unwrap();
    publisher
        .publish_json(TOPIC, "game_logs.lincoln", &log)
        .await
        .unwrap();

    assert_eq!(recv(&mut rx).await, (1, log.clone()));
    assert_eq!(recv(&mut rx).await, (2, log));
    eventually(|| broker.unacked_count("game_logs") == Some(0)).await;
    assert_eq!(broker.queue_depth("game_logs"), Some(0));
}

#[tokio::test]
async fn test_nack_discard_dead_letters() {
    let (broker, conn, engine) = setup().await;
    engine
        .topology()
        .declare_dead_letter_route(&conn)
        .await
        .unwrap();

    let _handle = engine
        .subscribe(&conn, logs_binding(), JsonCodec, |_: GameLog| {
            AckType::NackDiscard
        })
        .await
        .unwrap();

    let publisher = Publisher::open(&conn).await.unwrap();
    publisher
        .publish_json(
            TOPIC,
            "game_logs.lincoln",
            &GameLog {
                username: "lincoln".into(),
                message: "spam".into(),
            },
        )
        .await
        .unwrap();

    eventually(|| broker.queue_depth("peril_dlq") == Some(1)).await;
    assert_eq!(broker.queue_depth("game_logs"), Some(0));
}

#[tokio::test]
async fn test_dead_letter_override_leaves_queue_without_dlx() {
    let (broker, conn, engine) = setup().await;

    let _handle = engine
        .subscribe(
            &conn,
            logs_binding().with_dead_letter(false),
            JsonCodec,
            |_: GameLog| AckType::Ack,
        )
        .await
        .unwrap();

    assert_eq!(
        broker.queue_options("game_logs").unwrap().dead_letter_exchange,
        None
    );
}

// =========================================================================
// Failure and shutdown
// =========================================================================

#[tokio::test]
async fn test_ack_failure_fails_subscription() {
    let (broker, conn, engine) = setup().await;
    let client = broker.connect();
    let closer = client.clone();

    let handle = engine
        .subscribe(&client, logs_binding(), JsonCodec, move |_: GameLog| {
            // The delivery's channel goes away before it can be acked.
            closer.close();
            AckType::Ack
        })
        .await
        .unwrap();

    let publisher = Publisher::open(&conn).await.unwrap();
    publisher
        .publish_json(
            TOPIC,
            "game_logs.grant",
            &GameLog {
                username: "grant".into(),
                message: "hold".into(),
            },
        )
        .await
        .unwrap();

    assert_eq!(
        handle.wait_for(SubscriptionState::Closed).await,
        SubscriptionState::Failed
    );
    let err = handle.join().await.unwrap_err();
    assert!(matches!(err, PubSubError::AckProtocol { ref queue, .. } if queue == "game_logs"));
    assert!(err.is_terminal());

    // The unacked message went back to the durable queue.
    assert_eq!(broker.queue_depth("game_logs"), Some(1));
}

#[tokio::test]
async fn test_cancel_stops_worker_and_keeps_queue_consumable() {
    let (broker, conn, engine) = setup().await;

    let mut handle = engine
        .subscribe(&conn, logs_binding(), JsonCodec, |_: GameLog| AckType::Ack)
        .await
        .unwrap();
    assert!(handle.cancel());
    assert_eq!(
        handle.wait_for(SubscriptionState::Closed).await,
        SubscriptionState::Closed
    );
    assert_eq!(handle.join().await.unwrap(), SubscriptionEnd::Cancelled);
    assert_eq!(broker.consumer_count("game_logs"), 0);

    let log = GameLog {
        username: "lincoln".into(),
        message: "after cancel".into(),
    };
    let publisher = Publisher::open(&conn).await.unwrap();
    publisher
        .publish_json(TOPIC, "game_logs.lincoln", &log)
        .await
        .unwrap();
    assert_eq!(broker.queue_depth("game_logs"), Some(1));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _handle = engine
        .subscribe(&conn, logs_binding(), JsonCodec, move |log: GameLog| {
            tx.send(log).unwrap();
            AckType::Ack
        })
        .await
        .unwrap();
    assert_eq!(recv(&mut rx).await, log);
}

#[tokio::test]
async fn test_dropped_handle_detaches_worker() {
    let (_broker, conn, engine) = setup().await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    drop(
        engine
            .subscribe(&conn, logs_binding(), CborCodec, move |n: u32| {
                tx.send(n).unwrap();
                AckType::Ack
            })
            .await
            .unwrap(),
    );

    let publisher = Publisher::open(&conn).await.unwrap();
    publisher
        .publish_cbor(TOPIC, "game_logs.lincoln", &7u32)
        .await
        .unwrap();
    assert_eq!(recv(&mut rx).await, 7);
}

#[tokio::test]
async fn test_handler_panic_reports_worker_aborted() {
    let (broker, conn, engine) = setup().await;

    let handle = engine
        .subscribe(&conn, logs_binding(), CborCodec, |_: u32| -> AckType {
            panic!("handler bug")
        })
        .await
        .unwrap();

    let publisher = Publisher::open(&conn).await.unwrap();
    publisher
        .publish_cbor(TOPIC, "game_logs.lincoln", &1u32)
        .await
        .unwrap();

    assert_eq!(
        handle.wait_for(SubscriptionState::Failed).await,
        SubscriptionState::Failed
    );
    assert_eq!(handle.state(), SubscriptionState::Failed);
    let err = handle.join().await.unwrap_err();
    match err {
        PubSubError::WorkerAborted { queue, reason } => {
            assert_eq!(queue, "game_logs");
            assert!(reason.contains("handler bug"), "{reason}");
        }
        other => panic!("expected WorkerAborted, got {other:?}"),
    }

    // The channel is closed: no consumer left, the delivery is back in the queue.
    assert_eq!(broker.consumer_count("game_logs"), 0);
    assert_eq!(broker.unacked_count("game_logs"), Some(0));
    assert_eq!(broker.queue_depth("game_logs"), Some(1));
}

// =========================================================================
// Setup
// =========================================================================

#[tokio::test]
async fn test_subscribe_to_missing_exchange_fails_synchronously() {
    let (broker, conn, engine) = setup().await;
    let open_channels = broker.channel_count();

    let err = engine
        .subscribe(
            &conn,
            Binding::new("nope", "orphan", "pause", QueueClass::Durable),
            JsonCodec,
            |_: PlayingState| AckType::Ack,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, PubSubError::Connection(_)));
    assert_eq!(broker.consumer_count("orphan"), 0);
    assert_eq!(broker.channel_count(), open_channels);
}

#[tokio::test]
async fn test_redeclaring_binding_converges() {
    let (broker, conn, engine) = setup().await;
    let topology = engine.topology();

    let (first, _) = topology.declare_and_bind(&conn, &logs_binding()).await.unwrap();
    let (second, info) = topology.declare_and_bind(&conn, &logs_binding()).await.unwrap();
    assert_ne!(first.id(), second.id());
    assert_eq!(info.name, "game_logs");

    let publisher = Publisher::open(&conn).await.unwrap();
    publisher
        .publish_json(TOPIC, "game_logs.lincoln", &1u32)
        .await
        .unwrap();
    // One binding, one copy.
    assert_eq!(broker.queue_depth("game_logs"), Some(1));
}

#[tokio::test]
async fn test_conflicting_redeclaration_closes_channel() {
    let (broker, conn, engine) = setup().await;
    let topology = engine.topology();
    let (_first, _) = topology.declare_and_bind(&conn, &logs_binding()).await.unwrap();
    let open_channels = broker.channel_count();
    assert!(open_channels >= 1);

    let conflicting = Binding::new(TOPIC, "game_logs", "game_logs.*", QueueClass::Transient);
    let err = topology.declare_and_bind(&conn, &conflicting).await.unwrap_err();
    assert!(matches!(err, PubSubError::Connection(_)));
    assert!(broker.queue_options("game_logs").unwrap().durable);
    // The channel opened for the failed declaration is gone again.
    assert_eq!(broker.channel_count(), open_channels);
}

#[tokio::test]
async fn test_broker_named_queue() {
    let (_broker, conn, engine) = setup().await;

    let handle = engine
        .subscribe(
            &conn,
            Binding::new(DIRECT, "", "pause", QueueClass::Transient),
            JsonCodec,
            |_: PlayingState| AckType::Ack,
        )
        .await
        .unwrap();
    assert!(handle.queue().starts_with("amq.gen-"));
}

// =========================================================================
// Publishing
// =========================================================================

#[tokio::test]
async fn test_encode_failure_never_reaches_broker() {
    let (broker, conn, engine) = setup().await;
    engine
        .topology()
        .declare_and_bind(&conn, &logs_binding())
        .await
        .unwrap();

    let unencodable: BTreeMap<Vec<u8>, u8> = BTreeMap::from([(vec![1, 2], 3)]);
    let publisher = Publisher::open(&conn).await.unwrap();
    let err = publisher
        .publish_json(TOPIC, "game_logs.lincoln", &unencodable)
        .await
        .unwrap_err();
    assert!(matches!(err, PubSubError::Codec(_)));
    assert_eq!(broker.queue_depth("game_logs"), Some(0));
}

#[tokio::test]
async fn test_publish_to_missing_exchange_returns_broker_error() {
    let (_broker, conn, _engine) = setup().await;
    let publisher = Publisher::open(&conn).await.unwrap();

    let err = publisher
        .publish_json("nope", "pause", &PlayingState { is_paused: true })
        .await
        .unwrap_err();
    assert!(matches!(err, PubSubError::Broker(_)));
    assert!(!err.is_terminal());
}

#[tokio::test]
async fn test_publisher_close() {
    let (_broker, conn, _engine) = setup().await;
    let publisher = Publisher::open(&conn).await.unwrap();
    assert!(publisher.channel().is_open());
    publisher.close().await.unwrap();
}
