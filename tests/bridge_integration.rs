//! End-to-end tests over the in-memory broker.
//!
//! Producer, pull loop and push consumer wired together the way a host
//! process would, with delivery events captured for assertions.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use mqbridge::config::{ConsumeConfig, ProducerConfig};
use mqbridge::consumer::{handler_fn, pull, push, HandlerError, MessageHandler};
use mqbridge::events::BridgeEvent;
use mqbridge::message::{ConsumeSelector, Message, MessageExt, SelectorMode};
use mqbridge::producer::Producer;
use mqbridge::test_utils::capture_events;
use mqbridge::trace::{self, Context, TraceContext};
use mqbridge::MemoryBroker;

// ============================================================================
// Test Fixtures
// ============================================================================

const ADDRESS: &str = "127.0.0.1:9876";
const TRACE_KEY: &str = "trace";

fn producer_config(retry: u32) -> ProducerConfig {
    ProducerConfig::new(vec![ADDRESS.to_string()], retry)
}

fn consume_config(group: &str, topic: &str) -> ConsumeConfig {
    ConsumeConfig::new(vec![ADDRESS.to_string()], group, topic).with_trace_key(TRACE_KEY)
}

fn traced(trace_id: &str) -> Context {
    Context::new().with_value(TRACE_KEY, TraceContext::new(trace_id, "span", "child"))
}

/// Handler that records every message it sees and then fails or succeeds.
fn recording_handler(seen: Arc<Mutex<Vec<MessageExt>>>, fail: bool) -> Arc<dyn MessageHandler> {
    handler_fn(move |message: Arc<MessageExt>| {
        let seen = Arc::clone(&seen);
        async move {
            seen.lock().unwrap().push((*message).clone());
            if fail {
                return Err(HandlerError::from("handler rejected message"));
            }
            Ok(())
        }
    })
}

async fn wait_until(cond: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// ============================================================================
// Producer
// ============================================================================

#[tokio::test]
async fn test_publish_two_tags_with_transient_failure() {
    let (recorder, _guard) = capture_events();
    let broker = MemoryBroker::new();
    broker.fail_next_sends(1);
    let producer = Producer::start(&broker, &producer_config(3)).await.unwrap();

    let message = Message::new("orders", "order-1").with_tags(["vip", "new"]);
    let report = producer
        .publish(&traced("t-1"), TRACE_KEY, &message)
        .await
        .unwrap();

    assert!(report.all_succeeded());
    assert_eq!(
        broker.send_calls().await,
        vec![Some("vip".to_string()), Some("new".to_string())]
    );
    assert_eq!(broker.send_attempts(), 3);

    let out = recorder.of(BridgeEvent::ProduceOut);
    assert_eq!(out.len(), 2);
    assert_eq!(out[0].field("tag"), Some("vip"));
    assert_eq!(out[1].field("tag"), Some("new"));
    assert_eq!(recorder.count(BridgeEvent::ProduceErr), 0);

    producer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_publish_without_tags_is_a_successful_no_op() {
    let broker = MemoryBroker::new();
    let producer = Producer::start(&broker, &producer_config(0)).await.unwrap();

    let report = producer
        .publish(&Context::new(), TRACE_KEY, &Message::new("orders", "x"))
        .await
        .unwrap();

    assert_eq!(report.attempted(), 0);
    assert_eq!(broker.send_attempts(), 0);
}

// ============================================================================
// Trace Context
// ============================================================================

#[test]
fn test_extract_never_fails() {
    assert_eq!(trace::extract(&Context::new(), TRACE_KEY), TraceContext::default());

    let wrong_shape = Context::new().with_value(TRACE_KEY, "not a trace".to_string());
    let extracted = trace::extract(&wrong_shape, TRACE_KEY);
    assert_eq!(extracted.trace_id, "");
    assert_eq!(extracted.span_id, "");
    assert_eq!(extracted.child_span_id, "");
}

#[test]
fn test_selector_modes() {
    let none = ConsumeSelector::from_tags::<&str>(&[]);
    assert_eq!(none.mode, SelectorMode::None);

    let tagged = ConsumeSelector::from_tags(&["a", "b"]);
    assert_eq!(tagged.mode, SelectorMode::Tag);
    assert_eq!(tagged.expression, "a || b");
}

// ============================================================================
// Pull Consumer
// ============================================================================

#[tokio::test]
async fn test_pull_loop_keeps_pulling_empty_topic() {
    let (recorder, _guard) = capture_events();
    let broker = MemoryBroker::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let cancel = CancellationToken::new();

    let (result, _) = tokio::join!(
        pull::run(
            &broker,
            consume_config("pull-group", "events"),
            recording_handler(Arc::clone(&seen), false),
            cancel.clone(),
        ),
        async {
            wait_until(|| broker.pull_calls() >= 10).await;
            cancel.cancel();
        }
    );

    assert!(result.is_ok());
    assert!(seen.lock().unwrap().is_empty());
    assert!(recorder.bridge_events().is_empty());
}

#[tokio::test]
async fn test_pull_loop_receives_published_messages_with_trace() {
    let (recorder, _guard) = capture_events();
    let broker = MemoryBroker::new();
    let producer = Producer::start(&broker, &producer_config(0)).await.unwrap();
    producer
        .publish(
            &traced("t-pull"),
            TRACE_KEY,
            &Message::new("orders", "order-7").with_tags(["vip", "new"]),
        )
        .await
        .unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let cancel = CancellationToken::new();
    let config = consume_config("pull-group", "orders").with_tags(["new"]);

    let (result, _) = tokio::join!(
        pull::run(
            &broker,
            config,
            recording_handler(Arc::clone(&seen), false),
            cancel.clone(),
        ),
        async {
            wait_until(|| seen.lock().unwrap().len() == 1).await;
            cancel.cancel();
        }
    );

    assert!(result.is_ok());
    let seen = seen.lock().unwrap();
    assert_eq!(seen[0].tag.as_deref(), Some("new"));
    assert_eq!(TraceContext::from_message(&seen[0]).trace_id, "t-pull");

    let handled = &recorder.of(BridgeEvent::PullConsumeOut)[0];
    assert_eq!(handled.field("trace_id"), Some("t-pull"));
    assert_eq!(handled.field("body"), Some("order-7"));
}

// ============================================================================
// Push Consumer
// ============================================================================

#[tokio::test]
async fn test_push_reports_success_when_every_handler_fails() {
    let (recorder, _guard) = capture_events();
    let broker = MemoryBroker::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let consumer = push::run(
        &broker,
        consume_config("push-group", "orders"),
        recording_handler(Arc::clone(&seen), true),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    let producer = Producer::start(&broker, &producer_config(0)).await.unwrap();
    producer
        .publish(
            &traced("t-push"),
            TRACE_KEY,
            &Message::new("orders", "order-9").with_tags(["vip", "new"]),
        )
        .await
        .unwrap();

    wait_until(|| seen.lock().unwrap().len() == 2).await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    consumer.shutdown().await.unwrap();

    // Redelivery would show up as extra handler calls.
    assert_eq!(seen.lock().unwrap().len(), 2);
    let errors = recorder.of(BridgeEvent::PushConsumeErr);
    assert_eq!(errors.len(), 2);
    assert_eq!(errors[0].field("trace_id"), Some("t-push"));
    assert_eq!(recorder.count(BridgeEvent::PushConsumeOut), 0);
}

#[tokio::test]
async fn test_push_and_pull_groups_each_receive_messages() {
    let broker = MemoryBroker::new();
    let pushed = Arc::new(AtomicUsize::new(0));
    let push_handler = {
        let pushed = Arc::clone(&pushed);
        handler_fn(move |_message: Arc<MessageExt>| {
            let pushed = Arc::clone(&pushed);
            async move {
                pushed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    };
    let consumer = push::run(
        &broker,
        consume_config("push-group", "orders"),
        push_handler,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    let producer = Producer::start(&broker, &producer_config(0)).await.unwrap();
    producer
        .publish(
            &Context::new(),
            TRACE_KEY,
            &Message::new("orders", "x").with_tags(["a", "b", "c"]),
        )
        .await
        .unwrap();

    let pulled = Arc::new(Mutex::new(Vec::new()));
    let cancel = CancellationToken::new();
    let (result, _) = tokio::join!(
        pull::run(
            &broker,
            consume_config("pull-group", "orders"),
            recording_handler(Arc::clone(&pulled), false),
            cancel.clone(),
        ),
        async {
            wait_until(|| pulled.lock().unwrap().len() == 3).await;
            cancel.cancel();
        }
    );

    assert!(result.is_ok());
    wait_until(|| pushed.load(Ordering::SeqCst) == 3).await;

    consumer.shutdown().await.unwrap();
    producer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_push_subscribe_failure_aborts_run() {
    let broker = MemoryBroker::new();
    broker.refuse_subscribe(true);
    let seen = Arc::new(Mutex::new(Vec::new()));

    let result = push::run(
        &broker,
        consume_config("push-group", "orders"),
        recording_handler(seen, false),
        CancellationToken::new(),
    )
    .await;

    assert!(result.is_err());
}
