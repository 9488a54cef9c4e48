use super::*;
use crate::broker::MemoryBroker;
use crate::events::BridgeEvent;
use crate::test_utils::capture_events;
use crate::trace::TraceContext;

const TRACE_KEY: &str = "trace";

fn config(retry: u32) -> ProducerConfig {
    ProducerConfig::new(vec!["127.0.0.1:9876".to_string()], retry)
}

fn traced_context() -> Context {
    Context::new().with_value(TRACE_KEY, TraceContext::new("trace-1", "span-1", "child-1"))
}

#[tokio::test]
async fn test_publish_sends_once_per_tag_in_order() {
    let broker = MemoryBroker::new();
    let producer = Producer::start(&broker, &config(0)).await.unwrap();
    let message = Message::new("orders", "order-1").with_tags(["vip", "new", "eu"]);

    let report = producer
        .publish(&Context::new(), TRACE_KEY, &message)
        .await
        .unwrap();

    assert_eq!(report.attempted(), 3);
    assert!(report.all_succeeded());
    assert_eq!(
        broker.send_calls().await,
        vec![
            Some("vip".to_string()),
            Some("new".to_string()),
            Some("eu".to_string())
        ]
    );
}

#[tokio::test]
async fn test_publish_without_tags_sends_nothing() {
    let (recorder, _guard) = capture_events();
    let broker = MemoryBroker::new();
    let producer = Producer::start(&broker, &config(0)).await.unwrap();

    let report = producer
        .publish(&Context::new(), TRACE_KEY, &Message::new("orders", "x"))
        .await
        .unwrap();

    assert_eq!(report.attempted(), 0);
    assert!(broker.send_calls().await.is_empty());
    assert!(recorder.bridge_events().is_empty());
}

#[tokio::test]
async fn test_failed_tag_does_not_stop_later_tags() {
    let (recorder, _guard) = capture_events();
    let broker = MemoryBroker::new();
    broker.fail_sends_for_tag("vip").await;
    let producer = Producer::start(&broker, &config(2)).await.unwrap();
    let message = Message::new("orders", "order-1").with_tags(["vip", "new"]);

    let report = producer
        .publish(&traced_context(), TRACE_KEY, &message)
        .await
        .unwrap();

    assert_eq!(report.attempted(), 2);
    assert_eq!(report.succeeded(), 1);
    assert_eq!(report.failed_tags(), vec!["vip"]);
    assert_eq!(broker.messages("orders").await.len(), 1);
    assert_eq!(
        recorder.names(),
        vec!["produce_in", "produce_err", "produce_in", "produce_out"]
    );

    let err = &recorder.of(BridgeEvent::ProduceErr)[0];
    assert_eq!(err.field("tag"), Some("vip"));
    assert_eq!(err.field("trace_id"), Some("trace-1"));
    assert_eq!(err.field("body"), Some("order-1"));
    assert!(err.field("error").unwrap().contains("vip"));
}

#[tokio::test]
async fn test_publish_returns_ok_even_when_every_tag_fails() {
    let broker = MemoryBroker::new();
    broker.fail_sends_for_tag("a").await;
    broker.fail_sends_for_tag("b").await;
    let producer = Producer::start(&broker, &config(0)).await.unwrap();

    let report = producer
        .publish(
            &Context::new(),
            TRACE_KEY,
            &Message::new("orders", "x").with_tags(["a", "b"]),
        )
        .await
        .unwrap();

    assert_eq!(report.succeeded(), 0);
    assert_eq!(report.attempted(), 2);
}

#[tokio::test]
async fn test_success_event_carries_trace_and_receipt() {
    let (recorder, _guard) = capture_events();
    let broker = MemoryBroker::new();
    let producer = Producer::start(&broker, &config(0)).await.unwrap();

    producer
        .publish(
            &traced_context(),
            TRACE_KEY,
            &Message::new("orders", "order-1").with_tag("vip"),
        )
        .await
        .unwrap();

    let out = &recorder.of(BridgeEvent::ProduceOut)[0];
    assert_eq!(out.field("trace_id"), Some("trace-1"));
    assert_eq!(out.field("span_id"), Some("span-1"));
    assert_eq!(out.field("child_span_id"), Some("child-1"));
    assert_eq!(out.field("topic"), Some("orders"));
    assert!(out.field("receipt").unwrap().starts_with("msg_id="));
}

#[tokio::test]
async fn test_trace_is_stamped_on_sent_messages() {
    let broker = MemoryBroker::new();
    let producer = Producer::start(&broker, &config(0)).await.unwrap();

    producer
        .publish(
            &traced_context(),
            TRACE_KEY,
            &Message::new("orders", "x").with_tag("vip"),
        )
        .await
        .unwrap();

    let stored = broker.messages("orders").await;
    assert_eq!(
        TraceContext::from_message(&stored[0]),
        TraceContext::new("trace-1", "span-1", "child-1")
    );
}

#[tokio::test]
async fn test_missing_trace_logs_empty_ids() {
    let (recorder, _guard) = capture_events();
    let broker = MemoryBroker::new();
    let producer = Producer::start(&broker, &config(0)).await.unwrap();
    let ctx = Context::new().with_value(TRACE_KEY, 42u64);

    producer
        .publish(&ctx, TRACE_KEY, &Message::new("orders", "x").with_tag("vip"))
        .await
        .unwrap();

    let out = &recorder.of(BridgeEvent::ProduceOut)[0];
    assert_eq!(out.field("trace_id"), Some(""));
    assert_eq!(out.field("span_id"), Some(""));
    assert_eq!(out.field("child_span_id"), Some(""));
}

#[tokio::test]
async fn test_start_rejects_bad_address() {
    let broker = MemoryBroker::new();
    let result = Producer::start(&broker, &ProducerConfig::new(vec!["nope".to_string()], 0)).await;
    assert!(matches!(result, Err(BrokerError::InvalidAddress { .. })));
}

#[tokio::test]
async fn test_start_failure_is_connection_error() {
    let broker = MemoryBroker::new();
    broker.refuse_start(true);
    let result = Producer::start(&broker, &config(0)).await;
    assert!(matches!(result, Err(BrokerError::Connection(_))));
}

#[tokio::test]
async fn test_publish_after_shutdown_fails() {
    let broker = MemoryBroker::new();
    let producer = Producer::start(&broker, &config(0)).await.unwrap();

    producer.shutdown().await.unwrap();
    producer.shutdown().await.unwrap();

    assert!(!producer.is_running());
    let result = producer
        .publish(&Context::new(), TRACE_KEY, &Message::new("orders", "x").with_tag("a"))
        .await;
    assert_eq!(result, Err(BrokerError::NotRunning));
    assert!(broker.send_calls().await.is_empty());
}

#[tokio::test]
async fn test_clones_share_connection() {
    let broker = MemoryBroker::new();
    let producer = Producer::start(&broker, &config(0)).await.unwrap();
    let clone = producer.clone();

    let ctx = Context::new();
    let message = Message::new("orders", "x").with_tag("a");
    let (first, second) = tokio::join!(
        producer.publish(&ctx, TRACE_KEY, &message),
        clone.publish(&ctx, TRACE_KEY, &message),
    );

    assert!(first.unwrap().all_succeeded());
    assert!(second.unwrap().all_succeeded());
    assert_eq!(broker.messages("orders").await.len(), 2);

    clone.shutdown().await.unwrap();
    assert!(!producer.is_running());
}
