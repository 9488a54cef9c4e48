use super::*;
use crate::events::BridgeEvent;
use crate::test_utils::capture_events;
use crate::trace::{TraceContext, TRACE_ID_PROPERTY};
use bytes::Bytes;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

pub(crate) fn make_message(offset: i64, body: &str) -> MessageExt {
    let mut properties = HashMap::new();
    properties.insert(TRACE_ID_PROPERTY.to_string(), format!("trace-{}", offset));
    MessageExt {
        msg_id: format!("msg-{}", offset),
        topic: "events".to_string(),
        body: Bytes::from(body.to_string()),
        tag: Some("t".to_string()),
        properties,
        queue_offset: offset,
        born_timestamp: Utc::now(),
        reconsume_times: 0,
    }
}

/// Handler that fails on bodies starting with "bad" and counts calls.
pub(crate) fn picky_handler(calls: Arc<AtomicUsize>) -> Arc<dyn MessageHandler> {
    handler_fn(move |message: Arc<MessageExt>| {
        let calls = Arc::clone(&calls);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            if message.body_lossy().starts_with("bad") {
                return Err(HandlerError::from(format!("cannot handle {}", message.msg_id)));
            }
            Ok(())
        }
    })
}

#[tokio::test]
async fn test_dispatch_continues_after_handler_failure() {
    let (recorder, _guard) = capture_events();
    let calls = Arc::new(AtomicUsize::new(0));
    let handler = picky_handler(Arc::clone(&calls));

    let batch = vec![
        make_message(0, "good"),
        make_message(1, "bad"),
        make_message(2, "good"),
    ];
    let report = dispatch_batch(ConsumeKind::Pull, "events", handler.as_ref(), batch).await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(report.len(), 3);
    assert_eq!(report.failures(), 1);
    assert!(report.outcomes[0].1.is_success());
    assert_eq!(
        report.outcomes[1],
        (
            "msg-1".to_string(),
            DeliveryOutcome::Failure("cannot handle msg-1".to_string())
        )
    );
    assert_eq!(
        recorder.names(),
        vec!["pull_consume_out", "pull_consume_err", "pull_consume_out"]
    );
}

#[tokio::test]
async fn test_dispatch_logs_trace_from_message_properties() {
    let (recorder, _guard) = capture_events();
    let calls = Arc::new(AtomicUsize::new(0));
    let handler = picky_handler(calls);

    dispatch_batch(
        ConsumeKind::Push,
        "events",
        handler.as_ref(),
        vec![make_message(7, "good")],
    )
    .await;

    let events = recorder.of(BridgeEvent::PushConsumeOut);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].field("trace_id"), Some("trace-7"));
    assert_eq!(events[0].field("span_id"), Some(""));
    assert_eq!(events[0].field("topic"), Some("events"));
    assert_eq!(events[0].field("msg_id"), Some("msg-7"));
}

#[tokio::test]
async fn test_dispatch_empty_batch_invokes_nothing() {
    let (recorder, _guard) = capture_events();
    let calls = Arc::new(AtomicUsize::new(0));
    let handler = picky_handler(Arc::clone(&calls));

    let report = dispatch_batch(ConsumeKind::Pull, "events", handler.as_ref(), vec![]).await;

    assert!(report.is_empty());
    assert!(report.all_succeeded());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(recorder.bridge_events().is_empty());
}

#[test]
fn test_trace_context_from_message() {
    let message = make_message(3, "x");
    assert_eq!(
        TraceContext::from_message(&message),
        TraceContext::new("trace-3", "", "")
    );
}

#[test]
fn test_delivery_outcome_display() {
    assert_eq!(DeliveryOutcome::Success.to_string(), "success");
    assert_eq!(
        DeliveryOutcome::Failure("boom".to_string()).to_string(),
        "failure: boom"
    );
}
