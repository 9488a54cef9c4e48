//! Consumer side of the bridge.
//!
//! This module contains:
//! - `MessageHandler` trait: user code invoked once per delivered message
//! - `dispatch_batch`: the shared per-message dispatch policy
//! - `ReportSink`: optional channel receiving each batch's `BatchReport`
//! - `pull`: consumer-driven polling loop
//! - `push`: broker-driven subscription

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::debug;

use crate::events::{self, ConsumeKind};
use crate::message::MessageExt;

pub mod pull;
pub mod push;

pub use pull::PullConsumer;
pub use push::PushConsumer;

/// Error returned by a message handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Handler for messages delivered by either consumer loop.
///
/// Push consumers may call `handle` concurrently for different batches.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: Arc<MessageExt>) -> BoxFuture<'static, Result<(), HandlerError>>;
}

/// Handler built from a closure returning a future.
pub struct FnHandler<F>(F);

impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Arc<MessageExt>) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn handle(&self, message: Arc<MessageExt>) -> BoxFuture<'static, Result<(), HandlerError>> {
        (self.0)(message).boxed()
    }
}

/// Wrap a closure as a shared [`MessageHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Arc<MessageExt>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Outcome of handling one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Success,
    Failure(String),
}

impl DeliveryOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, DeliveryOutcome::Success)
    }
}

impl fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryOutcome::Success => f.write_str("success"),
            DeliveryOutcome::Failure(cause) => write!(f, "failure: {}", cause),
        }
    }
}

/// Per-message outcomes of one dispatched batch, in delivery order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub outcomes: Vec<(String, DeliveryOutcome)>,
}

impl BatchReport {
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn failures(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| !o.is_success()).count()
    }

    pub fn all_succeeded(&self) -> bool {
        self.failures() == 0
    }
}

/// Receives one [`BatchReport`] per dispatched batch.
pub type ReportSink = mpsc::UnboundedSender<BatchReport>;

/// Hand `report` to `sink` when one is attached. A dropped receiver only
/// stops the reports, never the consumer.
pub(crate) fn forward_report(topic: &str, sink: Option<&ReportSink>, report: BatchReport) {
    if let Some(sink) = sink {
        if sink.send(report).is_err() {
            debug!(topic = %topic, "Batch report receiver dropped");
        }
    }
}

/// Invoke the handler for every message in the batch, in order.
///
/// A handler failure is logged and the next message is still handled; the
/// batch never stops early.
pub async fn dispatch_batch(
    kind: ConsumeKind,
    topic: &str,
    handler: &dyn MessageHandler,
    messages: Vec<MessageExt>,
) -> BatchReport {
    let mut report = BatchReport::default();

    for message in messages {
        let message = Arc::new(message);
        let outcome = match handler.handle(Arc::clone(&message)).await {
            Ok(()) => {
                events::consume_out(kind, topic, &message);
                DeliveryOutcome::Success
            }
            Err(e) => {
                events::consume_err(kind, topic, &message, &e);
                DeliveryOutcome::Failure(e.to_string())
            }
        };
        report.outcomes.push((message.msg_id.clone(), outcome));
    }

    report
}

#[cfg(test)]
mod tests;
