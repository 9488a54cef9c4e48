//! Push consumer.
//!
//! Registers a dispatch callback with the broker client and starts it. After
//! that, delivery is driven by the client; the callback may run
//! concurrently for different batches. Every batch is acknowledged as
//! consumed, whatever the handler returned for its messages.

use std::sync::Arc;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{dispatch_batch, forward_report, MessageHandler, ReportSink};
use crate::broker::{
    Broker, BrokerError, ClientOptions, ConsumeResult, DispatchFn, PassthroughResolver,
    PushClient, Result,
};
use crate::config::ConsumeConfig;
use crate::events::ConsumeKind;
use crate::message::{ConsumeSelector, MessageExt};

/// Handle to a subscribed, running push consumer.
pub struct PushConsumer {
    client: Arc<dyn PushClient>,
    topic: String,
    selector: ConsumeSelector,
    cancel: CancellationToken,
}

impl PushConsumer {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn selector(&self) -> &ConsumeSelector {
        &self.selector
    }

    /// Stop dispatching and shut the client down.
    pub async fn shutdown(&self) -> Result<()> {
        self.cancel.cancel();
        self.client.shutdown().await?;
        info!(topic = %self.topic, "Push consumer shut down");
        Ok(())
    }
}

/// Build the callback handed to the broker client.
///
/// Batches arriving after `cancel` fired are handed back for redelivery
/// without touching the handler. Handled batches are acknowledged whatever
/// their outcomes; those go to `reports` when given.
pub fn dispatcher(
    topic: String,
    handler: Arc<dyn MessageHandler>,
    cancel: CancellationToken,
    reports: Option<ReportSink>,
) -> DispatchFn {
    Arc::new(move |messages: Vec<MessageExt>| {
        let topic = topic.clone();
        let handler = Arc::clone(&handler);
        let cancel = cancel.clone();
        let reports = reports.clone();
        async move {
            if cancel.is_cancelled() {
                debug!(topic = %topic, count = messages.len(), "Push batch declined after cancel");
                return ConsumeResult::RetryLater;
            }
            let report = dispatch_batch(ConsumeKind::Push, &topic, handler.as_ref(), messages).await;
            forward_report(&topic, reports.as_ref(), report);
            ConsumeResult::Success
        }
        .boxed()
    })
}

/// Subscribe `handler` to the configured topic and start the client.
///
/// Construction, subscription and start failures are returned as-is; once
/// this returns `Ok` the client delivers on its own until
/// [`PushConsumer::shutdown`] or `cancel`.
pub async fn run(
    broker: &dyn Broker,
    config: ConsumeConfig,
    handler: Arc<dyn MessageHandler>,
    cancel: CancellationToken,
) -> Result<PushConsumer> {
    start(broker, config, handler, cancel, None).await
}

/// Like [`run`], also sending every batch's report to `reports`.
pub async fn run_with_reports(
    broker: &dyn Broker,
    config: ConsumeConfig,
    handler: Arc<dyn MessageHandler>,
    cancel: CancellationToken,
    reports: ReportSink,
) -> Result<PushConsumer> {
    start(broker, config, handler, cancel, Some(reports)).await
}

async fn start(
    broker: &dyn Broker,
    config: ConsumeConfig,
    handler: Arc<dyn MessageHandler>,
    cancel: CancellationToken,
    reports: Option<ReportSink>,
) -> Result<PushConsumer> {
    let resolver = PassthroughResolver::new(config.address.clone())?;
    let options = ClientOptions::consumer(resolver, config.retry, config.group_name.clone());
    let client = broker.push_consumer(options)?;

    let selector = ConsumeSelector::from_tags(&config.tags);
    let dispatch = dispatcher(config.topic.clone(), handler, cancel.clone(), reports);
    client
        .subscribe(&config.topic, selector.clone(), dispatch)
        .await?;
    client.start().await.map_err(|e| match e {
        BrokerError::Connection(_) => e,
        other => BrokerError::Connection(other.to_string()),
    })?;

    info!(
        group = %config.group_name,
        topic = %config.topic,
        selector = %selector,
        "Push consumer started"
    );

    Ok(PushConsumer {
        client,
        topic: config.topic,
        selector,
        cancel,
    })
}
