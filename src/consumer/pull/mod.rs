//! Pull consumer loop.
//!
//! One pull at a time, one message per pull. The loop runs until its
//! cancellation token fires; handler failures and pull errors are logged and
//! never end it.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{dispatch_batch, forward_report, MessageHandler, ReportSink};
use crate::broker::{
    Broker, BrokerError, ClientOptions, PassthroughResolver, PullClient, PullStatus, Result,
};
use crate::config::ConsumeConfig;
use crate::events::{self, ConsumeKind};
use crate::message::ConsumeSelector;
use crate::utils::retry::IdleBackoff;

/// Messages requested per pull.
pub const PULL_BATCH_SIZE: usize = 1;

/// A started pull consumer, ready to run.
pub struct PullConsumer {
    client: Arc<dyn PullClient>,
    topic: String,
    selector: ConsumeSelector,
    backoff: IdleBackoff,
    reports: Option<ReportSink>,
}

impl PullConsumer {
    /// Resolve addresses, create the client for `group_name` and start it.
    ///
    /// Any failure here is fatal and returned to the caller.
    pub async fn start(broker: &dyn Broker, config: ConsumeConfig) -> Result<Self> {
        let resolver = PassthroughResolver::new(config.address.clone())?;
        let options = ClientOptions::consumer(resolver, config.retry, config.group_name.clone());
        let client = broker.pull_consumer(options)?;
        client.start().await.map_err(|e| match e {
            BrokerError::Connection(_) => e,
            other => BrokerError::Connection(other.to_string()),
        })?;

        let selector = ConsumeSelector::from_tags(&config.tags);
        info!(
            group = %config.group_name,
            topic = %config.topic,
            selector = %selector,
            "Pull consumer started"
        );

        Ok(Self {
            client,
            topic: config.topic,
            selector,
            backoff: IdleBackoff::new(config.idle_backoff.as_ref()),
            reports: None,
        })
    }

    /// Send the report of every dispatched batch to `sink`.
    pub fn with_reports(mut self, sink: ReportSink) -> Self {
        self.reports = Some(sink);
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn selector(&self) -> &ConsumeSelector {
        &self.selector
    }

    /// Pull and dispatch until `cancel` fires, then shut the client down.
    pub async fn run(
        mut self,
        handler: Arc<dyn MessageHandler>,
        cancel: CancellationToken,
    ) -> Result<()> {
        while !cancel.is_cancelled() {
            let pulled = tokio::select! {
                result = self.client.pull(&self.topic, &self.selector, PULL_BATCH_SIZE) => result,
                _ = cancel.cancelled() => break,
            };

            match pulled {
                Err(e) => {
                    events::pull_err(&self.topic, &e);
                    self.idle(&cancel).await;
                }
                Ok(result) if result.status == PullStatus::Found && !result.messages.is_empty() => {
                    self.backoff.reset();
                    events::pull_consume_in(&self.topic, &result);
                    let report = dispatch_batch(
                        ConsumeKind::Pull,
                        &self.topic,
                        handler.as_ref(),
                        result.messages,
                    )
                    .await;
                    forward_report(&self.topic, self.reports.as_ref(), report);
                }
                Ok(result) => {
                    debug!(
                        topic = %self.topic,
                        status = ?result.status,
                        next_begin_offset = result.next_begin_offset,
                        "Pull returned no messages"
                    );
                    self.idle(&cancel).await;
                }
            }
        }

        info!(topic = %self.topic, "Pull consumer cancelled");
        self.client.shutdown().await
    }

    /// Wait out the next idle delay unless cancelled first. Without a
    /// backoff the loop only yields to the runtime and re-pulls at once.
    async fn idle(&mut self, cancel: &CancellationToken) {
        match self.backoff.next_delay() {
            Some(delay) => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {}
                }
            }
            None => tokio::task::yield_now().await,
        }
    }
}

/// Start a pull consumer for `config` and run it until `cancel` fires.
pub async fn run(
    broker: &dyn Broker,
    config: ConsumeConfig,
    handler: Arc<dyn MessageHandler>,
    cancel: CancellationToken,
) -> Result<()> {
    PullConsumer::start(broker, config)
        .await?
        .run(handler, cancel)
        .await
}
