//! Producer gateway.
//!
//! Owns one broker connection and publishes each message once per declared
//! tag, synchronously, waiting for the broker's acknowledgement of every
//! send. A failed tag is logged and skipped; the remaining tags are still
//! sent. `publish` therefore succeeds whenever the gateway is running, and
//! per-tag results are visible through the emitted events and the returned
//! [`PublishReport`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::broker::{
    Broker, BrokerError, ClientOptions, PassthroughResolver, ProducerClient, Result, SendReceipt,
};
use crate::config::ProducerConfig;
use crate::events;
use crate::message::Message;
use crate::trace::{self, Context};

/// Result of sending one tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagOutcome {
    pub tag: String,
    pub result: std::result::Result<SendReceipt, BrokerError>,
}

impl TagOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Per-tag results of one `publish`, in tag order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub outcomes: Vec<TagOutcome>,
}

impl PublishReport {
    pub fn attempted(&self) -> usize {
        self.outcomes.len()
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failed_tags(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|o| !o.is_success())
            .map(|o| o.tag.as_str())
            .collect()
    }

    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(TagOutcome::is_success)
    }
}

struct ProducerInner {
    client: Arc<dyn ProducerClient>,
    trace_enabled: bool,
    running: AtomicBool,
}

/// Handle to a started producer.
///
/// Cheap to clone; clones share the same connection, so concurrent callers
/// may publish through one handle.
#[derive(Clone)]
pub struct Producer {
    inner: Arc<ProducerInner>,
}

impl Producer {
    /// Connect to the broker and start the client.
    ///
    /// Addresses are used as configured. Fails with `InvalidAddress` for a
    /// malformed address and `Connection` if the client cannot start.
    pub async fn start(broker: &dyn Broker, config: &ProducerConfig) -> Result<Self> {
        let resolver = PassthroughResolver::new(config.address.clone())?;
        let options = ClientOptions::producer(resolver, config.retry);
        let trace_enabled = options.trace_enabled;

        let client = broker.producer(options)?;
        client.start().await.map_err(|e| match e {
            BrokerError::Connection(_) => e,
            other => BrokerError::Connection(other.to_string()),
        })?;

        info!(
            addresses = ?config.address,
            retry = config.retry,
            "Producer started"
        );

        Ok(Self {
            inner: Arc::new(ProducerInner {
                client,
                trace_enabled,
                running: AtomicBool::new(true),
            }),
        })
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Send `message` once per tag, in tag order.
    ///
    /// The trace context is looked up in `ctx` under `trace_key`. Returns
    /// `NotRunning` if the producer was shut down; otherwise `Ok`, even when
    /// some or all tags failed.
    pub async fn publish(
        &self,
        ctx: &Context,
        trace_key: &str,
        message: &Message,
    ) -> Result<PublishReport> {
        if !self.is_running() {
            return Err(BrokerError::NotRunning);
        }

        let trace = trace::extract(ctx, trace_key);
        let mut report = PublishReport::default();

        for tag in &message.tags {
            let mut outbound = message.to_outbound(tag);
            if self.inner.trace_enabled {
                outbound = trace.inject(outbound);
            }

            events::produce_in(&trace, &outbound);
            let result = self.inner.client.send_sync(outbound.clone()).await;
            match &result {
                Ok(receipt) => events::produce_out(&trace, &outbound, receipt),
                Err(e) => events::produce_err(&trace, &outbound, e),
            }

            report.outcomes.push(TagOutcome {
                tag: tag.clone(),
                result,
            });
        }

        Ok(report)
    }

    /// Stop the broker connection.
    ///
    /// Only the first call reaches the client; later calls return `Ok`.
    pub async fn shutdown(&self) -> Result<()> {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.client.shutdown().await?;
        info!("Producer shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests;
