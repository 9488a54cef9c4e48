//! Broker client seam.
//!
//! This module contains:
//! - `Broker` trait: factory for the three client kinds
//! - `ProducerClient`, `PullClient`, `PushClient` traits: the primitives the
//!   bridge depends on (start/shutdown, send-with-ack, pull-batch,
//!   subscribe-with-callback)
//! - Value types exchanged with those clients
//! - Implementations: in-memory (standalone), Kafka

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::message::{ConsumeSelector, MessageExt, OutboundMessage};

// Implementation modules
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;
pub mod resolver;

// Re-exports
#[cfg(feature = "kafka")]
pub use kafka::{KafkaBroker, KafkaBrokerConfig};
pub use memory::MemoryBroker;
pub use resolver::PassthroughResolver;

// ============================================================================
// Errors
// ============================================================================

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors that can occur talking to the broker.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Invalid broker address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Pull failed: {0}")]
    Pull(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Client is not running")]
    NotRunning,

    #[error("Client already started")]
    AlreadyStarted,
}

// ============================================================================
// Value types
// ============================================================================

/// Options every client is constructed with.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub resolver: PassthroughResolver,
    /// Extra attempts the client makes on a transient send failure.
    pub retry: u32,
    /// Consumer group; `None` for producers.
    pub group_name: Option<String>,
    /// Stamp/recover trace properties on messages.
    pub trace_enabled: bool,
}

impl ClientOptions {
    pub fn producer(resolver: PassthroughResolver, retry: u32) -> Self {
        Self {
            resolver,
            retry,
            group_name: None,
            trace_enabled: true,
        }
    }

    pub fn consumer(
        resolver: PassthroughResolver,
        retry: u32,
        group_name: impl Into<String>,
    ) -> Self {
        Self {
            resolver,
            retry,
            group_name: Some(group_name.into()),
            trace_enabled: true,
        }
    }
}

/// Broker acknowledgement for a synchronous send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub msg_id: String,
    /// Queue (partition) the message landed in.
    pub queue_id: i32,
    pub queue_offset: i64,
}

impl fmt::Display for SendReceipt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "msg_id={} queue={} offset={}",
            self.msg_id, self.queue_id, self.queue_offset
        )
    }
}

/// Status of a single pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullStatus {
    /// At least one message was returned.
    Found,
    /// No new messages on the topic.
    NotFound,
    /// New messages existed but none passed the selector.
    NoMatched,
    /// The consumer's offset is outside the topic's range.
    OffsetIllegal,
}

/// Result of a single pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullResult {
    pub status: PullStatus,
    pub messages: Vec<MessageExt>,
    pub next_begin_offset: i64,
}

impl PullResult {
    pub fn found(messages: Vec<MessageExt>, next_begin_offset: i64) -> Self {
        Self {
            status: PullStatus::Found,
            messages,
            next_begin_offset,
        }
    }

    pub fn empty(status: PullStatus, next_begin_offset: i64) -> Self {
        Self {
            status,
            messages: Vec::new(),
            next_begin_offset,
        }
    }
}

/// Aggregate result a push dispatch callback reports back to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeResult {
    /// Batch consumed; do not redeliver.
    Success,
    /// Batch not consumed; redeliver later.
    RetryLater,
}

/// Callback the push client invokes with each delivered batch.
///
/// May be invoked concurrently for different batches.
pub type DispatchFn = Arc<dyn Fn(Vec<MessageExt>) -> BoxFuture<'static, ConsumeResult> + Send + Sync>;

// ============================================================================
// Traits
// ============================================================================

/// Client used by the producer gateway.
///
/// Safe to share between concurrent publishers.
#[async_trait]
pub trait ProducerClient: Send + Sync {
    async fn start(&self) -> Result<()>;

    /// Send and wait for the broker's acknowledgement.
    ///
    /// Transient failures are retried internally up to the configured count.
    async fn send_sync(&self, message: OutboundMessage) -> Result<SendReceipt>;

    async fn shutdown(&self) -> Result<()>;
}

/// Client used by the pull consumer loop.
#[async_trait]
pub trait PullClient: Send + Sync {
    async fn start(&self) -> Result<()>;

    /// Pull up to `max` messages from `topic` matching `selector`.
    async fn pull(&self, topic: &str, selector: &ConsumeSelector, max: usize)
        -> Result<PullResult>;

    async fn shutdown(&self) -> Result<()>;
}

/// Client used by the push consumer.
#[async_trait]
pub trait PushClient: Send + Sync {
    /// Register `dispatch` for messages on `topic` matching `selector`.
    ///
    /// Must be called before `start`.
    async fn subscribe(
        &self,
        topic: &str,
        selector: ConsumeSelector,
        dispatch: DispatchFn,
    ) -> Result<()>;

    async fn start(&self) -> Result<()>;

    async fn shutdown(&self) -> Result<()>;
}

/// Factory for broker clients.
///
/// Implementations:
/// - `MemoryBroker`: in-process broker for standalone use and tests
/// - `KafkaBroker`: Apache Kafka via rdkafka
pub trait Broker: Send + Sync {
    fn producer(&self, options: ClientOptions) -> Result<Arc<dyn ProducerClient>>;

    fn pull_consumer(&self, options: ClientOptions) -> Result<Arc<dyn PullClient>>;

    fn push_consumer(&self, options: ClientOptions) -> Result<Arc<dyn PushClient>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_producer_options_enable_trace() {
        let resolver = PassthroughResolver::new(vec!["127.0.0.1:9876".to_string()]).unwrap();
        let options = ClientOptions::producer(resolver, 3);
        assert!(options.trace_enabled);
        assert_eq!(options.retry, 3);
        assert!(options.group_name.is_none());
    }

    #[test]
    fn test_consumer_options_carry_group() {
        let resolver = PassthroughResolver::new(vec!["127.0.0.1:9876".to_string()]).unwrap();
        let options = ClientOptions::consumer(resolver, 1, "orders-group");
        assert_eq!(options.group_name.as_deref(), Some("orders-group"));
    }

    #[test]
    fn test_pull_result_empty_has_no_messages() {
        let result = PullResult::empty(PullStatus::NotFound, 7);
        assert!(result.messages.is_empty());
        assert_eq!(result.next_begin_offset, 7);
    }

    #[test]
    fn test_send_receipt_display() {
        let receipt = SendReceipt {
            msg_id: "abc".to_string(),
            queue_id: 0,
            queue_offset: 4,
        };
        assert_eq!(receipt.to_string(), "msg_id=abc queue=0 offset=4");
    }
}
