//! Kafka broker implementation.
//!
//! Topics map one-to-one onto Kafka topics. The message tag and the trace
//! properties travel as record headers; tag selection happens client side
//! after a record is received.
//! The broker acknowledgement for a send is the record's (partition, offset).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Header, Headers, Message as KafkaMessage, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{ClientConfig, Offset};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    Broker, BrokerError, ClientOptions, ConsumeResult, DispatchFn, ProducerClient, PullClient,
    PullResult, PullStatus, PushClient, Result, SendReceipt,
};
use crate::message::{ConsumeSelector, MessageExt, OutboundMessage};

/// Header carrying the message tag.
pub const TAG_HEADER: &str = "TAGS";

/// Configuration for Kafka connections.
///
/// Broker addresses, retry count and group come from [`ClientOptions`];
/// this holds the Kafka-specific settings.
#[derive(Clone, Debug)]
pub struct KafkaBrokerConfig {
    /// How long a send waits for the broker's acknowledgement.
    pub send_timeout: Duration,
    /// How long a single pull waits for a record.
    pub poll_timeout: Duration,
    /// Delay before a batch answered with `RetryLater` is redelivered.
    pub redelivery_delay: Duration,
    /// SASL username (optional, for authenticated clusters).
    pub sasl_username: Option<String>,
    /// SASL password (optional, for authenticated clusters).
    pub sasl_password: Option<String>,
    /// SASL mechanism (PLAIN, SCRAM-SHA-256, SCRAM-SHA-512).
    pub sasl_mechanism: Option<String>,
    /// Security protocol (PLAINTEXT, SSL, SASL_PLAINTEXT, SASL_SSL).
    pub security_protocol: Option<String>,
    /// SSL CA certificate path (for SSL connections).
    pub ssl_ca_location: Option<String>,
}

impl Default for KafkaBrokerConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(5),
            poll_timeout: Duration::from_secs(1),
            redelivery_delay: Duration::from_millis(500),
            sasl_username: None,
            sasl_password: None,
            sasl_mechanism: None,
            security_protocol: None,
            ssl_ca_location: None,
        }
    }
}

impl KafkaBrokerConfig {
    /// Add SASL authentication.
    pub fn with_sasl(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
        mechanism: impl Into<String>,
    ) -> Self {
        self.sasl_username = Some(username.into());
        self.sasl_password = Some(password.into());
        self.sasl_mechanism = Some(mechanism.into());
        self.security_protocol = Some("SASL_SSL".to_string());
        self
    }

    /// Set security protocol.
    pub fn with_security_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.security_protocol = Some(protocol.into());
        self
    }

    /// Set SSL CA certificate location.
    pub fn with_ssl_ca(mut self, ca_location: impl Into<String>) -> Self {
        self.ssl_ca_location = Some(ca_location.into());
        self
    }

    /// Build a ClientConfig for producers.
    fn build_producer_config(&self, options: &ClientOptions) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", options.resolver.joined());
        config.set("message.timeout.ms", self.send_timeout.as_millis().to_string());
        config.set("message.send.max.retries", options.retry.to_string());
        config.set("acks", "all");
        config.set("enable.idempotence", "true");

        self.apply_security_config(&mut config);
        config
    }

    /// Build a ClientConfig for consumers.
    fn build_consumer_config(&self, options: &ClientOptions, group: &str) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", options.resolver.joined());
        config.set("group.id", group);
        config.set("enable.auto.commit", "false");
        config.set("auto.offset.reset", "earliest");

        self.apply_security_config(&mut config);
        config
    }

    /// Apply security settings to a ClientConfig.
    fn apply_security_config(&self, config: &mut ClientConfig) {
        if let Some(ref protocol) = self.security_protocol {
            config.set("security.protocol", protocol);
        }

        if let Some(ref mechanism) = self.sasl_mechanism {
            config.set("sasl.mechanism", mechanism);
        }

        if let Some(ref username) = self.sasl_username {
            config.set("sasl.username", username);
        }

        if let Some(ref password) = self.sasl_password {
            config.set("sasl.password", password);
        }

        if let Some(ref ca_location) = self.ssl_ca_location {
            config.set("ssl.ca.location", ca_location);
        }
    }
}

/// Kafka-backed broker.
#[derive(Clone, Debug, Default)]
pub struct KafkaBroker {
    config: KafkaBrokerConfig,
}

impl KafkaBroker {
    pub fn new(config: KafkaBrokerConfig) -> Self {
        Self { config }
    }
}

impl Broker for KafkaBroker {
    fn producer(&self, options: ClientOptions) -> Result<Arc<dyn ProducerClient>> {
        let producer: FutureProducer =
            self.config
                .build_producer_config(&options)
                .create()
                .map_err(|e| {
                    BrokerError::Connection(format!("Failed to create Kafka producer: {}", e))
                })?;
        Ok(Arc::new(KafkaProducer {
            producer,
            send_timeout: self.config.send_timeout,
            bootstrap: options.resolver.joined(),
            running: AtomicBool::new(false),
        }))
    }

    fn pull_consumer(&self, options: ClientOptions) -> Result<Arc<dyn PullClient>> {
        let group = group_of(&options)?;
        let consumer = create_consumer(&self.config, &options, &group)?;
        Ok(Arc::new(KafkaPullConsumer {
            consumer,
            group,
            poll_timeout: self.config.poll_timeout,
            subscribed: Mutex::new(HashSet::new()),
            running: AtomicBool::new(false),
        }))
    }

    fn push_consumer(&self, options: ClientOptions) -> Result<Arc<dyn PushClient>> {
        let group = group_of(&options)?;
        let consumer = create_consumer(&self.config, &options, &group)?;
        Ok(Arc::new(KafkaPushConsumer {
            consumer: Arc::new(consumer),
            group,
            redelivery_delay: self.config.redelivery_delay,
            subscriptions: Mutex::new(HashMap::new()),
            task: Mutex::new(None),
            cancel: CancellationToken::new(),
            running: AtomicBool::new(false),
        }))
    }
}

fn group_of(options: &ClientOptions) -> Result<String> {
    match options.group_name.as_deref() {
        Some(group) if !group.is_empty() => Ok(group.to_string()),
        _ => Err(BrokerError::Connection(
            "Kafka consumer requires a group id".to_string(),
        )),
    }
}

fn create_consumer(
    config: &KafkaBrokerConfig,
    options: &ClientOptions,
    group: &str,
) -> Result<StreamConsumer> {
    config
        .build_consumer_config(options, group)
        .create()
        .map_err(|e| BrokerError::Connection(format!("Failed to create Kafka consumer: {}", e)))
}

/// Record headers for an outbound message: tag first, then properties.
pub(crate) fn record_headers(message: &OutboundMessage) -> OwnedHeaders {
    let mut headers = OwnedHeaders::new();
    if let Some(tag) = &message.tag {
        headers = headers.insert(Header {
            key: TAG_HEADER,
            value: Some(tag.as_str()),
        });
    }
    for (key, value) in &message.properties {
        headers = headers.insert(Header {
            key: key.as_str(),
            value: Some(value.as_str()),
        });
    }
    headers
}

/// Split headers back into the tag and the remaining properties.
pub(crate) fn decode_headers<H: Headers>(headers: Option<&H>) -> (Option<String>, HashMap<String, String>) {
    let mut tag = None;
    let mut properties = HashMap::new();
    let Some(headers) = headers else {
        return (tag, properties);
    };
    for header in headers.iter() {
        let value = header
            .value
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .unwrap_or_default();
        if header.key == TAG_HEADER {
            tag = Some(value);
        } else {
            properties.insert(header.key.to_string(), value);
        }
    }
    (tag, properties)
}

/// Message id for a record: `{topic}-{partition}-{offset}`.
pub(crate) fn message_id(topic: &str, partition: i32, offset: i64) -> String {
    format!("{}-{}-{}", topic, partition, offset)
}

fn to_message_ext<M: KafkaMessage>(record: &M) -> MessageExt {
    let (tag, properties) = decode_headers(record.headers());
    let born_timestamp = record
        .timestamp()
        .to_millis()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .unwrap_or_else(Utc::now);
    MessageExt {
        msg_id: message_id(record.topic(), record.partition(), record.offset()),
        topic: record.topic().to_string(),
        body: record
            .payload()
            .map(Bytes::copy_from_slice)
            .unwrap_or_default(),
        tag,
        properties,
        queue_offset: record.offset(),
        born_timestamp,
        reconsume_times: 0,
    }
}

struct KafkaProducer {
    producer: FutureProducer,
    send_timeout: Duration,
    bootstrap: String,
    running: AtomicBool,
}

#[async_trait]
impl ProducerClient for KafkaProducer {
    async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::AlreadyStarted);
        }
        info!(bootstrap_servers = %self.bootstrap, "Connected to Kafka");
        Ok(())
    }

    async fn send_sync(&self, message: OutboundMessage) -> Result<SendReceipt> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(BrokerError::NotRunning);
        }

        let headers = record_headers(&message);
        let record = FutureRecord::<(), [u8]>::to(&message.topic)
            .payload(&message.body[..])
            .headers(headers);

        let (partition, offset) = self
            .producer
            .send(record, self.send_timeout)
            .await
            .map_err(|(e, _)| BrokerError::Send(format!("Failed to publish: {}", e)))?;

        debug!(
            topic = %message.topic,
            partition,
            offset,
            "Published message to Kafka"
        );

        Ok(SendReceipt {
            msg_id: message_id(&message.topic, partition, offset),
            queue_id: partition,
            queue_offset: offset,
        })
    }

    async fn shutdown(&self) -> Result<()> {
        if self.running.swap(false, Ordering::SeqCst) {
            info!(bootstrap_servers = %self.bootstrap, "Kafka producer shut down");
        }
        Ok(())
    }
}

struct KafkaPullConsumer {
    consumer: StreamConsumer,
    group: String,
    poll_timeout: Duration,
    subscribed: Mutex<HashSet<String>>,
    running: AtomicBool,
}

impl KafkaPullConsumer {
    async fn ensure_subscribed(&self, topic: &str) -> Result<()> {
        let mut subscribed = self.subscribed.lock().await;
        let added = add_subscription(&mut subscribed, topic, |topics| {
            self.consumer
                .subscribe(topics)
                .map_err(|e| BrokerError::Pull(format!("Failed to subscribe to topics: {}", e)))
        })?;
        if added {
            info!(group = %self.group, topics = ?*subscribed, "Subscribed to Kafka topics");
        }
        Ok(())
    }
}

/// Subscribe to `topic` alongside the current set. The set only grows once
/// `subscribe` succeeds, so a failed call is retried on the next pull.
fn add_subscription<F>(subscribed: &mut HashSet<String>, topic: &str, subscribe: F) -> Result<bool>
where
    F: FnOnce(&[&str]) -> Result<()>,
{
    if subscribed.contains(topic) {
        return Ok(false);
    }
    let mut topics: Vec<&str> = subscribed.iter().map(String::as_str).collect();
    topics.push(topic);
    subscribe(&topics)?;
    subscribed.insert(topic.to_string());
    Ok(true)
}

#[async_trait]
impl PullClient for KafkaPullConsumer {
    async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::AlreadyStarted);
        }
        info!(group = %self.group, "Kafka pull consumer started");
        Ok(())
    }

    async fn pull(
        &self,
        topic: &str,
        selector: &ConsumeSelector,
        max: usize,
    ) -> Result<PullResult> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(BrokerError::NotRunning);
        }
        self.ensure_subscribed(topic).await?;

        let mut found = Vec::new();
        let mut scanned = false;
        let mut next_offset = -1;

        while found.len() < max.max(1) {
            let received = match tokio::time::timeout(self.poll_timeout, self.consumer.recv()).await
            {
                Ok(received) => received,
                Err(_) => break,
            };
            let record = received.map_err(|e| BrokerError::Pull(e.to_string()))?;
            scanned = true;
            next_offset = record.offset() + 1;

            let message = to_message_ext(&record);
            if let Err(e) = self.consumer.commit_message(&record, CommitMode::Async) {
                error!(error = %e, "Failed to commit offset");
            }
            if selector.matches(message.tag.as_deref()) {
                found.push(message);
            }
            if found.is_empty() {
                // Keep the pull to a single round trip when nothing matched.
                break;
            }
        }

        Ok(if !found.is_empty() {
            PullResult::found(found, next_offset)
        } else if scanned {
            PullResult::empty(PullStatus::NoMatched, next_offset)
        } else {
            PullResult::empty(PullStatus::NotFound, next_offset)
        })
    }

    async fn shutdown(&self) -> Result<()> {
        if self.running.swap(false, Ordering::SeqCst) {
            self.consumer.unsubscribe();
            info!(group = %self.group, "Kafka pull consumer shut down");
        }
        Ok(())
    }
}

struct Subscription {
    selector: ConsumeSelector,
    dispatch: DispatchFn,
}

struct KafkaPushConsumer {
    consumer: Arc<StreamConsumer>,
    group: String,
    redelivery_delay: Duration,
    subscriptions: Mutex<HashMap<String, Subscription>>,
    task: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    running: AtomicBool,
}

#[async_trait]
impl PushClient for KafkaPushConsumer {
    async fn subscribe(
        &self,
        topic: &str,
        selector: ConsumeSelector,
        dispatch: DispatchFn,
    ) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(BrokerError::Subscribe(
                "subscribe must be called before start".to_string(),
            ));
        }
        self.subscriptions
            .lock()
            .await
            .insert(topic.to_string(), Subscription { selector, dispatch });
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::AlreadyStarted);
        }

        let subscriptions = std::mem::take(&mut *self.subscriptions.lock().await);
        if subscriptions.is_empty() {
            warn!(group = %self.group, "Push consumer started without subscriptions");
        }
        let topics: Vec<String> = subscriptions.keys().cloned().collect();
        let names: Vec<&str> = topics.iter().map(String::as_str).collect();
        if let Err(e) = self.consumer.subscribe(&names) {
            self.subscriptions.lock().await.extend(subscriptions);
            self.running.store(false, Ordering::SeqCst);
            return Err(BrokerError::Subscribe(format!(
                "Failed to subscribe to topics: {}",
                e
            )));
        }
        info!(group = %self.group, topics = ?topics, "Subscribed to Kafka topics");

        let task = tokio::spawn(deliver(
            Arc::clone(&self.consumer),
            subscriptions,
            self.redelivery_delay,
            self.cancel.clone(),
        ));
        *self.task.lock().await = Some(task);
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.cancel.cancel();
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                warn!(group = %self.group, error = %e, "Kafka delivery task ended abnormally");
            }
        }
        self.consumer.unsubscribe();
        info!(group = %self.group, "Kafka push consumer shut down");
        Ok(())
    }
}

/// Delivery loop: one record per dispatch, committed once consumed.
async fn deliver(
    consumer: Arc<StreamConsumer>,
    subscriptions: HashMap<String, Subscription>,
    redelivery_delay: Duration,
    cancel: CancellationToken,
) {
    let mut stream = consumer.stream();

    loop {
        let received = tokio::select! {
            next = stream.next() => next,
            _ = cancel.cancelled() => break,
        };
        let record = match received {
            Some(Ok(record)) => record,
            Some(Err(e)) => {
                error!(error = %e, "Kafka consumer error");
                continue;
            }
            None => break,
        };

        let Some(subscription) = subscriptions.get(record.topic()) else {
            continue;
        };
        let message = to_message_ext(&record);
        if subscription.selector.matches(message.tag.as_deref()) {
            match (subscription.dispatch)(vec![message]).await {
                ConsumeResult::Success => {}
                ConsumeResult::RetryLater => {
                    let seek = consumer.seek(
                        record.topic(),
                        record.partition(),
                        Offset::Offset(record.offset()),
                        Duration::from_secs(1),
                    );
                    if let Err(e) = seek {
                        error!(error = %e, "Failed to rewind for redelivery");
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(redelivery_delay) => {}
                        _ = cancel.cancelled() => break,
                    }
                    continue;
                }
            }
        }

        if let Err(e) = consumer.commit_message(&record, CommitMode::Async) {
            error!(error = %e, "Failed to commit offset");
        }
    }
}
