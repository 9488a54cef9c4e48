//! In-memory broker for standalone mode.
//!
//! Each topic is an append-only log; each consumer group keeps its own offset
//! per topic, so pull and push clients in one group share progress. Push
//! subscriptions are served by a tokio task woken on every append.
//! Ideal for local development and testing without an external broker.
//!
//! Fault injection hooks (`fail_next_sends`, `fail_sends_for_tag`,
//! `fail_next_pulls`, `refuse_start`, `refuse_subscribe`) let tests exercise
//! the bridge's failure policy.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{BackoffBuilder, ConstantBuilder};
use chrono::Utc;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    Broker, BrokerError, ClientOptions, ConsumeResult, DispatchFn, ProducerClient, PullClient,
    PullResult, PullStatus, PushClient, Result, SendReceipt,
};
use crate::message::{ConsumeSelector, MessageExt, OutboundMessage};

/// Default number of messages handed to a push dispatch callback at once.
pub const DEFAULT_PUSH_BATCH_SIZE: usize = 32;

/// Most recent `send_sync` calls kept for `send_calls`.
pub const DEFAULT_SEND_HISTORY: usize = 1024;

/// Delay before a batch answered with `RetryLater` is redelivered.
const REDELIVERY_DELAY: Duration = Duration::from_millis(50);

/// Configuration for the in-memory broker.
#[derive(Debug, Clone)]
pub struct MemoryBrokerConfig {
    /// Max messages per push dispatch.
    pub push_batch_size: usize,
    /// Delay between a failed send attempt and its retry.
    pub send_retry_delay: Duration,
    /// Number of `send_sync` calls remembered; older entries are dropped.
    pub send_history: usize,
}

impl Default for MemoryBrokerConfig {
    fn default() -> Self {
        Self {
            push_batch_size: DEFAULT_PUSH_BATCH_SIZE,
            send_retry_delay: Duration::ZERO,
            send_history: DEFAULT_SEND_HISTORY,
        }
    }
}

#[derive(Default)]
struct Faults {
    fail_next_sends: AtomicU32,
    failing_tags: RwLock<HashSet<String>>,
    fail_next_pulls: AtomicU32,
    refuse_start: AtomicBool,
    refuse_subscribe: AtomicBool,
}

impl Faults {
    /// Consume one unit of a countdown; true if a fault fired.
    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[derive(Default)]
struct BrokerState {
    topics: RwLock<HashMap<String, Vec<MessageExt>>>,
    /// Next offset per (group, topic).
    offsets: Mutex<HashMap<(String, String), i64>>,
    appended: Notify,
    faults: Faults,
    send_calls: Mutex<VecDeque<Option<String>>>,
    send_attempts: AtomicUsize,
    pull_calls: AtomicUsize,
}

impl BrokerState {
    async fn append(&self, message: OutboundMessage) -> SendReceipt {
        let receipt = {
            let mut topics = self.topics.write().await;
            let log = topics.entry(message.topic.clone()).or_default();
            let queue_offset = log.len() as i64;
            let msg_id = Uuid::new_v4().simple().to_string();
            log.push(MessageExt {
                msg_id: msg_id.clone(),
                topic: message.topic,
                body: message.body,
                tag: message.tag,
                properties: message.properties,
                queue_offset,
                born_timestamp: Utc::now(),
                reconsume_times: 0,
            });
            SendReceipt {
                msg_id,
                queue_id: 0,
                queue_offset,
            }
        };
        self.appended.notify_waiters();
        receipt
    }

    /// Fetch up to `max` matching messages for `group`, advancing its offset
    /// past every message scanned.
    async fn fetch(
        &self,
        group: &str,
        topic: &str,
        selector: &ConsumeSelector,
        max: usize,
    ) -> PullResult {
        let topics = self.topics.read().await;
        let mut offsets = self.offsets.lock().await;
        let key = (group.to_string(), topic.to_string());
        let offset = offsets.get(&key).copied().unwrap_or(0);

        let log = match topics.get(topic) {
            Some(log) => log,
            None => return PullResult::empty(PullStatus::NotFound, offset),
        };
        if offset < 0 || offset as usize > log.len() {
            return PullResult::empty(PullStatus::OffsetIllegal, offset);
        }

        let mut found = Vec::new();
        let mut next = offset as usize;
        while next < log.len() && found.len() < max {
            let candidate = &log[next];
            if selector.matches(candidate.tag.as_deref()) {
                found.push(candidate.clone());
            }
            next += 1;
        }

        let scanned = next as i64 - offset;
        offsets.insert(key, next as i64);

        if !found.is_empty() {
            PullResult::found(found, next as i64)
        } else if scanned > 0 {
            PullResult::empty(PullStatus::NoMatched, next as i64)
        } else {
            PullResult::empty(PullStatus::NotFound, next as i64)
        }
    }

    async fn rewind(&self, group: &str, topic: &str, offset: i64) {
        let mut offsets = self.offsets.lock().await;
        let entry = offsets
            .entry((group.to_string(), topic.to_string()))
            .or_insert(offset);
        *entry = (*entry).min(offset);
    }
}

const CREATED: u8 = 0;
const RUNNING: u8 = 1;
const CLOSED: u8 = 2;

/// Created -> Running -> Closed.
#[derive(Default)]
struct Lifecycle(AtomicU8);

impl Lifecycle {
    fn start(&self) -> Result<()> {
        self.0
            .compare_exchange(CREATED, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|current| match current {
                RUNNING => BrokerError::AlreadyStarted,
                _ => BrokerError::NotRunning,
            })
    }

    fn ensure_running(&self) -> Result<()> {
        match self.0.load(Ordering::SeqCst) {
            RUNNING => Ok(()),
            _ => Err(BrokerError::NotRunning),
        }
    }

    fn is_created(&self) -> bool {
        self.0.load(Ordering::SeqCst) == CREATED
    }

    /// Returns true if this call performed the shutdown.
    fn close(&self) -> bool {
        self.0.swap(CLOSED, Ordering::SeqCst) != CLOSED
    }
}

/// In-process broker.
///
/// Cloning shares the same topics, offsets and fault settings.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
    config: MemoryBrokerConfig,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: MemoryBrokerConfig) -> Self {
        Self {
            state: Arc::new(BrokerState::default()),
            config,
        }
    }

    /// Fail the next `n` send attempts (each client-side retry counts).
    pub fn fail_next_sends(&self, n: u32) {
        self.state.faults.fail_next_sends.store(n, Ordering::SeqCst);
    }

    /// Fail every send attempt for `tag` until cleared.
    pub async fn fail_sends_for_tag(&self, tag: impl Into<String>) {
        self.state.faults.failing_tags.write().await.insert(tag.into());
    }

    pub async fn clear_send_failures(&self) {
        self.state.faults.fail_next_sends.store(0, Ordering::SeqCst);
        self.state.faults.failing_tags.write().await.clear();
    }

    /// Fail the next `n` pulls.
    pub fn fail_next_pulls(&self, n: u32) {
        self.state.faults.fail_next_pulls.store(n, Ordering::SeqCst);
    }

    /// Make client `start` fail with a connection error.
    pub fn refuse_start(&self, refuse: bool) {
        self.state.faults.refuse_start.store(refuse, Ordering::SeqCst);
    }

    /// Make push `subscribe` fail.
    pub fn refuse_subscribe(&self, refuse: bool) {
        self.state
            .faults
            .refuse_subscribe
            .store(refuse, Ordering::SeqCst);
    }

    /// Messages stored on `topic`, in append order.
    pub async fn messages(&self, topic: &str) -> Vec<MessageExt> {
        self.state
            .topics
            .read()
            .await
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    /// Tags of the most recent `send_sync` calls made by producers, in call
    /// order. At most `send_history` entries are kept.
    pub async fn send_calls(&self) -> Vec<Option<String>> {
        self.state.send_calls.lock().await.iter().cloned().collect()
    }

    /// Individual send attempts, including client-side retries.
    pub fn send_attempts(&self) -> usize {
        self.state.send_attempts.load(Ordering::SeqCst)
    }

    pub fn pull_calls(&self) -> usize {
        self.state.pull_calls.load(Ordering::SeqCst)
    }

    /// Append a message directly, bypassing any producer.
    pub async fn inject(&self, message: OutboundMessage) -> SendReceipt {
        self.state.append(message).await
    }

    async fn record_send(&self, tag: Option<String>) {
        let capacity = self.config.send_history;
        if capacity == 0 {
            return;
        }
        let mut calls = self.state.send_calls.lock().await;
        while calls.len() >= capacity {
            calls.pop_front();
        }
        calls.push_back(tag);
    }

    fn check_start(&self) -> Result<()> {
        if self.state.faults.refuse_start.load(Ordering::SeqCst) {
            return Err(BrokerError::Connection(
                "in-memory broker refused client start".to_string(),
            ));
        }
        Ok(())
    }
}

impl Broker for MemoryBroker {
    fn producer(&self, options: ClientOptions) -> Result<Arc<dyn ProducerClient>> {
        Ok(Arc::new(MemoryProducer {
            broker: self.clone(),
            options,
            lifecycle: Lifecycle::default(),
        }))
    }

    fn pull_consumer(&self, options: ClientOptions) -> Result<Arc<dyn PullClient>> {
        let group = group_of(&options)?;
        Ok(Arc::new(MemoryPullConsumer {
            broker: self.clone(),
            group,
            lifecycle: Lifecycle::default(),
        }))
    }

    fn push_consumer(&self, options: ClientOptions) -> Result<Arc<dyn PushClient>> {
        let group = group_of(&options)?;
        Ok(Arc::new(MemoryPushConsumer {
            broker: self.clone(),
            group,
            lifecycle: Lifecycle::default(),
            subscriptions: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        }))
    }
}

fn group_of(options: &ClientOptions) -> Result<String> {
    match options.group_name.as_deref() {
        Some(group) if !group.is_empty() => Ok(group.to_string()),
        _ => Err(BrokerError::Connection(
            "consumer requires a group name".to_string(),
        )),
    }
}

struct MemoryProducer {
    broker: MemoryBroker,
    options: ClientOptions,
    lifecycle: Lifecycle,
}

impl MemoryProducer {
    async fn attempt(&self, message: &OutboundMessage) -> Result<SendReceipt> {
        let state = &self.broker.state;
        state.send_attempts.fetch_add(1, Ordering::SeqCst);

        if Faults::take(&state.faults.fail_next_sends) {
            return Err(BrokerError::Send("injected transient failure".to_string()));
        }
        if let Some(tag) = &message.tag {
            if state.faults.failing_tags.read().await.contains(tag) {
                return Err(BrokerError::Send(format!("injected failure for tag '{}'", tag)));
            }
        }
        Ok(state.append(message.clone()).await)
    }
}

#[async_trait]
impl ProducerClient for MemoryProducer {
    async fn start(&self) -> Result<()> {
        self.broker.check_start()?;
        self.lifecycle.start()?;
        info!(
            addresses = ?self.options.resolver.resolve(),
            retry = self.options.retry,
            "In-memory producer started"
        );
        Ok(())
    }

    async fn send_sync(&self, message: OutboundMessage) -> Result<SendReceipt> {
        self.lifecycle.ensure_running()?;
        self.broker.record_send(message.tag.clone()).await;

        let mut backoff = ConstantBuilder::default()
            .with_delay(self.broker.config.send_retry_delay)
            .with_max_times(self.options.retry as usize)
            .build();
        let mut attempt = 0u32;
        loop {
            match self.attempt(&message).await {
                Ok(receipt) => return Ok(receipt),
                Err(e) => {
                    debug!(
                        topic = %message.topic,
                        attempt,
                        error = %e,
                        "Send attempt failed"
                    );
                    let Some(delay) = backoff.next() else {
                        return Err(e);
                    };
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
            }
        }
    }

    async fn shutdown(&self) -> Result<()> {
        if self.lifecycle.close() {
            info!("In-memory producer shut down");
        }
        Ok(())
    }
}

struct MemoryPullConsumer {
    broker: MemoryBroker,
    group: String,
    lifecycle: Lifecycle,
}

#[async_trait]
impl PullClient for MemoryPullConsumer {
    async fn start(&self) -> Result<()> {
        self.broker.check_start()?;
        self.lifecycle.start()?;
        info!(group = %self.group, "In-memory pull consumer started");
        Ok(())
    }

    async fn pull(
        &self,
        topic: &str,
        selector: &ConsumeSelector,
        max: usize,
    ) -> Result<PullResult> {
        self.lifecycle.ensure_running()?;
        let state = &self.broker.state;
        state.pull_calls.fetch_add(1, Ordering::SeqCst);

        if Faults::take(&state.faults.fail_next_pulls) {
            return Err(BrokerError::Pull("injected pull failure".to_string()));
        }
        Ok(state.fetch(&self.group, topic, selector, max).await)
    }

    async fn shutdown(&self) -> Result<()> {
        if self.lifecycle.close() {
            info!(group = %self.group, "In-memory pull consumer shut down");
        }
        Ok(())
    }
}

struct Subscription {
    topic: String,
    selector: ConsumeSelector,
    dispatch: DispatchFn,
}

struct MemoryPushConsumer {
    broker: MemoryBroker,
    group: String,
    lifecycle: Lifecycle,
    subscriptions: Mutex<Vec<Subscription>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

#[async_trait]
impl PushClient for MemoryPushConsumer {
    async fn subscribe(
        &self,
        topic: &str,
        selector: ConsumeSelector,
        dispatch: DispatchFn,
    ) -> Result<()> {
        if self.broker.state.faults.refuse_subscribe.load(Ordering::SeqCst) {
            return Err(BrokerError::Subscribe(format!(
                "in-memory broker refused subscription to '{}'",
                topic
            )));
        }
        if !self.lifecycle.is_created() {
            return Err(BrokerError::Subscribe(
                "subscribe must be called before start".to_string(),
            ));
        }
        self.subscriptions.lock().await.push(Subscription {
            topic: topic.to_string(),
            selector,
            dispatch,
        });
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        self.broker.check_start()?;
        self.lifecycle.start()?;

        let subscriptions = std::mem::take(&mut *self.subscriptions.lock().await);
        if subscriptions.is_empty() {
            warn!(group = %self.group, "Push consumer started without subscriptions");
        }

        let mut tasks = self.tasks.lock().await;
        for subscription in subscriptions {
            info!(
                group = %self.group,
                topic = %subscription.topic,
                selector = %subscription.selector,
                "In-memory push subscription started"
            );
            tasks.push(tokio::spawn(deliver(
                Arc::clone(&self.broker.state),
                self.group.clone(),
                subscription,
                self.broker.config.push_batch_size.max(1),
                self.cancel.clone(),
            )));
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        if !self.lifecycle.close() {
            return Ok(());
        }
        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                warn!(group = %self.group, error = %e, "Push delivery task ended abnormally");
            }
        }
        info!(group = %self.group, "In-memory push consumer shut down");
        Ok(())
    }
}

/// Delivery loop for one push subscription.
async fn deliver(
    state: Arc<BrokerState>,
    group: String,
    subscription: Subscription,
    batch_size: usize,
    cancel: CancellationToken,
) {
    let Subscription {
        topic,
        selector,
        dispatch,
    } = subscription;
    let mut redeliveries: HashMap<String, u32> = HashMap::new();

    while !cancel.is_cancelled() {
        let appended = state.appended.notified();
        tokio::pin!(appended);
        appended.as_mut().enable();

        let result = state.fetch(&group, &topic, &selector, batch_size).await;
        if result.messages.is_empty() {
            tokio::select! {
                _ = &mut appended => continue,
                _ = cancel.cancelled() => break,
            }
        }

        let first_offset = result.messages[0].queue_offset;
        let batch: Vec<MessageExt> = result
            .messages
            .into_iter()
            .map(|mut m| {
                m.reconsume_times = redeliveries.get(&m.msg_id).copied().unwrap_or(0);
                m
            })
            .collect();
        let ids: Vec<String> = batch.iter().map(|m| m.msg_id.clone()).collect();

        match dispatch(batch).await {
            ConsumeResult::Success => {
                for id in &ids {
                    redeliveries.remove(id);
                }
            }
            ConsumeResult::RetryLater => {
                for id in ids {
                    *redeliveries.entry(id).or_insert(0) += 1;
                }
                state.rewind(&group, &topic, first_offset).await;
                debug!(topic = %topic, offset = first_offset, "Batch scheduled for redelivery");
                tokio::select! {
                    _ = tokio::time::sleep(REDELIVERY_DELAY) => {}
                    _ = cancel.cancelled() => break,
                }
            }
        }
    }
}
