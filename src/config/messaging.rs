//! Producer and consumer configuration types.

use std::time::Duration;

use serde::Deserialize;

/// Producer gateway configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    /// Broker addresses, used as-is (no discovery).
    #[serde(alias = "addresses")]
    pub address: Vec<String>,
    /// Extra attempts the broker client makes on a transient send failure.
    pub retry: u32,
}

impl ProducerConfig {
    pub fn new(address: Vec<String>, retry: u32) -> Self {
        Self { address, retry }
    }
}

/// Configuration for one pull or push consumer loop.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ConsumeConfig {
    pub retry: u32,
    #[serde(alias = "groupName")]
    pub group_name: String,
    #[serde(alias = "addresses")]
    pub address: Vec<String>,
    pub topic: String,
    /// Context key under which callers store the trace context.
    #[serde(alias = "traceKey")]
    pub trace_key: String,
    /// Tags to select; empty selects every message on the topic.
    pub tags: Vec<String>,
    /// Delay policy after empty pulls and pull errors. `None` re-pulls
    /// immediately.
    pub idle_backoff: Option<BackoffConfig>,
}

impl ConsumeConfig {
    pub fn new(
        address: Vec<String>,
        group_name: impl Into<String>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            address,
            group_name: group_name.into(),
            topic: topic.into(),
            ..Self::default()
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_retry(mut self, retry: u32) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_trace_key(mut self, key: impl Into<String>) -> Self {
        self.trace_key = key.into();
        self
    }

    pub fn with_idle_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.idle_backoff = Some(backoff);
        self
    }
}

/// Exponential delay schedule.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub factor: f32,
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 10,
            max_delay_ms: 1_000,
            factor: 2.0,
            jitter: false,
        }
    }
}

impl BackoffConfig {
    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms.max(self.min_delay_ms))
    }
}
