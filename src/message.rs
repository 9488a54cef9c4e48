//! Message value types shared by the producer and both consumer loops.

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Separator used when joining requested tags into a selector expression.
pub const TAG_SEPARATOR: &str = " || ";

/// A message handed to the producer.
///
/// The message is sent once per tag, in declaration order. A message with no
/// tags is never sent.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Message {
    pub topic: String,
    #[serde(alias = "msg", with = "body_as_string")]
    pub body: Bytes,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Message {
    pub fn new(topic: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            body: body.into(),
            tags: Vec::new(),
        }
    }

    /// Append a tag; the message will be sent once for it.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Lossy UTF-8 rendering of the body, for log fields.
    pub fn body_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Tags joined with `", "` for log fields.
    pub fn joined_tags(&self) -> String {
        self.tags.join(", ")
    }

    /// Build the single-tag message actually handed to the broker client.
    pub fn to_outbound(&self, tag: &str) -> OutboundMessage {
        OutboundMessage {
            topic: self.topic.clone(),
            body: self.body.clone(),
            tag: Some(tag.to_string()),
            properties: HashMap::new(),
        }
    }
}

/// One send unit: a message carrying exactly the tag it is being sent for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub body: Bytes,
    pub tag: Option<String>,
    /// User properties carried alongside the body (trace ids live here).
    pub properties: HashMap<String, String>,
}

impl OutboundMessage {
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// A message as delivered by the broker to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageExt {
    pub msg_id: String,
    pub topic: String,
    pub body: Bytes,
    pub tag: Option<String>,
    pub properties: HashMap<String, String>,
    /// Position of the message in its topic log.
    pub queue_offset: i64,
    pub born_timestamp: DateTime<Utc>,
    /// Number of times this message was handed back for redelivery.
    pub reconsume_times: u32,
}

impl MessageExt {
    pub fn body_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

/// Selector filter mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SelectorMode {
    /// No filtering, every message on the topic is delivered.
    #[default]
    None,
    /// Filter on message tag.
    Tag,
}

/// Broker-side filter restricting which messages a consumer receives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumeSelector {
    pub mode: SelectorMode,
    pub expression: String,
}

impl ConsumeSelector {
    /// Build a selector from requested tags.
    ///
    /// An empty tag set selects everything; otherwise tags are OR-ed together.
    pub fn from_tags<S: AsRef<str>>(tags: &[S]) -> Self {
        if tags.is_empty() {
            return Self::default();
        }
        let expression = tags
            .iter()
            .map(AsRef::as_ref)
            .collect::<Vec<_>>()
            .join(TAG_SEPARATOR);
        Self {
            mode: SelectorMode::Tag,
            expression,
        }
    }

    /// Individual tags named by a `Tag` expression.
    pub fn tags(&self) -> Vec<&str> {
        match self.mode {
            SelectorMode::None => Vec::new(),
            SelectorMode::Tag => self
                .expression
                .split("||")
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .collect(),
        }
    }

    /// Whether a message with the given tag passes this selector.
    ///
    /// `*` in a tag expression matches every message, tagged or not.
    pub fn matches(&self, tag: Option<&str>) -> bool {
        match self.mode {
            SelectorMode::None => true,
            SelectorMode::Tag => {
                let tags = self.tags();
                if tags.contains(&"*") {
                    return true;
                }
                match tag {
                    Some(tag) => tags.contains(&tag),
                    None => false,
                }
            }
        }
    }
}

impl fmt::Display for ConsumeSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mode {
            SelectorMode::None => f.write_str("*"),
            SelectorMode::Tag => f.write_str(&self.expression),
        }
    }
}

mod body_as_string {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let body = String::deserialize(deserializer)?;
        Ok(Bytes::from(body))
    }
}
