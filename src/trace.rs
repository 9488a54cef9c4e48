//! Trace context propagation.
//!
//! The bridge never originates trace ids. It looks them up in the caller's
//! [`Context`], stamps them onto outbound messages, and reads them back from
//! delivered messages so both sides log the same correlation triple.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::message::{MessageExt, OutboundMessage};

/// Message property carrying the trace id.
pub const TRACE_ID_PROPERTY: &str = "TRACE_ID";
/// Message property carrying the span id.
pub const SPAN_ID_PROPERTY: &str = "SPAN_ID";
/// Message property carrying the child span id.
pub const CHILD_SPAN_ID_PROPERTY: &str = "CHILD_SPAN_ID";

/// Correlation triple threaded across producer and consumer sides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
    pub child_span_id: String,
}

impl TraceContext {
    pub fn new(
        trace_id: impl Into<String>,
        span_id: impl Into<String>,
        child_span_id: impl Into<String>,
    ) -> Self {
        Self {
            trace_id: trace_id.into(),
            span_id: span_id.into(),
            child_span_id: child_span_id.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.trace_id.is_empty() && self.span_id.is_empty() && self.child_span_id.is_empty()
    }

    /// Stamp this context onto an outbound message.
    pub fn inject(&self, message: OutboundMessage) -> OutboundMessage {
        message
            .with_property(TRACE_ID_PROPERTY, &self.trace_id)
            .with_property(SPAN_ID_PROPERTY, &self.span_id)
            .with_property(CHILD_SPAN_ID_PROPERTY, &self.child_span_id)
    }

    /// Recover the context from message properties; missing entries are empty.
    pub fn from_properties(properties: &HashMap<String, String>) -> Self {
        let get = |key: &str| properties.get(key).cloned().unwrap_or_default();
        Self {
            trace_id: get(TRACE_ID_PROPERTY),
            span_id: get(SPAN_ID_PROPERTY),
            child_span_id: get(CHILD_SPAN_ID_PROPERTY),
        }
    }

    pub fn from_message(message: &MessageExt) -> Self {
        Self::from_properties(&message.properties)
    }
}

/// Ambient per-call key/value context.
///
/// Immutable: [`Context::with_value`] returns a new context sharing the
/// existing entries.
#[derive(Clone, Default)]
pub struct Context {
    values: Arc<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value<T>(&self, key: impl Into<String>, value: T) -> Self
    where
        T: Any + Send + Sync,
    {
        let mut values = (*self.values).clone();
        values.insert(key.into(), Arc::new(value));
        Self {
            values: Arc::new(values),
        }
    }

    pub fn value(&self, key: &str) -> Option<&(dyn Any + Send + Sync)> {
        self.values.get(key).map(|v| &**v)
    }

    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.value(key).and_then(|v| v.downcast_ref::<T>())
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("keys", &self.values.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Look up the trace context stored under `key`.
///
/// Absence or a value of any other type yields an empty context.
pub fn extract(ctx: &Context, key: &str) -> TraceContext {
    ctx.get::<TraceContext>(key).cloned().unwrap_or_default()
}
