//! Structured delivery events.
//!
//! Every publish attempt, consume attempt and outcome is emitted as a
//! `tracing` event under [`EVENT_TARGET`] with a fixed vocabulary
//! ([`BridgeEvent`]). Each event carries `event`, `trace_id`, `span_id`,
//! `child_span_id` and `topic`, plus the payload fields for its kind. These
//! events are the only place per-tag and per-message failures surface.

use std::fmt;

use tracing::{error, info};

use crate::broker::{PullResult, SendReceipt};
use crate::message::{MessageExt, OutboundMessage};
use crate::trace::TraceContext;

/// Target all delivery events are emitted under.
pub const EVENT_TARGET: &str = "mqbridge::events";

/// Fixed event vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BridgeEvent {
    ProduceIn,
    ProduceOut,
    ProduceErr,
    PullConsumeIn,
    PullConsumeOut,
    PullConsumeErr,
    PushConsumeOut,
    PushConsumeErr,
}

impl BridgeEvent {
    pub const ALL: [BridgeEvent; 8] = [
        BridgeEvent::ProduceIn,
        BridgeEvent::ProduceOut,
        BridgeEvent::ProduceErr,
        BridgeEvent::PullConsumeIn,
        BridgeEvent::PullConsumeOut,
        BridgeEvent::PullConsumeErr,
        BridgeEvent::PushConsumeOut,
        BridgeEvent::PushConsumeErr,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BridgeEvent::ProduceIn => "produce_in",
            BridgeEvent::ProduceOut => "produce_out",
            BridgeEvent::ProduceErr => "produce_err",
            BridgeEvent::PullConsumeIn => "pull_consume_in",
            BridgeEvent::PullConsumeOut => "pull_consume_out",
            BridgeEvent::PullConsumeErr => "pull_consume_err",
            BridgeEvent::PushConsumeOut => "push_consume_out",
            BridgeEvent::PushConsumeErr => "push_consume_err",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|e| e.as_str() == name)
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            BridgeEvent::ProduceErr | BridgeEvent::PullConsumeErr | BridgeEvent::PushConsumeErr
        )
    }
}

impl fmt::Display for BridgeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which consumer loop a consume event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeKind {
    Pull,
    Push,
}

impl ConsumeKind {
    pub fn out_event(&self) -> BridgeEvent {
        match self {
            ConsumeKind::Pull => BridgeEvent::PullConsumeOut,
            ConsumeKind::Push => BridgeEvent::PushConsumeOut,
        }
    }

    pub fn err_event(&self) -> BridgeEvent {
        match self {
            ConsumeKind::Pull => BridgeEvent::PullConsumeErr,
            ConsumeKind::Push => BridgeEvent::PushConsumeErr,
        }
    }
}

fn tag_of(message: &OutboundMessage) -> &str {
    message.tag.as_deref().unwrap_or_default()
}

/// A send for one tag is about to be attempted.
pub fn produce_in(trace: &TraceContext, message: &OutboundMessage) {
    info!(
        target: EVENT_TARGET,
        event = BridgeEvent::ProduceIn.as_str(),
        trace_id = %trace.trace_id,
        span_id = %trace.span_id,
        child_span_id = %trace.child_span_id,
        topic = %message.topic,
        tag = %tag_of(message),
        body = %String::from_utf8_lossy(&message.body),
        "produce_in"
    );
}

/// The broker acknowledged the send for one tag.
pub fn produce_out(trace: &TraceContext, message: &OutboundMessage, receipt: &SendReceipt) {
    info!(
        target: EVENT_TARGET,
        event = BridgeEvent::ProduceOut.as_str(),
        trace_id = %trace.trace_id,
        span_id = %trace.span_id,
        child_span_id = %trace.child_span_id,
        topic = %message.topic,
        tag = %tag_of(message),
        body = %String::from_utf8_lossy(&message.body),
        msg_id = %receipt.msg_id,
        receipt = %receipt,
        "produce_out"
    );
}

/// The send for one tag failed after the client's own retries.
pub fn produce_err(trace: &TraceContext, message: &OutboundMessage, err: &dyn fmt::Display) {
    error!(
        target: EVENT_TARGET,
        event = BridgeEvent::ProduceErr.as_str(),
        trace_id = %trace.trace_id,
        span_id = %trace.span_id,
        child_span_id = %trace.child_span_id,
        topic = %message.topic,
        tag = %tag_of(message),
        body = %String::from_utf8_lossy(&message.body),
        error = %err,
        "produce_err"
    );
}

/// A pull returned a batch that is about to be dispatched.
pub fn pull_consume_in(topic: &str, result: &PullResult) {
    let first = result.messages.first();
    let trace = first.map(TraceContext::from_message).unwrap_or_default();
    info!(
        target: EVENT_TARGET,
        event = BridgeEvent::PullConsumeIn.as_str(),
        trace_id = %trace.trace_id,
        span_id = %trace.span_id,
        child_span_id = %trace.child_span_id,
        topic = %topic,
        tag = %first.and_then(|m| m.tag.as_deref()).unwrap_or_default(),
        msg_id = %first.map(|m| m.msg_id.as_str()).unwrap_or_default(),
        body = %first.map(MessageExt::body_lossy).unwrap_or_default(),
        status = ?result.status,
        count = result.messages.len(),
        next_begin_offset = result.next_begin_offset,
        "pull_consume_in"
    );
}

/// The pull itself failed; no message is involved.
pub fn pull_err(topic: &str, err: &dyn fmt::Display) {
    let trace = TraceContext::default();
    error!(
        target: EVENT_TARGET,
        event = BridgeEvent::PullConsumeErr.as_str(),
        trace_id = %trace.trace_id,
        span_id = %trace.span_id,
        child_span_id = %trace.child_span_id,
        topic = %topic,
        error = %err,
        "pull_consume_err"
    );
}

/// The handler accepted a delivered message.
pub fn consume_out(kind: ConsumeKind, topic: &str, message: &MessageExt) {
    let trace = TraceContext::from_message(message);
    let event = kind.out_event();
    info!(
        target: EVENT_TARGET,
        event = event.as_str(),
        trace_id = %trace.trace_id,
        span_id = %trace.span_id,
        child_span_id = %trace.child_span_id,
        topic = %topic,
        tag = %message.tag.as_deref().unwrap_or_default(),
        msg_id = %message.msg_id,
        queue_offset = message.queue_offset,
        body = %message.body_lossy(),
        "{}",
        event
    );
}

/// The handler rejected a delivered message.
pub fn consume_err(kind: ConsumeKind, topic: &str, message: &MessageExt, err: &dyn fmt::Display) {
    let trace = TraceContext::from_message(message);
    let event = kind.err_event();
    error!(
        target: EVENT_TARGET,
        event = event.as_str(),
        trace_id = %trace.trace_id,
        span_id = %trace.span_id,
        child_span_id = %trace.child_span_id,
        topic = %topic,
        tag = %message.tag.as_deref().unwrap_or_default(),
        msg_id = %message.msg_id,
        queue_offset = message.queue_offset,
        body = %message.body_lossy(),
        error = %err,
        "{}",
        event
    );
}
