//! mqbridge - trace-correlated messaging bridge
//!
//! Publishes messages once per tag through a tag-filtered broker and consumes
//! them in pull or push mode, correlating both sides with a trace context
//! carried on every message. Delivery outcomes surface as structured
//! `tracing` events (see [`events`]).

pub mod broker;
pub mod config;
pub mod consumer;
pub mod events;
pub mod message;
pub mod producer;
pub mod test_utils;
pub mod trace;
pub mod utils;

pub use broker::{Broker, BrokerError, MemoryBroker};
pub use consumer::{handler_fn, MessageHandler, PullConsumer, PushConsumer};
pub use message::{ConsumeSelector, Message, MessageExt};
pub use producer::{Producer, PublishReport};
pub use trace::{Context, TraceContext};
