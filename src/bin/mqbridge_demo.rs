//! mqbridge-demo: producer plus pull and push consumers in one process
//!
//! Runs against the in-memory broker. Publishes one sample message, logs
//! every delivery event, and exits on Ctrl-C.
//!
//! ## Configuration
//! ```yaml
//! producer:
//!   address: ["127.0.0.1:9876"]
//!   retry: 2
//! pull:
//!   address: ["127.0.0.1:9876"]
//!   group_name: demo-pull
//!   topic: orders
//!   trace_key: trace
//!   tags: [vip]
//!   idle_backoff:
//!     min_delay_ms: 10
//!     max_delay_ms: 1000
//! push:
//!   address: ["127.0.0.1:9876"]
//!   group_name: demo-push
//!   topic: orders
//!   tags: []
//! logging:
//!   level: info
//!   format: text
//! ```

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use mqbridge::config::{BackoffConfig, Config, ConsumeConfig, ProducerConfig};
use mqbridge::consumer::{handler_fn, pull, push, MessageHandler};
use mqbridge::message::{Message, MessageExt};
use mqbridge::producer::Producer;
use mqbridge::trace::{Context, TraceContext};
use mqbridge::utils::bootstrap::init_tracing;
use mqbridge::MemoryBroker;

const DEFAULT_ADDRESS: &str = "127.0.0.1:9876";
const DEFAULT_TOPIC: &str = "orders";
const DEFAULT_TRACE_KEY: &str = "trace";

fn logging_handler(name: &'static str) -> Arc<dyn MessageHandler> {
    handler_fn(move |message: Arc<MessageExt>| async move {
        info!(
            consumer = name,
            msg_id = %message.msg_id,
            body = %message.body_lossy(),
            "Handled message"
        );
        Ok(())
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let path = std::env::args().nth(1);
    let config = Config::load(path.as_deref())?;
    init_tracing(&config.logging);

    let address = vec![DEFAULT_ADDRESS.to_string()];
    let producer_config = config
        .producer
        .clone()
        .unwrap_or_else(|| ProducerConfig::new(address.clone(), 2));
    let pull_config = config.pull.clone().unwrap_or_else(|| {
        ConsumeConfig::new(address.clone(), "demo-pull", DEFAULT_TOPIC)
            .with_trace_key(DEFAULT_TRACE_KEY)
            .with_tags(["vip"])
            .with_idle_backoff(BackoffConfig::default())
    });
    let push_config = config.push.clone().unwrap_or_else(|| {
        ConsumeConfig::new(address.clone(), "demo-push", DEFAULT_TOPIC)
            .with_trace_key(DEFAULT_TRACE_KEY)
    });

    let broker = MemoryBroker::new();
    let cancel = CancellationToken::new();

    let producer = Producer::start(&broker, &producer_config).await?;
    let push_consumer = push::run(
        &broker,
        push_config,
        logging_handler("push"),
        cancel.clone(),
    )
    .await?;

    let pull_consumer = pull::PullConsumer::start(&broker, pull_config.clone()).await?;
    let pull_task = tokio::spawn(pull_consumer.run(logging_handler("pull"), cancel.clone()));

    let trace_key = if pull_config.trace_key.is_empty() {
        DEFAULT_TRACE_KEY
    } else {
        pull_config.trace_key.as_str()
    };
    let ctx = Context::new().with_value(
        trace_key,
        TraceContext::new(
            uuid::Uuid::new_v4().simple().to_string(),
            uuid::Uuid::new_v4().simple().to_string(),
            uuid::Uuid::new_v4().simple().to_string(),
        ),
    );
    let sample = Message::new(pull_config.topic.clone(), "order-1").with_tags(["vip", "new"]);
    let report = producer.publish(&ctx, trace_key, &sample).await?;
    info!(
        attempted = report.attempted(),
        succeeded = report.succeeded(),
        "Sample message published"
    );

    info!("mqbridge-demo running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    cancel.cancel();
    match pull_task.await {
        Ok(Err(e)) => error!(error = %e, "Pull consumer stopped with error"),
        Err(e) => error!(error = %e, "Pull consumer task failed"),
        Ok(Ok(())) => {}
    }
    push_consumer.shutdown().await?;
    producer.shutdown().await?;

    Ok(())
}
