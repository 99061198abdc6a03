//! keyspace-tail: log every event on a set of patterns
//!
//! Connects a broker to the configured source, subscribes to each pattern in
//! `tail.patterns` and logs deliveries as `{data, contextValue}` JSON until
//! Ctrl-C.
//!
//! ## Configuration
//! - KEYSPACE_BROKER_CONFIG: Path to a YAML config file (optional)
//! - KEYSPACE_BROKER__SOURCE__REDIS__URL: Redis URL (default: redis://localhost:6379)
//! - KEYSPACE_BROKER__TAIL__PATTERNS: Patterns to follow (default: `*`)
//! - PUBSUB_INTERVAL: Also emit `onInterval` events
//! - KEYSPACE_BROKER_LOG: Log filter (default: info)

use tracing::info;

use keyspace_broker::utils::bootstrap::init_tracing;
use keyspace_broker::{Broker, Config, Transforms};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let path = std::env::args().nth(1);
    let config = Config::load(path.as_deref())?;

    let broker = Broker::connect(&config, Transforms::new()).await?;

    for pattern in &config.tail.patterns {
        broker
            .subscribe_fn(pattern, |event| async move {
                info!(channel = %event.channel, event = %event.to_json(), "Event");
                Ok(())
            })
            .await?;
    }

    info!(patterns = ?config.tail.patterns, "keyspace-tail started");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    broker.close().await?;

    Ok(())
}
