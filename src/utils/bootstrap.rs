//! Startup helpers: tracing setup and connection retry.

use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LOG_ENV_VAR;

const INITIAL_DELAY: Duration = Duration::from_millis(100);
const MAX_DELAY: Duration = Duration::from_secs(5);

/// Install the global tracing subscriber.
///
/// Filter directives come from `KEYSPACE_BROKER_LOG`, falling back to `info`.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Run `connect` until it succeeds or `max_attempts` are spent.
///
/// Delays double from 100ms up to 5s between attempts. The last error is
/// returned when every attempt fails.
pub async fn connect_with_retry<T, E, F, Fut>(
    service_name: &str,
    address: &str,
    max_attempts: u32,
    connect: F,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let backoff = ExponentialBuilder::default()
        .with_min_delay(INITIAL_DELAY)
        .with_max_delay(MAX_DELAY)
        .with_max_times(max_attempts.max(1) as usize - 1);

    let result = connect
        .retry(backoff)
        .notify(|e: &E, delay: Duration| {
            warn!(
                service = service_name,
                address = address,
                error = %e,
                retry_in = ?delay,
                "Connection attempt failed"
            );
        })
        .await;

    match &result {
        Ok(_) => info!(service = service_name, address = address, "Connected"),
        Err(e) => error!(
            service = service_name,
            address = address,
            attempts = max_attempts.max(1),
            error = %e,
            "Giving up on connection"
        ),
    }
    result
}
