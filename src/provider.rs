//! Broker construction strategies.
//!
//! Long-lived processes share one broker; request-scoped callers (e.g. a
//! render pass that must not leak connections between requests) build a
//! fresh one each time. The strategy is chosen explicitly.

use tokio::sync::OnceCell;
use tracing::debug;

use crate::broker::{Broker, Result};
use crate::config::Config;
use crate::transform::Transforms;

/// Where brokers obtained from a `BrokerProvider` live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionContext {
    /// One broker per provider, built on first use and reused afterwards.
    Process,
    /// A new broker on every call; the caller closes it.
    Request,
}

/// Builds brokers according to an `ExecutionContext`.
pub struct BrokerProvider {
    context: ExecutionContext,
    config: Config,
    transforms: Transforms,
    shared: OnceCell<Broker>,
}

impl BrokerProvider {
    pub fn new(context: ExecutionContext, config: Config, transforms: Transforms) -> Self {
        Self {
            context,
            config,
            transforms,
            shared: OnceCell::new(),
        }
    }

    pub fn context(&self) -> ExecutionContext {
        self.context
    }

    /// Get a broker for the current context.
    pub async fn get(&self) -> Result<Broker> {
        match self.context {
            ExecutionContext::Process => {
                let broker = self
                    .shared
                    .get_or_try_init(|| Broker::connect(&self.config, self.transforms.clone()))
                    .await?;
                Ok(broker.clone())
            }
            ExecutionContext::Request => {
                debug!("Building request-scoped broker");
                Broker::connect(&self.config, self.transforms.clone()).await
            }
        }
    }

    /// Close the process-wide broker, if one was built.
    pub async fn shutdown(&self) -> Result<()> {
        match self.shared.get() {
            Some(broker) => broker.close().await,
            None => Ok(()),
        }
    }
}
