//! Event bus contract plus the built-in adapters.

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use vmherd_core::events::VmEvent;

/// Publishes lifecycle events on a named topic.
///
/// Implementations must be non-blocking or bounded: the engine
/// publishes from its critical path and only logs failures, it never
/// waits on slow consumers.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, topic: &str, event: &VmEvent) -> Result<()>;
}

/// Emits events as structured log lines. The default bus for
/// deployments without an external broker.
pub struct LogBus;

#[async_trait]
impl EventBus for LogBus {
    async fn publish(&self, topic: &str, event: &VmEvent) -> Result<()> {
        info!(
            topic,
            event = %event.event_type,
            vm = %event.name,
            status = %event.status,
            "lifecycle event"
        );
        Ok(())
    }
}

/// Swallows everything.
pub struct NullBus;

#[async_trait]
impl EventBus for NullBus {
    async fn publish(&self, _topic: &str, _event: &VmEvent) -> Result<()> {
        Ok(())
    }
}
