//! Message consumer and metric aggregator
//!
//! The single reader of the handoff. Each message sets the `RuleStat` series
//! for its label-key to its numeric id, then the loop sleeps for the pacing
//! interval before receiving again, so at most one message is aggregated per
//! interval however fast messages arrive.

use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::handoff::HandoffReceiver;
use crate::message::AuditMessage;
use crate::registry::MetricsRegistry;

/// Paced consumer of audit messages
#[derive(Debug, Clone)]
pub struct Aggregator {
    registry: MetricsRegistry,
    pacing: Duration,
}

impl Aggregator {
    /// Create an aggregator writing into `registry`
    pub fn new(registry: MetricsRegistry, pacing: Duration) -> Self {
        Self { registry, pacing }
    }

    /// Apply one message to the registry
    pub fn aggregate(&self, message: &AuditMessage) {
        tracing::info!(
            id = %message.id,
            user = %message.user,
            command = %message.command,
            args = %message.args,
            "Aggregating audit message"
        );
        self.registry.set(&message.label_key(), message.metric_value());
        self.registry.record_processed();
    }

    /// Run until the handoff is closed and drained, or shutdown is signalled
    pub async fn run(self, mut receiver: HandoffReceiver, shutdown: CancellationToken) {
        tracing::info!(pacing_ms = self.pacing.as_millis() as u64, "Aggregator started");

        loop {
            let message = tokio::select! {
                _ = shutdown.cancelled() => break,
                message = receiver.recv() => message,
            };

            let Some(message) = message else {
                tracing::info!("Handoff closed, aggregator stopping");
                break;
            };

            self.aggregate(&message);
            self.registry.sync_dropped(receiver.dropped());

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.pacing) => {}
            }
        }

        tracing::info!(processed = self.registry.processed(), "Aggregator stopped");
    }
}
