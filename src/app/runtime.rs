use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};

use super::error::{HarvestError, Result};
use super::types::PipelineEvent;

/// Cooperative stop flag shared by the runner, the scrapers and the operator.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(HarvestError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves once `cancel` has been called; immediately if it already was.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// Bounded wait that ends early with `Cancelled` when the signal fires.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancelSignal) -> Result<()> {
    cancel.check()?;
    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(()),
        _ = cancel.cancelled() => Err(HarvestError::Cancelled),
    }
}

/// `base * 2^(attempt - 1)`, capped at `max`. Attempt numbering starts at 1.
pub fn backoff_delay(base_ms: u64, max_ms: u64, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(20);
    let delay = base_ms.saturating_mul(1u64 << exponent);
    Duration::from_millis(delay.min(max_ms))
}

/// Fan-out of pipeline progress. Emitting never blocks and never fails when
/// nobody is listening.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn status(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!("{message}");
        self.emit(PipelineEvent::Log(message));
    }

    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!("{message}");
        self.emit(PipelineEvent::Error(message));
    }
}
