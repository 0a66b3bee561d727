//! Background worker for continuous Janitor operation

use crate::{Janitor, JanitorConfig, JanitorError, JanitorMetrics};
use ledger_engine::{Ledger, LedgerEvent};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::broadcast::Receiver;
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Background worker that sweeps on a schedule and follows the event stream
///
/// The worker subscribes to the ledger's events when it is created, so every
/// event published afterwards reaches it.
///
/// # Examples
///
/// ```no_run
/// use ledger_engine::{Ledger, LedgerConfig};
/// use ledger_janitor::{JanitorConfig, JanitorWorker};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let ledger = Arc::new(Ledger::in_memory(LedgerConfig::default()));
///     let mut worker = JanitorWorker::new(ledger, JanitorConfig::default());
///
///     // Run until Ctrl+C
///     worker.run(async { tokio::signal::ctrl_c().await.ok(); }).await?;
///     Ok(())
/// }
/// ```
pub struct JanitorWorker {
    janitor: Janitor,
    ledger: Arc<Ledger>,
    events: Receiver<LedgerEvent>,
    interval: Duration,
}

impl JanitorWorker {
    /// Create a new background worker with the given configuration
    pub fn new(ledger: Arc<Ledger>, config: JanitorConfig) -> Self {
        let interval = config.sweep_interval();
        let events = ledger.subscribe();
        Self {
            janitor: Janitor::new(config),
            ledger,
            events,
            interval,
        }
    }

    /// Run until `shutdown` completes
    ///
    /// Sweep failures are logged and the loop continues. A lagging event
    /// receiver counts the skipped events and keeps going.
    pub async fn run<F>(&mut self, shutdown: F) -> Result<(), JanitorError>
    where
        F: Future<Output = ()>,
    {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        tracing::info!("Janitor worker started (interval: {:?})", self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep_once();
                }
                received = self.events.recv() => {
                    match received {
                        Ok(event) => self.handle(&event),
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Janitor fell behind the event stream");
                            self.janitor.record_lagged(skipped);
                        }
                        Err(RecvError::Closed) => {
                            tracing::warn!("Event stream closed, stopping janitor");
                            break;
                        }
                    }
                }
                _ = &mut shutdown => {
                    tracing::info!("Shutdown signal received, stopping janitor");
                    break;
                }
            }
        }

        tracing::info!("Janitor stopped. Final metrics:\n{}", self.janitor.metrics().summary());
        Ok(())
    }

    /// Run for a specific number of cycles (useful for testing)
    ///
    /// Before each sweep, events already queued are handled. A sweep failure
    /// ends the run with that error.
    pub async fn run_cycles(&mut self, cycles: usize) -> Result<(), JanitorError> {
        let mut ticker = interval(self.interval);

        tracing::info!(
            "Janitor worker started for {} cycles (interval: {:?})",
            cycles,
            self.interval
        );

        for cycle in 0..cycles {
            ticker.tick().await;
            self.drain_events()?;

            tracing::debug!("Starting sweep cycle {}/{}", cycle + 1, cycles);
            let now = self.ledger.now();
            if let Err(e) = self.janitor.sweep(&self.ledger, now) {
                tracing::error!("Sweep {}/{} failed: {}", cycle + 1, cycles, e);
                return Err(e);
            }
        }

        tracing::info!(
            "Janitor finished {} cycles. Final metrics:\n{}",
            cycles,
            self.janitor.metrics().summary()
        );
        Ok(())
    }

    fn drain_events(&mut self) -> Result<(), JanitorError> {
        loop {
            match self.events.try_recv() {
                Ok(event) => self.handle(&event),
                Err(TryRecvError::Empty) => return Ok(()),
                Err(TryRecvError::Lagged(skipped)) => self.janitor.record_lagged(skipped),
                Err(TryRecvError::Closed) => {
                    return Err(JanitorError::Worker("event stream closed".into()));
                }
            }
        }
    }

    fn sweep_once(&mut self) {
        let now = self.ledger.now();
        match self.janitor.sweep(&self.ledger, now) {
            Ok(metrics) => {
                tracing::debug!(
                    "Sweep completed: {} expired, {} reactivated",
                    metrics.expired_proposals,
                    metrics.reactivated_conflicts
                );
            }
            Err(e) => {
                tracing::error!("Sweep failed: {}", e);
            }
        }
    }

    fn handle(&mut self, event: &LedgerEvent) {
        let now = self.ledger.now();
        if let Err(e) = self.janitor.handle_event(&self.ledger, event, now) {
            tracing::error!(event = event.name(), "Event handling failed: {}", e);
        }
    }

    /// Get a reference to the janitor's current metrics
    pub fn metrics(&self) -> &JanitorMetrics {
        self.janitor.metrics()
    }

    /// Reset the janitor's metrics counters
    pub fn reset_metrics(&mut self) {
        self.janitor.reset_metrics();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_engine::LedgerConfig;

    fn fast() -> JanitorConfig {
        JanitorConfig {
            sweep_interval_ms: 5,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_worker_creation() {
        let ledger = Arc::new(Ledger::in_memory(LedgerConfig::lenient()));
        let worker = JanitorWorker::new(ledger, fast());
        assert_eq!(worker.metrics().sweep_count, 0);
    }

    #[tokio::test]
    async fn test_run_cycles() {
        let ledger = Arc::new(Ledger::in_memory(LedgerConfig::lenient()));
        let mut worker = JanitorWorker::new(ledger, fast());

        worker.run_cycles(2).await.unwrap();
        assert_eq!(worker.metrics().sweep_count, 2);
    }

    #[tokio::test]
    async fn test_events_are_counted() {
        let ledger = Arc::new(Ledger::in_memory(LedgerConfig::lenient()));
        let mut worker = JanitorWorker::new(ledger.clone(), fast());
        let organism = ledger.create_organism("Maison", "brand", vec![]).unwrap();
        ledger.invalidate_projections(organism.id);
        ledger.invalidate_projections(organism.id);

        worker.run_cycles(1).await.unwrap();
        assert_eq!(worker.metrics().events_handled, 2);
        assert_eq!(worker.metrics().lagged_events, 0);
    }

    #[tokio::test]
    async fn test_lagging_receiver_keeps_going() {
        let config = LedgerConfig {
            event_capacity: 2,
            ..LedgerConfig::lenient()
        };
        let ledger = Arc::new(Ledger::in_memory(config));
        let mut worker = JanitorWorker::new(ledger.clone(), fast());
        let organism = ledger.create_organism("Maison", "brand", vec![]).unwrap();
        for _ in 0..5 {
            ledger.invalidate_projections(organism.id);
        }

        worker.run_cycles(1).await.unwrap();
        assert_eq!(worker.metrics().lagged_events, 3);
        assert_eq!(worker.metrics().events_handled, 2);
        assert_eq!(worker.metrics().sweep_count, 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let ledger = Arc::new(Ledger::in_memory(LedgerConfig::lenient()));
        let mut worker = JanitorWorker::new(ledger, fast());

        worker
            .run(tokio::time::sleep(Duration::from_millis(30)))
            .await
            .unwrap();
        assert!(worker.metrics().sweep_count >= 1);
    }

    #[tokio::test]
    async fn test_reset_metrics() {
        let ledger = Arc::new(Ledger::in_memory(LedgerConfig::lenient()));
        let mut worker = JanitorWorker::new(ledger, fast());

        worker.run_cycles(1).await.unwrap();
        assert_eq!(worker.metrics().sweep_count, 1);

        worker.reset_metrics();
        assert_eq!(worker.metrics().sweep_count, 0);
    }
}
