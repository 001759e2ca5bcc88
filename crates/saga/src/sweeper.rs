//! Recovery sweeper: finds stalled sagas and drives them again.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::SagaId;
use futures_util::StreamExt;
use saga_store::{IdempotencyGuard, SagaStateStore, SagaStatus};
use serde::Serialize;
use tokio::sync::watch;

use crate::coordinator::SagaOrchestrator;
use crate::error::Result;

/// Shortest period between sweeps; a zero interval is raised to this.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Sweeper settings.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Time between sweeps.
    pub interval: Duration,
    /// A saga untouched for this long is considered stalled.
    pub stale_after: Duration,
    /// Maximum number of sagas resumed at once.
    pub concurrency: usize,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            stale_after: Duration::from_secs(60),
            concurrency: 8,
        }
    }
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Stale sagas found.
    pub scanned: usize,
    /// Sagas driven to a terminal status.
    pub resumed: usize,
    /// Sagas left to a driver that still owns their current step.
    pub deferred: usize,
    /// Sagas whose resume failed; they will be picked up again next sweep.
    pub errors: usize,
    /// Sagas that ended `failed` and need an operator.
    pub escalated: Vec<SagaId>,
    /// Expired idempotency claims removed.
    pub claims_purged: usize,
}

/// Periodically resumes stalled sagas.
///
/// Safe to run next to live orchestrators: a resume that races a live driver
/// either finds the step claimed and backs off, or loses its compare-and-swap.
pub struct RecoverySweeper<S, G>
where
    S: SagaStateStore,
    G: IdempotencyGuard,
{
    orchestrator: Arc<SagaOrchestrator<S, G>>,
    config: SweeperConfig,
    last_report: watch::Sender<Option<SweepReport>>,
}

impl<S, G> RecoverySweeper<S, G>
where
    S: SagaStateStore,
    G: IdempotencyGuard,
{
    pub fn new(orchestrator: Arc<SagaOrchestrator<S, G>>, config: SweeperConfig) -> Self {
        let (last_report, _) = watch::channel(None);
        Self {
            orchestrator,
            config,
            last_report,
        }
    }

    /// Receiver that always holds the latest sweep report.
    pub fn subscribe(&self) -> watch::Receiver<Option<SweepReport>> {
        self.last_report.subscribe()
    }

    /// Runs a single sweep.
    #[tracing::instrument(skip(self))]
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let stale = self
            .orchestrator
            .store()
            .find_stale(self.config.stale_after)
            .await?;

        let report = Mutex::new(SweepReport {
            scanned: stale.len(),
            ..SweepReport::default()
        });

        futures_util::stream::iter(stale)
            .for_each_concurrent(self.config.concurrency.max(1), |saga_id| {
                let report = &report;
                async move {
                    let outcome = self.orchestrator.resume_saga(saga_id).await;
                    let mut report = report.lock().unwrap_or_else(|e| e.into_inner());
                    match outcome {
                        Ok(saga) if saga.status() == SagaStatus::Failed => {
                            report.resumed += 1;
                            report.escalated.push(saga_id);
                        }
                        Ok(saga) if saga.is_terminal() => report.resumed += 1,
                        Ok(_) => report.deferred += 1,
                        Err(e) => {
                            tracing::warn!(%saga_id, error = %e, "failed to resume stale saga");
                            report.errors += 1;
                        }
                    }
                }
            })
            .await;

        let mut report = report.into_inner().unwrap_or_else(|e| e.into_inner());

        match self.orchestrator.guard().purge_expired().await {
            Ok(purged) => report.claims_purged = purged,
            Err(e) => tracing::warn!(error = %e, "failed to purge expired claims"),
        }

        metrics::counter!("saga_sweeps_total").increment(1);
        if report.scanned > 0 {
            tracing::info!(
                scanned = report.scanned,
                resumed = report.resumed,
                deferred = report.deferred,
                errors = report.errors,
                escalated = report.escalated.len(),
                "sweep finished"
            );
        }
        for saga_id in &report.escalated {
            tracing::error!(%saga_id, "saga escalated to failed");
        }

        self.last_report.send_replace(Some(report.clone()));
        Ok(report)
    }

    /// Sweeps on every tick of the configured interval until `shutdown`
    /// resolves. A failed sweep is logged and retried on the next tick.
    /// A zero interval is raised to one millisecond.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let period = self.config.interval.max(MIN_INTERVAL);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        tracing::info!(
            interval_ms = period.as_millis() as u64,
            stale_after_secs = self.config.stale_after.as_secs(),
            "recovery sweeper started"
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        tracing::warn!(error = %e, "sweep failed");
                    }
                }
            }
        }

        tracing::info!("recovery sweeper stopped");
    }
}
