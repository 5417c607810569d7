//! Backstop that expires bookings whose reservation TTL has passed, and
//! confirms the ones whose payment completed without being settled.
//!
//! Safe to run on several workers at once: every expiry goes through the
//! orchestrator's compare-and-set, so a booking claimed by one sweep is a
//! no-op for the others.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use shared::Clock;
use tokio::sync::watch;
use tokio::time;
use tracing::{error, info, warn};

use crate::error::BookingError;
use crate::orchestrator::BookingOrchestrator;
use crate::store::{Store, StoreTx};

const CONCURRENT_EXPIRIES: usize = 8;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    /// Settled by someone else between the scan and the expiry, or found
    /// paid and confirmed instead.
    pub skipped: usize,
}

pub struct ReconciliationJob<S> {
    orchestrator: BookingOrchestrator<S>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    batch_size: i64,
}

impl<S: Store> ReconciliationJob<S> {
    pub fn new(
        orchestrator: BookingOrchestrator<S>,
        clock: Arc<dyn Clock>,
        interval: Duration,
        batch_size: i64,
    ) -> Self {
        Self {
            orchestrator,
            clock,
            interval,
            batch_size,
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = time::interval(self.interval);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("Reconciliation job stopping");
                    return;
                }
                _ = interval.tick() => {}
            }

            match self.sweep().await {
                Ok(report) if report.expired > 0 || report.skipped > 0 => {
                    info!(expired = report.expired, skipped = report.skipped, "Reconciliation sweep finished");
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Reconciliation sweep failed"),
            }
        }
    }

    /// Expires one batch of overdue bookings.
    pub async fn sweep(&self) -> Result<SweepReport, BookingError> {
        let due = {
            let mut tx = self.orchestrator.store().begin().await?;
            tx.expired_booking_ids(self.clock.now(), self.batch_size).await?
        };

        let outcomes: Vec<_> = stream::iter(due)
            .map(|booking_id| async move { (booking_id, self.orchestrator.expire(booking_id).await) })
            .buffer_unordered(CONCURRENT_EXPIRIES)
            .collect()
            .await;

        let mut report = SweepReport::default();
        for (booking_id, outcome) in outcomes {
            match outcome {
                Ok(true) => report.expired += 1,
                Ok(false) | Err(BookingError::BookingTerminalStateConflict { .. }) => report.skipped += 1,
                Err(e) => {
                    warn!(%booking_id, error = %e, "Could not expire booking");
                    report.skipped += 1;
                }
            }
        }
        Ok(report)
    }
}
