//! Bounded, cancellable polling of in-flight payments.
//!
//! One task per payment. The only suspension points are the interval tick and
//! the status query; cancellation is observed at both and never reaches the
//! booking. Running out of time or attempts leaves everything as it is for
//! the reconciliation job.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use shared::{FailureCategory, PaymentStatus};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::orchestrator::PaymentSettlement;
use crate::payments::PaymentStatusSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerConfig {
    pub interval: Duration,
    pub timeout: Duration,
    pub max_attempts: Option<u32>,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            timeout: Duration::from_secs(300),
            max_attempts: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Confirmed,
    Failed(FailureCategory),
    /// The payment was closed some other way; the booking was left alone.
    Superseded,
    /// Budget exhausted with the payment still pending. Not a failure.
    TimedOut,
    Cancelled,
    /// The payment settled but the booking could not follow it.
    SettlementError,
}

pub struct PollHandle {
    cancel: watch::Sender<bool>,
    task: JoinHandle<PollOutcome>,
}

impl PollHandle {
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn join(self) -> PollOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => PollOutcome::Cancelled,
            Err(e) => {
                error!(error = %e, "Payment poller panicked");
                PollOutcome::SettlementError
            }
        }
    }
}

#[derive(Clone)]
pub struct PaymentPoller {
    source: Arc<dyn PaymentStatusSource>,
    settlement: Arc<dyn PaymentSettlement>,
    config: PollerConfig,
}

impl PaymentPoller {
    pub fn new(
        source: Arc<dyn PaymentStatusSource>,
        settlement: Arc<dyn PaymentSettlement>,
        config: PollerConfig,
    ) -> Self {
        Self {
            source,
            settlement,
            config,
        }
    }

    pub fn spawn(&self, payment_id: Uuid, booking_id: Uuid) -> PollHandle {
        let (cancel, cancelled) = watch::channel(false);
        let task = tokio::spawn(poll(self.clone(), payment_id, booking_id, cancelled));
        PollHandle { cancel, task }
    }
}

async fn poll(
    poller: PaymentPoller,
    payment_id: Uuid,
    booking_id: Uuid,
    mut cancelled: watch::Receiver<bool>,
) -> PollOutcome {
    let PollerConfig {
        interval,
        timeout,
        max_attempts,
    } = poller.config;
    let deadline = Instant::now() + timeout;
    let mut ticker = time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut attempt: u32 = 0;

    loop {
        tokio::select! {
            biased;
            // A dropped handle counts as cancellation.
            _ = cancelled.changed() => return PollOutcome::Cancelled,
            _ = time::sleep_until(deadline) => {
                info!(%payment_id, %booking_id, attempt, "Payment still pending at poll timeout");
                return PollOutcome::TimedOut;
            }
            _ = ticker.tick() => {}
        }

        attempt += 1;
        let status = tokio::select! {
            biased;
            _ = cancelled.changed() => return PollOutcome::Cancelled,
            status = poller.source.poll_status(payment_id) => status,
        };

        match status {
            Ok(view) if view.status.is_terminal() && !view.settles_booking() => {
                debug!(%payment_id, %booking_id, "Payment closed without settling booking");
                return PollOutcome::Superseded;
            }
            Ok(view) if view.status == PaymentStatus::Completed => {
                return match poller.settlement.settle_completed(booking_id).await {
                    Ok(()) => PollOutcome::Confirmed,
                    Err(e) => {
                        error!(%payment_id, %booking_id, error = %e, "Could not confirm paid booking");
                        PollOutcome::SettlementError
                    }
                };
            }
            Ok(view) if view.status == PaymentStatus::Failed => {
                let reason = view.failure.unwrap_or(FailureCategory::Generic);
                return match poller.settlement.settle_failed(booking_id, reason).await {
                    Ok(()) => PollOutcome::Failed(reason),
                    Err(e) => {
                        error!(%payment_id, %booking_id, error = %e, "Could not record payment failure");
                        PollOutcome::SettlementError
                    }
                };
            }
            Ok(_) => debug!(%payment_id, attempt, "Payment pending"),
            Err(e) => warn!(%payment_id, attempt, error = %e, "Payment status query failed"),
        }

        if max_attempts.map_or(false, |max| attempt >= max) {
            info!(%payment_id, %booking_id, attempt, "Payment still pending after last poll attempt");
            return PollOutcome::TimedOut;
        }
    }
}

/// The active poll per booking. Starting a poll for a booking replaces (and
/// cancels) the previous one.
pub struct PollerRegistry {
    poller: PaymentPoller,
    active: DashMap<Uuid, PollHandle>,
}

impl PollerRegistry {
    pub fn new(poller: PaymentPoller) -> Self {
        Self {
            poller,
            active: DashMap::new(),
        }
    }

    pub fn start(&self, payment_id: Uuid, booking_id: Uuid) {
        self.active.retain(|_, handle| !handle.is_finished());

        let handle = self.poller.spawn(payment_id, booking_id);
        if let Some(previous) = self.active.insert(booking_id, handle) {
            previous.cancel();
        }
    }

    pub fn cancel(&self, booking_id: Uuid) -> bool {
        match self.active.remove(&booking_id) {
            Some((_, handle)) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    /// Removes the poll for `booking_id` so the caller can await its outcome.
    pub fn take(&self, booking_id: Uuid) -> Option<PollHandle> {
        self.active.remove(&booking_id).map(|(_, handle)| handle)
    }

    pub fn cancel_all(&self) {
        for entry in self.active.iter() {
            entry.value().cancel();
        }
        self.active.clear();
    }

    pub fn active_count(&self) -> usize {
        self.active.iter().filter(|e| !e.value().is_finished()).count()
    }
}
