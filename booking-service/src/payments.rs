//! Payment initiation and status tracking against the mobile-money provider.
//!
//! The provider is never called with a transaction open: state is read and
//! written in short transactions on either side of each round trip, and every
//! status change is a compare-and-set so a callback and a poll observing the
//! same outcome record it once.

use std::sync::Arc;

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use mpesa_gateway::{
    classify_failure, MobileMoneyProvider, PhoneNumber, ProviderStatus, StkCallback, StkPushRequest,
};
use num_traits::ToPrimitive;
use serde::Serialize;
use shared::*;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::BookingError;
use crate::store::{Store, StoreError, StoreTx, OPEN_PAYMENT_CONSTRAINT};

const SUPERSEDED: &str = "superseded by a newer payment request";

/// How long an open payment is reported as pending before the payer is told
/// it is taking longer than usual.
const DEFAULT_PENDING_TIMEOUT_MINUTES: i64 = 5;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaymentInitiation {
    pub payment_id: Uuid,
    pub booking_id: Uuid,
    pub checkout_request_id: String,
    pub amount: BigDecimal,
    pub customer_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaymentStatusView {
    pub payment_id: Uuid,
    pub booking_id: Uuid,
    pub status: PaymentStatus,
    pub error_message: Option<String>,
    pub failure: Option<FailureCategory>,
    /// A newer payment attempt is open for the same booking; this outcome
    /// must not settle the booking.
    pub superseded: bool,
}

impl PaymentStatusView {
    fn of(payment: &Payment, failure_code: Option<&str>) -> Self {
        let failure = (payment.status == PaymentStatus::Failed).then(|| {
            classify_failure(failure_code, payment.error_message.as_deref().unwrap_or_default())
        });
        Self {
            payment_id: payment.id,
            booking_id: payment.booking_id,
            status: payment.status,
            error_message: payment.error_message.clone(),
            failure,
            superseded: false,
        }
    }

    /// Whether the booking should follow this outcome.
    pub fn settles_booking(&self) -> bool {
        self.status.is_terminal() && !self.superseded
    }
}

/// Where the poller reads payment outcomes from.
#[async_trait]
pub trait PaymentStatusSource: Send + Sync {
    async fn poll_status(&self, payment_id: Uuid) -> Result<PaymentStatusView, BookingError>;
}

pub struct PaymentGatewayAdapter<S> {
    store: Arc<S>,
    provider: Arc<dyn MobileMoneyProvider>,
    clock: Arc<dyn Clock>,
    country_prefix: String,
    pending_timeout: chrono::Duration,
}

impl<S> Clone for PaymentGatewayAdapter<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            provider: self.provider.clone(),
            clock: self.clock.clone(),
            country_prefix: self.country_prefix.clone(),
            pending_timeout: self.pending_timeout,
        }
    }
}

/// Whole currency units to charge; fractions round up.
fn chargeable_units(amount: &BigDecimal) -> Option<u64> {
    let whole = amount.with_scale(0);
    let whole = if &whole < amount { whole + BigDecimal::from(1) } else { whole };
    whole.to_u64()
}

impl<S: Store> PaymentGatewayAdapter<S> {
    pub fn new(
        store: Arc<S>,
        provider: Arc<dyn MobileMoneyProvider>,
        clock: Arc<dyn Clock>,
        country_prefix: impl Into<String>,
    ) -> Self {
        Self {
            store,
            provider,
            clock,
            country_prefix: country_prefix.into(),
            pending_timeout: chrono::Duration::minutes(DEFAULT_PENDING_TIMEOUT_MINUTES),
        }
    }

    pub fn with_pending_timeout(mut self, pending_timeout: chrono::Duration) -> Self {
        self.pending_timeout = pending_timeout;
        self
    }

    /// Sends a payment prompt for a booking awaiting payment.
    ///
    /// Any payment still open for the booking is failed first, so a user can
    /// retry after an abandoned prompt without tripping the one-open-payment rule.
    /// A booking that already has a completed payment is never charged again.
    pub async fn initiate(
        &self,
        user_id: Uuid,
        booking_id: Uuid,
        raw_phone: &str,
    ) -> Result<PaymentInitiation, BookingError> {
        let phone = PhoneNumber::parse(raw_phone, &self.country_prefix)?;
        let now = self.clock.now();

        let mut tx = self.store.begin().await?;
        let booking = tx
            .booking(booking_id)
            .await?
            .filter(|b| b.user_id == user_id)
            .ok_or(BookingError::BookingNotFound(booking_id))?;

        if booking.state != BookingState::PendingPayment {
            return Err(BookingError::conflict(booking_id, booking.state));
        }
        if let Some(paid) = tx.completed_payment_for_booking(booking_id).await? {
            return Err(BookingError::PaymentAlreadyCompleted {
                booking_id,
                payment_id: paid.id,
            });
        }
        if booking.expires_at <= now {
            return Err(BookingError::ReservationExpired(booking_id));
        }
        let amount = chargeable_units(&booking.total_amount)
            .ok_or_else(|| StoreError::Corrupt(format!("unpayable total {}", booking.total_amount)))?;

        if let Some(previous) = tx.open_payment_for_booking(booking_id).await? {
            tx.compare_and_set_payment(previous.id, previous.status, &PaymentUpdate::failed(SUPERSEDED, now))
                .await?;
            info!(%booking_id, payment_id = %previous.id, "Superseded open payment");
        }

        let payment = Payment {
            id: Uuid::new_v4(),
            booking_id,
            phone_number: phone.as_str().to_string(),
            provider_reference: None,
            status: PaymentStatus::Initiated,
            amount: booking.total_amount.clone(),
            error_message: None,
            created_at: now,
            completed_at: None,
        };
        match tx.insert_payment(&payment).await {
            Err(StoreError::UniqueViolation(constraint)) if constraint == OPEN_PAYMENT_CONSTRAINT => {
                return Err(BookingError::PaymentSuperseded(payment.id));
            }
            other => other?,
        }
        tx.commit().await?;

        let request = StkPushRequest {
            phone,
            amount,
            account_reference: format!("BK-{}", &booking_id.simple().to_string()[..8]).to_uppercase(),
            description: "Event tickets".to_string(),
        };

        let accepted = match self.provider.stk_push(&request).await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(%booking_id, payment_id = %payment.id, error = %e, "Payment prompt failed");
                let mut tx = self.store.begin().await?;
                tx.compare_and_set_payment(
                    payment.id,
                    PaymentStatus::Initiated,
                    &PaymentUpdate::failed(e.to_string(), self.clock.now()),
                )
                .await?;
                tx.commit().await?;
                return Err(e.into());
            }
        };

        let mut tx = self.store.begin().await?;
        if !tx
            .compare_and_set_payment(
                payment.id,
                PaymentStatus::Initiated,
                &PaymentUpdate::pending(accepted.checkout_request_id.clone()),
            )
            .await?
        {
            return Err(BookingError::PaymentSuperseded(payment.id));
        }
        tx.commit().await?;

        info!(
            %booking_id,
            payment_id = %payment.id,
            checkout_request_id = %accepted.checkout_request_id,
            amount,
            "Payment prompt sent"
        );

        Ok(PaymentInitiation {
            payment_id: payment.id,
            booking_id,
            checkout_request_id: accepted.checkout_request_id,
            amount: booking.total_amount,
            customer_message: accepted.customer_message,
        })
    }

    /// One provider round trip for an open payment. A terminal outcome is
    /// recorded on the payment; the booking is left to the caller.
    pub async fn query_status(&self, payment_id: Uuid) -> Result<PaymentStatusView, BookingError> {
        let payment = {
            let mut tx = self.store.begin().await?;
            tx.payment(payment_id)
                .await?
                .ok_or(BookingError::PaymentNotFound(payment_id))?
        };

        let reference = match (&payment.provider_reference, payment.status) {
            (_, status) if status.is_terminal() => return self.view(&payment, None).await,
            (Some(reference), _) => reference.clone(),
            (None, _) => return Ok(PaymentStatusView::of(&payment, None)),
        };

        let status = self.provider.stk_query(&reference).await?;
        self.record(payment, &status).await
    }

    /// Handles a notification on the callback URL. Anyone can reach that URL,
    /// so the body only says which payment to look at: the outcome recorded
    /// is the one the provider returns when queried. Unknown references are
    /// ignored.
    pub async fn apply_callback(&self, callback: &StkCallback) -> Result<Option<PaymentStatusView>, BookingError> {
        let reference = callback.checkout_request_id.as_str();
        let payment = {
            let mut tx = self.store.begin().await?;
            tx.payment_by_reference(reference).await?
        };
        let Some(payment) = payment else {
            warn!(checkout_request_id = %reference, "Callback for unknown payment");
            return Ok(None);
        };

        let claimed = callback.status();
        if payment.status.is_terminal() && !matches!(claimed, ProviderStatus::Completed { .. }) {
            return self.view(&payment, None).await.map(Some);
        }

        let status = self.provider.stk_query(reference).await?;
        match (&claimed, &status) {
            (claimed, ProviderStatus::Pending) if claimed.is_terminal() => {
                warn!(
                    payment_id = %payment.id,
                    checkout_request_id = %reference,
                    "Callback outcome not confirmed by provider"
                );
            }
            (
                ProviderStatus::Completed {
                    receipt_number: Some(receipt),
                },
                ProviderStatus::Completed { .. },
            ) => info!(payment_id = %payment.id, %receipt, "Provider receipt"),
            _ => {}
        }
        self.record(payment, &status).await.map(Some)
    }

    async fn record(&self, payment: Payment, status: &ProviderStatus) -> Result<PaymentStatusView, BookingError> {
        let now = self.clock.now();
        let (update, code) = match status {
            ProviderStatus::Pending if payment.status.is_terminal() => {
                return self.view(&payment, None).await;
            }
            ProviderStatus::Pending => return Ok(PaymentStatusView::of(&payment, None)),
            ProviderStatus::Completed { .. } => (PaymentUpdate::completed(now), None),
            ProviderStatus::Failed { code, message } => {
                (PaymentUpdate::failed(message.clone(), now), Some(code.as_str()))
            }
        };

        let mut tx = self.store.begin().await?;
        if payment.status.is_terminal() || !tx.compare_and_set_payment(payment.id, payment.status, &update).await? {
            let current = tx
                .payment(payment.id)
                .await?
                .ok_or(BookingError::PaymentNotFound(payment.id))?;
            if matches!(status, ProviderStatus::Completed { .. }) && current.status == PaymentStatus::Failed {
                error!(
                    payment_id = %current.id,
                    booking_id = %current.booking_id,
                    "Provider reports completion for a closed payment; refund required"
                );
            }
            drop(tx);
            return self.view(&current, None).await;
        }
        tx.commit().await?;

        let mut recorded = payment;
        update.apply_to(&mut recorded);
        info!(
            payment_id = %recorded.id,
            booking_id = %recorded.booking_id,
            status = %recorded.status,
            "Payment settled"
        );
        self.view(&recorded, code).await
    }

    async fn view(&self, payment: &Payment, failure_code: Option<&str>) -> Result<PaymentStatusView, BookingError> {
        let mut view = PaymentStatusView::of(payment, failure_code);
        if payment.status == PaymentStatus::Failed {
            let mut tx = self.store.begin().await?;
            view.superseded = tx
                .open_payment_for_booking(payment.booking_id)
                .await?
                .map_or(false, |open| open.id != payment.id);
        }
        Ok(view)
    }

    /// Status check on behalf of the payer. A payment still open after the
    /// pending timeout is reported as [`BookingError::PaymentTimeout`]: the
    /// booking stays payable and nothing is failed.
    pub async fn status_for_user(&self, user_id: Uuid, payment_id: Uuid) -> Result<PaymentStatusView, BookingError> {
        let payment = self.payment_for_user(user_id, payment_id).await?;
        let view = self.query_status(payment_id).await?;
        if !view.status.is_terminal() && self.clock.now() - payment.created_at >= self.pending_timeout {
            return Err(BookingError::PaymentTimeout);
        }
        Ok(view)
    }

    /// Payments on other users' bookings are reported as not found.
    pub async fn payment_for_user(&self, user_id: Uuid, payment_id: Uuid) -> Result<Payment, BookingError> {
        let mut tx = self.store.begin().await?;
        let payment = tx
            .payment(payment_id)
            .await?
            .ok_or(BookingError::PaymentNotFound(payment_id))?;
        let owned = tx
            .booking(payment.booking_id)
            .await?
            .map_or(false, |b| b.user_id == user_id);
        if !owned {
            return Err(BookingError::PaymentNotFound(payment_id));
        }
        Ok(payment)
    }

    pub async fn history(&self, user_id: Uuid) -> Result<Vec<Payment>, BookingError> {
        let mut tx = self.store.begin().await?;
        Ok(tx.payments_for_user(user_id).await?)
    }
}

#[async_trait]
impl<S: Store> PaymentStatusSource for PaymentGatewayAdapter<S> {
    async fn poll_status(&self, payment_id: Uuid) -> Result<PaymentStatusView, BookingError> {
        self.query_status(payment_id).await
    }
}
