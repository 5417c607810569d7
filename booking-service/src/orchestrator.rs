//! Owns the booking state machine.
//!
//! Each operation runs in one store transaction: the state change is a
//! compare-and-set on the state the booking was read in, and the ledger,
//! promo and outbox writes that go with it commit or roll back together.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use num_traits::Zero;
use serde::Deserialize;
use shared::*;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{BookingError, PromoRejection};
use crate::ledger;
use crate::promo;
use crate::store::{Store, StoreError, StoreTx, ACTIVE_BOOKING_CONSTRAINT};

#[derive(Debug, Clone, Deserialize)]
pub struct CreateBooking {
    pub event_id: Uuid,
    pub ticket_type_id: Option<Uuid>,
    pub quantity: i32,
    pub promo_code: Option<String>,
}

/// How a payment outcome reaches the booking it pays for.
#[async_trait]
pub trait PaymentSettlement: Send + Sync {
    async fn settle_completed(&self, booking_id: Uuid) -> Result<(), BookingError>;

    async fn settle_failed(&self, booking_id: Uuid, reason: FailureCategory) -> Result<(), BookingError>;
}

pub struct BookingOrchestrator<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    reservation_ttl: Duration,
}

impl<S> Clone for BookingOrchestrator<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            clock: self.clock.clone(),
            reservation_ttl: self.reservation_ttl,
        }
    }
}

impl<S: Store> BookingOrchestrator<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, reservation_ttl: Duration) -> Self {
        Self {
            store,
            clock,
            reservation_ttl,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub async fn create_booking(
        &self,
        user_id: Uuid,
        request: CreateBooking,
    ) -> Result<Booking, BookingError> {
        ledger::check_quantity(request.quantity)?;

        let now = self.clock.now();
        let mut tx = self.store.begin().await?;

        let event = tx
            .event(request.event_id)
            .await?
            .ok_or(BookingError::EventNotFound(request.event_id))?;
        if event.has_started(now) {
            return Err(BookingError::EventAlreadyStarted);
        }

        if tx.active_booking_for(user_id, event.id).await?.is_some() {
            return Err(BookingError::DuplicatePendingBooking);
        }

        let ticket_type = match request.ticket_type_id {
            Some(id) => Some(
                tx.ticket_type(id)
                    .await?
                    .filter(|t| t.event_id == event.id && t.is_active)
                    .ok_or(BookingError::TicketTypeUnavailable(id))?,
            ),
            None if event.is_free => None,
            None => return Err(BookingError::TicketTypeRequired),
        };

        let discount = match request.promo_code.as_deref().map(str::trim) {
            Some("") | None => None,
            Some(_) if event.is_free => return Err(PromoRejection::NotApplicableToEvent.into()),
            Some(code) => Some(promo::validate_in(&mut tx, code, event.id, user_id, now).await?),
        };

        let reservation = match &ticket_type {
            Some(t) => Some(ledger::reserve_in(&mut tx, t.id, request.quantity, self.clock.as_ref()).await?),
            None => None,
        };

        let (unit_price, amounts) = match &ticket_type {
            Some(t) if !event.is_free => (
                t.unit_price.clone(),
                BookingAmounts::compute(&t.unit_price, request.quantity, discount.as_ref()),
            ),
            _ => (BookingAmounts::free().subtotal, BookingAmounts::free()),
        };

        // Nothing to collect: free events, or a discount covering the whole price.
        let state = if event.is_free || amounts.total_amount.is_zero() {
            BookingState::Confirmed
        } else {
            BookingState::PendingPayment
        };

        let booking = Booking {
            id: Uuid::new_v4(),
            event_id: event.id,
            user_id,
            ticket_type_id: ticket_type.as_ref().map(|t| t.id),
            reservation,
            promo_code: discount.as_ref().map(|d| d.code.clone()),
            quantity: request.quantity,
            unit_price,
            discount_amount: amounts.discount_amount,
            total_amount: amounts.total_amount,
            state,
            failure_reason: None,
            created_at: now,
            updated_at: now,
            expires_at: now + self.reservation_ttl,
        };

        match tx.insert_booking(&booking).await {
            Err(StoreError::UniqueViolation(constraint)) if constraint == ACTIVE_BOOKING_CONSTRAINT => {
                return Err(BookingError::DuplicatePendingBooking);
            }
            other => other?,
        }

        if booking.state == BookingState::Confirmed {
            if let Some(token) = booking.reservation {
                ledger::confirm_in(&mut tx, token).await?;
            }
            if let Some(code) = &booking.promo_code {
                promo::redeem_in(&mut tx, code, user_id, booking.id, now).await?;
            }
        }

        write_event(
            &mut tx,
            &BookingEvent::BookingCreated {
                booking_id: booking.id,
                event_id: booking.event_id,
                user_id,
                state: booking.state,
                total_amount: booking.total_amount.clone(),
            },
            now,
        )
        .await?;
        tx.commit().await?;

        info!(
            booking_id = %booking.id,
            event_id = %booking.event_id,
            %user_id,
            state = %booking.state,
            total = %booking.total_amount,
            "Booking created"
        );
        Ok(booking)
    }

    /// User-initiated cancellation of a booking that is not settled yet.
    pub async fn cancel(&self, booking_id: Uuid) -> Result<Booking, BookingError> {
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;
        let booking = load(&mut tx, booking_id).await?;

        if !booking.state.can_transition_to(BookingState::Cancelled) {
            return Err(BookingError::conflict(booking_id, booking.state));
        }
        let event = tx
            .event(booking.event_id)
            .await?
            .ok_or(BookingError::EventNotFound(booking.event_id))?;
        if event.has_started(now) {
            return Err(BookingError::EventAlreadyStarted);
        }

        let booking = self
            .transition(&mut tx, booking, BookingState::Cancelled, None)
            .await?;
        if let Some(token) = booking.reservation {
            ledger::release_in(&mut tx, token).await?;
        }
        close_open_payment(&mut tx, booking_id, "booking cancelled", now).await?;
        write_event(
            &mut tx,
            &BookingEvent::BookingCancelled {
                booking_id,
                user_id: booking.user_id,
            },
            now,
        )
        .await?;
        tx.commit().await?;

        info!(%booking_id, "Booking cancelled");
        Ok(booking)
    }

    /// Settles a paid booking: confirms the held capacity and redeems the promo
    /// code in the same transaction as the state change.
    pub async fn confirm(&self, booking_id: Uuid) -> Result<Booking, BookingError> {
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;
        let booking = load(&mut tx, booking_id).await?;

        if booking.state != BookingState::PendingPayment {
            return Err(BookingError::conflict(booking_id, booking.state));
        }

        let booking = self
            .transition(&mut tx, booking, BookingState::Confirmed, None)
            .await?;
        if let Err(e) = apply_confirmation(&mut tx, &booking, now).await {
            if matches!(e, BookingError::Promo(_)) {
                error!(%booking_id, error = %e, "Promo redemption failed; booking left pending");
            }
            return Err(e);
        }
        tx.commit().await?;

        info!(%booking_id, "Booking confirmed");
        Ok(booking)
    }

    pub async fn fail(&self, booking_id: Uuid, reason: FailureCategory) -> Result<Booking, BookingError> {
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;
        let booking = load(&mut tx, booking_id).await?;

        if booking.state != BookingState::PendingPayment {
            return Err(BookingError::conflict(booking_id, booking.state));
        }

        let booking = self
            .transition(&mut tx, booking, BookingState::PaymentFailed, Some(reason))
            .await?;
        if let Some(token) = booking.reservation {
            ledger::release_in(&mut tx, token).await?;
        }
        close_open_payment(&mut tx, booking_id, reason.user_message(), now).await?;
        write_event(
            &mut tx,
            &BookingEvent::BookingPaymentFailed {
                booking_id,
                user_id: booking.user_id,
                reason,
            },
            now,
        )
        .await?;
        tx.commit().await?;

        info!(%booking_id, reason = reason.as_str(), "Booking payment failed");
        Ok(booking)
    }

    /// Expires an unsettled booking whose reservation TTL has passed.
    ///
    /// Returns `Ok(false)` when there is nothing to do: the booking is not due
    /// yet or already ended some other way. Expiring a confirmed booking is a
    /// conflict. A due booking that already has a completed payment is
    /// confirmed instead, and also reports `Ok(false)`.
    pub async fn expire(&self, booking_id: Uuid) -> Result<bool, BookingError> {
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;
        let booking = load(&mut tx, booking_id).await?;

        match booking.state {
            BookingState::Confirmed => return Err(BookingError::conflict(booking_id, booking.state)),
            state if state.is_terminal() => return Ok(false),
            _ if !booking.is_due_for_expiry(now) => return Ok(false),
            _ => {}
        }

        let paid = tx.completed_payment_for_booking(booking_id).await?;
        let target = if paid.is_some() {
            BookingState::Confirmed
        } else {
            BookingState::Expired
        };

        let booking = match self.transition(&mut tx, booking, target, None).await {
            Ok(booking) => booking,
            Err(BookingError::BookingTerminalStateConflict { state, .. })
                if state != BookingState::Confirmed =>
            {
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        if let Some(payment) = paid {
            apply_confirmation(&mut tx, &booking, now).await?;
            tx.commit().await?;
            warn!(%booking_id, payment_id = %payment.id, "Confirmed paid booking instead of expiring it");
            return Ok(false);
        }

        if let Some(token) = booking.reservation {
            ledger::release_in(&mut tx, token).await?;
        }
        close_open_payment(&mut tx, booking_id, "reservation expired", now).await?;
        write_event(
            &mut tx,
            &BookingEvent::BookingExpired {
                booking_id,
                user_id: booking.user_id,
            },
            now,
        )
        .await?;
        tx.commit().await?;

        info!(%booking_id, expires_at = %booking.expires_at, "Booking expired");
        Ok(true)
    }

    pub async fn booking(&self, booking_id: Uuid) -> Result<Booking, BookingError> {
        let mut tx = self.store.begin().await?;
        load(&mut tx, booking_id).await
    }

    /// Bookings belonging to someone else are reported as not found.
    pub async fn booking_for_user(&self, user_id: Uuid, booking_id: Uuid) -> Result<Booking, BookingError> {
        let booking = self.booking(booking_id).await?;
        if booking.user_id != user_id {
            return Err(BookingError::BookingNotFound(booking_id));
        }
        Ok(booking)
    }

    pub async fn bookings_for_user(&self, user_id: Uuid) -> Result<Vec<Booking>, BookingError> {
        let mut tx = self.store.begin().await?;
        Ok(tx.bookings_for_user(user_id).await?)
    }

    async fn transition(
        &self,
        tx: &mut S::Tx,
        mut booking: Booking,
        to: BookingState,
        failure_reason: Option<FailureCategory>,
    ) -> Result<Booking, BookingError> {
        let now = self.clock.now();
        if !tx
            .compare_and_set_booking_state(booking.id, booking.state, to, failure_reason, now)
            .await?
        {
            let current = load(tx, booking.id).await?;
            return Err(BookingError::conflict(booking.id, current.state));
        }

        booking.state = to;
        booking.failure_reason = failure_reason;
        booking.updated_at = now;
        Ok(booking)
    }
}

#[async_trait]
impl<S: Store> PaymentSettlement for BookingOrchestrator<S> {
    async fn settle_completed(&self, booking_id: Uuid) -> Result<(), BookingError> {
        match self.confirm(booking_id).await {
            Ok(_) => Ok(()),
            Err(BookingError::BookingTerminalStateConflict {
                state: BookingState::Confirmed,
                ..
            }) => Ok(()),
            Err(BookingError::BookingTerminalStateConflict { state, .. }) => {
                error!(
                    %booking_id,
                    %state,
                    "Payment completed for a booking that can no longer be confirmed; refund required"
                );
                Err(BookingError::conflict(booking_id, state))
            }
            Err(e) => Err(e),
        }
    }

    async fn settle_failed(&self, booking_id: Uuid, reason: FailureCategory) -> Result<(), BookingError> {
        match self.fail(booking_id, reason).await {
            Ok(_) => Ok(()),
            Err(BookingError::BookingTerminalStateConflict { state, .. }) => {
                if state != BookingState::PaymentFailed {
                    warn!(%booking_id, %state, "Ignoring payment failure for settled booking");
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

async fn load<T: StoreTx>(tx: &mut T, booking_id: Uuid) -> Result<Booking, BookingError> {
    tx.booking(booking_id)
        .await?
        .ok_or(BookingError::BookingNotFound(booking_id))
}

async fn write_event<T: StoreTx>(
    tx: &mut T,
    event: &BookingEvent,
    at: chrono::DateTime<chrono::Utc>,
) -> Result<(), BookingError> {
    let outbox = OutboxEvent::from_booking_event(event, at).map_err(StoreError::from)?;
    tx.insert_outbox_event(&outbox).await?;
    Ok(())
}

/// Capacity, promo and outbox writes that go with a move to `Confirmed`.
async fn apply_confirmation<T: StoreTx>(
    tx: &mut T,
    booking: &Booking,
    at: chrono::DateTime<chrono::Utc>,
) -> Result<(), BookingError> {
    if let Some(token) = booking.reservation {
        ledger::confirm_in(tx, token).await?;
    }
    if let Some(code) = &booking.promo_code {
        promo::redeem_in(tx, code, booking.user_id, booking.id, at).await?;
    }
    write_event(
        tx,
        &BookingEvent::BookingConfirmed {
            booking_id: booking.id,
            event_id: booking.event_id,
            user_id: booking.user_id,
        },
        at,
    )
    .await
}

/// A booking that ends must not leave a payment open behind it.
async fn close_open_payment<T: StoreTx>(
    tx: &mut T,
    booking_id: Uuid,
    reason: &str,
    at: chrono::DateTime<chrono::Utc>,
) -> Result<(), BookingError> {
    if let Some(payment) = tx.open_payment_for_booking(booking_id).await? {
        tx.compare_and_set_payment(payment.id, payment.status, &PaymentUpdate::failed(reason, at))
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use bigdecimal::BigDecimal;
    use chrono::Utc;
    use std::str::FromStr;

    struct Fixture {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        orchestrator: BookingOrchestrator<MemoryStore>,
        event: Event,
        ticket_type: TicketType,
    }

    async fn fixture(capacity: Option<i32>, is_free: bool) -> Fixture {
        let now = Utc::now();
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(now));
        let event = Event {
            id: Uuid::new_v4(),
            title: "Nairobi Jazz Night".to_string(),
            starts_at: now + Duration::days(7),
            is_free,
        };
        let ticket_type = TicketType {
            id: Uuid::new_v4(),
            event_id: event.id,
            name: "Regular".to_string(),
            capacity_total: capacity,
            capacity_reserved: 0,
            capacity_confirmed: 0,
            unit_price: BigDecimal::from(1500),
            is_active: true,
        };
        store.insert_event(event.clone()).await;
        store.insert_ticket_type(ticket_type.clone()).await;

        let orchestrator =
            BookingOrchestrator::new(store.clone(), clock.clone(), Duration::minutes(15));
        Fixture {
            store,
            clock,
            orchestrator,
            event,
            ticket_type,
        }
    }

    impl Fixture {
        fn request(&self, quantity: i32, promo_code: Option<&str>) -> CreateBooking {
            CreateBooking {
                event_id: self.event.id,
                ticket_type_id: Some(self.ticket_type.id),
                quantity,
                promo_code: promo_code.map(str::to_string),
            }
        }

        async fn ticket_counts(&self) -> (i32, i32) {
            let mut tx = self.store.begin().await.unwrap();
            let t = tx.ticket_type(self.ticket_type.id).await.unwrap().unwrap();
            (t.capacity_reserved, t.capacity_confirmed)
        }

        async fn add_promo(&self, code: &str, max_uses: Option<i32>) {
            let now = self.clock.now();
            self.store
                .insert_promo_code(PromoCode {
                    code: code.to_string(),
                    event_id: None,
                    discount_type: DiscountType::Percentage,
                    discount_value: BigDecimal::from(10),
                    max_uses,
                    max_uses_per_user: 1,
                    current_uses: 0,
                    valid_from: now - Duration::days(1),
                    valid_until: now + Duration::days(30),
                    is_active: true,
                })
                .await;
        }
    }

    #[tokio::test]
    async fn paid_booking_waits_for_payment_with_discounted_total() {
        let f = fixture(Some(10), false).await;
        f.add_promo("JAZZ10", None).await;

        let booking = f
            .orchestrator
            .create_booking(Uuid::new_v4(), f.request(2, Some("jazz10")))
            .await
            .unwrap();

        assert_eq!(booking.state, BookingState::PendingPayment);
        assert_eq!(booking.total_amount, BigDecimal::from_str("2700").unwrap());
        assert_eq!(booking.discount_amount, BigDecimal::from_str("300").unwrap());
        assert_eq!(booking.promo_code.as_deref(), Some("JAZZ10"));
        assert_eq!(booking.expires_at, f.clock.now() + Duration::minutes(15));
        assert_eq!(f.ticket_counts().await, (2, 0));
        assert!(f.store.redemptions().await.is_empty());
    }

    #[tokio::test]
    async fn free_booking_is_confirmed_immediately() {
        let f = fixture(Some(10), true).await;
        let booking = f
            .orchestrator
            .create_booking(Uuid::new_v4(), f.request(3, None))
            .await
            .unwrap();

        assert_eq!(booking.state, BookingState::Confirmed);
        assert_eq!(booking.total_amount, BigDecimal::from(0));
        assert_eq!(f.ticket_counts().await, (0, 3));

        let without_ticket_type = f
            .orchestrator
            .create_booking(
                Uuid::new_v4(),
                CreateBooking {
                    event_id: f.event.id,
                    ticket_type_id: None,
                    quantity: 1,
                    promo_code: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(without_ticket_type.state, BookingState::Confirmed);
        assert!(without_ticket_type.reservation.is_none());
    }

    #[tokio::test]
    async fn free_events_reject_promo_codes() {
        let f = fixture(Some(10), true).await;
        f.add_promo("JAZZ10", None).await;
        let result = f
            .orchestrator
            .create_booking(Uuid::new_v4(), f.request(1, Some("JAZZ10")))
            .await;
        assert!(matches!(
            result,
            Err(BookingError::Promo(PromoRejection::NotApplicableToEvent))
        ));
    }

    #[tokio::test]
    async fn second_active_booking_for_same_event_is_rejected() {
        let f = fixture(Some(10), false).await;
        let user = Uuid::new_v4();
        f.orchestrator.create_booking(user, f.request(1, None)).await.unwrap();

        assert!(matches!(
            f.orchestrator.create_booking(user, f.request(1, None)).await,
            Err(BookingError::DuplicatePendingBooking)
        ));
        assert_eq!(f.ticket_counts().await, (1, 0));
    }

    #[tokio::test]
    async fn promo_failure_aborts_before_touching_inventory() {
        let f = fixture(Some(10), false).await;
        let result = f
            .orchestrator
            .create_booking(Uuid::new_v4(), f.request(1, Some("MISSING")))
            .await;
        assert!(matches!(result, Err(BookingError::Promo(PromoRejection::NotFound))));
        assert_eq!(f.ticket_counts().await, (0, 0));
    }

    #[tokio::test]
    async fn paid_event_needs_a_ticket_type() {
        let f = fixture(Some(10), false).await;
        let mut request = f.request(1, None);
        request.ticket_type_id = None;
        assert!(matches!(
            f.orchestrator.create_booking(Uuid::new_v4(), request).await,
            Err(BookingError::TicketTypeRequired)
        ));
    }

    #[tokio::test]
    async fn confirm_commits_capacity_and_redeems_promo_once() {
        let f = fixture(Some(10), false).await;
        f.add_promo("JAZZ10", Some(5)).await;
        let booking = f
            .orchestrator
            .create_booking(Uuid::new_v4(), f.request(2, Some("JAZZ10")))
            .await
            .unwrap();

        let confirmed = f.orchestrator.confirm(booking.id).await.unwrap();
        assert_eq!(confirmed.state, BookingState::Confirmed);
        assert_eq!(f.ticket_counts().await, (0, 2));
        assert_eq!(f.store.redemptions().await.len(), 1);

        assert!(matches!(
            f.orchestrator.confirm(booking.id).await,
            Err(BookingError::BookingTerminalStateConflict { state: BookingState::Confirmed, .. })
        ));
        f.orchestrator.settle_completed(booking.id).await.unwrap();
        assert_eq!(f.store.redemptions().await.len(), 1);
        assert_eq!(f.ticket_counts().await, (0, 2));
    }

    #[tokio::test]
    async fn confirm_rolls_back_when_promo_is_exhausted() {
        let f = fixture(Some(10), false).await;
        f.add_promo("JAZZ10", Some(1)).await;
        let first = f
            .orchestrator
            .create_booking(Uuid::new_v4(), f.request(1, Some("JAZZ10")))
            .await
            .unwrap();
        let second = f
            .orchestrator
            .create_booking(Uuid::new_v4(), f.request(1, Some("JAZZ10")))
            .await
            .unwrap();

        f.orchestrator.confirm(first.id).await.unwrap();
        assert!(matches!(
            f.orchestrator.confirm(second.id).await,
            Err(BookingError::Promo(PromoRejection::UsageLimitReached))
        ));

        let second = f.orchestrator.booking(second.id).await.unwrap();
        assert_eq!(second.state, BookingState::PendingPayment);
        assert_eq!(f.ticket_counts().await, (1, 1));
    }

    #[tokio::test]
    async fn cancel_releases_inventory_once() {
        let f = fixture(Some(10), false).await;
        let booking = f
            .orchestrator
            .create_booking(Uuid::new_v4(), f.request(4, None))
            .await
            .unwrap();

        let cancelled = f.orchestrator.cancel(booking.id).await.unwrap();
        assert_eq!(cancelled.state, BookingState::Cancelled);
        assert_eq!(f.ticket_counts().await, (0, 0));

        assert!(matches!(
            f.orchestrator.cancel(booking.id).await,
            Err(BookingError::BookingTerminalStateConflict { state: BookingState::Cancelled, .. })
        ));
        assert!(matches!(
            f.orchestrator.confirm(booking.id).await,
            Err(BookingError::BookingTerminalStateConflict { .. })
        ));
        assert_eq!(f.ticket_counts().await, (0, 0));
    }

    #[tokio::test]
    async fn cancel_after_event_start_is_rejected() {
        let f = fixture(Some(10), false).await;
        let booking = f
            .orchestrator
            .create_booking(Uuid::new_v4(), f.request(1, None))
            .await
            .unwrap();

        f.clock.advance(Duration::days(8));
        assert!(matches!(
            f.orchestrator.cancel(booking.id).await,
            Err(BookingError::EventAlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn fail_releases_and_records_reason() {
        let f = fixture(Some(10), false).await;
        let booking = f
            .orchestrator
            .create_booking(Uuid::new_v4(), f.request(2, None))
            .await
            .unwrap();

        let failed = f
            .orchestrator
            .fail(booking.id, FailureCategory::Validation)
            .await
            .unwrap();
        assert_eq!(failed.state, BookingState::PaymentFailed);
        assert_eq!(failed.failure_reason, Some(FailureCategory::Validation));
        assert_eq!(f.ticket_counts().await, (0, 0));

        f.orchestrator
            .settle_failed(booking.id, FailureCategory::Generic)
            .await
            .unwrap();
        assert_eq!(f.ticket_counts().await, (0, 0));
    }

    #[tokio::test]
    async fn expire_respects_ttl_and_terminal_states() {
        let f = fixture(Some(10), false).await;
        let booking = f
            .orchestrator
            .create_booking(Uuid::new_v4(), f.request(1, None))
            .await
            .unwrap();

        assert!(!f.orchestrator.expire(booking.id).await.unwrap());

        f.clock.advance(Duration::minutes(16));
        assert!(f.orchestrator.expire(booking.id).await.unwrap());
        assert!(!f.orchestrator.expire(booking.id).await.unwrap());
        assert_eq!(f.ticket_counts().await, (0, 0));

        let other = f
            .orchestrator
            .create_booking(Uuid::new_v4(), f.request(1, None))
            .await
            .unwrap();
        f.orchestrator.confirm(other.id).await.unwrap();
        f.clock.advance(Duration::minutes(16));
        assert!(matches!(
            f.orchestrator.expire(other.id).await,
            Err(BookingError::BookingTerminalStateConflict { state: BookingState::Confirmed, .. })
        ));
    }

    #[tokio::test]
    async fn quantity_is_bounded_per_booking() {
        let f = fixture(None, false).await;
        for quantity in [0, -1, ledger::MAX_QUANTITY_PER_BOOKING + 1, i32::MAX] {
            assert!(matches!(
                f.orchestrator.create_booking(Uuid::new_v4(), f.request(quantity, None)).await,
                Err(BookingError::InvalidQuantity(q)) if q == quantity
            ));
        }
        f.orchestrator
            .create_booking(Uuid::new_v4(), f.request(ledger::MAX_QUANTITY_PER_BOOKING, None))
            .await
            .unwrap();
        assert_eq!(f.ticket_counts().await, (ledger::MAX_QUANTITY_PER_BOOKING, 0));
    }

    #[tokio::test]
    async fn overdue_booking_with_completed_payment_is_confirmed() {
        let f = fixture(Some(10), false).await;
        let booking = f
            .orchestrator
            .create_booking(Uuid::new_v4(), f.request(2, None))
            .await
            .unwrap();
        let now = f.clock.now();
        {
            let mut tx = f.store.begin().await.unwrap();
            tx.insert_payment(&Payment {
                id: Uuid::new_v4(),
                booking_id: booking.id,
                phone_number: "254712345678".to_string(),
                provider_reference: Some("ws_CO_1".to_string()),
                status: PaymentStatus::Completed,
                amount: booking.total_amount.clone(),
                error_message: None,
                created_at: now,
                completed_at: Some(now),
            })
            .await
            .unwrap();
            tx.commit().await.unwrap();
        }

        f.clock.advance(Duration::minutes(16));
        assert!(!f.orchestrator.expire(booking.id).await.unwrap());
        assert_eq!(
            f.orchestrator.booking(booking.id).await.unwrap().state,
            BookingState::Confirmed
        );
        assert_eq!(f.ticket_counts().await, (0, 2));
    }

    #[tokio::test]
    async fn every_transition_is_published_through_the_outbox() {
        let f = fixture(Some(10), false).await;
        let booking = f
            .orchestrator
            .create_booking(Uuid::new_v4(), f.request(1, None))
            .await
            .unwrap();
        f.orchestrator.confirm(booking.id).await.unwrap();

        let types: Vec<_> = f
            .store
            .outbox()
            .await
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(types, ["BookingCreated", "BookingConfirmed"]);
    }
}
