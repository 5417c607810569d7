//! Transactional storage for bookings, capacity, promo codes and payments.
//!
//! Every operation runs inside a [`StoreTx`] obtained from [`Store::begin`].
//! Changes become visible to other transactions only on [`StoreTx::commit`];
//! dropping a transaction rolls it back. The conditional primitives
//! (`try_*` and `compare_and_set_*`) are single atomic steps and report whether
//! they took effect instead of failing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::*;
use uuid::Uuid;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A uniqueness rule was violated; carries the constraint name.
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),
    #[error("database error: {0}")]
    Database(diesel::result::Error),
    #[error("connection pool error: {0}")]
    Pool(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<diesel::result::Error> for StoreError {
    fn from(e: diesel::result::Error) -> Self {
        use diesel::result::{DatabaseErrorKind, Error};

        match e {
            Error::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => Self::UniqueViolation(
                info.constraint_name()
                    .unwrap_or_else(|| info.message())
                    .to_string(),
            ),
            other => Self::Database(other),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Corrupt(e.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Unique constraint backing the one-active-booking-per-user-and-event rule.
pub const ACTIVE_BOOKING_CONSTRAINT: &str = "bookings_one_active_per_user_event";
/// Unique constraint backing the one-open-payment-per-booking rule.
pub const OPEN_PAYMENT_CONSTRAINT: &str = "payments_one_open_per_booking";
/// Unique constraint making promo redemption idempotent per booking.
pub const REDEMPTION_CONSTRAINT: &str = "promo_redemptions_booking_id_key";

#[async_trait]
pub trait Store: Send + Sync + 'static {
    type Tx: StoreTx + 'static;

    async fn begin(&self) -> StoreResult<Self::Tx>;
}

#[async_trait]
pub trait StoreTx: Send {
    // Catalogue

    async fn event(&mut self, id: Uuid) -> StoreResult<Option<Event>>;

    async fn ticket_type(&mut self, id: Uuid) -> StoreResult<Option<TicketType>>;

    // Capacity ledger

    /// Adds `quantity` to `capacity_reserved` if the ticket type is active and
    /// has room for it. Returns `false` and changes nothing otherwise.
    async fn try_reserve_capacity(&mut self, ticket_type_id: Uuid, quantity: i32)
        -> StoreResult<bool>;

    /// Moves `quantity` from reserved to confirmed.
    async fn commit_reserved_capacity(&mut self, ticket_type_id: Uuid, quantity: i32)
        -> StoreResult<()>;

    async fn release_reserved_capacity(&mut self, ticket_type_id: Uuid, quantity: i32)
        -> StoreResult<()>;

    async fn insert_reservation(&mut self, reservation: &Reservation) -> StoreResult<()>;

    async fn reservation(&mut self, token: ReservationToken) -> StoreResult<Option<Reservation>>;

    async fn compare_and_set_reservation(
        &mut self,
        token: ReservationToken,
        from: ReservationStatus,
        to: ReservationStatus,
    ) -> StoreResult<bool>;

    // Promo codes

    async fn promo_code(&mut self, code: &str) -> StoreResult<Option<PromoCode>>;

    /// Reads the promo code and holds it until the transaction ends.
    async fn lock_promo_code(&mut self, code: &str) -> StoreResult<Option<PromoCode>>;

    /// Increments `current_uses` unless that would exceed `max_uses`.
    async fn try_increment_promo_uses(&mut self, code: &str) -> StoreResult<bool>;

    async fn count_promo_redemptions(&mut self, code: &str, user_id: Uuid) -> StoreResult<i64>;

    async fn promo_redemption_for_booking(
        &mut self,
        booking_id: Uuid,
    ) -> StoreResult<Option<PromoRedemption>>;

    async fn insert_promo_redemption(&mut self, redemption: &PromoRedemption) -> StoreResult<()>;

    // Bookings

    /// Fails with [`StoreError::UniqueViolation`] if the user already holds an
    /// active booking for the event.
    async fn insert_booking(&mut self, booking: &Booking) -> StoreResult<()>;

    async fn booking(&mut self, id: Uuid) -> StoreResult<Option<Booking>>;

    async fn active_booking_for(&mut self, user_id: Uuid, event_id: Uuid)
        -> StoreResult<Option<Booking>>;

    async fn compare_and_set_booking_state(
        &mut self,
        id: Uuid,
        from: BookingState,
        to: BookingState,
        failure_reason: Option<FailureCategory>,
        at: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Newest first.
    async fn bookings_for_user(&mut self, user_id: Uuid) -> StoreResult<Vec<Booking>>;

    /// Active bookings whose `expires_at` is before `now`, oldest first.
    async fn expired_booking_ids(&mut self, now: DateTime<Utc>, limit: i64)
        -> StoreResult<Vec<Uuid>>;

    // Payments

    /// Fails with [`StoreError::UniqueViolation`] if the booking already has an
    /// open payment.
    async fn insert_payment(&mut self, payment: &Payment) -> StoreResult<()>;

    async fn payment(&mut self, id: Uuid) -> StoreResult<Option<Payment>>;

    async fn payment_by_reference(&mut self, reference: &str) -> StoreResult<Option<Payment>>;

    async fn open_payment_for_booking(&mut self, booking_id: Uuid) -> StoreResult<Option<Payment>>;

    async fn completed_payment_for_booking(&mut self, booking_id: Uuid) -> StoreResult<Option<Payment>>;

    async fn compare_and_set_payment(
        &mut self,
        id: Uuid,
        from: PaymentStatus,
        update: &PaymentUpdate,
    ) -> StoreResult<bool>;

    /// Newest first.
    async fn payments_for_user(&mut self, user_id: Uuid) -> StoreResult<Vec<Payment>>;

    // Outbox

    async fn insert_outbox_event(&mut self, event: &OutboxEvent) -> StoreResult<()>;

    async fn pending_outbox_events(&mut self, limit: i64) -> StoreResult<Vec<OutboxEvent>>;

    async fn mark_outbox_published(&mut self, id: Uuid) -> StoreResult<()>;

    async fn commit(self) -> StoreResult<()>;
}
