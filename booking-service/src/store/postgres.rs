use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::pooled_connection::bb8::Pool;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::{AnsiTransactionManager, AsyncPgConnection, RunQueryDsl, TransactionManager};
use shared::*;
use uuid::Uuid;

use super::{Store, StoreError, StoreResult, StoreTx};
use crate::models::*;
use crate::schema::*;

pub type DbPool = Pool<AsyncPgConnection>;

type PooledConnection =
    bb8::PooledConnection<'static, AsyncDieselConnectionManager<AsyncPgConnection>>;

const ACTIVE_STATES: [&str; 2] = [
    BookingState::Created.as_str(),
    BookingState::PendingPayment.as_str(),
];
const OPEN_STATUSES: [&str; 2] = [
    PaymentStatus::Initiated.as_str(),
    PaymentStatus::Pending.as_str(),
];

/// PostgreSQL store on a bb8 pool of async diesel connections.
#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

/// A pooled connection with an open transaction. Dropping it without
/// committing rolls the transaction back before the connection returns to
/// the pool.
pub struct PgTx {
    conn: Option<PooledConnection>,
}

impl PgTx {
    fn conn(&mut self) -> StoreResult<&mut AsyncPgConnection> {
        self.conn
            .as_deref_mut()
            .ok_or_else(|| StoreError::Pool("transaction already finished".to_string()))
    }
}

impl Drop for PgTx {
    fn drop(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        // Without a runtime the connection is dropped mid-transaction and the
        // pool discards it.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = AnsiTransactionManager::rollback_transaction(&mut *conn).await;
            });
        }
    }
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Store for PgStore {
    type Tx = PgTx;

    async fn begin(&self) -> StoreResult<PgTx> {
        let mut conn = self
            .pool
            .get_owned()
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))?;
        AnsiTransactionManager::begin_transaction(&mut *conn).await?;
        Ok(PgTx { conn: Some(conn) })
    }
}

#[async_trait]
impl StoreTx for PgTx {
    async fn event(&mut self, id: Uuid) -> StoreResult<Option<Event>> {
        let row = events::table
            .find(id)
            .select(DbEvent::as_select())
            .first(self.conn()?)
            .await
            .optional()?;
        Ok(row.map(Event::from))
    }

    async fn ticket_type(&mut self, id: Uuid) -> StoreResult<Option<TicketType>> {
        let row = ticket_types::table
            .find(id)
            .select(DbTicketType::as_select())
            .first(self.conn()?)
            .await
            .optional()?;
        Ok(row.map(TicketType::from))
    }

    async fn try_reserve_capacity(&mut self, ticket_type_id: Uuid, quantity: i32) -> StoreResult<bool> {
        let updated = diesel::update(ticket_types::table)
            .filter(ticket_types::id.eq(ticket_type_id))
            .filter(ticket_types::is_active.eq(true))
            // Counters never sum past i32::MAX; compare against headroom
            // instead of adding the quantity to them.
            .filter(
                (ticket_types::capacity_reserved + ticket_types::capacity_confirmed)
                    .le(i32::MAX.saturating_sub(quantity)),
            )
            .filter(
                ticket_types::capacity_total.is_null().or((ticket_types::capacity_total
                    - ticket_types::capacity_reserved.nullable()
                    - ticket_types::capacity_confirmed.nullable())
                .ge(quantity)),
            )
            .set(ticket_types::capacity_reserved.eq(ticket_types::capacity_reserved + quantity))
            .execute(self.conn()?)
            .await?;
        Ok(updated == 1)
    }

    async fn commit_reserved_capacity(&mut self, ticket_type_id: Uuid, quantity: i32) -> StoreResult<()> {
        diesel::update(ticket_types::table.find(ticket_type_id))
            .set((
                ticket_types::capacity_reserved.eq(ticket_types::capacity_reserved - quantity),
                ticket_types::capacity_confirmed.eq(ticket_types::capacity_confirmed + quantity),
            ))
            .execute(self.conn()?)
            .await?;
        Ok(())
    }

    async fn release_reserved_capacity(&mut self, ticket_type_id: Uuid, quantity: i32) -> StoreResult<()> {
        diesel::update(ticket_types::table.find(ticket_type_id))
            .set(ticket_types::capacity_reserved.eq(ticket_types::capacity_reserved - quantity))
            .execute(self.conn()?)
            .await?;
        Ok(())
    }

    async fn insert_reservation(&mut self, reservation: &Reservation) -> StoreResult<()> {
        diesel::insert_into(reservations::table)
            .values(DbReservation::from(reservation))
            .execute(self.conn()?)
            .await?;
        Ok(())
    }

    async fn reservation(&mut self, token: ReservationToken) -> StoreResult<Option<Reservation>> {
        reservations::table
            .find(token.as_uuid())
            .select(DbReservation::as_select())
            .first(self.conn()?)
            .await
            .optional()?
            .map(Reservation::try_from)
            .transpose()
    }

    async fn compare_and_set_reservation(
        &mut self,
        token: ReservationToken,
        from: ReservationStatus,
        to: ReservationStatus,
    ) -> StoreResult<bool> {
        let updated = diesel::update(reservations::table)
            .filter(reservations::token.eq(token.as_uuid()))
            .filter(reservations::status.eq(from.as_str()))
            .set(reservations::status.eq(to.as_str()))
            .execute(self.conn()?)
            .await?;
        Ok(updated == 1)
    }

    async fn promo_code(&mut self, code: &str) -> StoreResult<Option<PromoCode>> {
        promo_codes::table
            .find(code)
            .select(DbPromoCode::as_select())
            .first(self.conn()?)
            .await
            .optional()?
            .map(PromoCode::try_from)
            .transpose()
    }

    async fn lock_promo_code(&mut self, code: &str) -> StoreResult<Option<PromoCode>> {
        promo_codes::table
            .find(code)
            .select(DbPromoCode::as_select())
            .for_update()
            .first(self.conn()?)
            .await
            .optional()?
            .map(PromoCode::try_from)
            .transpose()
    }

    async fn try_increment_promo_uses(&mut self, code: &str) -> StoreResult<bool> {
        let updated = diesel::update(promo_codes::table)
            .filter(promo_codes::code.eq(code))
            .filter(
                promo_codes::max_uses
                    .is_null()
                    .or(promo_codes::current_uses.lt(promo_codes::max_uses.assume_not_null())),
            )
            .set(promo_codes::current_uses.eq(promo_codes::current_uses + 1))
            .execute(self.conn()?)
            .await?;
        Ok(updated == 1)
    }

    async fn count_promo_redemptions(&mut self, code: &str, user_id: Uuid) -> StoreResult<i64> {
        let count = promo_redemptions::table
            .filter(promo_redemptions::code.eq(code))
            .filter(promo_redemptions::user_id.eq(user_id))
            .count()
            .get_result(self.conn()?)
            .await?;
        Ok(count)
    }

    async fn promo_redemption_for_booking(&mut self, booking_id: Uuid) -> StoreResult<Option<PromoRedemption>> {
        let row = promo_redemptions::table
            .filter(promo_redemptions::booking_id.eq(booking_id))
            .select(DbPromoRedemption::as_select())
            .first(self.conn()?)
            .await
            .optional()?;
        Ok(row.map(PromoRedemption::from))
    }

    async fn insert_promo_redemption(&mut self, redemption: &PromoRedemption) -> StoreResult<()> {
        diesel::insert_into(promo_redemptions::table)
            .values(DbPromoRedemption::from(redemption))
            .execute(self.conn()?)
            .await?;
        Ok(())
    }

    async fn insert_booking(&mut self, booking: &Booking) -> StoreResult<()> {
        diesel::insert_into(bookings::table)
            .values(DbBooking::from(booking))
            .execute(self.conn()?)
            .await?;
        Ok(())
    }

    async fn booking(&mut self, id: Uuid) -> StoreResult<Option<Booking>> {
        bookings::table
            .find(id)
            .select(DbBooking::as_select())
            .first(self.conn()?)
            .await
            .optional()?
            .map(Booking::try_from)
            .transpose()
    }

    async fn active_booking_for(&mut self, user_id: Uuid, event_id: Uuid) -> StoreResult<Option<Booking>> {
        bookings::table
            .filter(bookings::user_id.eq(user_id))
            .filter(bookings::event_id.eq(event_id))
            .filter(bookings::state.eq_any(ACTIVE_STATES))
            .select(DbBooking::as_select())
            .first(self.conn()?)
            .await
            .optional()?
            .map(Booking::try_from)
            .transpose()
    }

    async fn compare_and_set_booking_state(
        &mut self,
        id: Uuid,
        from: BookingState,
        to: BookingState,
        failure_reason: Option<FailureCategory>,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let updated = diesel::update(bookings::table)
            .filter(bookings::id.eq(id))
            .filter(bookings::state.eq(from.as_str()))
            .set((
                bookings::state.eq(to.as_str()),
                bookings::failure_reason.eq(failure_reason.map(FailureCategory::as_str)),
                bookings::updated_at.eq(at),
            ))
            .execute(self.conn()?)
            .await?;
        Ok(updated == 1)
    }

    async fn bookings_for_user(&mut self, user_id: Uuid) -> StoreResult<Vec<Booking>> {
        bookings::table
            .filter(bookings::user_id.eq(user_id))
            .order(bookings::created_at.desc())
            .select(DbBooking::as_select())
            .load(self.conn()?)
            .await?
            .into_iter()
            .map(Booking::try_from)
            .collect()
    }

    async fn expired_booking_ids(&mut self, now: DateTime<Utc>, limit: i64) -> StoreResult<Vec<Uuid>> {
        let ids = bookings::table
            .filter(bookings::state.eq_any(ACTIVE_STATES))
            .filter(bookings::expires_at.lt(now))
            .order(bookings::expires_at.asc())
            .limit(limit)
            .select(bookings::id)
            .load(self.conn()?)
            .await?;
        Ok(ids)
    }

    async fn insert_payment(&mut self, payment: &Payment) -> StoreResult<()> {
        diesel::insert_into(payments::table)
            .values(DbPayment::from(payment))
            .execute(self.conn()?)
            .await?;
        Ok(())
    }

    async fn payment(&mut self, id: Uuid) -> StoreResult<Option<Payment>> {
        payments::table
            .find(id)
            .select(DbPayment::as_select())
            .first(self.conn()?)
            .await
            .optional()?
            .map(Payment::try_from)
            .transpose()
    }

    async fn payment_by_reference(&mut self, reference: &str) -> StoreResult<Option<Payment>> {
        payments::table
            .filter(payments::provider_reference.eq(reference))
            .select(DbPayment::as_select())
            .first(self.conn()?)
            .await
            .optional()?
            .map(Payment::try_from)
            .transpose()
    }

    async fn open_payment_for_booking(&mut self, booking_id: Uuid) -> StoreResult<Option<Payment>> {
        payments::table
            .filter(payments::booking_id.eq(booking_id))
            .filter(payments::status.eq_any(OPEN_STATUSES))
            .select(DbPayment::as_select())
            .first(self.conn()?)
            .await
            .optional()?
            .map(Payment::try_from)
            .transpose()
    }

    async fn completed_payment_for_booking(&mut self, booking_id: Uuid) -> StoreResult<Option<Payment>> {
        payments::table
            .filter(payments::booking_id.eq(booking_id))
            .filter(payments::status.eq(PaymentStatus::Completed.as_str()))
            .select(DbPayment::as_select())
            .first(self.conn()?)
            .await
            .optional()?
            .map(Payment::try_from)
            .transpose()
    }

    async fn compare_and_set_payment(
        &mut self,
        id: Uuid,
        from: PaymentStatus,
        update: &PaymentUpdate,
    ) -> StoreResult<bool> {
        let updated = diesel::update(payments::table)
            .filter(payments::id.eq(id))
            .filter(payments::status.eq(from.as_str()))
            .set(PaymentChangeset::from(update))
            .execute(self.conn()?)
            .await?;
        Ok(updated == 1)
    }

    async fn payments_for_user(&mut self, user_id: Uuid) -> StoreResult<Vec<Payment>> {
        payments::table
            .inner_join(bookings::table)
            .filter(bookings::user_id.eq(user_id))
            .order(payments::created_at.desc())
            .select(DbPayment::as_select())
            .load(self.conn()?)
            .await?
            .into_iter()
            .map(Payment::try_from)
            .collect()
    }

    async fn insert_outbox_event(&mut self, event: &OutboxEvent) -> StoreResult<()> {
        diesel::insert_into(outbox_events::table)
            .values(DbOutboxEvent::from(event))
            .execute(self.conn()?)
            .await?;
        Ok(())
    }

    async fn pending_outbox_events(&mut self, limit: i64) -> StoreResult<Vec<OutboxEvent>> {
        let rows = outbox_events::table
            .filter(outbox_events::processed.eq(false))
            .order(outbox_events::created_at.asc())
            .limit(limit)
            .select(DbOutboxEvent::as_select())
            .load(self.conn()?)
            .await?;
        Ok(rows.into_iter().map(OutboxEvent::from).collect())
    }

    async fn mark_outbox_published(&mut self, id: Uuid) -> StoreResult<()> {
        diesel::update(outbox_events::table.find(id))
            .set(outbox_events::processed.eq(true))
            .execute(self.conn()?)
            .await?;
        Ok(())
    }

    async fn commit(mut self) -> StoreResult<()> {
        if let Some(mut conn) = self.conn.take() {
            AnsiTransactionManager::commit_transaction(&mut *conn).await?;
        }
        Ok(())
    }
}
