use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::*;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{
    Store, StoreError, StoreResult, StoreTx, ACTIVE_BOOKING_CONSTRAINT, OPEN_PAYMENT_CONSTRAINT,
    REDEMPTION_CONSTRAINT,
};

#[derive(Debug, Clone, Default)]
struct State {
    events: HashMap<Uuid, Event>,
    ticket_types: HashMap<Uuid, TicketType>,
    reservations: HashMap<ReservationToken, Reservation>,
    promo_codes: HashMap<String, PromoCode>,
    redemptions: Vec<PromoRedemption>,
    bookings: HashMap<Uuid, Booking>,
    payments: HashMap<Uuid, Payment>,
    outbox: Vec<OutboxEvent>,
}

/// In-process store. Transactions are serialized by a single lock and work on
/// a copy of the state that replaces the shared state on commit.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

pub struct MemoryTx {
    guard: OwnedMutexGuard<State>,
    working: State,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_event(&self, event: Event) {
        self.state.lock().await.events.insert(event.id, event);
    }

    pub async fn insert_ticket_type(&self, ticket_type: TicketType) {
        self.state
            .lock()
            .await
            .ticket_types
            .insert(ticket_type.id, ticket_type);
    }

    pub async fn insert_promo_code(&self, mut promo: PromoCode) {
        promo.code = PromoCode::normalize_code(&promo.code);
        self.state
            .lock()
            .await
            .promo_codes
            .insert(promo.code.clone(), promo);
    }

    pub async fn redemptions(&self) -> Vec<PromoRedemption> {
        self.state.lock().await.redemptions.clone()
    }

    pub async fn outbox(&self) -> Vec<OutboxEvent> {
        self.state.lock().await.outbox.clone()
    }

    pub async fn payments_for_booking(&self, booking_id: Uuid) -> Vec<Payment> {
        let state = self.state.lock().await;
        let mut payments: Vec<_> = state
            .payments
            .values()
            .filter(|p| p.booking_id == booking_id)
            .cloned()
            .collect();
        payments.sort_by_key(|p| p.created_at);
        payments
    }
}

#[async_trait]
impl Store for MemoryStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> StoreResult<MemoryTx> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(MemoryTx { guard, working })
    }
}

impl MemoryTx {
    fn ticket_type_mut(&mut self, id: Uuid) -> StoreResult<&mut TicketType> {
        self.working
            .ticket_types
            .get_mut(&id)
            .ok_or_else(|| StoreError::Corrupt(format!("ticket type {id} does not exist")))
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn event(&mut self, id: Uuid) -> StoreResult<Option<Event>> {
        Ok(self.working.events.get(&id).cloned())
    }

    async fn ticket_type(&mut self, id: Uuid) -> StoreResult<Option<TicketType>> {
        Ok(self.working.ticket_types.get(&id).cloned())
    }

    async fn try_reserve_capacity(&mut self, ticket_type_id: Uuid, quantity: i32) -> StoreResult<bool> {
        let Some(ticket_type) = self.working.ticket_types.get_mut(&ticket_type_id) else {
            return Ok(false);
        };
        if !ticket_type.can_reserve(quantity) {
            return Ok(false);
        }
        ticket_type.capacity_reserved += quantity;
        Ok(true)
    }

    async fn commit_reserved_capacity(&mut self, ticket_type_id: Uuid, quantity: i32) -> StoreResult<()> {
        let ticket_type = self.ticket_type_mut(ticket_type_id)?;
        ticket_type.capacity_reserved -= quantity;
        ticket_type.capacity_confirmed += quantity;
        Ok(())
    }

    async fn release_reserved_capacity(&mut self, ticket_type_id: Uuid, quantity: i32) -> StoreResult<()> {
        let ticket_type = self.ticket_type_mut(ticket_type_id)?;
        ticket_type.capacity_reserved -= quantity;
        Ok(())
    }

    async fn insert_reservation(&mut self, reservation: &Reservation) -> StoreResult<()> {
        self.working
            .reservations
            .insert(reservation.token, reservation.clone());
        Ok(())
    }

    async fn reservation(&mut self, token: ReservationToken) -> StoreResult<Option<Reservation>> {
        Ok(self.working.reservations.get(&token).cloned())
    }

    async fn compare_and_set_reservation(
        &mut self,
        token: ReservationToken,
        from: ReservationStatus,
        to: ReservationStatus,
    ) -> StoreResult<bool> {
        match self.working.reservations.get_mut(&token) {
            Some(reservation) if reservation.status == from => {
                reservation.status = to;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn promo_code(&mut self, code: &str) -> StoreResult<Option<PromoCode>> {
        Ok(self.working.promo_codes.get(code).cloned())
    }

    async fn lock_promo_code(&mut self, code: &str) -> StoreResult<Option<PromoCode>> {
        // The whole store is already held by this transaction.
        self.promo_code(code).await
    }

    async fn try_increment_promo_uses(&mut self, code: &str) -> StoreResult<bool> {
        match self.working.promo_codes.get_mut(code) {
            Some(promo) if !promo.is_exhausted() => {
                promo.current_uses += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn count_promo_redemptions(&mut self, code: &str, user_id: Uuid) -> StoreResult<i64> {
        let count = self
            .working
            .redemptions
            .iter()
            .filter(|r| r.code == code && r.user_id == user_id)
            .count();
        Ok(count as i64)
    }

    async fn promo_redemption_for_booking(&mut self, booking_id: Uuid) -> StoreResult<Option<PromoRedemption>> {
        Ok(self
            .working
            .redemptions
            .iter()
            .find(|r| r.booking_id == booking_id)
            .cloned())
    }

    async fn insert_promo_redemption(&mut self, redemption: &PromoRedemption) -> StoreResult<()> {
        if self
            .working
            .redemptions
            .iter()
            .any(|r| r.booking_id == redemption.booking_id)
        {
            return Err(StoreError::UniqueViolation(REDEMPTION_CONSTRAINT.to_string()));
        }
        self.working.redemptions.push(redemption.clone());
        Ok(())
    }

    async fn insert_booking(&mut self, booking: &Booking) -> StoreResult<()> {
        let duplicate = booking.state.is_active()
            && self.working.bookings.values().any(|b| {
                b.user_id == booking.user_id && b.event_id == booking.event_id && b.state.is_active()
            });
        if duplicate {
            return Err(StoreError::UniqueViolation(ACTIVE_BOOKING_CONSTRAINT.to_string()));
        }
        self.working.bookings.insert(booking.id, booking.clone());
        Ok(())
    }

    async fn booking(&mut self, id: Uuid) -> StoreResult<Option<Booking>> {
        Ok(self.working.bookings.get(&id).cloned())
    }

    async fn active_booking_for(&mut self, user_id: Uuid, event_id: Uuid) -> StoreResult<Option<Booking>> {
        Ok(self
            .working
            .bookings
            .values()
            .find(|b| b.user_id == user_id && b.event_id == event_id && b.state.is_active())
            .cloned())
    }

    async fn compare_and_set_booking_state(
        &mut self,
        id: Uuid,
        from: BookingState,
        to: BookingState,
        failure_reason: Option<FailureCategory>,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        match self.working.bookings.get_mut(&id) {
            Some(booking) if booking.state == from => {
                booking.state = to;
                booking.failure_reason = failure_reason;
                booking.updated_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn bookings_for_user(&mut self, user_id: Uuid) -> StoreResult<Vec<Booking>> {
        let mut bookings: Vec<_> = self
            .working
            .bookings
            .values()
            .filter(|b| b.user_id == user_id)
            .cloned()
            .collect();
        bookings.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(bookings)
    }

    async fn expired_booking_ids(&mut self, now: DateTime<Utc>, limit: i64) -> StoreResult<Vec<Uuid>> {
        let mut due: Vec<_> = self
            .working
            .bookings
            .values()
            .filter(|b| b.is_due_for_expiry(now))
            .map(|b| (b.expires_at, b.id))
            .collect();
        due.sort();
        Ok(due
            .into_iter()
            .take(usize::try_from(limit).unwrap_or(0))
            .map(|(_, id)| id)
            .collect())
    }

    async fn insert_payment(&mut self, payment: &Payment) -> StoreResult<()> {
        let open_exists = !payment.status.is_terminal()
            && self
                .working
                .payments
                .values()
                .any(|p| p.booking_id == payment.booking_id && !p.status.is_terminal());
        if open_exists {
            return Err(StoreError::UniqueViolation(OPEN_PAYMENT_CONSTRAINT.to_string()));
        }
        self.working.payments.insert(payment.id, payment.clone());
        Ok(())
    }

    async fn payment(&mut self, id: Uuid) -> StoreResult<Option<Payment>> {
        Ok(self.working.payments.get(&id).cloned())
    }

    async fn payment_by_reference(&mut self, reference: &str) -> StoreResult<Option<Payment>> {
        Ok(self
            .working
            .payments
            .values()
            .find(|p| p.provider_reference.as_deref() == Some(reference))
            .cloned())
    }

    async fn open_payment_for_booking(&mut self, booking_id: Uuid) -> StoreResult<Option<Payment>> {
        Ok(self
            .working
            .payments
            .values()
            .find(|p| p.booking_id == booking_id && !p.status.is_terminal())
            .cloned())
    }

    async fn completed_payment_for_booking(&mut self, booking_id: Uuid) -> StoreResult<Option<Payment>> {
        Ok(self
            .working
            .payments
            .values()
            .find(|p| p.booking_id == booking_id && p.status == PaymentStatus::Completed)
            .cloned())
    }

    async fn compare_and_set_payment(
        &mut self,
        id: Uuid,
        from: PaymentStatus,
        update: &PaymentUpdate,
    ) -> StoreResult<bool> {
        match self.working.payments.get_mut(&id) {
            Some(payment) if payment.status == from => {
                update.apply_to(payment);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn payments_for_user(&mut self, user_id: Uuid) -> StoreResult<Vec<Payment>> {
        let bookings = &self.working.bookings;
        let mut payments: Vec<_> = self
            .working
            .payments
            .values()
            .filter(|p| bookings.get(&p.booking_id).map_or(false, |b| b.user_id == user_id))
            .cloned()
            .collect();
        payments.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(payments)
    }

    async fn insert_outbox_event(&mut self, event: &OutboxEvent) -> StoreResult<()> {
        self.working.outbox.push(event.clone());
        Ok(())
    }

    async fn pending_outbox_events(&mut self, limit: i64) -> StoreResult<Vec<OutboxEvent>> {
        Ok(self
            .working
            .outbox
            .iter()
            .filter(|e| !e.processed)
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect())
    }

    async fn mark_outbox_published(&mut self, id: Uuid) -> StoreResult<()> {
        if let Some(event) = self.working.outbox.iter_mut().find(|e| e.id == id) {
            event.processed = true;
        }
        Ok(())
    }

    async fn commit(mut self) -> StoreResult<()> {
        *self.guard = self.working;
        Ok(())
    }
}
