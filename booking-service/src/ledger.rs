//! Capacity ledger: the only authority on how many tickets are left.
//!
//! A reservation moves `held -> confirmed` or `held -> released` exactly once;
//! the counter change rides on the same compare-and-set, so confirming or
//! releasing twice is a no-op.

use std::sync::Arc;

use shared::{Clock, Reservation, ReservationStatus, ReservationToken, TicketType};
use tracing::debug;
use uuid::Uuid;

use crate::error::BookingError;
use crate::store::{Store, StoreTx};

/// Most tickets one booking may hold.
pub const MAX_QUANTITY_PER_BOOKING: i32 = 100;

pub fn check_quantity(quantity: i32) -> Result<(), BookingError> {
    if (1..=MAX_QUANTITY_PER_BOOKING).contains(&quantity) {
        Ok(())
    } else {
        Err(BookingError::InvalidQuantity(quantity))
    }
}

pub async fn reserve_in<T: StoreTx>(
    tx: &mut T,
    ticket_type_id: Uuid,
    quantity: i32,
    clock: &dyn Clock,
) -> Result<ReservationToken, BookingError> {
    check_quantity(quantity)?;

    let ticket_type = tx
        .ticket_type(ticket_type_id)
        .await?
        .filter(|t| t.is_active)
        .ok_or(BookingError::TicketTypeUnavailable(ticket_type_id))?;

    if !tx.try_reserve_capacity(ticket_type.id, quantity).await? {
        return Err(BookingError::InsufficientInventory);
    }

    let reservation = Reservation {
        token: ReservationToken::new(),
        ticket_type_id,
        quantity,
        status: ReservationStatus::Held,
        created_at: clock.now(),
    };
    tx.insert_reservation(&reservation).await?;

    debug!(%ticket_type_id, quantity, token = %reservation.token, "Reserved capacity");
    Ok(reservation.token)
}

/// Returns whether this call did the confirming.
pub async fn confirm_in<T: StoreTx>(
    tx: &mut T,
    token: ReservationToken,
) -> Result<bool, BookingError> {
    let reservation = tx
        .reservation(token)
        .await?
        .ok_or(BookingError::ReservationNotFound(token))?;

    if !tx
        .compare_and_set_reservation(token, ReservationStatus::Held, ReservationStatus::Confirmed)
        .await?
    {
        return Ok(false);
    }

    tx.commit_reserved_capacity(reservation.ticket_type_id, reservation.quantity)
        .await?;
    Ok(true)
}

/// Returns whether this call did the releasing.
pub async fn release_in<T: StoreTx>(
    tx: &mut T,
    token: ReservationToken,
) -> Result<bool, BookingError> {
    let reservation = tx
        .reservation(token)
        .await?
        .ok_or(BookingError::ReservationNotFound(token))?;

    if !tx
        .compare_and_set_reservation(token, ReservationStatus::Held, ReservationStatus::Released)
        .await?
    {
        return Ok(false);
    }

    tx.release_reserved_capacity(reservation.ticket_type_id, reservation.quantity)
        .await?;
    Ok(true)
}

/// Standalone ledger operations, each in its own transaction.
pub struct InventoryLedger<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
}

impl<S> Clone for InventoryLedger<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            clock: self.clock.clone(),
        }
    }
}

impl<S: Store> InventoryLedger<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn reserve(
        &self,
        ticket_type_id: Uuid,
        quantity: i32,
    ) -> Result<ReservationToken, BookingError> {
        let mut tx = self.store.begin().await?;
        let token = reserve_in(&mut tx, ticket_type_id, quantity, self.clock.as_ref()).await?;
        tx.commit().await?;
        Ok(token)
    }

    pub async fn confirm(&self, token: ReservationToken) -> Result<bool, BookingError> {
        let mut tx = self.store.begin().await?;
        let confirmed = confirm_in(&mut tx, token).await?;
        tx.commit().await?;
        Ok(confirmed)
    }

    pub async fn release(&self, token: ReservationToken) -> Result<bool, BookingError> {
        let mut tx = self.store.begin().await?;
        let released = release_in(&mut tx, token).await?;
        tx.commit().await?;
        Ok(released)
    }

    pub async fn availability(&self, ticket_type_id: Uuid) -> Result<Option<TicketType>, BookingError> {
        let mut tx = self.store.begin().await?;
        Ok(tx.ticket_type(ticket_type_id).await?)
    }
}
