//! Row types for the diesel schema and their conversions to the domain model.
//!
//! Enum-valued columns are stored as their snake_case names; a value that does
//! not parse back is reported as [`StoreError::Corrupt`].

use std::str::FromStr;

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use shared::*;
use uuid::Uuid;

use crate::schema::*;
use crate::store::StoreError;

fn parse_column<T>(value: &str) -> Result<T, StoreError>
where
    T: FromStr<Err = UnknownVariant>,
{
    value.parse().map_err(|e: UnknownVariant| StoreError::Corrupt(e.to_string()))
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = events)]
pub struct DbEvent {
    pub id: Uuid,
    pub title: String,
    pub starts_at: DateTime<Utc>,
    pub is_free: bool,
}

impl From<DbEvent> for Event {
    fn from(row: DbEvent) -> Self {
        Self {
            id: row.id,
            title: row.title,
            starts_at: row.starts_at,
            is_free: row.is_free,
        }
    }
}

impl From<&Event> for DbEvent {
    fn from(event: &Event) -> Self {
        Self {
            id: event.id,
            title: event.title.clone(),
            starts_at: event.starts_at,
            is_free: event.is_free,
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = ticket_types)]
pub struct DbTicketType {
    pub id: Uuid,
    pub event_id: Uuid,
    pub name: String,
    pub capacity_total: Option<i32>,
    pub capacity_reserved: i32,
    pub capacity_confirmed: i32,
    pub unit_price: BigDecimal,
    pub is_active: bool,
}

impl From<DbTicketType> for TicketType {
    fn from(row: DbTicketType) -> Self {
        Self {
            id: row.id,
            event_id: row.event_id,
            name: row.name,
            capacity_total: row.capacity_total,
            capacity_reserved: row.capacity_reserved,
            capacity_confirmed: row.capacity_confirmed,
            unit_price: row.unit_price,
            is_active: row.is_active,
        }
    }
}

impl From<&TicketType> for DbTicketType {
    fn from(ticket_type: &TicketType) -> Self {
        Self {
            id: ticket_type.id,
            event_id: ticket_type.event_id,
            name: ticket_type.name.clone(),
            capacity_total: ticket_type.capacity_total,
            capacity_reserved: ticket_type.capacity_reserved,
            capacity_confirmed: ticket_type.capacity_confirmed,
            unit_price: ticket_type.unit_price.clone(),
            is_active: ticket_type.is_active,
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = reservations)]
pub struct DbReservation {
    pub token: Uuid,
    pub ticket_type_id: Uuid,
    pub quantity: i32,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<DbReservation> for Reservation {
    type Error = StoreError;

    fn try_from(row: DbReservation) -> Result<Self, Self::Error> {
        Ok(Self {
            token: ReservationToken::from_uuid(row.token),
            ticket_type_id: row.ticket_type_id,
            quantity: row.quantity,
            status: parse_column(&row.status)?,
            created_at: row.created_at,
        })
    }
}

impl From<&Reservation> for DbReservation {
    fn from(reservation: &Reservation) -> Self {
        Self {
            token: reservation.token.as_uuid(),
            ticket_type_id: reservation.ticket_type_id,
            quantity: reservation.quantity,
            status: reservation.status.as_str().to_string(),
            created_at: reservation.created_at,
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = promo_codes)]
pub struct DbPromoCode {
    pub code: String,
    pub event_id: Option<Uuid>,
    pub discount_type: String,
    pub discount_value: BigDecimal,
    pub max_uses: Option<i32>,
    pub max_uses_per_user: i32,
    pub current_uses: i32,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    pub is_active: bool,
}

impl TryFrom<DbPromoCode> for PromoCode {
    type Error = StoreError;

    fn try_from(row: DbPromoCode) -> Result<Self, Self::Error> {
        Ok(Self {
            discount_type: parse_column(&row.discount_type)?,
            code: row.code,
            event_id: row.event_id,
            discount_value: row.discount_value,
            max_uses: row.max_uses,
            max_uses_per_user: row.max_uses_per_user,
            current_uses: row.current_uses,
            valid_from: row.valid_from,
            valid_until: row.valid_until,
            is_active: row.is_active,
        })
    }
}

impl From<&PromoCode> for DbPromoCode {
    fn from(promo: &PromoCode) -> Self {
        Self {
            code: promo.code.clone(),
            event_id: promo.event_id,
            discount_type: promo.discount_type.as_str().to_string(),
            discount_value: promo.discount_value.clone(),
            max_uses: promo.max_uses,
            max_uses_per_user: promo.max_uses_per_user,
            current_uses: promo.current_uses,
            valid_from: promo.valid_from,
            valid_until: promo.valid_until,
            is_active: promo.is_active,
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = promo_redemptions)]
pub struct DbPromoRedemption {
    pub id: Uuid,
    pub code: String,
    pub user_id: Uuid,
    pub booking_id: Uuid,
    pub redeemed_at: DateTime<Utc>,
}

impl From<DbPromoRedemption> for PromoRedemption {
    fn from(row: DbPromoRedemption) -> Self {
        Self {
            id: row.id,
            code: row.code,
            user_id: row.user_id,
            booking_id: row.booking_id,
            redeemed_at: row.redeemed_at,
        }
    }
}

impl From<&PromoRedemption> for DbPromoRedemption {
    fn from(redemption: &PromoRedemption) -> Self {
        Self {
            id: redemption.id,
            code: redemption.code.clone(),
            user_id: redemption.user_id,
            booking_id: redemption.booking_id,
            redeemed_at: redemption.redeemed_at,
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = bookings)]
pub struct DbBooking {
    pub id: Uuid,
    pub event_id: Uuid,
    pub user_id: Uuid,
    pub ticket_type_id: Option<Uuid>,
    pub reservation_token: Option<Uuid>,
    pub promo_code: Option<String>,
    pub quantity: i32,
    pub unit_price: BigDecimal,
    pub discount_amount: BigDecimal,
    pub total_amount: BigDecimal,
    pub state: String,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl TryFrom<DbBooking> for Booking {
    type Error = StoreError;

    fn try_from(row: DbBooking) -> Result<Self, Self::Error> {
        let failure_reason = row
            .failure_reason
            .as_deref()
            .map(parse_column::<FailureCategory>)
            .transpose()?;

        Ok(Self {
            id: row.id,
            event_id: row.event_id,
            user_id: row.user_id,
            ticket_type_id: row.ticket_type_id,
            reservation: row.reservation_token.map(ReservationToken::from_uuid),
            promo_code: row.promo_code,
            quantity: row.quantity,
            unit_price: row.unit_price,
            discount_amount: row.discount_amount,
            total_amount: row.total_amount,
            state: parse_column(&row.state)?,
            failure_reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
            expires_at: row.expires_at,
        })
    }
}

impl From<&Booking> for DbBooking {
    fn from(booking: &Booking) -> Self {
        Self {
            id: booking.id,
            event_id: booking.event_id,
            user_id: booking.user_id,
            ticket_type_id: booking.ticket_type_id,
            reservation_token: booking.reservation.map(|token| token.as_uuid()),
            promo_code: booking.promo_code.clone(),
            quantity: booking.quantity,
            unit_price: booking.unit_price.clone(),
            discount_amount: booking.discount_amount.clone(),
            total_amount: booking.total_amount.clone(),
            state: booking.state.as_str().to_string(),
            failure_reason: booking.failure_reason.map(|r| r.as_str().to_string()),
            created_at: booking.created_at,
            updated_at: booking.updated_at,
            expires_at: booking.expires_at,
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = payments)]
pub struct DbPayment {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub phone_number: String,
    pub provider_reference: Option<String>,
    pub status: String,
    pub amount: BigDecimal,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<DbPayment> for Payment {
    type Error = StoreError;

    fn try_from(row: DbPayment) -> Result<Self, Self::Error> {
        Ok(Self {
            status: parse_column(&row.status)?,
            id: row.id,
            booking_id: row.booking_id,
            phone_number: row.phone_number,
            provider_reference: row.provider_reference,
            amount: row.amount,
            error_message: row.error_message,
            created_at: row.created_at,
            completed_at: row.completed_at,
        })
    }
}

impl From<&Payment> for DbPayment {
    fn from(payment: &Payment) -> Self {
        Self {
            id: payment.id,
            booking_id: payment.booking_id,
            phone_number: payment.phone_number.clone(),
            provider_reference: payment.provider_reference.clone(),
            status: payment.status.as_str().to_string(),
            amount: payment.amount.clone(),
            error_message: payment.error_message.clone(),
            created_at: payment.created_at,
            completed_at: payment.completed_at,
        }
    }
}

/// Columns written by a payment status change. `None` leaves a column untouched.
#[derive(Debug, Clone, AsChangeset)]
#[diesel(table_name = payments)]
pub struct PaymentChangeset {
    pub status: String,
    pub provider_reference: Option<String>,
    pub error_message: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&PaymentUpdate> for PaymentChangeset {
    fn from(update: &PaymentUpdate) -> Self {
        Self {
            status: update.status.as_str().to_string(),
            provider_reference: update.provider_reference.clone(),
            error_message: update.error_message.clone(),
            completed_at: update.completed_at,
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = outbox_events)]
pub struct DbOutboxEvent {
    pub id: Uuid,
    pub aggregate_id: Uuid,
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub processed: bool,
    pub created_at: DateTime<Utc>,
}

impl From<DbOutboxEvent> for OutboxEvent {
    fn from(row: DbOutboxEvent) -> Self {
        Self {
            id: row.id,
            aggregate_id: row.aggregate_id,
            event_type: row.event_type,
            event_data: row.event_data,
            processed: row.processed,
            created_at: row.created_at,
        }
    }
}

impl From<&OutboxEvent> for DbOutboxEvent {
    fn from(event: &OutboxEvent) -> Self {
        Self {
            id: event.id,
            aggregate_id: event.aggregate_id,
            event_type: event.event_type.clone(),
            event_data: event.event_data.clone(),
            processed: event.processed,
            created_at: event.created_at,
        }
    }
}
