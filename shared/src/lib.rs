use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};
use bigdecimal::BigDecimal;

pub mod booking;
pub mod clock;
pub mod inventory;
pub mod payment;
pub mod promo;

pub use booking::*;
pub use clock::*;
pub use inventory::*;
pub use payment::*;
pub use promo::*;

/// Returned when a persisted enum column holds a value this build does not know.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl UnknownVariant {
    pub fn new(kind: &'static str, value: impl Into<String>) -> Self {
        Self { kind, value: value.into() }
    }
}

/// Booking lifecycle facts published to downstream consumers (notifications, analytics).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BookingEvent {
    BookingCreated {
        booking_id: Uuid,
        event_id: Uuid,
        user_id: Uuid,
        state: BookingState,
        total_amount: BigDecimal,
    },
    BookingConfirmed {
        booking_id: Uuid,
        event_id: Uuid,
        user_id: Uuid,
    },
    BookingPaymentFailed {
        booking_id: Uuid,
        user_id: Uuid,
        reason: FailureCategory,
    },
    BookingCancelled {
        booking_id: Uuid,
        user_id: Uuid,
    },
    BookingExpired {
        booking_id: Uuid,
        user_id: Uuid,
    },
}

impl BookingEvent {
    pub fn booking_id(&self) -> Uuid {
        match self {
            Self::BookingCreated { booking_id, .. }
            | Self::BookingConfirmed { booking_id, .. }
            | Self::BookingPaymentFailed { booking_id, .. }
            | Self::BookingCancelled { booking_id, .. }
            | Self::BookingExpired { booking_id, .. } => *booking_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::BookingCreated { .. } => "BookingCreated",
            Self::BookingConfirmed { .. } => "BookingConfirmed",
            Self::BookingPaymentFailed { .. } => "BookingPaymentFailed",
            Self::BookingCancelled { .. } => "BookingCancelled",
            Self::BookingExpired { .. } => "BookingExpired",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: Uuid,
    pub aggregate_id: Uuid,
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub processed: bool,
    pub created_at: DateTime<Utc>,
}

impl OutboxEvent {
    pub fn from_booking_event(event: &BookingEvent, at: DateTime<Utc>) -> serde_json::Result<Self> {
        Ok(Self {
            id: Uuid::new_v4(),
            aggregate_id: event.booking_id(),
            event_type: event.event_type().to_string(),
            event_data: serde_json::to_value(event)?,
            processed: false,
            created_at: at,
        })
    }
}
