use std::fmt;
use std::str::FromStr;

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use num_traits::Zero;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Discount, FailureCategory, ReservationToken, UnknownVariant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingState {
    Created,
    PendingPayment,
    Confirmed,
    PaymentFailed,
    Expired,
    Cancelled,
}

impl BookingState {
    /// States that still hold a reservation and may move on.
    pub const ACTIVE: [BookingState; 2] = [BookingState::Created, BookingState::PendingPayment];

    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Confirmed | Self::PaymentFailed | Self::Expired | Self::Cancelled
        )
    }

    pub const fn is_active(self) -> bool {
        !self.is_terminal()
    }

    pub const fn can_transition_to(self, next: BookingState) -> bool {
        match self {
            Self::Created => matches!(
                next,
                Self::PendingPayment | Self::Confirmed | Self::Expired | Self::Cancelled
            ),
            Self::PendingPayment => matches!(
                next,
                Self::Confirmed | Self::PaymentFailed | Self::Expired | Self::Cancelled
            ),
            Self::Confirmed | Self::PaymentFailed | Self::Expired | Self::Cancelled => false,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::PendingPayment => "pending_payment",
            Self::Confirmed => "confirmed",
            Self::PaymentFailed => "payment_failed",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for BookingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingState {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "pending_payment" => Ok(Self::PendingPayment),
            "confirmed" => Ok(Self::Confirmed),
            "payment_failed" => Ok(Self::PaymentFailed),
            "expired" => Ok(Self::Expired),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(UnknownVariant::new("booking state", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Uuid,
    pub event_id: Uuid,
    pub user_id: Uuid,
    pub ticket_type_id: Option<Uuid>,
    pub reservation: Option<ReservationToken>,
    pub promo_code: Option<String>,
    pub quantity: i32,
    pub unit_price: BigDecimal,
    pub discount_amount: BigDecimal,
    pub total_amount: BigDecimal,
    pub state: BookingState,
    pub failure_reason: Option<FailureCategory>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Booking {
    pub fn is_due_for_expiry(&self, now: DateTime<Utc>) -> bool {
        self.state.is_active() && self.expires_at < now
    }
}

/// Price breakdown of a booking. `discount_amount` is clamped to `[0, subtotal]`,
/// so `total_amount` is never negative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingAmounts {
    pub subtotal: BigDecimal,
    pub discount_amount: BigDecimal,
    pub total_amount: BigDecimal,
}

impl BookingAmounts {
    pub fn compute(unit_price: &BigDecimal, quantity: i32, discount: Option<&Discount>) -> Self {
        let subtotal = unit_price * &BigDecimal::from(quantity);
        let discount_amount = discount
            .map(|d| d.amount_for(&subtotal))
            .unwrap_or_else(BigDecimal::zero);
        let total_amount = &subtotal - &discount_amount;

        Self {
            subtotal,
            discount_amount,
            total_amount,
        }
    }

    pub fn free() -> Self {
        Self {
            subtotal: BigDecimal::zero(),
            discount_amount: BigDecimal::zero(),
            total_amount: BigDecimal::zero(),
        }
    }
}
