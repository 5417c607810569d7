use std::fmt;
use std::str::FromStr;

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::UnknownVariant;

/// The slice of the event catalogue that pricing and cancellation rules need.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub title: String,
    pub starts_at: DateTime<Utc>,
    pub is_free: bool,
}

impl Event {
    pub fn has_started(&self, now: DateTime<Utc>) -> bool {
        self.starts_at <= now
    }
}

/// Capacity counters for one ticket type. `capacity_total = None` means unlimited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketType {
    pub id: Uuid,
    pub event_id: Uuid,
    pub name: String,
    pub capacity_total: Option<i32>,
    pub capacity_reserved: i32,
    pub capacity_confirmed: i32,
    pub unit_price: BigDecimal,
    pub is_active: bool,
}

impl TicketType {
    /// Units still sellable, or `None` for an unlimited ticket type.
    pub fn available(&self) -> Option<i32> {
        self.capacity_total
            .map(|total| total - self.capacity_reserved - self.capacity_confirmed)
    }

    /// Unlimited types are still bounded by what the counters can hold.
    pub fn can_reserve(&self, quantity: i32) -> bool {
        let held = i64::from(self.capacity_reserved) + i64::from(self.capacity_confirmed);
        let limit = self.capacity_total.map_or(i64::from(i32::MAX), i64::from);
        self.is_active && quantity > 0 && held + i64::from(quantity) <= limit
    }
}

/// Opaque handle on a provisional capacity hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReservationToken(Uuid);

impl ReservationToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ReservationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ReservationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Held,
    Confirmed,
    Released,
}

impl ReservationStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Held => "held",
            Self::Confirmed => "confirmed",
            Self::Released => "released",
        }
    }
}

impl FromStr for ReservationStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "held" => Ok(Self::Held),
            "confirmed" => Ok(Self::Confirmed),
            "released" => Ok(Self::Released),
            other => Err(UnknownVariant::new("reservation status", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub token: ReservationToken,
    pub ticket_type_id: Uuid,
    pub quantity: i32,
    pub status: ReservationStatus,
    pub created_at: DateTime<Utc>,
}
