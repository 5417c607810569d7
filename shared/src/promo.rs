use std::str::FromStr;

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use num_traits::Zero;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::UnknownVariant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscountType {
    /// `discount_value` is a whole-number percent of the subtotal.
    Percentage,
    /// `discount_value` is an amount in the ticket price's currency unit.
    Fixed,
}

impl DiscountType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Percentage => "percentage",
            Self::Fixed => "fixed",
        }
    }
}

impl FromStr for DiscountType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "percentage" => Ok(Self::Percentage),
            "fixed" => Ok(Self::Fixed),
            other => Err(UnknownVariant::new("discount type", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromoCode {
    pub code: String,
    /// `None` applies to every event.
    pub event_id: Option<Uuid>,
    pub discount_type: DiscountType,
    pub discount_value: BigDecimal,
    pub max_uses: Option<i32>,
    pub max_uses_per_user: i32,
    pub current_uses: i32,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    pub is_active: bool,
}

impl PromoCode {
    /// Codes are matched case-insensitively and stored upper-case.
    pub fn normalize_code(raw: &str) -> String {
        raw.trim().to_uppercase()
    }

    pub fn is_exhausted(&self) -> bool {
        self.max_uses.map_or(false, |max| self.current_uses >= max)
    }

    pub fn applies_to(&self, event_id: Uuid) -> bool {
        self.event_id.map_or(true, |scoped| scoped == event_id)
    }

    pub fn discount(&self) -> Discount {
        Discount {
            code: self.code.clone(),
            discount_type: self.discount_type,
            discount_value: self.discount_value.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromoRedemption {
    pub id: Uuid,
    pub code: String,
    pub user_id: Uuid,
    pub booking_id: Uuid,
    pub redeemed_at: DateTime<Utc>,
}

/// The outcome of a successful promo check: what to take off the subtotal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discount {
    pub code: String,
    pub discount_type: DiscountType,
    pub discount_value: BigDecimal,
}

impl Discount {
    pub fn amount_for(&self, subtotal: &BigDecimal) -> BigDecimal {
        let raw = match self.discount_type {
            DiscountType::Percentage => {
                ((subtotal * &self.discount_value) / BigDecimal::from(100)).round(2)
            }
            DiscountType::Fixed => self.discount_value.clone(),
        };
        raw.max(BigDecimal::zero()).min(subtotal.clone())
    }
}
