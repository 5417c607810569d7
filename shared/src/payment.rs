use std::fmt;
use std::str::FromStr;

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::UnknownVariant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Initiated,
    Pending,
    Completed,
    Failed,
}

impl PaymentStatus {
    pub const OPEN: [PaymentStatus; 2] = [PaymentStatus::Initiated, PaymentStatus::Pending];

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initiated => "initiated",
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initiated" => Ok(Self::Initiated),
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(UnknownVariant::new("payment status", other)),
        }
    }
}

/// Coarse failure classes the booking state machine consumes instead of raw provider text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// The provider rejected the request itself, e.g. an unregistered phone number.
    Validation,
    Generic,
}

impl FailureCategory {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Generic => "generic",
        }
    }

    pub const fn user_message(self) -> &'static str {
        match self {
            Self::Validation => {
                "Payment validation failed. Please ensure your phone number is registered for M-Pesa."
            }
            Self::Generic => "Payment failed. Please try again.",
        }
    }
}

impl FromStr for FailureCategory {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "validation" => Ok(Self::Validation),
            "generic" => Ok(Self::Generic),
            other => Err(UnknownVariant::new("failure category", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub booking_id: Uuid,
    /// International form, e.g. `254712345678`.
    pub phone_number: String,
    /// Provider checkout/correlation id; absent until the provider accepts the push.
    pub provider_reference: Option<String>,
    pub status: PaymentStatus,
    pub amount: BigDecimal,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Fields written together with a payment status change.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentUpdate {
    pub status: PaymentStatus,
    pub provider_reference: Option<String>,
    pub error_message: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PaymentUpdate {
    pub fn pending(provider_reference: impl Into<String>) -> Self {
        Self {
            status: PaymentStatus::Pending,
            provider_reference: Some(provider_reference.into()),
            error_message: None,
            completed_at: None,
        }
    }

    pub fn completed(at: DateTime<Utc>) -> Self {
        Self {
            status: PaymentStatus::Completed,
            provider_reference: None,
            error_message: None,
            completed_at: Some(at),
        }
    }

    pub fn failed(message: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            status: PaymentStatus::Failed,
            provider_reference: None,
            error_message: Some(message.into()),
            completed_at: Some(at),
        }
    }

    /// Applies the update; `None` fields keep their current value.
    pub fn apply_to(&self, payment: &mut Payment) {
        payment.status = self.status;
        if let Some(reference) = &self.provider_reference {
            payment.provider_reference = Some(reference.clone());
        }
        if let Some(message) = &self.error_message {
            payment.error_message = Some(message.clone());
        }
        if let Some(at) = self.completed_at {
            payment.completed_at = Some(at);
        }
    }
}
