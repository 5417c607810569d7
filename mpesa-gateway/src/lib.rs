//! Boundary to the mobile-money provider (M-Pesa STK push).
//!
//! Everything provider-specific lives here: phone normalization, the HTTP
//! client, callback decoding and the mapping of free-text failures onto
//! [`shared::FailureCategory`]. Callers only see [`MobileMoneyProvider`].

use async_trait::async_trait;
use serde::{de, Deserialize, Deserializer};

pub mod callback;
pub mod classify;
pub mod daraja;
pub mod phone;
pub mod simulated;

pub use callback::{CallbackEnvelope, StkCallback};
pub use classify::classify_failure;
pub use daraja::{DarajaClient, DarajaConfig};
pub use phone::PhoneNumber;
pub use simulated::SimulatedProvider;

/// Result code reported by the provider for a successful payment.
pub const RESULT_SUCCESS: &str = "0";
/// Result code reported while the payer has not answered the prompt yet.
pub const RESULT_STILL_PROCESSING: &str = "4999";
/// Error code of an STK query issued before the provider has a result.
pub const ERROR_STILL_PROCESSING: &str = "500.001.1001";

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("invalid phone number: {0}")]
    InvalidPhoneNumber(String),
    #[error("payment gateway unavailable: {0}")]
    Unavailable(String),
    #[error("payment request rejected ({code}): {message}")]
    Rejected { code: String, message: String },
    #[error("unexpected gateway response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Unavailable(e.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StkPushRequest {
    pub phone: PhoneNumber,
    /// Whole currency units; the provider does not accept fractions.
    pub amount: u64,
    pub account_reference: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StkPushAccepted {
    pub merchant_request_id: String,
    pub checkout_request_id: String,
    pub customer_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderStatus {
    Pending,
    Completed { receipt_number: Option<String> },
    Failed { code: String, message: String },
}

impl ProviderStatus {
    pub fn from_result_code(code: &str, description: &str) -> Self {
        match code {
            RESULT_SUCCESS => Self::Completed { receipt_number: None },
            RESULT_STILL_PROCESSING => Self::Pending,
            other => Self::Failed {
                code: other.to_string(),
                message: description.to_string(),
            },
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

#[async_trait]
pub trait MobileMoneyProvider: Send + Sync {
    /// Sends the PIN prompt to the payer's phone.
    async fn stk_push(&self, request: &StkPushRequest) -> Result<StkPushAccepted, GatewayError>;

    /// One round trip asking for the outcome of an earlier push. Not retried here.
    async fn stk_query(&self, checkout_request_id: &str) -> Result<ProviderStatus, GatewayError>;
}

/// The provider sends result codes as strings in some payloads and numbers in others.
pub(crate) fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}
