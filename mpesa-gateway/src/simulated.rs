use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use crate::{GatewayError, MobileMoneyProvider, ProviderStatus, StkPushAccepted, StkPushRequest};

/// Stand-in provider for development without provider credentials.
///
/// Each checkout reports `Pending` for `pending_polls` queries and then settles
/// once: completed with probability `success_rate`, otherwise failed with the
/// configured code and message.
pub struct SimulatedProvider {
    success_rate: f64,
    pending_polls: u32,
    failure: (String, String),
    checkouts: Mutex<HashMap<String, SimulatedCheckout>>,
}

struct SimulatedCheckout {
    queries: u32,
    outcome: Option<ProviderStatus>,
}

impl SimulatedProvider {
    pub fn new(success_rate: f64, pending_polls: u32) -> Self {
        Self {
            success_rate,
            pending_polls,
            failure: ("1032".to_string(), "Request cancelled by user".to_string()),
            checkouts: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_failure(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.failure = (code.into(), message.into());
        self
    }

    fn settle(&self) -> ProviderStatus {
        if rand::random::<f64>() < self.success_rate {
            let id = Uuid::new_v4().simple().to_string().to_uppercase();
            ProviderStatus::Completed {
                receipt_number: Some(format!("SIM{}", &id[..7])),
            }
        } else {
            ProviderStatus::Failed {
                code: self.failure.0.clone(),
                message: self.failure.1.clone(),
            }
        }
    }
}

#[async_trait]
impl MobileMoneyProvider for SimulatedProvider {
    async fn stk_push(&self, request: &StkPushRequest) -> Result<StkPushAccepted, GatewayError> {
        let checkout_request_id = format!("ws_CO_SIM_{}", Uuid::new_v4().simple());
        let merchant_request_id = format!("SIM-{}", Uuid::new_v4().simple());

        self.checkouts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(
                checkout_request_id.clone(),
                SimulatedCheckout {
                    queries: 0,
                    outcome: None,
                },
            );

        info!(
            phone = %request.phone,
            amount = request.amount,
            checkout_request_id = %checkout_request_id,
            "Simulated STK push sent"
        );

        Ok(StkPushAccepted {
            merchant_request_id,
            checkout_request_id,
            customer_message: Some("Success. Request accepted for processing".to_string()),
        })
    }

    async fn stk_query(&self, checkout_request_id: &str) -> Result<ProviderStatus, GatewayError> {
        let mut checkouts = self
            .checkouts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let Some(checkout) = checkouts.get_mut(checkout_request_id) else {
            return Err(GatewayError::Rejected {
                code: "400.002.02".to_string(),
                message: "Invalid CheckoutRequestID".to_string(),
            });
        };

        checkout.queries += 1;
        if checkout.queries <= self.pending_polls {
            return Ok(ProviderStatus::Pending);
        }

        if checkout.outcome.is_none() {
            checkout.outcome = Some(self.settle());
        }
        Ok(checkout.outcome.clone().unwrap_or(ProviderStatus::Pending))
    }
}
