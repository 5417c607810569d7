#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use bigdecimal::BigDecimal;
use booking_service::api::{self, AppState};
use booking_service::orchestrator::{BookingOrchestrator, CreateBooking};
use booking_service::payments::PaymentGatewayAdapter;
use booking_service::poller::{PaymentPoller, PollerConfig, PollerRegistry};
use booking_service::promo::PromoCodeValidator;
use booking_service::store::{MemoryStore, Store, StoreTx};
use chrono::Utc;
use mpesa_gateway::{
    CallbackEnvelope, GatewayError, MobileMoneyProvider, ProviderStatus, StkCallback, StkPushAccepted,
    StkPushRequest,
};
use shared::*;
use uuid::Uuid;

/// Provider double: accepts every push and answers queries from a script,
/// repeating the last entry.
#[derive(Default)]
pub struct ScriptedProvider {
    pushes: Mutex<Vec<StkPushRequest>>,
    statuses: Mutex<VecDeque<ProviderStatus>>,
    checkouts: AtomicU32,
}

impl ScriptedProvider {
    pub fn script(&self, statuses: impl IntoIterator<Item = ProviderStatus>) {
        *self.statuses.lock().unwrap() = statuses.into_iter().collect();
    }

    pub fn pushes(&self) -> Vec<StkPushRequest> {
        self.pushes.lock().unwrap().clone()
    }
}

#[async_trait]
impl MobileMoneyProvider for ScriptedProvider {
    async fn stk_push(&self, request: &StkPushRequest) -> Result<StkPushAccepted, GatewayError> {
        self.pushes.lock().unwrap().push(request.clone());
        let n = self.checkouts.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(StkPushAccepted {
            merchant_request_id: format!("29115-{n}"),
            checkout_request_id: format!("ws_CO_{n}"),
            customer_message: Some("Success. Request accepted for processing".to_string()),
        })
    }

    async fn stk_query(&self, _: &str) -> Result<ProviderStatus, GatewayError> {
        let mut statuses = self.statuses.lock().unwrap();
        Ok(if statuses.len() > 1 {
            statuses.pop_front().unwrap_or(ProviderStatus::Pending)
        } else {
            statuses.front().cloned().unwrap_or(ProviderStatus::Pending)
        })
    }
}

pub fn completed() -> ProviderStatus {
    ProviderStatus::Completed {
        receipt_number: Some("NLJ7RT61SV".to_string()),
    }
}

pub fn failed(code: &str, message: &str) -> ProviderStatus {
    ProviderStatus::Failed {
        code: code.to_string(),
        message: message.to_string(),
    }
}

pub fn callback(checkout_request_id: &str, result_code: i64, result_desc: &str) -> StkCallback {
    let envelope: CallbackEnvelope = serde_json::from_value(callback_json(checkout_request_id, result_code, result_desc))
        .unwrap();
    envelope.body.stk_callback
}

pub fn callback_json(checkout_request_id: &str, result_code: i64, result_desc: &str) -> serde_json::Value {
    serde_json::json!({
        "Body": {
            "stkCallback": {
                "MerchantRequestID": "29115-34620561-1",
                "CheckoutRequestID": checkout_request_id,
                "ResultCode": result_code,
                "ResultDesc": result_desc,
                "CallbackMetadata": {
                    "Item": [
                        { "Name": "Amount", "Value": 2700 },
                        { "Name": "MpesaReceiptNumber", "Value": "NLJ7RT61SV" },
                        { "Name": "PhoneNumber", "Value": 254712345678u64 }
                    ]
                }
            }
        }
    })
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
    pub provider: Arc<ScriptedProvider>,
    pub orchestrator: BookingOrchestrator<MemoryStore>,
    pub payments: PaymentGatewayAdapter<MemoryStore>,
    pub promos: PromoCodeValidator<MemoryStore>,
    pub event: Event,
    pub ticket_type: TicketType,
}

impl Harness {
    pub async fn new(capacity: Option<i32>, is_free: bool) -> Self {
        let now = Utc::now();
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(now));
        let provider = Arc::new(ScriptedProvider::default());

        let event = Event {
            id: Uuid::new_v4(),
            title: "Blankets & Wine".to_string(),
            starts_at: now + chrono::Duration::days(10),
            is_free,
        };
        let ticket_type = TicketType {
            id: Uuid::new_v4(),
            event_id: event.id,
            name: "Early Bird".to_string(),
            capacity_total: capacity,
            capacity_reserved: 0,
            capacity_confirmed: 0,
            unit_price: BigDecimal::from(1500),
            is_active: true,
        };
        store.insert_event(event.clone()).await;
        store.insert_ticket_type(ticket_type.clone()).await;

        let orchestrator = BookingOrchestrator::new(store.clone(), clock.clone(), chrono::Duration::minutes(15));
        let payments = PaymentGatewayAdapter::new(store.clone(), provider.clone(), clock.clone(), "254");
        let promos = PromoCodeValidator::new(store.clone(), clock.clone());

        Self {
            store,
            clock,
            provider,
            orchestrator,
            payments,
            promos,
            event,
            ticket_type,
        }
    }

    pub fn request(&self, quantity: i32, promo_code: Option<&str>) -> CreateBooking {
        CreateBooking {
            event_id: self.event.id,
            ticket_type_id: Some(self.ticket_type.id),
            quantity,
            promo_code: promo_code.map(str::to_string),
        }
    }

    pub async fn add_promo(&self, code: &str, max_uses: Option<i32>) {
        let now = self.clock.now();
        self.store
            .insert_promo_code(PromoCode {
                code: code.to_string(),
                event_id: Some(self.event.id),
                discount_type: DiscountType::Percentage,
                discount_value: BigDecimal::from(10),
                max_uses,
                max_uses_per_user: 1,
                current_uses: 0,
                valid_from: now - chrono::Duration::days(1),
                valid_until: now + chrono::Duration::days(30),
                is_active: true,
            })
            .await;
    }

    pub async fn booking(&self, user_id: Uuid) -> Booking {
        self.orchestrator
            .create_booking(user_id, self.request(2, None))
            .await
            .unwrap()
    }

    /// `(capacity_reserved, capacity_confirmed)`
    pub async fn ticket_counts(&self) -> (i32, i32) {
        let mut tx = self.store.begin().await.unwrap();
        let t = tx.ticket_type(self.ticket_type.id).await.unwrap().unwrap();
        (t.capacity_reserved, t.capacity_confirmed)
    }

    pub async fn payment(&self, payment_id: Uuid) -> Payment {
        let mut tx = self.store.begin().await.unwrap();
        tx.payment(payment_id).await.unwrap().unwrap()
    }

    pub async fn event_types(&self) -> Vec<String> {
        self.store
            .outbox()
            .await
            .into_iter()
            .map(|e| e.event_type)
            .collect()
    }

    pub fn poller(&self, config: PollerConfig) -> PaymentPoller {
        PaymentPoller::new(
            Arc::new(self.payments.clone()),
            Arc::new(self.orchestrator.clone()),
            config,
        )
    }

    /// Router whose pollers never tick during a test.
    pub fn app(&self) -> Router {
        let pollers = PollerRegistry::new(self.poller(PollerConfig {
            interval: Duration::from_secs(3600),
            timeout: Duration::from_secs(7200),
            max_attempts: None,
        }));
        api::create_router(AppState {
            orchestrator: self.orchestrator.clone(),
            promos: self.promos.clone(),
            payments: self.payments.clone(),
            pollers: Arc::new(pollers),
        })
    }
}
