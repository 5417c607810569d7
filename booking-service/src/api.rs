use std::sync::Arc;

use axum::{
    async_trait,
    extract::{FromRequestParts, Path, State},
    http::{request::Parts, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use mpesa_gateway::CallbackEnvelope;
use serde::{Deserialize, Serialize};
use shared::*;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::BookingError;
use crate::orchestrator::{BookingOrchestrator, CreateBooking, PaymentSettlement};
use crate::payments::{PaymentGatewayAdapter, PaymentInitiation, PaymentStatusView};
use crate::poller::PollerRegistry;
use crate::promo::PromoCodeValidator;
use crate::store::Store;

/// Header carrying the caller's id, set by the authenticating proxy in front of us.
pub const USER_ID_HEADER: &str = "x-user-id";

pub struct AppState<S> {
    pub orchestrator: BookingOrchestrator<S>,
    pub promos: PromoCodeValidator<S>,
    pub payments: PaymentGatewayAdapter<S>,
    pub pollers: Arc<PollerRegistry>,
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            orchestrator: self.orchestrator.clone(),
            promos: self.promos.clone(),
            payments: self.payments.clone(),
            pollers: self.pollers.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<Json<T>, ApiError>;

fn status_for(e: &BookingError) -> StatusCode {
    use BookingError::*;
    match e {
        InsufficientInventory
        | DuplicatePendingBooking
        | BookingTerminalStateConflict { .. }
        | PaymentSuperseded(_)
        | PaymentAlreadyCompleted { .. } => StatusCode::CONFLICT,
        Promo(_) | InvalidPhoneNumber(_) | InvalidQuantity(_) | TicketTypeRequired
        | TicketTypeUnavailable(_) | EventAlreadyStarted => StatusCode::BAD_REQUEST,
        PaymentValidationFailure(_) | PaymentGenericFailure(_) => StatusCode::PAYMENT_REQUIRED,
        PaymentTimeout => StatusCode::ACCEPTED,
        GatewayUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        BookingNotFound(_) | EventNotFound(_) | PaymentNotFound(_) | ReservationNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        ReservationExpired(_) => StatusCode::GONE,
        Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(e: BookingError) -> ApiError {
    let status = status_for(&e);
    let error = if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!(error = %e, "Request failed");
        "internal server error".to_string()
    } else {
        e.to_string()
    };
    (
        status,
        Json(ErrorResponse {
            error,
            code: e.code().to_string(),
        }),
    )
}

/// The authenticated caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurrentUser(pub Uuid);

#[async_trait]
impl<St: Send + Sync> FromRequestParts<St> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _: &St) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| Uuid::parse_str(v.trim()).ok())
            .map(CurrentUser)
            .ok_or_else(|| {
                (
                    StatusCode::UNAUTHORIZED,
                    Json(ErrorResponse {
                        error: "authentication required".to_string(),
                        code: "unauthenticated".to_string(),
                    }),
                )
            })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateBookingResponse {
    pub booking_id: Uuid,
    pub state: BookingState,
    pub total_amount: BigDecimal,
    pub requires_payment: bool,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct ValidatePromoRequest {
    pub code: String,
    pub event_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct InitiatePaymentRequest {
    pub booking_id: Uuid,
    pub phone_number: String,
}

#[derive(Debug, Serialize)]
pub struct PaymentStatusResponse {
    pub payment: PaymentStatusView,
    /// Text to show the payer when the payment failed.
    pub message: Option<&'static str>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CallbackAck {
    #[serde(rename = "ResultCode")]
    pub result_code: i32,
    #[serde(rename = "ResultDesc")]
    pub result_desc: String,
}

pub fn create_router<S: Store>(state: AppState<S>) -> Router {
    Router::new()
        .route("/bookings", post(create_booking::<S>).get(list_bookings::<S>))
        .route("/bookings/:id", get(get_booking::<S>))
        .route("/bookings/:id/cancel", post(cancel_booking::<S>))
        .route("/promo-codes/validate", post(validate_promo::<S>))
        .route("/payments/initiate", post(initiate_payment::<S>))
        .route("/payments/history", get(payment_history::<S>))
        .route("/payments/:id/status", get(payment_status::<S>))
        .route("/payments/mpesa/callback", post(mpesa_callback::<S>))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

pub async fn create_booking<S: Store>(
    State(state): State<AppState<S>>,
    CurrentUser(user_id): CurrentUser,
    Json(request): Json<CreateBooking>,
) -> ApiResult<CreateBookingResponse> {
    let booking = state
        .orchestrator
        .create_booking(user_id, request)
        .await
        .map_err(reject)?;

    Ok(Json(CreateBookingResponse {
        booking_id: booking.id,
        state: booking.state,
        total_amount: booking.total_amount,
        requires_payment: booking.state == BookingState::PendingPayment,
        expires_at: booking.expires_at,
    }))
}

pub async fn list_bookings<S: Store>(
    State(state): State<AppState<S>>,
    CurrentUser(user_id): CurrentUser,
) -> ApiResult<Vec<Booking>> {
    let bookings = state
        .orchestrator
        .bookings_for_user(user_id)
        .await
        .map_err(reject)?;
    Ok(Json(bookings))
}

pub async fn get_booking<S: Store>(
    State(state): State<AppState<S>>,
    CurrentUser(user_id): CurrentUser,
    Path(booking_id): Path<Uuid>,
) -> ApiResult<Booking> {
    let booking = state
        .orchestrator
        .booking_for_user(user_id, booking_id)
        .await
        .map_err(reject)?;
    Ok(Json(booking))
}

pub async fn cancel_booking<S: Store>(
    State(state): State<AppState<S>>,
    CurrentUser(user_id): CurrentUser,
    Path(booking_id): Path<Uuid>,
) -> ApiResult<Booking> {
    state
        .orchestrator
        .booking_for_user(user_id, booking_id)
        .await
        .map_err(reject)?;

    let booking = state.orchestrator.cancel(booking_id).await.map_err(reject)?;
    state.pollers.cancel(booking_id);
    Ok(Json(booking))
}

pub async fn validate_promo<S: Store>(
    State(state): State<AppState<S>>,
    CurrentUser(user_id): CurrentUser,
    Json(request): Json<ValidatePromoRequest>,
) -> ApiResult<Discount> {
    let discount = state
        .promos
        .validate(&request.code, request.event_id, user_id)
        .await
        .map_err(reject)?;
    Ok(Json(discount))
}

pub async fn initiate_payment<S: Store>(
    State(state): State<AppState<S>>,
    CurrentUser(user_id): CurrentUser,
    Json(request): Json<InitiatePaymentRequest>,
) -> ApiResult<PaymentInitiation> {
    let initiation = match state
        .payments
        .initiate(user_id, request.booking_id, &request.phone_number)
        .await
    {
        Ok(initiation) => initiation,
        Err(e @ BookingError::PaymentAlreadyCompleted { .. }) => {
            // Paid, but the settlement that should have followed never ran.
            if let Err(settle_err) = state.orchestrator.settle_completed(request.booking_id).await {
                warn!(booking_id = %request.booking_id, error = %settle_err, "Could not settle paid booking");
            }
            return Err(reject(e));
        }
        Err(e) => return Err(reject(e)),
    };

    state
        .pollers
        .start(initiation.payment_id, initiation.booking_id);
    Ok(Json(initiation))
}

/// Asks the provider for the latest status and settles the booking if the
/// payment has ended, racing the poller and the callback safely. A payment
/// open for too long answers 202 `payment_timeout`.
pub async fn payment_status<S: Store>(
    State(state): State<AppState<S>>,
    CurrentUser(user_id): CurrentUser,
    Path(payment_id): Path<Uuid>,
) -> ApiResult<PaymentStatusResponse> {
    let view = state
        .payments
        .status_for_user(user_id, payment_id)
        .await
        .map_err(reject)?;

    if let Err(e) = settle(&state, &view).await {
        warn!(%payment_id, error = %e, "Could not settle booking from status check");
    }

    Ok(Json(PaymentStatusResponse {
        message: view.failure.map(FailureCategory::user_message),
        payment: view,
    }))
}

pub async fn payment_history<S: Store>(
    State(state): State<AppState<S>>,
    CurrentUser(user_id): CurrentUser,
) -> ApiResult<Vec<Payment>> {
    let payments = state.payments.history(user_id).await.map_err(reject)?;
    Ok(Json(payments))
}

/// Called by the provider, not by users; always acknowledged once decoded so
/// the provider does not keep redelivering.
pub async fn mpesa_callback<S: Store>(
    State(state): State<AppState<S>>,
    Json(envelope): Json<CallbackEnvelope>,
) -> Json<CallbackAck> {
    let callback = &envelope.body.stk_callback;
    info!(
        checkout_request_id = %callback.checkout_request_id,
        result_code = %callback.result_code,
        "Payment callback received"
    );

    match state.payments.apply_callback(callback).await {
        Ok(Some(view)) => {
            if let Err(e) = settle(&state, &view).await {
                error!(payment_id = %view.payment_id, error = %e, "Could not settle booking from callback");
            }
        }
        Ok(None) => {}
        Err(e) => error!(
            checkout_request_id = %callback.checkout_request_id,
            error = %e,
            "Could not record payment callback"
        ),
    }

    Json(CallbackAck {
        result_code: 0,
        result_desc: "Accepted".to_string(),
    })
}

async fn settle<S: Store>(state: &AppState<S>, view: &PaymentStatusView) -> Result<(), BookingError> {
    if !view.settles_booking() {
        return Ok(());
    }
    state.pollers.cancel(view.booking_id);
    match view.status {
        PaymentStatus::Completed => state.orchestrator.settle_completed(view.booking_id).await,
        _ => {
            let reason = view.failure.unwrap_or(FailureCategory::Generic);
            state.orchestrator.settle_failed(view.booking_id, reason).await
        }
    }
}

pub async fn health_check() -> &'static str {
    "OK"
}
