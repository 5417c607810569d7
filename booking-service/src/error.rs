use mpesa_gateway::{classify_failure, GatewayError};
use shared::{BookingState, FailureCategory, ReservationToken};
use uuid::Uuid;

use crate::store::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PromoRejection {
    #[error("promo code not found")]
    NotFound,
    #[error("promo code is not active")]
    Inactive,
    #[error("promo code has expired")]
    Expired,
    #[error("promo code is not valid yet")]
    NotYetValid,
    #[error("promo code usage limit reached")]
    UsageLimitReached,
    #[error("you have already used this promo code")]
    PerUserLimitReached,
    #[error("promo code is not applicable to this event")]
    NotApplicableToEvent,
}

impl PromoRejection {
    pub const fn code(self) -> &'static str {
        match self {
            Self::NotFound => "promo_not_found",
            Self::Inactive => "promo_inactive",
            Self::Expired => "promo_expired",
            Self::NotYetValid => "promo_not_yet_valid",
            Self::UsageLimitReached => "promo_usage_limit_reached",
            Self::PerUserLimitReached => "promo_per_user_limit_reached",
            Self::NotApplicableToEvent => "promo_not_applicable",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BookingError {
    #[error("not enough tickets available")]
    InsufficientInventory,
    #[error("you already have a pending booking for this event")]
    DuplicatePendingBooking,
    #[error(transparent)]
    Promo(#[from] PromoRejection),
    #[error("invalid phone number: {0}")]
    InvalidPhoneNumber(String),
    #[error("payment gateway unavailable: {0}")]
    GatewayUnavailable(String),
    #[error("{}", FailureCategory::Validation.user_message())]
    PaymentValidationFailure(String),
    #[error("{}", FailureCategory::Generic.user_message())]
    PaymentGenericFailure(String),
    #[error("payment is still being processed")]
    PaymentTimeout,
    #[error("booking {0} not found")]
    BookingNotFound(Uuid),
    #[error("booking {booking_id} is {state}")]
    BookingTerminalStateConflict { booking_id: Uuid, state: BookingState },
    #[error("cannot change a booking for an event that has already started")]
    EventAlreadyStarted,
    #[error("event {0} not found")]
    EventNotFound(Uuid),
    #[error("ticket type {0} is not available")]
    TicketTypeUnavailable(Uuid),
    #[error("a ticket type is required for paid events")]
    TicketTypeRequired,
    #[error("quantity must be between 1 and {max}, got {0}", max = crate::ledger::MAX_QUANTITY_PER_BOOKING)]
    InvalidQuantity(i32),
    #[error("reservation for booking {0} has expired")]
    ReservationExpired(Uuid),
    #[error("payment {0} not found")]
    PaymentNotFound(Uuid),
    #[error("payment {0} was superseded by a newer payment request")]
    PaymentSuperseded(Uuid),
    #[error("booking {booking_id} is already paid by payment {payment_id}")]
    PaymentAlreadyCompleted { booking_id: Uuid, payment_id: Uuid },
    #[error("reservation {0} not found")]
    ReservationNotFound(ReservationToken),
    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl BookingError {
    /// Stable machine-readable code for API clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InsufficientInventory => "insufficient_inventory",
            Self::DuplicatePendingBooking => "duplicate_pending_booking",
            Self::Promo(rejection) => rejection.code(),
            Self::InvalidPhoneNumber(_) => "invalid_phone_number",
            Self::GatewayUnavailable(_) => "gateway_unavailable",
            Self::PaymentValidationFailure(_) => "payment_validation_failure",
            Self::PaymentGenericFailure(_) => "payment_generic_failure",
            Self::PaymentTimeout => "payment_timeout",
            Self::BookingNotFound(_) => "booking_not_found",
            Self::BookingTerminalStateConflict { .. } => "booking_terminal_state_conflict",
            Self::EventAlreadyStarted => "event_already_started",
            Self::EventNotFound(_) => "event_not_found",
            Self::TicketTypeUnavailable(_) => "ticket_type_unavailable",
            Self::TicketTypeRequired => "ticket_type_required",
            Self::InvalidQuantity(_) => "invalid_quantity",
            Self::ReservationExpired(_) => "reservation_expired",
            Self::PaymentNotFound(_) => "payment_not_found",
            Self::PaymentSuperseded(_) => "payment_superseded",
            Self::PaymentAlreadyCompleted { .. } => "payment_already_completed",
            Self::ReservationNotFound(_) => "reservation_not_found",
            Self::Storage(_) => "internal_error",
        }
    }

    pub fn conflict(booking_id: Uuid, state: BookingState) -> Self {
        Self::BookingTerminalStateConflict { booking_id, state }
    }
}

impl From<GatewayError> for BookingError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::InvalidPhoneNumber(raw) => Self::InvalidPhoneNumber(raw),
            GatewayError::Unavailable(reason) | GatewayError::Decode(reason) => {
                Self::GatewayUnavailable(reason)
            }
            GatewayError::Rejected { code, message } => {
                match classify_failure(Some(&code), &message) {
                    FailureCategory::Validation => Self::PaymentValidationFailure(message),
                    FailureCategory::Generic => Self::PaymentGenericFailure(message),
                }
            }
        }
    }
}
