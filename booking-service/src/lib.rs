//! Ticket booking with mobile-money settlement.
//!
//! [`orchestrator::BookingOrchestrator`] owns the booking state machine and is
//! the only writer of bookings; the capacity ledger, promo codes and payments
//! are changed inside its transactions or through compare-and-set primitives
//! on [`store::StoreTx`].

pub mod api;
pub mod config;
pub mod error;
pub mod ledger;
pub mod models;
pub mod orchestrator;
pub mod outbox;
pub mod payments;
pub mod poller;
pub mod promo;
pub mod reconciliation;
pub mod schema;
pub mod store;

pub use error::{BookingError, PromoRejection};
