mod common;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use booking_service::api::USER_ID_HEADER;
use common::{callback_json, completed, Harness};
use serde_json::{json, Value};
use shared::BookingState;
use tower::ServiceExt;
use uuid::Uuid;

async fn send(app: &Router, method: &str, uri: &str, user: Option<Uuid>, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        request = request.header(USER_ID_HEADER, user.to_string());
    }
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

#[tokio::test]
async fn booking_requires_caller_identity() {
    let h = Harness::new(Some(10), false).await;
    let app = h.app();

    let body = json!({ "event_id": h.event.id, "ticket_type_id": h.ticket_type.id, "quantity": 1 });
    let (status, body) = send(&app, "POST", "/bookings", None, Some(body)).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "unauthenticated");
}

#[tokio::test]
async fn create_then_duplicate_booking() {
    let h = Harness::new(Some(10), false).await;
    let app = h.app();
    let user = Uuid::new_v4();
    let body = json!({ "event_id": h.event.id, "ticket_type_id": h.ticket_type.id, "quantity": 2 });

    let (status, created) = send(&app, "POST", "/bookings", Some(user), Some(body.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(created["state"], "pending_payment");
    assert_eq!(created["requires_payment"], true);

    let (status, error) = send(&app, "POST", "/bookings", Some(user), Some(body)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(error["code"], "duplicate_pending_booking");

    let (status, listed) = send(&app, "GET", "/bookings", Some(user), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let uri = format!("/bookings/{}", created["booking_id"].as_str().unwrap());
    let (status, _) = send(&app, "GET", &uri, Some(Uuid::new_v4()), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn free_booking_needs_no_payment() {
    let h = Harness::new(Some(10), true).await;
    let app = h.app();
    let body = json!({ "event_id": h.event.id, "quantity": 1 });

    let (status, created) = send(&app, "POST", "/bookings", Some(Uuid::new_v4()), Some(body)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(created["state"], "confirmed");
    assert_eq!(created["requires_payment"], false);
}

#[tokio::test]
async fn promo_validation_reports_rejection_codes() {
    let h = Harness::new(Some(10), false).await;
    h.add_promo("WINE10", Some(5)).await;
    let app = h.app();
    let user = Uuid::new_v4();

    let body = json!({ "code": "wine10", "event_id": h.event.id });
    let (status, discount) = send(&app, "POST", "/promo-codes/validate", Some(user), Some(body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(discount["code"], "WINE10");

    let body = json!({ "code": "NOPE", "event_id": h.event.id });
    let (status, error) = send(&app, "POST", "/promo-codes/validate", Some(user), Some(body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error["code"], "promo_not_found");
}

#[tokio::test]
async fn payment_flow_settles_through_callback() {
    let h = Harness::new(Some(10), false).await;
    let app = h.app();
    let user = Uuid::new_v4();
    let booking = h.booking(user).await;

    let body = json!({ "booking_id": booking.id, "phone_number": "0712345678" });
    let (status, initiation) = send(&app, "POST", "/payments/initiate", Some(user), Some(body)).await;
    assert_eq!(status, StatusCode::OK);
    let payment_id = initiation["payment_id"].as_str().unwrap().to_string();
    let checkout = initiation["checkout_request_id"].as_str().unwrap().to_string();
    assert_ne!(payment_id, booking.id.to_string());

    let uri = format!("/payments/{payment_id}/status");
    let (status, pending) = send(&app, "GET", &uri, Some(user), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(pending["payment"]["status"], "pending");

    h.provider.script([completed()]);
    let body = callback_json(&checkout, 0, "The service request is processed successfully.");
    let (status, ack) = send(&app, "POST", "/payments/mpesa/callback", None, Some(body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack, json!({ "ResultCode": 0, "ResultDesc": "Accepted" }));

    assert_eq!(
        h.orchestrator.booking(booking.id).await.unwrap().state,
        BookingState::Confirmed
    );

    let (status, history) = send(&app, "GET", "/payments/history", Some(user), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(history[0]["status"], "completed");
}

#[tokio::test]
async fn success_callback_the_provider_has_not_seen_confirms_nothing() {
    let h = Harness::new(Some(10), false).await;
    let app = h.app();
    let user = Uuid::new_v4();
    let booking = h.booking(user).await;

    let body = json!({ "booking_id": booking.id, "phone_number": "0712345678" });
    let (_, initiation) = send(&app, "POST", "/payments/initiate", Some(user), Some(body)).await;
    let checkout = initiation["checkout_request_id"].as_str().unwrap().to_string();

    let body = callback_json(&checkout, 0, "The service request is processed successfully.");
    let (status, ack) = send(&app, "POST", "/payments/mpesa/callback", None, Some(body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["ResultCode"], 0);

    assert_eq!(
        h.orchestrator.booking(booking.id).await.unwrap().state,
        BookingState::PendingPayment
    );
    let (_, history) = send(&app, "GET", "/payments/history", Some(user), None).await;
    assert_eq!(history[0]["status"], "pending");
    assert_eq!(h.ticket_counts().await, (2, 0));
}

#[tokio::test]
async fn slow_payment_status_is_accepted_not_failed() {
    let h = Harness::new(Some(10), false).await;
    let app = h.app();
    let user = Uuid::new_v4();
    let booking = h.booking(user).await;

    let body = json!({ "booking_id": booking.id, "phone_number": "0712345678" });
    let (_, initiation) = send(&app, "POST", "/payments/initiate", Some(user), Some(body)).await;
    let uri = format!("/payments/{}/status", initiation["payment_id"].as_str().unwrap());

    h.clock.advance(chrono::Duration::minutes(6));
    let (status, body) = send(&app, "GET", &uri, Some(user), None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["code"], "payment_timeout");
    assert_eq!(
        h.orchestrator.booking(booking.id).await.unwrap().state,
        BookingState::PendingPayment
    );
}

#[tokio::test]
async fn paid_booking_is_settled_instead_of_charged_again() {
    let h = Harness::new(Some(10), false).await;
    let app = h.app();
    let user = Uuid::new_v4();
    let booking = h.booking(user).await;

    let body = json!({ "booking_id": booking.id, "phone_number": "0712345678" });
    let (_, initiation) = send(&app, "POST", "/payments/initiate", Some(user), Some(body.clone())).await;
    let payment_id = initiation["payment_id"].as_str().unwrap().parse().unwrap();
    h.provider.script([completed()]);
    h.payments.query_status(payment_id).await.unwrap();

    let (status, rejection) = send(&app, "POST", "/payments/initiate", Some(user), Some(body)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(rejection["code"], "payment_already_completed");
    assert_eq!(h.provider.pushes().len(), 1);
    assert_eq!(
        h.orchestrator.booking(booking.id).await.unwrap().state,
        BookingState::Confirmed
    );
}

#[tokio::test]
async fn invalid_phone_is_a_bad_request() {
    let h = Harness::new(Some(10), false).await;
    let app = h.app();
    let user = Uuid::new_v4();
    let booking = h.booking(user).await;

    let body = json!({ "booking_id": booking.id, "phone_number": "12345" });
    let (status, error) = send(&app, "POST", "/payments/initiate", Some(user), Some(body)).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error["code"], "invalid_phone_number");
}

#[tokio::test]
async fn cancel_endpoint_releases_tickets() {
    let h = Harness::new(Some(10), false).await;
    let app = h.app();
    let user = Uuid::new_v4();
    let booking = h.booking(user).await;
    let uri = format!("/bookings/{}/cancel", booking.id);

    let (status, _) = send(&app, "POST", &uri, Some(Uuid::new_v4()), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, cancelled) = send(&app, "POST", &uri, Some(user), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cancelled["state"], "cancelled");
    assert_eq!(h.ticket_counts().await, (0, 0));

    let (status, error) = send(&app, "POST", &uri, Some(user), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(error["code"], "booking_terminal_state_conflict");
}

#[tokio::test]
async fn health_check_answers() {
    let h = Harness::new(None, false).await;
    let response = h
        .app()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
