mod common;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use common::{harness, Harness};
use serde_json::{json, Value};
use shared::{EventStatus, Order};
use std::sync::Arc;
use ticketing_service::api::{create_router, AppState, ORDER_TOKEN_HEADER};
use ticketing_service::store::TicketingStore;
use tower::ServiceExt;

const STAFF_TOKEN: &str = "door-token";

fn app(h: &Harness) -> Router {
    create_router(AppState {
        engine: Arc::new(h.engine.clone()),
        staff_tokens: Arc::new(vec![STAFF_TOKEN.to_string()]),
    })
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn staff(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", STAFF_TOKEN))
        .body(Body::empty())
        .unwrap()
}

fn checkout_body(h: &Harness, quantity: i32) -> Value {
    json!({
        "eventId": h.event_id,
        "items": [{ "templateId": h.general, "quantity": quantity }],
        "buyerInfo": { "email": "ana@example.com", "name": "Ana Torres" },
        "method": "wallet",
    })
}

async fn paid_qr(h: &Harness) -> String {
    let order = h.pending_order(1).await;
    h.pay(&order).await;
    h.store.tickets_for_order(order.id).await.unwrap()[0]
        .qr_code
        .clone()
}

fn webhook_request(h: &Harness, order: &Order, event_id: &str) -> Request<Body> {
    let (body, headers) =
        h.wallet_webhook(order, event_id, EventStatus::Completed, order.total.clone());
    let mut request = Request::post("/webhooks/wallet")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap();
    request.headers_mut().extend(headers);
    request
}

#[tokio::test]
async fn health_reports_the_store_backend() {
    let h = harness().await;
    let (status, body) = send(
        &app(&h),
        Request::get("/health").body(Body::empty()).unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "status": "ok", "store": "memory" }));
}

#[tokio::test]
async fn a_buyer_checks_out_and_a_webhook_settles_the_order() {
    let h = harness().await;
    let app = app(&h);

    let (status, created) = send(&app, post_json("/checkout/session", checkout_body(&h, 2))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(created["status"], "pending");
    assert_eq!(created["currency"], "MXN");
    let order_id = created["orderId"].as_str().unwrap().to_string();
    let token = created["accessToken"].as_str().unwrap().to_string();
    let summary_uri = format!("/checkout/orders/{}", order_id);

    let (status, body) = send(
        &app,
        Request::get(summary_uri.as_str()).body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "NOT_FOUND");

    let (status, body) = send(
        &app,
        Request::post(format!("/checkout/orders/{}/payment-intent", order_id))
            .header(header::CONTENT_TYPE, "application/json")
            .header(ORDER_TOKEN_HEADER, token.as_str())
            .body(Body::from(json!({ "gateway": "wallet", "method": "wallet" }).to_string()))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["redirectUrl"].as_str().unwrap().starts_with("https://"));

    let order = h
        .store
        .get_order(order_id.parse().unwrap())
        .await
        .unwrap();

    let mut forged = webhook_request(&h, &order, "evt-http-forged");
    forged
        .headers_mut()
        .insert("x-mock-signature", "00".parse().unwrap());
    let (status, body) = send(&app, forged).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "INVALID_SIGNATURE");

    let (status, ack) = send(&app, webhook_request(&h, &order, "evt-http-1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["outcome"], "APPLIED");
    assert_eq!(ack["orderId"], order_id.as_str());

    let (status, ack) = send(&app, webhook_request(&h, &order, "evt-http-1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["outcome"], "DUPLICATE");

    let (status, summary) = send(
        &app,
        Request::get(summary_uri.as_str())
            .header(ORDER_TOKEN_HEADER, token.as_str())
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["status"], "paid");
    assert_eq!(summary["tickets"].as_array().unwrap().len(), 2);
    assert!(summary.get("accessToken").is_none());
}

#[tokio::test]
async fn sold_out_checkouts_answer_with_the_remaining_stock() {
    let h = harness().await;
    let app = app(&h);
    h.pending_order(8).await;

    let (status, body) = send(&app, post_json("/checkout/session", checkout_body(&h, 3))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "OUT_OF_STOCK");
    assert_eq!(body["error"]["details"]["available"], 2);
}

#[tokio::test]
async fn scanner_endpoints_need_a_staff_token() {
    let h = harness().await;
    let app = app(&h);
    let qr = paid_qr(&h).await;
    let uri = format!("/tickets/check-in/{}", qr);

    let (status, body) = send(
        &app,
        Request::post(uri.as_str()).body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "UNAUTHORIZED");

    let (status, _) = send(
        &app,
        Request::post(uri.as_str())
            .header(header::AUTHORIZATION, "Bearer somebody-else")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(
        &app,
        Request::get(format!("/tickets/validate/{}", qr))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, view) = send(&app, staff("GET", &format!("/tickets/validate/{}", qr))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["status"], "valid");
    assert_eq!(view["kind"], "paid");
}

#[tokio::test]
async fn a_second_scan_is_a_conflict_with_the_first_scan_time() {
    let h = harness().await;
    let app = app(&h);
    let qr = paid_qr(&h).await;
    let uri = format!("/tickets/check-in/{}", qr);

    let (status, first) = send(&app, staff("POST", &uri)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["status"], "used");

    let (status, second) = send(&app, staff("POST", &uri)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(second["error"]["code"], "ALREADY_USED");
    assert_eq!(second["error"]["details"]["usedAt"], first["usedAt"]);

    let (status, _) = send(&app, staff("POST", "/tickets/check-in/unknown-code")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn manual_completion_is_for_staff_only() {
    let h = harness().await;
    let app = app(&h);
    let order = h.pending_order(2).await;
    let uri = format!("/checkout/orders/{}/manual-complete", order.id);

    let (status, _) = send(&app, post_json(&uri, json!({ "reference": "cash" }))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(h.store.tickets_for_order(order.id).await.unwrap().is_empty());

    let (status, body) = send(&app, staff("POST", &uri)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "APPLIED");
    assert_eq!(body["status"], "paid");
    assert_eq!(body["tickets"].as_array().unwrap().len(), 2);

    let (status, body) = send(&app, staff("POST", &uri)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "IGNORED_NOT_APPLICABLE");
}

#[tokio::test]
async fn promoters_mint_courtesy_tickets_by_code() {
    let h = harness().await;
    let app = app(&h);
    h.rp_profile("LUNA", Some(1)).await;

    let (status, info) = send(
        &app,
        Request::get("/rp/LUNA/info").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(info["remaining"], 1);

    let guest = json!({ "guestTypeId": h.guest_type, "holderName": "Carla Ruiz" });
    let (status, ticket) = send(&app, post_json("/rp/LUNA/generate-ticket", guest.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ticket["holderName"], "Carla Ruiz");
    assert_eq!(ticket["status"], "valid");

    let (status, body) = send(&app, post_json("/rp/LUNA/generate-ticket", guest.clone())).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "QUOTA_EXHAUSTED");

    let (status, body) = send(&app, post_json("/rp/NADIE/generate-ticket", guest)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "INVALID_OR_INACTIVE_CODE");
}
