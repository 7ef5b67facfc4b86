use axum::{
    async_trait,
    body::Bytes,
    extract::{FromRequestParts, Path, State},
    http::{header::AUTHORIZATION, request::Parts, HeaderMap},
    response::Json,
    routing::{get, post},
    Router,
};
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shared::{Gateway, OrderStatus, PaymentMethod, Ticket, TicketStatus};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::checkin::TicketView;
use crate::checkout::{CheckoutRequest, OrderSummary};
use crate::error::{AppError, AppResult};
use crate::payments::ChargeOutcome;
use crate::reconciler::WebhookAck;
use crate::rp::{GuestRequest, RpInfo};
use crate::settlement::SettlementOutcome;
use crate::Engine;

pub const ORDER_TOKEN_HEADER: &str = "x-order-token";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub staff_tokens: Arc<Vec<String>>,
}

/// An operator or scanner authenticated with one of the configured staff bearer tokens.
#[derive(Debug, Clone)]
pub struct StaffAuth {
    pub operator: String,
}

#[async_trait]
impl FromRequestParts<AppState> for StaffAuth {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or(AppError::Unauthorized)?;

        state
            .staff_tokens
            .iter()
            .position(|known| known == token)
            .map(|index| StaffAuth {
                operator: format!("staff-{}", index + 1),
            })
            .ok_or(AppError::Unauthorized)
    }
}

fn order_token(headers: &HeaderMap) -> &str {
    headers
        .get(ORDER_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutResponse {
    pub order_id: Uuid,
    pub access_token: String,
    pub status: OrderStatus,
    pub total: BigDecimal,
    pub currency: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentBody {
    pub gateway: Gateway,
    pub method: PaymentMethod,
    #[serde(default)]
    pub return_url: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentResponse {
    pub gateway: Gateway,
    pub redirect_url: Option<String>,
    pub client_token: Option<String>,
    pub reference: Option<String>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct ChargeBody {
    pub gateway: Gateway,
    pub token: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ManualCompleteBody {
    #[serde(default)]
    pub reference: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedTicket {
    pub ticket_id: Uuid,
    pub qr_code: String,
    pub status: TicketStatus,
    pub holder_name: Option<String>,
    pub nickname: Option<String>,
}

impl From<Ticket> for IssuedTicket {
    fn from(ticket: Ticket) -> Self {
        Self {
            ticket_id: ticket.id,
            qr_code: ticket.qr_code,
            status: ticket.status,
            holder_name: ticket.holder_name,
            nickname: ticket.nickname,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckInResponse {
    pub ticket_id: Uuid,
    pub status: TicketStatus,
    pub used_at: Option<DateTime<Utc>>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/checkout/session", post(open_checkout))
        .route("/checkout/orders/:id", get(order_summary))
        .route("/checkout/orders/:id/payment-intent", post(create_payment_intent))
        .route("/checkout/orders/:id/charge", post(charge_order))
        .route("/checkout/orders/:id/cancel", post(cancel_order))
        .route("/checkout/orders/:id/manual-complete", post(manual_complete))
        .route("/webhooks/:gateway", post(receive_webhook))
        .route("/tickets/validate/:qr", get(validate_ticket))
        .route("/tickets/check-in/:qr", post(check_in_ticket))
        .route("/rp/:code/info", get(rp_info))
        .route("/rp/:code/generate-ticket", post(rp_generate))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

pub async fn health_check(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let store = &state.engine.store;
    store.health_check().await?;
    Ok(Json(json!({ "status": "ok", "store": store.backend_name() })))
}

pub async fn open_checkout(
    State(state): State<AppState>,
    Json(request): Json<CheckoutRequest>,
) -> AppResult<Json<CheckoutResponse>> {
    let order = state.engine.checkout.open(request).await?;
    Ok(Json(CheckoutResponse {
        order_id: order.id,
        access_token: order.access_token,
        status: order.status,
        total: order.total,
        currency: order.currency,
        expires_at: order.expires_at,
    }))
}

pub async fn order_summary(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> AppResult<Json<OrderSummary>> {
    let summary = state
        .engine
        .checkout
        .get_summary(id, order_token(&headers))
        .await?;
    Ok(Json(summary))
}

pub async fn create_payment_intent(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(body): Json<IntentBody>,
) -> AppResult<Json<IntentResponse>> {
    let intent = state
        .engine
        .payments
        .create_intent(
            id,
            order_token(&headers),
            body.gateway,
            body.method,
            body.return_url.as_deref(),
        )
        .await?;

    Ok(Json(IntentResponse {
        gateway: intent.gateway,
        redirect_url: intent.redirect_url,
        client_token: intent.client_token,
        reference: intent.reference,
        expires_at: intent.expires_at,
    }))
}

pub async fn charge_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(body): Json<ChargeBody>,
) -> AppResult<Json<ChargeOutcome>> {
    let outcome = state
        .engine
        .payments
        .charge(id, order_token(&headers), body.gateway, &body.token)
        .await?;
    Ok(Json(outcome))
}

pub async fn cancel_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let order = state
        .engine
        .checkout
        .cancel(id, order_token(&headers))
        .await?;
    Ok(Json(json!({ "orderId": order.id, "status": order.status })))
}

pub async fn manual_complete(
    State(state): State<AppState>,
    staff: StaffAuth,
    Path(id): Path<Uuid>,
    body: Option<Json<ManualCompleteBody>>,
) -> AppResult<Json<Value>> {
    let reference = body.and_then(|Json(body)| body.reference);
    let outcome = state
        .engine
        .checkout
        .complete_manually(id, &staff.operator, reference)
        .await?;

    let body = match outcome {
        SettlementOutcome::Applied { order, tickets } => json!({
            "outcome": "APPLIED",
            "orderId": order.id,
            "status": order.status,
            "tickets": tickets.into_iter().map(IssuedTicket::from).collect::<Vec<_>>(),
        }),
        SettlementOutcome::NotApplicable(status) => json!({
            "outcome": "IGNORED_NOT_APPLICABLE",
            "orderId": id,
            "status": status,
        }),
        SettlementOutcome::AmountMismatch { expected, received } => json!({
            "outcome": "AMOUNT_MISMATCH",
            "orderId": id,
            "expected": expected,
            "received": received,
        }),
    };
    Ok(Json(body))
}

pub async fn receive_webhook(
    State(state): State<AppState>,
    Path(gateway): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<WebhookAck>> {
    let ack = state
        .engine
        .reconciler
        .handle(&gateway, &body, &headers)
        .await?;
    Ok(Json(ack))
}

pub async fn validate_ticket(
    State(state): State<AppState>,
    _staff: StaffAuth,
    Path(qr): Path<String>,
) -> AppResult<Json<TicketView>> {
    Ok(Json(state.engine.check_in.validate(&qr).await?))
}

pub async fn check_in_ticket(
    State(state): State<AppState>,
    _staff: StaffAuth,
    Path(qr): Path<String>,
) -> AppResult<Json<CheckInResponse>> {
    let ticket = state.engine.check_in.check_in(&qr).await?;
    Ok(Json(CheckInResponse {
        ticket_id: ticket.id,
        status: ticket.status,
        used_at: ticket.used_at,
    }))
}

pub async fn rp_info(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> AppResult<Json<RpInfo>> {
    Ok(Json(state.engine.rp.info(&code).await?))
}

pub async fn rp_generate(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Json(request): Json<GuestRequest>,
) -> AppResult<Json<IssuedTicket>> {
    let ticket = state.engine.rp.generate(&code, request).await?;
    Ok(Json(IssuedTicket::from(ticket)))
}
