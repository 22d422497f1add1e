use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use bet_domain::{Bet, BetId};
use serde::Serialize;
use service_core::{ErrorCode, ResponseEnvelope};
use tracing::info;
use uuid::Uuid;

use crate::escrow_api::{
    BetStatusBody, EscrowApi, EscrowOpenedBody, FailureBody, OpenEscrowBody, SuccessBody,
    WebhookAck,
};

/// Header carrying the processor's `t=...,v1=...` signature.
const SIGNATURE_HEADER: &str = "gateway-signature";

#[derive(Clone)]
pub struct AppState {
    pub api: Arc<EscrowApi>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: &'static str,
}

pub fn build_router(api: Arc<EscrowApi>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/bets/{id}", get(get_bet))
        .route("/v1/bets/{id}/escrow", post(open_escrow))
        .route("/v1/bets/{id}/activate", post(activate))
        .route("/v1/bets/{id}/success", post(resolve_success))
        .route("/v1/bets/{id}/failure", post(resolve_failure))
        .route("/v1/gateway/webhook", post(gateway_webhook))
        .with_state(AppState { api })
}

fn parse_bet_id(raw: &str) -> Option<BetId> {
    Uuid::parse_str(raw).ok().map(BetId)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        service: "escrow-server",
    })
}

async fn get_bet(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<ResponseEnvelope<Bet>> {
    let Some(bet_id) = parse_bet_id(&id) else {
        return Json(ResponseEnvelope::err(
            ErrorCode::RequestInvalid,
            "invalid bet id",
        ));
    };
    Json(state.api.get_bet(bet_id).await)
}

async fn open_escrow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<OpenEscrowBody>,
) -> Json<ResponseEnvelope<EscrowOpenedBody>> {
    info!(route = "/v1/bets/:id/escrow", bet_id = %id, "escrow request");
    let Some(bet_id) = parse_bet_id(&id) else {
        return Json(ResponseEnvelope::err(
            ErrorCode::RequestInvalid,
            "invalid bet id",
        ));
    };
    Json(state.api.open_escrow(bet_id, body).await)
}

async fn activate(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<ResponseEnvelope<BetStatusBody>> {
    let Some(bet_id) = parse_bet_id(&id) else {
        return Json(ResponseEnvelope::err(
            ErrorCode::RequestInvalid,
            "invalid bet id",
        ));
    };
    Json(state.api.activate(bet_id).await)
}

async fn resolve_success(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<ResponseEnvelope<SuccessBody>> {
    info!(route = "/v1/bets/:id/success", bet_id = %id, "resolution request");
    let Some(bet_id) = parse_bet_id(&id) else {
        return Json(ResponseEnvelope::err(
            ErrorCode::RequestInvalid,
            "invalid bet id",
        ));
    };
    Json(state.api.resolve_success(bet_id).await)
}

async fn resolve_failure(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<ResponseEnvelope<FailureBody>> {
    info!(route = "/v1/bets/:id/failure", bet_id = %id, "resolution request");
    let Some(bet_id) = parse_bet_id(&id) else {
        return Json(ResponseEnvelope::err(
            ErrorCode::RequestInvalid,
            "invalid bet id",
        ));
    };
    Json(state.api.resolve_failure(bet_id).await)
}

async fn gateway_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Json<ResponseEnvelope<WebhookAck>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());
    Json(state.api.handle_gateway_event(&body, signature).await)
}
