use crate::auth::{AuthKeys, Caller};
use crate::errors::SettlementResult;
use crate::models::*;
use crate::service::SettlementService;
use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub service: SettlementService,
    pub auth: Arc<AuthKeys>,
}

/// Place an order paid from the caller's wallet balance.
pub async fn place_wallet_order(
    State(state): State<AppState>,
    caller: Caller,
    payload: Result<Json<PlaceWalletOrderRequest>, JsonRejection>,
) -> SettlementResult<Json<Envelope<WalletOrderReceipt>>> {
    let Json(payload) = payload?;
    let receipt = state.service.place_wallet_order(&caller, payload).await?;
    Ok(Json(Envelope::ok(receipt)))
}

/// Create a pending order (COD, bank transfer, mobile wallet, or a wallet
/// order settled later by the back office). Guests may check out.
pub async fn create_order(
    State(state): State<AppState>,
    caller: Option<Caller>,
    payload: Result<Json<CheckoutRequest>, JsonRejection>,
) -> SettlementResult<(StatusCode, Json<Envelope<CheckoutReceipt>>)> {
    let Json(payload) = payload?;
    let receipt = state
        .service
        .create_checkout_order(caller.as_ref(), payload)
        .await?;
    Ok((StatusCode::CREATED, Json(Envelope::ok(receipt))))
}

pub async fn get_wallet(
    State(state): State<AppState>,
    caller: Caller,
) -> SettlementResult<Json<Envelope<WalletSummary>>> {
    tracing::debug!(user_id = %caller.user_id, "Fetching wallet");
    let summary = state.service.wallet_summary(&caller).await?;
    Ok(Json(Envelope::ok(summary)))
}

pub async fn get_topup_instructions(
    State(state): State<AppState>,
    caller: Caller,
    Query(query): Query<TopupQuery>,
) -> Json<Envelope<TopupInstructions>> {
    Json(Envelope::ok(state.service.topup_instructions(&caller, query.amount)))
}

/// Bank transfer notifications.
///
/// Always answers 200 with one result per record once the shared secret
/// checks out; the provider inspects per-record results for its own retries.
pub async fn bank_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !state.auth.verify_hook(&headers) {
        tracing::warn!("Bank webhook called without a valid secret");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "ok": false, "error": "Unauthorized" })),
        )
            .into_response();
    }

    let body = if body.is_empty() {
        Value::Null
    } else {
        match serde_json::from_slice::<Value>(&body) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(error = %e, "Bank webhook body is not JSON");
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "ok": false, "error": "Invalid JSON body" })),
                )
                    .into_response();
            }
        }
    };
    let service = state.service.clone();

    // Records are processed on their own task so a panic in one delivery
    // surfaces as a 500 instead of a dropped connection.
    match tokio::spawn(async move { service.reconcile_delivery(body).await }).await {
        Ok(results) => {
            tracing::info!(
                records = results.len(),
                applied = results.iter().filter(|r| r.is_ok()).count(),
                "Bank webhook processed"
            );
            Json(Envelope::ok(WebhookResults { results })).into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "Bank webhook processing aborted");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "ok": false, "error": "Internal error" })),
            )
                .into_response()
        }
    }
}

pub async fn admin_mark_paid(
    State(state): State<AppState>,
    caller: Caller,
    Path(order_id): Path<String>,
) -> SettlementResult<Json<Envelope<AdminSettlement>>> {
    let settled = state.service.mark_order_paid(&caller, &order_id).await?;
    Ok(Json(Envelope::ok(settled)))
}

pub async fn admin_wallet_pay(
    State(state): State<AppState>,
    caller: Caller,
    Path(order_id): Path<String>,
) -> SettlementResult<Json<Envelope<AdminSettlement>>> {
    let settled = state
        .service
        .settle_order_from_wallet(&caller, &order_id)
        .await?;
    Ok(Json(Envelope::ok(settled)))
}

pub async fn admin_deposit(
    State(state): State<AppState>,
    caller: Caller,
    Path(user_id): Path<String>,
    payload: Result<Json<AdjustBalanceRequest>, JsonRejection>,
) -> SettlementResult<Json<Envelope<BalanceAdjustment>>> {
    let Json(payload) = payload?;
    let adjusted = state
        .service
        .adjust_balance(&caller, &user_id, LedgerKind::Topup, payload)
        .await?;
    Ok(Json(Envelope::ok(adjusted)))
}

pub async fn admin_withdraw(
    State(state): State<AppState>,
    caller: Caller,
    Path(user_id): Path<String>,
    payload: Result<Json<AdjustBalanceRequest>, JsonRejection>,
) -> SettlementResult<Json<Envelope<BalanceAdjustment>>> {
    let Json(payload) = payload?;
    let adjusted = state
        .service
        .adjust_balance(&caller, &user_id, LedgerKind::Debit, payload)
        .await?;
    Ok(Json(Envelope::ok(adjusted)))
}

pub async fn health_check() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}
