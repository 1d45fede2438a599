/// HTTP surface tests: routing, authentication and response envelopes.
mod common;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use common::{admin, harness, pending_order, user, Harness};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use settlement_service::auth::{AuthKeys, Claims, HOOK_SIGNATURE_HEADER};
use settlement_service::handlers::AppState;
use settlement_service::models::{OrderStatus, PaymentMethod};
use settlement_service::repository::Store;
use std::sync::Arc;
use tower::ServiceExt;

const JWT_SECRET: &str = "test-jwt-secret";
const HOOK_SECRET: &str = "test-hook-secret";

fn app(h: &Harness) -> Router {
    settlement_service::router(AppState {
        service: h.service.clone(),
        auth: Arc::new(AuthKeys::new(JWT_SECRET, HOOK_SECRET)),
    })
}

fn token_for(user_id: &str) -> String {
    let claims = Claims {
        sub: user_id.to_string(),
        email: Some(format!("{}@example.com", user_id)),
        exp: (chrono::Utc::now().timestamp() + 3600) as usize,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .unwrap()
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn post_json(uri: &str, token: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn webhook(secret: Option<&str>, body: &str) -> Request<Body> {
    let mut builder = Request::builder().method("POST").uri("/webhooks/bank");
    if let Some(secret) = secret {
        builder = builder.header(HOOK_SIGNATURE_HEADER, secret);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

#[tokio::test]
async fn test_health() {
    let h = harness();
    let response = app(&h)
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_wallet_order_over_http() {
    let h = harness();
    h.store.put_user(user("u1", 500000));

    let (status, body) = send(
        app(&h),
        post_json(
            "/orders/wallet",
            Some(&token_for("u1")),
            json!({
                "items": [{"id": "p1", "name": "A", "price": 100000, "qty": 2}],
                "total": 200000,
                "address": "12 Nguyen Hue"
            }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert_eq!(body["total"], 200000);
    let order_id = body["orderId"].as_str().unwrap();

    let order = h.store.find_order(order_id).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::PaidWallet);
    assert_eq!(order.customer.email.as_deref(), Some("u1@example.com"));
    assert_eq!(order.items[0].product_id.as_deref(), Some("p1"));
}

#[tokio::test]
async fn test_wallet_order_errors_carry_code_and_reason() {
    let h = harness();
    h.store.put_user(user("u1", 1000));
    let token = token_for("u1");

    let (status, body) = send(
        app(&h),
        post_json(
            "/orders/wallet",
            Some(&token),
            json!({"items": [{"name": "A", "price": 100000, "qty": 1}], "total": 100000, "address": "x"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::PRECONDITION_FAILED);
    assert_eq!(body["ok"], false);
    assert_eq!(body["code"], "failed-precondition");
    assert_eq!(body["reason"], "INSUFFICIENT_FUNDS");

    let (status, body) = send(
        app(&h),
        post_json(
            "/orders/wallet",
            Some(&token),
            json!({"items": [], "total": 100, "address": "x"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid-argument");
    assert_eq!(body["reason"], "EMPTY_CART");
}

#[tokio::test]
async fn test_wrongly_typed_bodies_use_error_envelope() {
    let h = harness();
    h.store.put_user(user("u1", 500000));
    let token = token_for("u1");

    let cases = [
        (
            json!({"items": [{"name": "A", "price": "100000", "qty": 1}], "total": 100000, "address": "x"}),
            "INVALID_ITEM",
        ),
        (
            json!({"items": [{"name": "A", "price": 100000, "qty": "1"}], "total": 100000, "address": "x"}),
            "INVALID_ITEM",
        ),
        (
            json!({"items": [{"name": "A", "price": 100000, "qty": 1}], "total": "100000", "address": "x"}),
            "INVALID_TOTAL",
        ),
        (
            json!({"items": {"name": "A", "price": 100000, "qty": 1}, "total": 100000, "address": "x"}),
            "INVALID_BODY",
        ),
    ];

    for (payload, reason) in cases {
        let (status, body) = send(app(&h), post_json("/orders/wallet", Some(&token), payload)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "reason {}", reason);
        assert_eq!(body["ok"], false);
        assert_eq!(body["code"], "invalid-argument");
        assert_eq!(body["reason"], reason);
    }
    assert_eq!(h.store.order_count(), 0);
}

#[tokio::test]
async fn test_body_without_json_content_type_is_invalid_argument() {
    let h = harness();
    h.store.put_user(user("u1", 500000));

    let request = Request::builder()
        .method("POST")
        .uri("/orders/wallet")
        .header(header::AUTHORIZATION, format!("Bearer {}", token_for("u1")))
        .body(Body::from(
            json!({"items": [{"name": "A", "price": 1000, "qty": 1}], "total": 1000, "address": "x"})
                .to_string(),
        ))
        .unwrap();

    let (status, body) = send(app(&h), request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["reason"], "INVALID_BODY");
}

#[tokio::test]
async fn test_checkout_accepts_lowercase_payment_method() {
    let h = harness();

    let (status, body) = send(
        app(&h),
        post_json(
            "/orders",
            None,
            json!({"items": [{"name": "A", "price": 20000, "qty": 1}], "address": "x", "paymentMethod": "cod"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "pending");

    let (status, body) = send(
        app(&h),
        post_json(
            "/orders",
            None,
            json!({"items": [{"name": "A", "price": 20000, "qty": 1}], "address": "x", "paymentMethod": "card"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["reason"], "INVALID_BODY");
}

#[tokio::test]
async fn test_admin_deposit_and_withdraw_over_http() {
    let h = harness();
    h.store.put_user(admin("boss"));
    h.store.put_user(user("u1", 0));
    let token = token_for("boss");

    let (status, body) = send(
        app(&h),
        post_json("/admin/users/u1/deposit", Some(&token), json!({"amount": 70000})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["balance"], 70000);
    assert!(body["ledgerId"].as_str().unwrap().starts_with("ADJUST-u1-"));

    let (status, body) = send(
        app(&h),
        post_json("/admin/users/u1/withdraw", Some(&token), json!({"amount": 90000})),
    )
    .await;
    assert_eq!(status, StatusCode::PRECONDITION_FAILED);
    assert_eq!(body["reason"], "INSUFFICIENT_FUNDS");

    let (status, body) = send(
        app(&h),
        post_json("/admin/users/u1/withdraw", Some(&token), json!({"amount": "lots"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["reason"], "INVALID_AMOUNT");

    let (status, body) = send(
        app(&h),
        post_json("/admin/users/u1/withdraw", Some(&token), json!({"amount": 20000})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["balance"], 50000);

    let (status, _) = send(
        app(&h),
        post_json("/admin/users/u1/deposit", Some(&token_for("u1")), json!({"amount": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(h.store.find_user("u1").await.unwrap().unwrap().balance, 50000);
}

#[tokio::test]
async fn test_wallet_order_requires_valid_token() {
    let h = harness();
    let payload = json!({"items": [{"name": "A", "price": 1000, "qty": 1}], "total": 1000, "address": "x"});

    let (status, body) = send(app(&h), post_json("/orders/wallet", None, payload.clone())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "unauthenticated");

    let (status, _) = send(
        app(&h),
        post_json("/orders/wallet", Some("not-a-jwt"), payload),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_guest_bank_checkout() {
    let h = harness();

    let (status, body) = send(
        app(&h),
        post_json(
            "/orders",
            None,
            json!({
                "items": [{"name": "A", "price": 50000, "qty": 3}],
                "address": "7 Tran Hung Dao",
                "paymentMethod": "BANK",
                "customer": {"name": "Minh", "phone": "0900000000"}
            }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "awaiting_bank");
    assert_eq!(body["total"], 150000);
    assert!(body["transferReference"].as_str().unwrap().starts_with("ORDER-"));
    assert!(body["qrUrl"].as_str().unwrap().starts_with("https://img.vietqr.io/"));
}

#[tokio::test]
async fn test_webhook_rejects_bad_secret() {
    let h = harness();
    h.store.put_user(user("abcdefghij12", 0));
    let body = r#"{"amount": 50000, "description": "TOPUP-abcdefghij12", "id": "tx1"}"#;

    let (status, json) = send(app(&h), webhook(None, body)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(json["ok"], false);

    let (status, _) = send(app(&h), webhook(Some("wrong"), body)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    assert_eq!(
        h.store.find_user("abcdefghij12").await.unwrap().unwrap().balance,
        0
    );
}

#[tokio::test]
async fn test_webhook_reports_each_record() {
    let h = harness();
    h.store.put_user(user("abcdefghij12", 0));
    h.store
        .put_order(pending_order("xyz789", None, PaymentMethod::Bank, 150000));

    let body = json!({
        "data": [
            {"amount": 50000, "description": "TOPUP-abcdefghij12", "id": "tx1"},
            {"amount": 150000, "description": "ORDER-xyz789", "id": "tx2"},
            {"amount": 10000, "description": "lunch", "id": "tx3"}
        ]
    })
    .to_string();

    let (status, json) = send(app(&h), webhook(Some(HOOK_SECRET), &body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["ok"], true);

    let results = json["results"].as_array().unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results[0]["action"], "TOPUP");
    assert_eq!(results[0]["ok"], true);
    assert_eq!(results[1]["action"], "ORDER");
    assert_eq!(results[1]["orderId"], "xyz789");
    assert_eq!(results[2]["ignored"], true);
    assert_eq!(results[2]["reason"], "no-matching-pattern");

    // Redelivery of the same payload changes nothing.
    let (status, json) = send(app(&h), webhook(Some(HOOK_SECRET), &body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["results"][0]["error"], "duplicate");
    assert_eq!(json["results"][1]["alreadyPaid"], true);
    assert_eq!(
        h.store.find_user("abcdefghij12").await.unwrap().unwrap().balance,
        50000
    );
}

#[tokio::test]
async fn test_webhook_empty_and_malformed_bodies() {
    let h = harness();

    let (status, json) = send(app(&h), webhook(Some(HOOK_SECRET), "")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["results"].as_array().map(Vec::len), Some(1));
    assert_eq!(json["results"][0]["reason"], "no-amount");

    let (status, _) = send(app(&h), webhook(Some(HOOK_SECRET), "{not json")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_admin_routes_check_role() {
    let h = harness();
    h.store.put_user(user("u1", 0));
    h.store
        .put_order(pending_order("c1", None, PaymentMethod::Cod, 50000));

    let (status, body) = send(
        app(&h),
        post_json("/admin/orders/c1/mark-paid", Some(&token_for("u1")), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["reason"], "PERMISSION_DENIED");
    assert_eq!(
        h.store.find_order("c1").await.unwrap().unwrap().status,
        OrderStatus::Pending
    );
}
