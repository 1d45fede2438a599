pub mod auth;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod kafka;
pub mod models;
pub mod pricing;
pub mod reference;
pub mod repository;
pub mod service;
pub mod transfer;

use crate::handlers::AppState;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        // Callable operations
        .route("/orders/wallet", post(handlers::place_wallet_order))
        .route("/orders", post(handlers::create_order))
        .route("/wallet", get(handlers::get_wallet))
        .route("/wallet/topup", get(handlers::get_topup_instructions))
        // Bank integration
        .route("/webhooks/bank", post(handlers::bank_webhook))
        // Back office
        .route("/admin/orders/:order_id/mark-paid", post(handlers::admin_mark_paid))
        .route("/admin/orders/:order_id/wallet-pay", post(handlers::admin_wallet_pay))
        .route("/admin/users/:user_id/deposit", post(handlers::admin_deposit))
        .route("/admin/users/:user_id/withdraw", post(handlers::admin_withdraw))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
