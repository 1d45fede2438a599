use crate::pricing::CartError;
use crate::repository::StoreError;
use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Errors surfaced by settlement operations.
///
/// Each variant maps to one caller-facing kind (`code`) and one machine
/// reason (`reason`) so clients can render distinct messages.
///
/// Three audiences read these:
/// - HTTP callers get `{ ok: false, code, reason, error }` through
///   `IntoResponse`; `code` picks the status, `reason` names the exact rule.
/// - The bank webhook reports per-record failures with `record_error`,
///   a short hyphenated label instead of an HTTP status.
/// - Logs get the full `Display` text. `Store` and `Internal` details stay
///   in the logs and never reach a caller.
///
/// Balance and status checks (`InsufficientFunds`, `AmountNotEnough`, ...)
/// are `failed-precondition`, not `invalid-argument`: the same request may
/// succeed later once the wallet or order changes.
#[derive(Debug, Error)]
pub enum SettlementError {
    #[error("Authentication required")]
    Unauthenticated,

    #[error("Administrator role required")]
    PermissionDenied,

    #[error("Request body rejected: {0}")]
    InvalidBody(String),

    #[error(transparent)]
    InvalidCart(#[from] CartError),

    #[error("Amount must be a positive whole number")]
    InvalidAmount,

    #[error("Delivery address is required")]
    MissingAddress,

    #[error("Wallet orders must be placed by a signed-in user")]
    GuestWalletOrder,

    #[error("Claimed total {claimed} does not match computed total {computed}")]
    TotalMismatch { claimed: f64, computed: i64 },

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Insufficient balance. Required: {required}, Available: {available}")]
    InsufficientFunds { required: i64, available: i64 },

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Order {0} was not placed with this payment method")]
    WrongPaymentMethod(String),

    #[error("Bank transaction already processed: {0}")]
    DuplicateTransfer(String),

    #[error("Transferred amount {amount} is less than order total {expected}")]
    AmountNotEnough { amount: i64, expected: i64 },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl SettlementError {
    /// Caller-facing error kind.
    pub fn code(&self) -> &'static str {
        match self {
            SettlementError::Unauthenticated => "unauthenticated",
            SettlementError::PermissionDenied => "permission-denied",
            SettlementError::InvalidBody(_)
            | SettlementError::InvalidCart(_)
            | SettlementError::InvalidAmount
            | SettlementError::MissingAddress
            | SettlementError::GuestWalletOrder => "invalid-argument",
            SettlementError::TotalMismatch { .. }
            | SettlementError::UserNotFound(_)
            | SettlementError::InsufficientFunds { .. }
            | SettlementError::WrongPaymentMethod(_)
            | SettlementError::DuplicateTransfer(_)
            | SettlementError::AmountNotEnough { .. } => "failed-precondition",
            SettlementError::OrderNotFound(_) => "not-found",
            SettlementError::Store(_) | SettlementError::Internal(_) => "internal",
        }
    }

    /// Machine-readable reason.
    pub fn reason(&self) -> &'static str {
        match self {
            SettlementError::Unauthenticated => "UNAUTHENTICATED",
            SettlementError::PermissionDenied => "PERMISSION_DENIED",
            SettlementError::InvalidBody(_) => "INVALID_BODY",
            SettlementError::InvalidCart(e) => e.code(),
            SettlementError::InvalidAmount => "INVALID_AMOUNT",
            SettlementError::MissingAddress => "MISSING_ADDRESS",
            SettlementError::GuestWalletOrder => "GUEST_WALLET_ORDER",
            SettlementError::TotalMismatch { .. } => "TOTAL_MISMATCH",
            SettlementError::UserNotFound(_) => "USER_NOT_FOUND",
            SettlementError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            SettlementError::OrderNotFound(_) => "ORDER_NOT_FOUND",
            SettlementError::WrongPaymentMethod(_) => "WRONG_PAYMENT_METHOD",
            SettlementError::DuplicateTransfer(_) => "DUPLICATE_TRANSFER",
            SettlementError::AmountNotEnough { .. } => "AMOUNT_NOT_ENOUGH",
            SettlementError::Store(_) | SettlementError::Internal(_) => "INTERNAL",
        }
    }

    /// Short error label used in webhook per-record results.
    pub fn record_error(&self) -> &'static str {
        match self {
            SettlementError::DuplicateTransfer(_) => "duplicate",
            SettlementError::UserNotFound(_) => "user-not-found",
            SettlementError::OrderNotFound(_) => "order-not-found",
            SettlementError::WrongPaymentMethod(_) => "not-bank-order",
            SettlementError::AmountNotEnough { .. } => "amount-not-enough",
            _ => "internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self.code() {
            "unauthenticated" => StatusCode::UNAUTHORIZED,
            "permission-denied" => StatusCode::FORBIDDEN,
            "invalid-argument" => StatusCode::BAD_REQUEST,
            "failed-precondition" => StatusCode::PRECONDITION_FAILED,
            "not-found" => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for SettlementError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            SettlementError::Store(e) => {
                tracing::error!("Store error: {:?}", e);
                "Database operation failed".to_string()
            }
            SettlementError::Internal(e) => {
                tracing::error!("Internal error: {}", e);
                "An unexpected error occurred".to_string()
            }
            other => other.to_string(),
        };

        let body = Json(json!({
            "ok": false,
            "code": self.code(),
            "reason": self.reason(),
            "error": message,
        }));

        (status, body).into_response()
    }
}

/// Malformed JSON, a wrong content type or a wrongly shaped field all become
/// `invalid-argument` responses in the usual envelope.
impl From<JsonRejection> for SettlementError {
    fn from(rejection: JsonRejection) -> Self {
        SettlementError::InvalidBody(rejection.body_text())
    }
}

pub type SettlementResult<T> = Result<T, SettlementError>;
