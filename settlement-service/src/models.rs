use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Account holder as seen by the settlement core.
///
/// The record itself belongs to the account subsystem; settlement only ever
/// reads it and rewrites `balance` inside a store transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub role: Role,
    pub balance: i64,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn new(id: impl Into<String>, balance: i64) -> Self {
        Self {
            id: id.into(),
            email: None,
            display_name: None,
            phone: None,
            address: None,
            role: Role::User,
            balance,
            updated_at: Utc::now(),
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Admin => write!(f, "admin"),
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

/// Snapshot of a cart line, frozen at order creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_id: Option<String>,
    pub name: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub price: Decimal,
    pub qty: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// Contact details captured at checkout.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: String,
    /// None for guest checkouts.
    pub user_id: Option<String>,
    pub items: Vec<LineItem>,
    pub total: i64,
    pub payment_method: PaymentMethod,
    pub status: OrderStatus,
    pub address: String,
    pub note: String,
    pub customer: Customer,
    pub bank_tx_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PaymentMethod {
    Cod,
    Bank,
    Wallet,
    Momo,
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PaymentMethod::Cod => write!(f, "COD"),
            PaymentMethod::Bank => write!(f, "BANK"),
            PaymentMethod::Wallet => write!(f, "WALLET"),
            PaymentMethod::Momo => write!(f, "MOMO"),
        }
    }
}

impl FromStr for PaymentMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "COD" => Ok(PaymentMethod::Cod),
            "BANK" => Ok(PaymentMethod::Bank),
            "WALLET" => Ok(PaymentMethod::Wallet),
            "MOMO" => Ok(PaymentMethod::Momo),
            other => Err(format!("unknown payment method '{}'", other)),
        }
    }
}

/// Accepts any casing (`bank`, `Bank`, `BANK`).
impl<'de> Deserialize<'de> for PaymentMethod {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

/// Order lifecycle. Transitions only go from a pending-like status to a
/// paid-like one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    PendingWallet,
    AwaitingBank,
    Paid,
    PaidWallet,
    PaidBank,
}

impl OrderStatus {
    pub fn is_paid(self) -> bool {
        matches!(
            self,
            OrderStatus::Paid | OrderStatus::PaidWallet | OrderStatus::PaidBank
        )
    }

    /// Status a freshly checked-out order starts in.
    pub fn initial_for(method: PaymentMethod) -> Self {
        match method {
            PaymentMethod::Cod | PaymentMethod::Momo => OrderStatus::Pending,
            PaymentMethod::Bank => OrderStatus::AwaitingBank,
            PaymentMethod::Wallet => OrderStatus::PendingWallet,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderStatus::Pending => "pending",
            OrderStatus::PendingWallet => "pending_wallet",
            OrderStatus::AwaitingBank => "awaiting_bank",
            OrderStatus::Paid => "paid",
            OrderStatus::PaidWallet => "paid_wallet",
            OrderStatus::PaidBank => "paid_bank",
        };
        f.write_str(s)
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OrderStatus::Pending),
            "pending_wallet" => Ok(OrderStatus::PendingWallet),
            "awaiting_bank" => Ok(OrderStatus::AwaitingBank),
            "paid" => Ok(OrderStatus::Paid),
            "paid_wallet" => Ok(OrderStatus::PaidWallet),
            "paid_bank" => Ok(OrderStatus::PaidBank),
            other => Err(format!("unknown order status '{}'", other)),
        }
    }
}

/// Append-only wallet ledger entry. `id` is the idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub id: String,
    pub user_id: String,
    #[serde(rename = "type")]
    pub kind: LedgerKind,
    pub reason: Option<LedgerReason>,
    /// Order id for debits, bank transaction id for top-ups.
    pub reference: String,
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn debit_key(user_id: &str, order_id: &str) -> String {
        format!("DEBIT-{}-{}", user_id, order_id)
    }

    pub fn topup_key(bank_tx_id: &str) -> String {
        format!("TOPUP-{}", bank_tx_id)
    }

    pub fn order_debit(user_id: &str, order_id: &str, amount: i64, at: DateTime<Utc>) -> Self {
        Self {
            id: Self::debit_key(user_id, order_id),
            user_id: user_id.to_string(),
            kind: LedgerKind::Debit,
            reason: Some(LedgerReason::Order),
            reference: order_id.to_string(),
            amount,
            created_at: at,
        }
    }

    pub fn adjustment_key(user_id: &str, adjustment_id: &str) -> String {
        format!("ADJUST-{}-{}", user_id, adjustment_id)
    }

    /// Back-office balance change: `Topup` for deposits, `Debit` for
    /// withdrawals. `amount` is always positive.
    pub fn adjustment(
        user_id: &str,
        adjustment_id: &str,
        kind: LedgerKind,
        amount: i64,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Self::adjustment_key(user_id, adjustment_id),
            user_id: user_id.to_string(),
            kind,
            reason: Some(LedgerReason::Adjustment),
            reference: adjustment_id.to_string(),
            amount,
            created_at: at,
        }
    }

    pub fn topup(user_id: &str, bank_tx_id: &str, amount: i64, at: DateTime<Utc>) -> Self {
        Self {
            id: Self::topup_key(bank_tx_id),
            user_id: user_id.to_string(),
            kind: LedgerKind::Topup,
            reason: None,
            reference: bank_tx_id.to_string(),
            amount,
            created_at: at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerKind {
    Topup,
    Debit,
}

impl fmt::Display for LedgerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerKind::Topup => write!(f, "TOPUP"),
            LedgerKind::Debit => write!(f, "DEBIT"),
        }
    }
}

impl FromStr for LedgerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TOPUP" => Ok(LedgerKind::Topup),
            "DEBIT" => Ok(LedgerKind::Debit),
            other => Err(format!("unknown ledger kind '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerReason {
    Order,
    /// Manual back-office deposit or withdrawal.
    Adjustment,
}

impl fmt::Display for LedgerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerReason::Order => write!(f, "ORDER"),
            LedgerReason::Adjustment => write!(f, "ADJUSTMENT"),
        }
    }
}

impl FromStr for LedgerReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ORDER" => Ok(LedgerReason::Order),
            "ADJUSTMENT" => Ok(LedgerReason::Adjustment),
            other => Err(format!("unknown ledger reason '{}'", other)),
        }
    }
}

/// Marks a physical bank transfer as processed. Keyed by the bank's
/// transaction id; its existence is what makes redelivery a no-op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BankTxRecord {
    pub id: String,
    pub kind: LedgerKind,
    pub user_id: Option<String>,
    pub amount: i64,
    pub description: String,
    pub account: String,
    pub occurred_at: String,
    pub created_at: DateTime<Utc>,
}

// === API Request/Response Models ===

/// JSON numbers pass through; strings, objects and other shapes read as
/// absent so the validation layer reports them with its own reason code.
fn lenient_number<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(Value::as_f64))
}

/// Cart line as sent by the browser. Price and quantity stay loose here so
/// a missing or non-numeric value surfaces as `INVALID_ITEM` instead of a
/// body rejection.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartItem {
    #[serde(default, alias = "id")]
    pub product_id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "lenient_number")]
    pub price: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub qty: Option<f64>,
    #[serde(default)]
    pub image: Option<String>,
}

impl CartItem {
    pub fn new(name: &str, price: f64, qty: f64) -> Self {
        Self {
            name: name.to_string(),
            price: Some(price),
            qty: Some(qty),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceWalletOrderRequest {
    #[serde(default)]
    pub items: Vec<CartItem>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub total: Option<f64>,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub note: Option<String>,
    /// Client-chosen order intent id; retries carrying the same value never
    /// debit twice.
    #[serde(default)]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletOrderReceipt {
    pub order_id: String,
    pub total: i64,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub replayed: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutRequest {
    #[serde(default)]
    pub items: Vec<CartItem>,
    #[serde(default)]
    pub address: String,
    pub payment_method: PaymentMethod,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub customer: Customer,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutReceipt {
    pub order_id: String,
    pub status: OrderStatus,
    pub total: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qr_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletSummary {
    pub user_id: String,
    pub balance: i64,
    pub entries: Vec<LedgerEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TopupQuery {
    pub amount: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopupInstructions {
    pub reference: String,
    pub amount: i64,
    pub qr_url: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminSettlement {
    pub order_id: String,
    pub status: OrderStatus,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub already_paid: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdjustBalanceRequest {
    #[serde(default, deserialize_with = "lenient_number")]
    pub amount: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceAdjustment {
    pub user_id: String,
    pub ledger_id: String,
    pub balance: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReconcileAction {
    Topup,
    Order,
}

/// Result of reconciling one bank transfer in a webhook delivery.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordOutcome {
    pub tx_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ignored: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<ReconcileAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub already_paid: Option<bool>,
}

impl RecordOutcome {
    fn bare(tx_id: &str) -> Self {
        Self {
            tx_id: tx_id.to_string(),
            ok: None,
            ignored: None,
            action: None,
            reason: None,
            error: None,
            user_id: None,
            order_id: None,
            amount: None,
            expected: None,
            already_paid: None,
        }
    }

    pub fn ignored(tx_id: &str, reason: &str) -> Self {
        Self {
            ignored: Some(true),
            reason: Some(reason.to_string()),
            ..Self::bare(tx_id)
        }
    }

    pub fn topped_up(tx_id: &str, user_id: &str, amount: i64) -> Self {
        Self {
            ok: Some(true),
            action: Some(ReconcileAction::Topup),
            user_id: Some(user_id.to_string()),
            amount: Some(amount),
            ..Self::bare(tx_id)
        }
    }

    pub fn order_settled(tx_id: &str, order_id: &str, already_paid: bool) -> Self {
        Self {
            ok: Some(true),
            action: Some(ReconcileAction::Order),
            order_id: Some(order_id.to_string()),
            already_paid: already_paid.then_some(true),
            ..Self::bare(tx_id)
        }
    }

    pub fn failed(tx_id: &str, action: ReconcileAction, error: &str) -> Self {
        Self {
            ok: Some(false),
            action: Some(action),
            error: Some(error.to_string()),
            ..Self::bare(tx_id)
        }
    }

    pub fn is_ok(&self) -> bool {
        self.ok == Some(true)
    }
}

#[derive(Debug, Serialize)]
pub struct WebhookResults {
    pub results: Vec<RecordOutcome>,
}

/// `{ "ok": true, ...body }`
#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub ok: bool,
    #[serde(flatten)]
    pub body: T,
}

impl<T> Envelope<T> {
    pub fn ok(body: T) -> Self {
        Self { ok: true, body }
    }
}
