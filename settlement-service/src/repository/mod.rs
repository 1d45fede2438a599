//! Storage capability for the settlement core.
//!
//! All balance and order-status mutations go through a [`StoreTx`]: reads
//! inside it observe committed state, writes become visible only on
//! [`StoreTx::commit`], and dropping the transaction discards them. A commit
//! that races another transaction on the same documents fails with
//! [`StoreError::Conflict`] and the caller retries from the top.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::models::{BankTxRecord, LedgerEntry, Order, OrderStatus, User};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Failures a store transaction can report.
///
/// Only two of these are retryable, and `retry_on_conflict` in the service
/// re-runs the whole transaction body for them:
/// - `Conflict`: another transaction committed a document this one read.
///   Re-running re-reads the committed state, so the second of two
///   concurrent wallet debits sees the lowered balance instead of
///   overwriting it.
/// - `Duplicate`: a create-if-absent key (order id, ledger key, bank
///   transaction marker) appeared first. On re-run the body finds the
///   existing record and answers from it (`duplicate`, `alreadyPaid`,
///   a replayed order).
///
/// Everything else is infrastructure trouble and surfaces as `internal`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Concurrent update detected. Please retry.")]
    Conflict,

    #[error("Document already exists: {0}")]
    Duplicate(String),

    #[error("Stored document is malformed: {0}")]
    Corrupt(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Database error: {0}")]
    Database(sqlx::Error),
}

/// Classify PostgreSQL failures by SQLSTATE.
///
/// With `FOR UPDATE` row locks, plain lost updates cannot happen, but
/// PostgreSQL can still abort a transaction with `40001` (serialization
/// failure, e.g. under a stricter isolation level configured on the server)
/// or `40P01` (deadlock between two transactions locking a user and an order
/// in opposite order). Both leave nothing committed, so they map to
/// `Conflict` and are retried. `23505` is the primary key of the ledger or
/// the bank transaction marker rejecting a second insert: that is the
/// database enforcing idempotency, reported as `Duplicate`.
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            match db.code().as_deref() {
                // serialization_failure, deadlock_detected
                Some("40001") | Some("40P01") => return StoreError::Conflict,
                // unique_violation
                Some("23505") => {
                    return StoreError::Duplicate(db.constraint().unwrap_or("unknown").to_string())
                }
                _ => {}
            }
        }
        StoreError::Database(err)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Atomic read-modify-write over users, orders, ledger entries and bank
/// transaction markers.
#[async_trait]
pub trait StoreTx: Send {
    async fn get_user(&mut self, user_id: &str) -> StoreResult<Option<User>>;

    async fn set_balance(&mut self, user_id: &str, balance: i64, at: DateTime<Utc>) -> StoreResult<()>;

    async fn get_order(&mut self, order_id: &str) -> StoreResult<Option<Order>>;

    /// Fails with `Duplicate` if an order with the same id exists.
    async fn insert_order(&mut self, order: &Order) -> StoreResult<()>;

    async fn mark_order_paid(
        &mut self,
        order_id: &str,
        status: OrderStatus,
        paid_at: DateTime<Utc>,
        bank_tx_id: Option<&str>,
    ) -> StoreResult<()>;

    async fn bank_tx_exists(&mut self, tx_id: &str) -> StoreResult<bool>;

    /// Fails with `Duplicate` if the marker already exists.
    async fn insert_bank_tx(&mut self, record: &BankTxRecord) -> StoreResult<()>;

    /// Create-if-absent keyed by `entry.id`; fails with `Duplicate` otherwise.
    async fn insert_ledger_entry(&mut self, entry: &LedgerEntry) -> StoreResult<()>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTx>>;

    async fn find_user(&self, user_id: &str) -> StoreResult<Option<User>>;

    async fn find_order(&self, order_id: &str) -> StoreResult<Option<Order>>;

    /// Newest first.
    async fn ledger_for_user(&self, user_id: &str) -> StoreResult<Vec<LedgerEntry>>;
}
