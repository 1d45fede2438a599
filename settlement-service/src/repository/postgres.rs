use super::{Store, StoreError, StoreResult, StoreTx};
use crate::models::{
    BankTxRecord, Customer, LedgerEntry, LineItem, Order, OrderStatus, User,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, Transaction};

/// PostgreSQL-backed store.
///
/// Rows read inside a transaction are locked with `SELECT ... FOR UPDATE`, so
/// two settlements touching the same user or order serialize on the row lock
/// and the second one sees the first one's committed state. Ledger entries and
/// bank transaction markers are keyed by primary key, which makes
/// create-if-absent a database guarantee.
///
/// How a concurrent wallet debit plays out:
/// 1. Transaction A reads the user `FOR UPDATE` and takes the row lock.
/// 2. Transaction B issues the same read and blocks on the lock.
/// 3. A writes the new balance, the order and the ledger entry, then commits.
/// 4. B's read returns A's committed balance; the balance check runs against
///    it and refuses the debit if it no longer covers the total.
///
/// Why row locks instead of a version column?
/// - Every read in a settlement is followed by a write to the same row.
/// - A blocked transaction just waits; no `Conflict` round trip and retry.
/// - The `balance >= 0` check constraint still backs the service-level check.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

pub struct PgStoreTx {
    tx: Transaction<'static, Postgres>,
}

#[derive(FromRow)]
struct UserRow {
    id: String,
    email: Option<String>,
    display_name: Option<String>,
    phone: Option<String>,
    address: Option<String>,
    role: String,
    balance: i64,
    updated_at: DateTime<Utc>,
}

impl TryFrom<UserRow> for User {
    type Error = StoreError;

    fn try_from(row: UserRow) -> StoreResult<Self> {
        Ok(User {
            role: row.role.parse().map_err(StoreError::Corrupt)?,
            id: row.id,
            email: row.email,
            display_name: row.display_name,
            phone: row.phone,
            address: row.address,
            balance: row.balance,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct OrderRow {
    id: String,
    user_id: Option<String>,
    items: Json<Vec<LineItem>>,
    total: i64,
    payment_method: String,
    status: String,
    address: String,
    note: String,
    customer: Json<Customer>,
    bank_tx_id: Option<String>,
    created_at: DateTime<Utc>,
    paid_at: Option<DateTime<Utc>>,
}

impl TryFrom<OrderRow> for Order {
    type Error = StoreError;

    fn try_from(row: OrderRow) -> StoreResult<Self> {
        Ok(Order {
            payment_method: row.payment_method.parse().map_err(StoreError::Corrupt)?,
            status: row.status.parse().map_err(StoreError::Corrupt)?,
            id: row.id,
            user_id: row.user_id,
            items: row.items.0,
            total: row.total,
            address: row.address,
            note: row.note,
            customer: row.customer.0,
            bank_tx_id: row.bank_tx_id,
            created_at: row.created_at,
            paid_at: row.paid_at,
        })
    }
}

#[derive(FromRow)]
struct LedgerRow {
    id: String,
    user_id: String,
    kind: String,
    reason: Option<String>,
    reference: String,
    amount: i64,
    created_at: DateTime<Utc>,
}

impl TryFrom<LedgerRow> for LedgerEntry {
    type Error = StoreError;

    fn try_from(row: LedgerRow) -> StoreResult<Self> {
        Ok(LedgerEntry {
            kind: row.kind.parse().map_err(StoreError::Corrupt)?,
            reason: row
                .reason
                .map(|r| r.parse())
                .transpose()
                .map_err(StoreError::Corrupt)?,
            id: row.id,
            user_id: row.user_id,
            reference: row.reference,
            amount: row.amount,
            created_at: row.created_at,
        })
    }
}

const USER_COLUMNS: &str = "id, email, display_name, phone, address, role, balance, updated_at";
const ORDER_COLUMNS: &str = "id, user_id, items, total, payment_method, status, address, note, customer, bank_tx_id, created_at, paid_at";

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgStoreTx { tx }))
    }

    async fn find_user(&self, user_id: &str) -> StoreResult<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {} FROM users WHERE id = $1",
            USER_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(User::try_from).transpose()
    }

    async fn find_order(&self, order_id: &str) -> StoreResult<Option<Order>> {
        let row = sqlx::query_as::<_, OrderRow>(&format!(
            "SELECT {} FROM orders WHERE id = $1",
            ORDER_COLUMNS
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Order::try_from).transpose()
    }

    async fn ledger_for_user(&self, user_id: &str) -> StoreResult<Vec<LedgerEntry>> {
        let rows = sqlx::query_as::<_, LedgerRow>(
            r#"
            SELECT id, user_id, kind, reason, reference, amount, created_at
            FROM wallet_ledger
            WHERE user_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(LedgerEntry::try_from).collect()
    }
}

#[async_trait]
impl StoreTx for PgStoreTx {
    async fn get_user(&mut self, user_id: &str) -> StoreResult<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {} FROM users WHERE id = $1 FOR UPDATE",
            USER_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(User::try_from).transpose()
    }

    async fn set_balance(&mut self, user_id: &str, balance: i64, at: DateTime<Utc>) -> StoreResult<()> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE users
            SET balance = $1, updated_at = $2
            WHERE id = $3
            "#,
        )
        .bind(balance)
        .bind(at)
        .bind(user_id)
        .execute(&mut *self.tx)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            // The row was locked by get_user, so it can only vanish if the
            // caller skipped that read.
            return Err(StoreError::Conflict);
        }
        Ok(())
    }

    async fn get_order(&mut self, order_id: &str) -> StoreResult<Option<Order>> {
        let row = sqlx::query_as::<_, OrderRow>(&format!(
            "SELECT {} FROM orders WHERE id = $1 FOR UPDATE",
            ORDER_COLUMNS
        ))
        .bind(order_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(Order::try_from).transpose()
    }

    async fn insert_order(&mut self, order: &Order) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO orders
                (id, user_id, items, total, payment_method, status, address, note, customer, bank_tx_id, created_at, paid_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(&order.id)
        .bind(&order.user_id)
        .bind(Json(&order.items))
        .bind(order.total)
        .bind(order.payment_method.to_string())
        .bind(order.status.to_string())
        .bind(&order.address)
        .bind(&order.note)
        .bind(Json(&order.customer))
        .bind(&order.bank_tx_id)
        .bind(order.created_at)
        .bind(order.paid_at)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn mark_order_paid(
        &mut self,
        order_id: &str,
        status: OrderStatus,
        paid_at: DateTime<Utc>,
        bank_tx_id: Option<&str>,
    ) -> StoreResult<()> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE orders
            SET status = $1, paid_at = $2, bank_tx_id = COALESCE($3, bank_tx_id)
            WHERE id = $4
            "#,
        )
        .bind(status.to_string())
        .bind(paid_at)
        .bind(bank_tx_id)
        .bind(order_id)
        .execute(&mut *self.tx)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(StoreError::Conflict);
        }
        Ok(())
    }

    async fn bank_tx_exists(&mut self, tx_id: &str) -> StoreResult<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM bank_transactions
                WHERE id = $1
            )
            "#,
        )
        .bind(tx_id)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(exists)
    }

    async fn insert_bank_tx(&mut self, record: &BankTxRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO bank_transactions
                (id, kind, user_id, amount, description, account, occurred_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&record.id)
        .bind(record.kind.to_string())
        .bind(&record.user_id)
        .bind(record.amount)
        .bind(&record.description)
        .bind(&record.account)
        .bind(&record.occurred_at)
        .bind(record.created_at)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn insert_ledger_entry(&mut self, entry: &LedgerEntry) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO wallet_ledger (id, user_id, kind, reason, reference, amount, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.user_id)
        .bind(entry.kind.to_string())
        .bind(entry.reason.map(|r| r.to_string()))
        .bind(&entry.reference)
        .bind(entry.amount)
        .bind(entry.created_at)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.tx.commit().await?;
        Ok(())
    }
}
