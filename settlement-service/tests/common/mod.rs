#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use settlement_service::config::BankAccount;
use settlement_service::errors::SettlementResult;
use settlement_service::kafka::{EventPublisher, SettlementEvent};
use settlement_service::models::{
    BankTxRecord, Customer, LedgerEntry, LineItem, Order, OrderStatus, PaymentMethod, Role, User,
};
use settlement_service::repository::{MemoryStore, Store, StoreError, StoreResult, StoreTx};
use settlement_service::service::SettlementService;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Keeps every published event so tests can assert on post-commit effects.
#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<SettlementEvent>>,
}

impl RecordingPublisher {
    pub fn events(&self) -> Vec<SettlementEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn event_types(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.event_type().to_string())
            .collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, event: SettlementEvent) -> SettlementResult<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

pub fn bank() -> BankAccount {
    BankAccount {
        bank_code: "VCB".into(),
        account_number: "0123456789".into(),
        account_name: "SHOP".into(),
        template: "compact".into(),
    }
}

pub struct Harness {
    pub store: MemoryStore,
    pub events: Arc<RecordingPublisher>,
    pub service: SettlementService,
}

pub fn harness() -> Harness {
    let store = MemoryStore::new();
    let events = Arc::new(RecordingPublisher::default());
    let service = SettlementService::new(Arc::new(store.clone()), events.clone(), bank());
    Harness {
        store,
        events,
        service,
    }
}

/// Wraps a `MemoryStore` and yields to the scheduler after every read and
/// before every commit, so futures joined on one task interleave inside their
/// transactions the way concurrent requests do. Counts begun transactions and
/// commits rejected with `Conflict` or `Duplicate`.
pub struct InterleavingStore {
    inner: MemoryStore,
    begins: AtomicUsize,
    rejected_commits: Arc<AtomicUsize>,
}

impl InterleavingStore {
    pub fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            begins: AtomicUsize::new(0),
            rejected_commits: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn begins(&self) -> usize {
        self.begins.load(Ordering::SeqCst)
    }

    pub fn rejected_commits(&self) -> usize {
        self.rejected_commits.load(Ordering::SeqCst)
    }
}

struct InterleavingTx {
    inner: Box<dyn StoreTx>,
    rejected_commits: Arc<AtomicUsize>,
}

#[async_trait]
impl Store for InterleavingStore {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTx>> {
        self.begins.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(InterleavingTx {
            inner: self.inner.begin().await?,
            rejected_commits: Arc::clone(&self.rejected_commits),
        }))
    }

    async fn find_user(&self, user_id: &str) -> StoreResult<Option<User>> {
        self.inner.find_user(user_id).await
    }

    async fn find_order(&self, order_id: &str) -> StoreResult<Option<Order>> {
        self.inner.find_order(order_id).await
    }

    async fn ledger_for_user(&self, user_id: &str) -> StoreResult<Vec<LedgerEntry>> {
        self.inner.ledger_for_user(user_id).await
    }
}

#[async_trait]
impl StoreTx for InterleavingTx {
    async fn get_user(&mut self, user_id: &str) -> StoreResult<Option<User>> {
        let user = self.inner.get_user(user_id).await;
        tokio::task::yield_now().await;
        user
    }

    async fn set_balance(&mut self, user_id: &str, balance: i64, at: DateTime<Utc>) -> StoreResult<()> {
        self.inner.set_balance(user_id, balance, at).await
    }

    async fn get_order(&mut self, order_id: &str) -> StoreResult<Option<Order>> {
        let order = self.inner.get_order(order_id).await;
        tokio::task::yield_now().await;
        order
    }

    async fn insert_order(&mut self, order: &Order) -> StoreResult<()> {
        self.inner.insert_order(order).await
    }

    async fn mark_order_paid(
        &mut self,
        order_id: &str,
        status: OrderStatus,
        paid_at: DateTime<Utc>,
        bank_tx_id: Option<&str>,
    ) -> StoreResult<()> {
        self.inner
            .mark_order_paid(order_id, status, paid_at, bank_tx_id)
            .await
    }

    async fn bank_tx_exists(&mut self, tx_id: &str) -> StoreResult<bool> {
        let exists = self.inner.bank_tx_exists(tx_id).await;
        tokio::task::yield_now().await;
        exists
    }

    async fn insert_bank_tx(&mut self, record: &BankTxRecord) -> StoreResult<()> {
        self.inner.insert_bank_tx(record).await
    }

    async fn insert_ledger_entry(&mut self, entry: &LedgerEntry) -> StoreResult<()> {
        self.inner.insert_ledger_entry(entry).await
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        tokio::task::yield_now().await;
        let InterleavingTx {
            inner,
            rejected_commits,
        } = *self;
        let result = inner.commit().await;
        if matches!(result, Err(StoreError::Conflict) | Err(StoreError::Duplicate(_))) {
            rejected_commits.fetch_add(1, Ordering::SeqCst);
        }
        result
    }
}

/// Like `harness`, but the service runs on an `InterleavingStore` over
/// `Harness::store`.
pub fn interleaved_harness() -> (Harness, Arc<InterleavingStore>) {
    let store = MemoryStore::new();
    let events = Arc::new(RecordingPublisher::default());
    let interleaving = Arc::new(InterleavingStore::new(store.clone()));
    let service = SettlementService::new(interleaving.clone(), events.clone(), bank());
    (
        Harness {
            store,
            events,
            service,
        },
        interleaving,
    )
}

pub fn user(id: &str, balance: i64) -> User {
    User::new(id, balance)
}

pub fn admin(id: &str) -> User {
    User {
        role: Role::Admin,
        ..User::new(id, 0)
    }
}

pub fn pending_order(id: &str, user_id: Option<&str>, method: PaymentMethod, total: i64) -> Order {
    Order {
        id: id.to_string(),
        user_id: user_id.map(str::to_string),
        items: vec![LineItem {
            product_id: None,
            name: "A".into(),
            price: total.into(),
            qty: 1,
            image: None,
        }],
        total,
        payment_method: method,
        status: OrderStatus::initial_for(method),
        address: "1 Le Loi".into(),
        note: String::new(),
        customer: Customer::default(),
        bank_tx_id: None,
        created_at: Utc::now(),
        paid_at: None,
    }
}
