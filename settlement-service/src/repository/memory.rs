use super::{Store, StoreError, StoreResult, StoreTx};
use crate::models::{BankTxRecord, LedgerEntry, Order, OrderStatus, User};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum DocKey {
    User(String),
    Order(String),
    BankTx(String),
    Ledger(String),
}

#[derive(Debug, Clone)]
enum Doc {
    User(User),
    Order(Order),
    BankTx(BankTxRecord),
    Ledger(LedgerEntry),
}

#[derive(Default)]
struct State {
    /// Every document carries the version it was last written at.
    docs: HashMap<DocKey, (u64, Doc)>,
    clock: u64,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    failing_commits: AtomicUsize,
}

impl Inner {
    fn lock(&self) -> StoreResult<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }
}

/// In-process store with optimistic concurrency.
///
/// A transaction remembers the version of every document it read and buffers
/// its writes. Commit re-checks those versions under the lock and fails with
/// `Conflict` if any changed, so concurrent settlements behave the way they
/// would against a store with conflict detection.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed or overwrite a user record outside any transaction.
    pub fn put_user(&self, user: User) {
        self.put(DocKey::User(user.id.clone()), Doc::User(user));
    }

    /// Seed or overwrite an order record outside any transaction.
    pub fn put_order(&self, order: Order) {
        self.put(DocKey::Order(order.id.clone()), Doc::Order(order));
    }

    /// Make the next `n` commits fail with `Unavailable` before applying
    /// anything.
    pub fn fail_next_commits(&self, n: usize) {
        self.inner.failing_commits.store(n, Ordering::SeqCst);
    }

    pub fn bank_tx(&self, tx_id: &str) -> Option<BankTxRecord> {
        match self.get(&DocKey::BankTx(tx_id.to_string())) {
            Some(Doc::BankTx(record)) => Some(record),
            _ => None,
        }
    }

    pub fn ledger_len(&self) -> usize {
        self.inner
            .lock()
            .map(|state| {
                state
                    .docs
                    .keys()
                    .filter(|key| matches!(key, DocKey::Ledger(_)))
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn order_count(&self) -> usize {
        self.inner
            .lock()
            .map(|state| {
                state
                    .docs
                    .keys()
                    .filter(|key| matches!(key, DocKey::Order(_)))
                    .count()
            })
            .unwrap_or(0)
    }

    fn put(&self, key: DocKey, doc: Doc) {
        if let Ok(mut state) = self.inner.lock() {
            state.clock += 1;
            let version = state.clock;
            state.docs.insert(key, (version, doc));
        }
    }

    fn get(&self, key: &DocKey) -> Option<Doc> {
        self.inner
            .lock()
            .ok()
            .and_then(|state| state.docs.get(key).map(|(_, doc)| doc.clone()))
    }
}

pub struct MemoryTx {
    inner: Arc<Inner>,
    /// Version observed at first read; 0 means the document was absent.
    reads: HashMap<DocKey, u64>,
    creates: HashSet<DocKey>,
    writes: Vec<(DocKey, Doc)>,
}

impl MemoryTx {
    fn read(&mut self, key: DocKey) -> StoreResult<Option<Doc>> {
        if let Some((_, doc)) = self.writes.iter().rev().find(|(k, _)| *k == key) {
            return Ok(Some(doc.clone()));
        }

        let state = self.inner.lock()?;
        let found = state.docs.get(&key).cloned();
        drop(state);

        let version = found.as_ref().map_or(0, |(v, _)| *v);
        self.reads.entry(key).or_insert(version);
        Ok(found.map(|(_, doc)| doc))
    }

    fn write(&mut self, key: DocKey, doc: Doc) {
        self.writes.push((key, doc));
    }

    fn create(&mut self, key: DocKey, doc: Doc) -> StoreResult<()> {
        let pending = self.creates.contains(&key)
            || self.writes.iter().any(|(k, _)| *k == key);
        if pending {
            return Err(StoreError::Duplicate(format!("{:?}", key)));
        }
        self.creates.insert(key.clone());
        self.write(key, doc);
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTx>> {
        Ok(Box::new(MemoryTx {
            inner: Arc::clone(&self.inner),
            reads: HashMap::new(),
            creates: HashSet::new(),
            writes: Vec::new(),
        }))
    }

    async fn find_user(&self, user_id: &str) -> StoreResult<Option<User>> {
        match self.get(&DocKey::User(user_id.to_string())) {
            Some(Doc::User(user)) => Ok(Some(user)),
            _ => Ok(None),
        }
    }

    async fn find_order(&self, order_id: &str) -> StoreResult<Option<Order>> {
        match self.get(&DocKey::Order(order_id.to_string())) {
            Some(Doc::Order(order)) => Ok(Some(order)),
            _ => Ok(None),
        }
    }

    async fn ledger_for_user(&self, user_id: &str) -> StoreResult<Vec<LedgerEntry>> {
        let state = self.inner.lock()?;
        let mut entries: Vec<(u64, LedgerEntry)> = state
            .docs
            .values()
            .filter_map(|(version, doc)| match doc {
                Doc::Ledger(entry) if entry.user_id == user_id => Some((*version, entry.clone())),
                _ => None,
            })
            .collect();
        entries.sort_by(|(va, a), (vb, b)| b.created_at.cmp(&a.created_at).then(vb.cmp(va)));
        Ok(entries.into_iter().map(|(_, entry)| entry).collect())
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn get_user(&mut self, user_id: &str) -> StoreResult<Option<User>> {
        match self.read(DocKey::User(user_id.to_string()))? {
            Some(Doc::User(user)) => Ok(Some(user)),
            _ => Ok(None),
        }
    }

    async fn set_balance(&mut self, user_id: &str, balance: i64, at: DateTime<Utc>) -> StoreResult<()> {
        let mut user = self
            .get_user(user_id)
            .await?
            .ok_or(StoreError::Conflict)?;
        user.balance = balance;
        user.updated_at = at;
        self.write(DocKey::User(user_id.to_string()), Doc::User(user));
        Ok(())
    }

    async fn get_order(&mut self, order_id: &str) -> StoreResult<Option<Order>> {
        match self.read(DocKey::Order(order_id.to_string()))? {
            Some(Doc::Order(order)) => Ok(Some(order)),
            _ => Ok(None),
        }
    }

    async fn insert_order(&mut self, order: &Order) -> StoreResult<()> {
        self.create(DocKey::Order(order.id.clone()), Doc::Order(order.clone()))
    }

    async fn mark_order_paid(
        &mut self,
        order_id: &str,
        status: OrderStatus,
        paid_at: DateTime<Utc>,
        bank_tx_id: Option<&str>,
    ) -> StoreResult<()> {
        let mut order = self
            .get_order(order_id)
            .await?
            .ok_or(StoreError::Conflict)?;
        order.status = status;
        order.paid_at = Some(paid_at);
        if let Some(tx_id) = bank_tx_id {
            order.bank_tx_id = Some(tx_id.to_string());
        }
        self.write(DocKey::Order(order_id.to_string()), Doc::Order(order));
        Ok(())
    }

    async fn bank_tx_exists(&mut self, tx_id: &str) -> StoreResult<bool> {
        Ok(self.read(DocKey::BankTx(tx_id.to_string()))?.is_some())
    }

    async fn insert_bank_tx(&mut self, record: &BankTxRecord) -> StoreResult<()> {
        self.create(DocKey::BankTx(record.id.clone()), Doc::BankTx(record.clone()))
    }

    async fn insert_ledger_entry(&mut self, entry: &LedgerEntry) -> StoreResult<()> {
        self.create(DocKey::Ledger(entry.id.clone()), Doc::Ledger(entry.clone()))
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let inner = Arc::clone(&self.inner);
        let mut state = inner.lock()?;

        let injected = inner
            .failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Unavailable("injected commit failure".to_string()));
        }

        for (key, seen) in &self.reads {
            let current = state.docs.get(key).map_or(0, |(v, _)| *v);
            if current != *seen {
                return Err(StoreError::Conflict);
            }
        }
        for key in &self.creates {
            if state.docs.contains_key(key) {
                return Err(StoreError::Duplicate(format!("{:?}", key)));
            }
        }

        let MemoryTx { writes, .. } = *self;
        for (key, doc) in writes {
            state.clock += 1;
            let version = state.clock;
            state.docs.insert(key, (version, doc));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str, balance: i64) -> User {
        User::new(id, balance)
    }

    #[tokio::test]
    async fn writes_are_invisible_until_commit() {
        let store = MemoryStore::new();
        store.put_user(user("u1", 100));

        let mut tx = store.begin().await.unwrap();
        tx.set_balance("u1", 40, Utc::now()).await.unwrap();
        assert_eq!(tx.get_user("u1").await.unwrap().unwrap().balance, 40);
        assert_eq!(store.find_user("u1").await.unwrap().unwrap().balance, 100);

        tx.commit().await.unwrap();
        assert_eq!(store.find_user("u1").await.unwrap().unwrap().balance, 40);
    }

    #[tokio::test]
    async fn dropped_transaction_leaves_no_trace() {
        let store = MemoryStore::new();
        store.put_user(user("u1", 100));

        {
            let mut tx = store.begin().await.unwrap();
            tx.set_balance("u1", 0, Utc::now()).await.unwrap();
        }

        assert_eq!(store.find_user("u1").await.unwrap().unwrap().balance, 100);
    }

    #[tokio::test]
    async fn stale_read_conflicts_on_commit() {
        let store = MemoryStore::new();
        store.put_user(user("u1", 100));

        let mut first = store.begin().await.unwrap();
        let mut second = store.begin().await.unwrap();
        first.get_user("u1").await.unwrap();
        second.get_user("u1").await.unwrap();

        first.set_balance("u1", 50, Utc::now()).await.unwrap();
        second.set_balance("u1", 70, Utc::now()).await.unwrap();

        first.commit().await.unwrap();
        assert!(matches!(second.commit().await, Err(StoreError::Conflict)));
        assert_eq!(store.find_user("u1").await.unwrap().unwrap().balance, 50);
    }

    #[tokio::test]
    async fn absent_document_read_conflicts_once_created() {
        let store = MemoryStore::new();

        let mut first = store.begin().await.unwrap();
        let mut second = store.begin().await.unwrap();
        assert!(!first.bank_tx_exists("tx1").await.unwrap());
        assert!(!second.bank_tx_exists("tx1").await.unwrap());

        let record = BankTxRecord {
            id: "tx1".into(),
            kind: crate::models::LedgerKind::Topup,
            user_id: Some("u1".into()),
            amount: 10,
            description: String::new(),
            account: String::new(),
            occurred_at: String::new(),
            created_at: Utc::now(),
        };
        first.insert_bank_tx(&record).await.unwrap();
        second.insert_bank_tx(&record).await.unwrap();

        first.commit().await.unwrap();
        assert!(second.commit().await.is_err());
        assert!(store.bank_tx("tx1").is_some());
    }

    #[tokio::test]
    async fn duplicate_ledger_key_is_rejected() {
        let store = MemoryStore::new();
        let entry = LedgerEntry::order_debit("u1", "o1", 10, Utc::now());

        let mut tx = store.begin().await.unwrap();
        tx.insert_ledger_entry(&entry).await.unwrap();
        tx.commit().await.unwrap();

        let mut again = store.begin().await.unwrap();
        again.insert_ledger_entry(&entry).await.unwrap();
        assert!(matches!(again.commit().await, Err(StoreError::Duplicate(_))));
        assert_eq!(store.ledger_len(), 1);
    }

    #[tokio::test]
    async fn injected_failure_applies_nothing() {
        let store = MemoryStore::new();
        store.put_user(user("u1", 100));
        store.fail_next_commits(1);

        let mut tx = store.begin().await.unwrap();
        tx.set_balance("u1", 0, Utc::now()).await.unwrap();
        assert!(matches!(tx.commit().await, Err(StoreError::Unavailable(_))));
        assert_eq!(store.find_user("u1").await.unwrap().unwrap().balance, 100);

        let mut retry = store.begin().await.unwrap();
        retry.set_balance("u1", 0, Utc::now()).await.unwrap();
        retry.commit().await.unwrap();
        assert_eq!(store.find_user("u1").await.unwrap().unwrap().balance, 0);
    }
}
