use crate::auth::Caller;
use crate::config::BankAccount;
use crate::errors::{SettlementError, SettlementResult};
use crate::kafka::{EventPublisher, SettlementEvent};
use crate::models::{
    AdjustBalanceRequest, AdminSettlement, BalanceAdjustment, BankTxRecord, CheckoutReceipt, CheckoutRequest, Customer, LedgerEntry, LedgerKind,
    Order, OrderStatus, PaymentMethod, PlaceWalletOrderRequest, ReconcileAction, RecordOutcome,
    TopupInstructions, WalletOrderReceipt, WalletSummary,
};
use crate::pricing::{price_cart, total_matches, CartError, PricedCart};
use crate::reference::{self, TransferReference};
use crate::repository::{Store, StoreError};
use crate::transfer::{normalize_record, split_payload, TransferRecord};
use chrono::Utc;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Attempts per operation before a transaction conflict is reported.
const MAX_ATTEMPTS: u32 = 5;
const DEFAULT_TOPUP_AMOUNT: i64 = 50_000;

/// Settlement core: wallet order placement, bank webhook reconciliation and
/// the back-office operations that move orders to paid.
///
/// Every balance or order-status change happens inside one store transaction.
/// Events are published only after that transaction commits.
#[derive(Clone)]
pub struct SettlementService {
    store: Arc<dyn Store>,
    events: Arc<dyn EventPublisher>,
    bank: Arc<BankAccount>,
}

enum WalletPlacement {
    Placed { new_balance: i64 },
    Replayed { total: i64 },
}

enum Settlement {
    Settled(Order),
    AlreadyPaid(Order),
}

impl SettlementService {
    pub fn new(store: Arc<dyn Store>, events: Arc<dyn EventPublisher>, bank: BankAccount) -> Self {
        Self {
            store,
            events,
            bank: Arc::new(bank),
        }
    }

    // === Wallet order placement ===

    /// Turn a cart into a `paid_wallet` order funded from the caller's
    /// balance. Debit, order and ledger entry commit together or not at all.
    pub async fn place_wallet_order(
        &self,
        caller: &Caller,
        request: PlaceWalletOrderRequest,
    ) -> SettlementResult<WalletOrderReceipt> {
        let priced = price_cart(&request.items)?;

        let address = request.address.trim();
        if address.is_empty() {
            return Err(SettlementError::MissingAddress);
        }

        let claimed = request
            .total
            .filter(|t| t.is_finite() && *t > 0.0)
            .ok_or(SettlementError::InvalidCart(CartError::InvalidTotal))?;
        if !total_matches(claimed, priced.total) {
            return Err(SettlementError::TotalMismatch {
                claimed,
                computed: priced.total,
            });
        }

        let order_id = wallet_order_id(&caller.user_id, request.request_id.as_deref());
        let note = request.note.clone().unwrap_or_default();

        tracing::info!(
            user_id = %caller.user_id,
            order_id = %order_id,
            total = priced.total,
            "Placing wallet order"
        );

        let placement = retry_on_conflict("place_wallet_order", || {
            self.try_place_wallet_order(caller, &order_id, &priced, address, &note)
        })
        .await?;

        match placement {
            WalletPlacement::Placed { new_balance } => {
                tracing::info!(
                    user_id = %caller.user_id,
                    order_id = %order_id,
                    new_balance = new_balance,
                    "Wallet order placed"
                );
                let now = Utc::now();
                self.emit(SettlementEvent::WalletDebited {
                    user_id: caller.user_id.clone(),
                    order_id: order_id.clone(),
                    amount: priced.total,
                    new_balance,
                    timestamp: now,
                })
                .await;
                self.emit(SettlementEvent::OrderPaid {
                    order_id: order_id.clone(),
                    user_id: Some(caller.user_id.clone()),
                    status: OrderStatus::PaidWallet,
                    total: priced.total,
                    bank_tx_id: None,
                    timestamp: now,
                })
                .await;

                Ok(WalletOrderReceipt {
                    order_id,
                    total: priced.total,
                    replayed: false,
                })
            }
            WalletPlacement::Replayed { total } => {
                tracing::info!(
                    user_id = %caller.user_id,
                    order_id = %order_id,
                    "Wallet order already committed, returning it"
                );
                Ok(WalletOrderReceipt {
                    order_id,
                    total,
                    replayed: true,
                })
            }
        }
    }

    async fn try_place_wallet_order(
        &self,
        caller: &Caller,
        order_id: &str,
        priced: &PricedCart,
        address: &str,
        note: &str,
    ) -> SettlementResult<WalletPlacement> {
        let user_id = caller.user_id.as_str();
        let mut tx = self.store.begin().await?;

        if let Some(existing) = tx.get_order(order_id).await? {
            if existing.user_id.as_deref() == Some(user_id) && existing.status == OrderStatus::PaidWallet {
                return Ok(WalletPlacement::Replayed {
                    total: existing.total,
                });
            }
            return Err(SettlementError::Internal(format!(
                "order id {} already taken",
                order_id
            )));
        }

        let user = tx
            .get_user(user_id)
            .await?
            .ok_or_else(|| SettlementError::UserNotFound(user_id.to_string()))?;

        if user.balance < priced.total {
            return Err(SettlementError::InsufficientFunds {
                required: priced.total,
                available: user.balance,
            });
        }

        let now = Utc::now();
        let new_balance = user.balance - priced.total;
        tx.set_balance(user_id, new_balance, now).await?;

        let order = Order {
            id: order_id.to_string(),
            user_id: Some(user_id.to_string()),
            items: priced.items.clone(),
            total: priced.total,
            payment_method: PaymentMethod::Wallet,
            status: OrderStatus::PaidWallet,
            address: address.to_string(),
            note: note.to_string(),
            customer: Customer {
                name: user.display_name.clone(),
                phone: user.phone.clone(),
                email: caller.email.clone().or_else(|| user.email.clone()),
            },
            bank_tx_id: None,
            created_at: now,
            paid_at: Some(now),
        };
        tx.insert_order(&order).await?;
        tx.insert_ledger_entry(&LedgerEntry::order_debit(user_id, order_id, priced.total, now))
            .await?;

        tx.commit().await?;
        Ok(WalletPlacement::Placed { new_balance })
    }

    // === Checkout (pending orders) ===

    /// Record a pending order for COD, bank transfer, mobile wallet or a
    /// later back-office wallet debit. Bank orders get a transfer reference
    /// and QR code the webhook will recognize.
    pub async fn create_checkout_order(
        &self,
        caller: Option<&Caller>,
        request: CheckoutRequest,
    ) -> SettlementResult<CheckoutReceipt> {
        let priced = price_cart(&request.items)?;

        let address = request.address.trim();
        if address.is_empty() {
            return Err(SettlementError::MissingAddress);
        }
        if request.payment_method == PaymentMethod::Wallet && caller.is_none() {
            return Err(SettlementError::GuestWalletOrder);
        }

        let mut customer = request.customer.clone();
        if customer.email.is_none() {
            customer.email = caller.and_then(|c| c.email.clone());
        }

        let now = Utc::now();
        let order = Order {
            id: Uuid::new_v4().to_string(),
            user_id: caller.map(|c| c.user_id.clone()),
            items: priced.items,
            total: priced.total,
            payment_method: request.payment_method,
            status: OrderStatus::initial_for(request.payment_method),
            address: address.to_string(),
            note: request.note.clone().unwrap_or_default(),
            customer,
            bank_tx_id: None,
            created_at: now,
            paid_at: None,
        };

        retry_on_conflict("create_checkout_order", || async {
            let mut tx = self.store.begin().await?;
            tx.insert_order(&order).await?;
            tx.commit().await?;
            Ok::<_, SettlementError>(())
        })
        .await?;

        tracing::info!(
            order_id = %order.id,
            payment_method = %order.payment_method,
            status = %order.status,
            total = order.total,
            "Checkout order created"
        );

        self.emit(SettlementEvent::OrderCreated {
            order_id: order.id.clone(),
            user_id: order.user_id.clone(),
            payment_method: order.payment_method,
            total: order.total,
            timestamp: now,
        })
        .await;

        let (transfer_reference, qr_url) = if order.payment_method == PaymentMethod::Bank {
            let reference = reference::order_reference(&order.id);
            let url = reference::qr_url(&self.bank, order.total, &reference);
            (Some(reference), Some(url))
        } else {
            (None, None)
        };

        Ok(CheckoutReceipt {
            order_id: order.id,
            status: order.status,
            total: order.total,
            transfer_reference,
            qr_url,
        })
    }

    // === Wallet queries ===

    pub async fn wallet_summary(&self, caller: &Caller) -> SettlementResult<WalletSummary> {
        let user = self
            .store
            .find_user(&caller.user_id)
            .await?
            .ok_or_else(|| SettlementError::UserNotFound(caller.user_id.clone()))?;
        let entries = self.store.ledger_for_user(&caller.user_id).await?;

        Ok(WalletSummary {
            user_id: user.id,
            balance: user.balance,
            entries,
        })
    }

    pub fn topup_instructions(&self, caller: &Caller, amount: Option<i64>) -> TopupInstructions {
        let amount = amount.filter(|a| *a > 0).unwrap_or(DEFAULT_TOPUP_AMOUNT);
        let reference = reference::topup_reference(&caller.user_id);
        let qr_url = reference::qr_url(&self.bank, amount, &reference);

        TopupInstructions {
            reference,
            amount,
            qr_url,
        }
    }

    // === Bank webhook reconciliation ===

    /// Apply every transfer in a webhook delivery. Records are independent:
    /// one failing never stops the rest, and each gets its own result.
    pub async fn reconcile_delivery(&self, body: Value) -> Vec<RecordOutcome> {
        let now = Utc::now();
        let records = split_payload(body);
        let mut results = Vec::with_capacity(records.len());

        for raw in &records {
            let record = normalize_record(raw, now);
            results.push(self.reconcile_transfer(&record).await);
        }

        results
    }

    pub async fn reconcile_transfer(&self, record: &TransferRecord) -> RecordOutcome {
        if record.amount <= 0 {
            tracing::debug!(tx_id = %record.tx_id, "Ignoring transfer without amount");
            return RecordOutcome::ignored(&record.tx_id, "no-amount");
        }

        match reference::parse_reference(&record.description) {
            TransferReference::Topup(user_id) => match self.apply_topup(record, &user_id).await {
                Ok(_) => RecordOutcome::topped_up(&record.tx_id, &user_id, record.amount),
                Err(e) => {
                    log_record_failure(record, &e);
                    RecordOutcome::failed(&record.tx_id, ReconcileAction::Topup, e.record_error())
                }
            },
            TransferReference::Order(order_id) => {
                match self.apply_order_payment(record, &order_id).await {
                    Ok(already_paid) => {
                        RecordOutcome::order_settled(&record.tx_id, &order_id, already_paid)
                    }
                    Err(e) => {
                        log_record_failure(record, &e);
                        let mut outcome = RecordOutcome::failed(
                            &record.tx_id,
                            ReconcileAction::Order,
                            e.record_error(),
                        );
                        outcome.order_id = Some(order_id);
                        if let SettlementError::AmountNotEnough { amount, expected } = e {
                            outcome.amount = Some(amount);
                            outcome.expected = Some(expected);
                        }
                        outcome
                    }
                }
            }
            TransferReference::Unrecognized => {
                tracing::debug!(tx_id = %record.tx_id, "Transfer description matches no reference");
                RecordOutcome::ignored(&record.tx_id, "no-matching-pattern")
            }
        }
    }

    /// Credit a wallet exactly once per bank transaction id.
    async fn apply_topup(&self, record: &TransferRecord, user_id: &str) -> SettlementResult<i64> {
        let new_balance = retry_on_conflict("apply_topup", || async {
            let mut tx = self.store.begin().await?;

            if tx.bank_tx_exists(&record.tx_id).await? {
                return Err(SettlementError::DuplicateTransfer(record.tx_id.clone()));
            }

            let user = tx
                .get_user(user_id)
                .await?
                .ok_or_else(|| SettlementError::UserNotFound(user_id.to_string()))?;
            let new_balance = user
                .balance
                .checked_add(record.amount)
                .ok_or_else(|| SettlementError::Internal("balance overflow".to_string()))?;

            let now = Utc::now();
            tx.set_balance(user_id, new_balance, now).await?;
            tx.insert_bank_tx(&BankTxRecord {
                id: record.tx_id.clone(),
                kind: LedgerKind::Topup,
                user_id: Some(user_id.to_string()),
                amount: record.amount,
                description: record.description.clone(),
                account: record.account.clone(),
                occurred_at: record.occurred_at.clone(),
                created_at: now,
            })
            .await?;
            tx.insert_ledger_entry(&LedgerEntry::topup(user_id, &record.tx_id, record.amount, now))
                .await?;

            tx.commit().await?;
            Ok::<_, SettlementError>(new_balance)
        })
        .await?;

        tracing::info!(
            tx_id = %record.tx_id,
            user_id = %user_id,
            amount = record.amount,
            new_balance = new_balance,
            "Wallet topped up"
        );
        self.emit(SettlementEvent::WalletToppedUp {
            user_id: user_id.to_string(),
            bank_tx_id: record.tx_id.clone(),
            amount: record.amount,
            new_balance,
            timestamp: Utc::now(),
        })
        .await;

        Ok(new_balance)
    }

    /// Settle a bank-transfer order. Returns `true` when the order was
    /// already paid and nothing changed.
    async fn apply_order_payment(&self, record: &TransferRecord, order_id: &str) -> SettlementResult<bool> {
        let settlement = retry_on_conflict("apply_order_payment", || async {
            let mut tx = self.store.begin().await?;

            let order = tx
                .get_order(order_id)
                .await?
                .ok_or_else(|| SettlementError::OrderNotFound(order_id.to_string()))?;
            if order.status.is_paid() {
                return Ok(Settlement::AlreadyPaid(order));
            }
            if order.payment_method != PaymentMethod::Bank {
                return Err(SettlementError::WrongPaymentMethod(order_id.to_string()));
            }
            if record.amount < order.total {
                return Err(SettlementError::AmountNotEnough {
                    amount: record.amount,
                    expected: order.total,
                });
            }

            tx.mark_order_paid(order_id, OrderStatus::PaidBank, Utc::now(), Some(&record.tx_id))
                .await?;
            tx.commit().await?;
            Ok::<_, SettlementError>(Settlement::Settled(order))
        })
        .await?;

        match settlement {
            Settlement::AlreadyPaid(order) => {
                tracing::info!(
                    tx_id = %record.tx_id,
                    order_id = %order.id,
                    status = %order.status,
                    "Order already paid, ignoring transfer"
                );
                Ok(true)
            }
            Settlement::Settled(order) => {
                tracing::info!(
                    tx_id = %record.tx_id,
                    order_id = %order.id,
                    amount = record.amount,
                    "Order paid by bank transfer"
                );
                self.emit(SettlementEvent::OrderPaid {
                    order_id: order.id,
                    user_id: order.user_id,
                    status: OrderStatus::PaidBank,
                    total: order.total,
                    bank_tx_id: Some(record.tx_id.clone()),
                    timestamp: Utc::now(),
                })
                .await;
                Ok(false)
            }
        }
    }

    // === Back-office ===

    async fn require_admin(&self, caller: &Caller) -> SettlementResult<()> {
        match self.store.find_user(&caller.user_id).await? {
            Some(user) if user.is_admin() => Ok(()),
            _ => {
                tracing::warn!(user_id = %caller.user_id, "Admin operation refused");
                Err(SettlementError::PermissionDenied)
            }
        }
    }

    /// Manual override: mark a pending order `paid` without touching any
    /// balance.
    pub async fn mark_order_paid(&self, admin: &Caller, order_id: &str) -> SettlementResult<AdminSettlement> {
        self.require_admin(admin).await?;

        let settlement = retry_on_conflict("mark_order_paid", || async {
            let mut tx = self.store.begin().await?;
            let order = tx
                .get_order(order_id)
                .await?
                .ok_or_else(|| SettlementError::OrderNotFound(order_id.to_string()))?;
            if order.status.is_paid() {
                return Ok(Settlement::AlreadyPaid(order));
            }

            tx.mark_order_paid(order_id, OrderStatus::Paid, Utc::now(), None)
                .await?;
            tx.commit().await?;
            Ok::<_, SettlementError>(Settlement::Settled(order))
        })
        .await?;

        self.finish_admin_settlement(admin, settlement, OrderStatus::Paid)
            .await
    }

    /// Debit the owner's wallet for a pending wallet order and mark it
    /// `paid_wallet`, atomically.
    pub async fn settle_order_from_wallet(
        &self,
        admin: &Caller,
        order_id: &str,
    ) -> SettlementResult<AdminSettlement> {
        self.require_admin(admin).await?;

        let (settlement, new_balance) = retry_on_conflict("settle_order_from_wallet", || async {
            let mut tx = self.store.begin().await?;
            let order = tx
                .get_order(order_id)
                .await?
                .ok_or_else(|| SettlementError::OrderNotFound(order_id.to_string()))?;
            if order.status.is_paid() {
                return Ok((Settlement::AlreadyPaid(order), None));
            }
            if order.payment_method != PaymentMethod::Wallet {
                return Err(SettlementError::WrongPaymentMethod(order_id.to_string()));
            }

            let user_id = order
                .user_id
                .clone()
                .ok_or_else(|| SettlementError::UserNotFound("guest".to_string()))?;
            let user = tx
                .get_user(&user_id)
                .await?
                .ok_or_else(|| SettlementError::UserNotFound(user_id.clone()))?;
            if user.balance < order.total {
                return Err(SettlementError::InsufficientFunds {
                    required: order.total,
                    available: user.balance,
                });
            }

            let now = Utc::now();
            let new_balance = user.balance - order.total;
            tx.set_balance(&user_id, new_balance, now).await?;
            tx.mark_order_paid(order_id, OrderStatus::PaidWallet, now, None)
                .await?;
            tx.insert_ledger_entry(&LedgerEntry::order_debit(&user_id, order_id, order.total, now))
                .await?;
            tx.commit().await?;
            Ok::<_, SettlementError>((Settlement::Settled(order), Some(new_balance)))
        })
        .await?;

        if let (Settlement::Settled(order), Some(new_balance)) = (&settlement, new_balance) {
            if let Some(user_id) = &order.user_id {
                self.emit(SettlementEvent::WalletDebited {
                    user_id: user_id.clone(),
                    order_id: order.id.clone(),
                    amount: order.total,
                    new_balance,
                    timestamp: Utc::now(),
                })
                .await;
            }
        }

        self.finish_admin_settlement(admin, settlement, OrderStatus::PaidWallet)
            .await
    }

    /// Manual deposit (`LedgerKind::Topup`) or withdrawal (`LedgerKind::Debit`)
    /// on a user's wallet. Like every other balance change it writes a ledger
    /// entry in the same transaction; withdrawals never take a balance below
    /// zero.
    pub async fn adjust_balance(
        &self,
        admin: &Caller,
        user_id: &str,
        kind: LedgerKind,
        request: AdjustBalanceRequest,
    ) -> SettlementResult<BalanceAdjustment> {
        self.require_admin(admin).await?;

        let amount = request
            .amount
            .filter(|a| a.is_finite() && *a > 0.0 && a.fract() == 0.0 && *a < i64::MAX as f64)
            .map(|a| a as i64)
            .ok_or(SettlementError::InvalidAmount)?;
        let adjustment_id = Uuid::new_v4().to_string();
        let entry_id = LedgerEntry::adjustment_key(user_id, &adjustment_id);

        let new_balance = retry_on_conflict("adjust_balance", || async {
            let mut tx = self.store.begin().await?;
            let user = tx
                .get_user(user_id)
                .await?
                .ok_or_else(|| SettlementError::UserNotFound(user_id.to_string()))?;

            let new_balance = match kind {
                LedgerKind::Topup => user
                    .balance
                    .checked_add(amount)
                    .ok_or_else(|| SettlementError::Internal("balance overflow".to_string()))?,
                LedgerKind::Debit => {
                    if user.balance < amount {
                        return Err(SettlementError::InsufficientFunds {
                            required: amount,
                            available: user.balance,
                        });
                    }
                    user.balance - amount
                }
            };

            let now = Utc::now();
            tx.set_balance(user_id, new_balance, now).await?;
            tx.insert_ledger_entry(&LedgerEntry::adjustment(user_id, &adjustment_id, kind, amount, now))
                .await?;
            tx.commit().await?;
            Ok::<_, SettlementError>(new_balance)
        })
        .await?;

        let signed_amount = match kind {
            LedgerKind::Topup => amount,
            LedgerKind::Debit => -amount,
        };
        tracing::info!(
            admin_id = %admin.user_id,
            user_id = %user_id,
            amount = signed_amount,
            new_balance = new_balance,
            "Wallet balance adjusted by administrator"
        );
        self.emit(SettlementEvent::WalletAdjusted {
            user_id: user_id.to_string(),
            admin_id: admin.user_id.clone(),
            ledger_id: entry_id.clone(),
            amount: signed_amount,
            new_balance,
            timestamp: Utc::now(),
        })
        .await;

        Ok(BalanceAdjustment {
            user_id: user_id.to_string(),
            ledger_id: entry_id,
            balance: new_balance,
        })
    }

    async fn finish_admin_settlement(
        &self,
        admin: &Caller,
        settlement: Settlement,
        paid_status: OrderStatus,
    ) -> SettlementResult<AdminSettlement> {
        match settlement {
            Settlement::AlreadyPaid(order) => Ok(AdminSettlement {
                order_id: order.id,
                status: order.status,
                already_paid: true,
            }),
            Settlement::Settled(order) => {
                tracing::info!(
                    admin_id = %admin.user_id,
                    order_id = %order.id,
                    status = %paid_status,
                    "Order settled by administrator"
                );
                self.emit(SettlementEvent::OrderPaid {
                    order_id: order.id.clone(),
                    user_id: order.user_id.clone(),
                    status: paid_status,
                    total: order.total,
                    bank_tx_id: None,
                    timestamp: Utc::now(),
                })
                .await;
                Ok(AdminSettlement {
                    order_id: order.id,
                    status: paid_status,
                    already_paid: false,
                })
            }
        }
    }

    /// Publish after commit. A broker failure is logged, never surfaced: the
    /// money has already moved.
    async fn emit(&self, event: SettlementEvent) {
        let event_type = event.event_type().to_string();
        if let Err(e) = self.events.publish(event).await {
            tracing::warn!(error = %e, event_type = %event_type, "Failed to publish settlement event");
        }
    }
}

/// Deterministic when the caller supplies an order intent id, so a retried
/// placement lands on the same order and ledger key.
pub fn wallet_order_id(user_id: &str, request_id: Option<&str>) -> String {
    match request_id.map(str::trim).filter(|r| !r.is_empty()) {
        Some(request_id) => Uuid::new_v5(
            &Uuid::NAMESPACE_OID,
            format!("{}:{}", user_id, request_id).as_bytes(),
        )
        .to_string(),
        None => Uuid::new_v4().to_string(),
    }
}

fn is_retryable(err: &SettlementError) -> bool {
    matches!(
        err,
        SettlementError::Store(StoreError::Conflict) | SettlementError::Store(StoreError::Duplicate(_))
    )
}

/// Re-run a transaction body from the top while the store reports a
/// conflicting concurrent commit.
async fn retry_on_conflict<T, F, Fut>(operation: &str, mut attempt: F) -> SettlementResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SettlementResult<T>>,
{
    let mut tries = 1;
    loop {
        match attempt().await {
            Err(e) if is_retryable(&e) && tries < MAX_ATTEMPTS => {
                tracing::debug!(operation, attempt = tries, error = %e, "Transaction conflict, retrying");
                tokio::time::sleep(Duration::from_millis(5 * u64::from(tries))).await;
                tries += 1;
            }
            result => return result,
        }
    }
}

fn log_record_failure(record: &TransferRecord, err: &SettlementError) {
    match err {
        SettlementError::DuplicateTransfer(_) => {
            tracing::info!(tx_id = %record.tx_id, "Transfer already processed");
        }
        SettlementError::Store(_) | SettlementError::Internal(_) => {
            tracing::error!(tx_id = %record.tx_id, error = %err, "Transfer reconciliation failed");
        }
        _ => {
            tracing::warn!(tx_id = %record.tx_id, error = %err, "Transfer rejected");
        }
    }
}
