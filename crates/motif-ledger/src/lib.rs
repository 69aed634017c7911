//! Component A — the transactional, snapshot-based balance ledger.
//!
//! Grounded on the teacher engine's `Storage` (an `RwLock`-guarded
//! in-process map, persisted as the system of record) and on the
//! re-check-inside-the-lock idempotency pattern used by accountability
//! ledgers over commitment lifecycles. There is no external database in
//! this workspace; a `tokio::sync::Mutex` acquired per account stands in
//! for the row-level lock spec.md §4.A describes (see DESIGN.md).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::instrument;

use motif_types::{
    Account, AccountId, EngineError, EngineResult, RechargeOrder, RechargeOrderId,
    RechargeOrderStatus, TaskId, Transaction, TransactionCategory, TransactionId, UserId,
};

/// Per-operation inputs that do not change the accounting math but are
/// recorded on the `Transaction` row for audit purposes.
#[derive(Debug, Clone, Default)]
pub struct TransactionRefs {
    pub task_id: Option<TaskId>,
    pub recharge_order_id: Option<RechargeOrderId>,
    pub payment_method: Option<String>,
    pub metadata: Value,
}

struct AccountRow {
    account: Account,
    lock: Arc<Mutex<()>>,
}

pub struct Ledger {
    accounts: RwLock<HashMap<AccountId, AccountRow>>,
    transactions: RwLock<HashMap<AccountId, Vec<Transaction>>>,
    recharge_orders: RwLock<HashMap<RechargeOrderId, RechargeOrder>>,
    recharge_lock: Mutex<()>,
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

impl Ledger {
    pub fn new() -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            transactions: RwLock::new(HashMap::new()),
            recharge_orders: RwLock::new(HashMap::new()),
            recharge_lock: Mutex::new(()),
        }
    }

    pub async fn create_account(&self, user_id: UserId) -> Account {
        let account = Account::new(user_id);
        let mut accounts = self.accounts.write().await;
        let row = AccountRow {
            account: account.clone(),
            lock: Arc::new(Mutex::new(())),
        };
        accounts.insert(account.id.clone(), row);
        account
    }

    pub async fn get_account(&self, account_id: &AccountId) -> EngineResult<Account> {
        self.accounts
            .read()
            .await
            .get(account_id)
            .map(|row| row.account.clone())
            .ok_or_else(|| EngineError::NotFound(format!("account {account_id}")))
    }

    pub async fn history(&self, account_id: &AccountId) -> Vec<Transaction> {
        self.transactions
            .read()
            .await
            .get(account_id)
            .cloned()
            .unwrap_or_default()
    }

    async fn account_lock(&self, account_id: &AccountId) -> Arc<Mutex<()>> {
        self.accounts
            .read()
            .await
            .get(account_id)
            .map(|row| row.lock.clone())
            .unwrap_or_else(|| Arc::new(Mutex::new(())))
    }

    /// Atomically: check `balance >= amount`, insert a debit `Transaction`,
    /// update the account balance. All-or-nothing.
    #[instrument(skip(self, refs), fields(account_id = %account_id, amount))]
    pub async fn debit(
        &self,
        account_id: &AccountId,
        amount: i64,
        category: TransactionCategory,
        refs: TransactionRefs,
    ) -> EngineResult<TransactionId> {
        let row_lock = self.account_lock(account_id).await;
        let _guard = row_lock.lock().await;

        let mut accounts = self.accounts.write().await;
        let row = accounts
            .get_mut(account_id)
            .ok_or_else(|| EngineError::NotFound(format!("account {account_id}")))?;

        if row.account.balance < amount {
            tracing::warn!(
                balance = row.account.balance,
                required = amount,
                "insufficient_balance"
            );
            return Err(EngineError::InsufficientBalance {
                balance: row.account.balance,
                required: amount,
            });
        }

        let balance_before = row.account.balance;
        let balance_after = balance_before - amount;
        row.account.balance = balance_after;

        let txn = Transaction {
            id: TransactionId::new(),
            account_id: account_id.clone(),
            category,
            amount: -amount,
            balance_before,
            balance_after,
            task_id: refs.task_id,
            recharge_order_id: refs.recharge_order_id,
            payment_method: refs.payment_method,
            metadata: refs.metadata,
            created_at: Utc::now(),
        };
        let txn_id = txn.id.clone();
        drop(accounts);

        self.transactions
            .write()
            .await
            .entry(account_id.clone())
            .or_default()
            .push(txn);

        tracing::info!(balance_after, category = category_display(category), "ledger_debit");
        Ok(txn_id)
    }

    /// Same shape as `debit`, positive amount, no balance check.
    #[instrument(skip(self, refs), fields(account_id = %account_id, amount))]
    pub async fn credit(
        &self,
        account_id: &AccountId,
        amount: i64,
        category: TransactionCategory,
        refs: TransactionRefs,
    ) -> EngineResult<TransactionId> {
        let row_lock = self.account_lock(account_id).await;
        let _guard = row_lock.lock().await;

        let mut accounts = self.accounts.write().await;
        let row = accounts
            .get_mut(account_id)
            .ok_or_else(|| EngineError::NotFound(format!("account {account_id}")))?;

        let balance_before = row.account.balance;
        let balance_after = balance_before + amount;
        row.account.balance = balance_after;

        let txn = Transaction {
            id: TransactionId::new(),
            account_id: account_id.clone(),
            category,
            amount,
            balance_before,
            balance_after,
            task_id: refs.task_id,
            recharge_order_id: refs.recharge_order_id,
            payment_method: refs.payment_method,
            metadata: refs.metadata,
            created_at: Utc::now(),
        };
        let txn_id = txn.id.clone();
        drop(accounts);

        self.transactions
            .write()
            .await
            .entry(account_id.clone())
            .or_default()
            .push(txn);

        tracing::info!(balance_after, category = category_display(category), "ledger_credit");
        Ok(txn_id)
    }

    /// If `actual > expected`: debit the difference as `task_charge`.
    /// If `actual < expected`: credit the difference as `task_refund`.
    /// If equal: no-op.
    #[instrument(skip(self), fields(account_id = %account_id, task_id = %task_id))]
    pub async fn settle(
        &self,
        account_id: &AccountId,
        task_id: &TaskId,
        expected: i64,
        actual: i64,
    ) -> EngineResult<Option<TransactionId>> {
        if actual > expected {
            let txn = self
                .debit(
                    account_id,
                    actual - expected,
                    TransactionCategory::TaskCharge,
                    TransactionRefs {
                        task_id: Some(task_id.clone()),
                        ..Default::default()
                    },
                )
                .await?;
            Ok(Some(txn))
        } else if actual < expected {
            let txn = self
                .credit(
                    account_id,
                    expected - actual,
                    TransactionCategory::TaskRefund,
                    TransactionRefs {
                        task_id: Some(task_id.clone()),
                        ..Default::default()
                    },
                )
                .await?;
            Ok(Some(txn))
        } else {
            Ok(None)
        }
    }

    /// Refund the full pre-charge amount for a task (cancel-from-pending,
    /// or fail/timeout settlement).
    pub async fn refund_full(
        &self,
        account_id: &AccountId,
        task_id: &TaskId,
        amount: i64,
    ) -> EngineResult<TransactionId> {
        self.credit(
            account_id,
            amount,
            TransactionCategory::TaskRefund,
            TransactionRefs {
                task_id: Some(task_id.clone()),
                ..Default::default()
            },
        )
        .await
    }

    // ---- RechargeOrder lifecycle ----

    pub async fn create_recharge_order(
        &self,
        account_id: AccountId,
        amount: i64,
        provider: String,
        out_trade_no: String,
    ) -> RechargeOrder {
        let order = RechargeOrder {
            id: RechargeOrderId::new(),
            account_id,
            amount,
            provider,
            out_trade_no,
            external_transaction_id: None,
            status: RechargeOrderStatus::Pending,
            expire_time: None,
            paid_at: None,
            transaction_id: None,
            created_at: Utc::now(),
        };
        self.recharge_orders
            .write()
            .await
            .insert(order.id.clone(), order.clone());
        order
    }

    pub async fn get_recharge_order(&self, id: &RechargeOrderId) -> EngineResult<RechargeOrder> {
        self.recharge_orders
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("recharge order {id}")))
    }

    /// Idempotent provider callback: a second arrival with the same
    /// `out_trade_no` and an already-`success` order returns successfully
    /// without writing again (spec.md §4.A, §8 "double callback").
    #[instrument(skip(self), fields(out_trade_no = %out_trade_no))]
    pub async fn apply_recharge_callback(
        &self,
        out_trade_no: &str,
        external_transaction_id: String,
        amount: i64,
    ) -> EngineResult<RechargeOrder> {
        let _guard = self.recharge_lock.lock().await;

        let order_id = {
            let orders = self.recharge_orders.read().await;
            orders
                .values()
                .find(|o| o.out_trade_no == out_trade_no)
                .map(|o| o.id.clone())
                .ok_or_else(|| EngineError::NotFound(format!("recharge order {out_trade_no}")))?
        };

        let snapshot = self.get_recharge_order(&order_id).await?;
        if snapshot.status.is_terminal() {
            tracing::info!(status = ?snapshot.status, "recharge_callback_already_terminal");
            return Ok(snapshot);
        }
        if snapshot.amount != amount {
            return Err(EngineError::InvalidInput(format!(
                "callback amount {amount} does not match order amount {}",
                snapshot.amount
            )));
        }

        let txn_id = self
            .credit(
                &snapshot.account_id,
                amount,
                TransactionCategory::Recharge,
                TransactionRefs {
                    recharge_order_id: Some(order_id.clone()),
                    payment_method: Some(snapshot.provider.clone()),
                    ..Default::default()
                },
            )
            .await?;

        let mut orders = self.recharge_orders.write().await;
        let order = orders
            .get_mut(&order_id)
            .ok_or_else(|| EngineError::NotFound(format!("recharge order {order_id}")))?;
        order.status = RechargeOrderStatus::Success;
        order.external_transaction_id = Some(external_transaction_id);
        order.paid_at = Some(Utc::now());
        order.transaction_id = Some(txn_id);
        Ok(order.clone())
    }

    pub async fn close_recharge_order(&self, id: &RechargeOrderId) -> EngineResult<RechargeOrder> {
        let mut orders = self.recharge_orders.write().await;
        let order = orders
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(format!("recharge order {id}")))?;
        if !order.status.is_terminal() {
            order.status = RechargeOrderStatus::Closed;
        }
        Ok(order.clone())
    }
}

fn category_display(category: TransactionCategory) -> &'static str {
    match category {
        TransactionCategory::TaskCharge => "task_charge",
        TransactionCategory::TaskRefund => "task_refund",
        TransactionCategory::Recharge => "recharge",
        TransactionCategory::AnalysisCharge => "analysis_charge",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use motif_types::UserId;

    async fn funded_account(ledger: &Ledger, balance: i64) -> Account {
        let account = ledger.create_account(UserId::new()).await;
        ledger
            .credit(
                &account.id,
                balance,
                TransactionCategory::Recharge,
                TransactionRefs::default(),
            )
            .await
            .unwrap();
        ledger.get_account(&account.id).await.unwrap()
    }

    #[tokio::test]
    async fn debit_enforces_balance_invariant() {
        let ledger = Ledger::new();
        let account = funded_account(&ledger, 1_000).await;
        let err = ledger
            .debit(
                &account.id,
                2_000,
                TransactionCategory::TaskCharge,
                TransactionRefs::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InsufficientBalance { .. }));
        assert_eq!(ledger.get_account(&account.id).await.unwrap().balance, 1_000);
    }

    #[tokio::test]
    async fn settle_no_op_when_actual_equals_expected() {
        let ledger = Ledger::new();
        let account = funded_account(&ledger, 1_000).await;
        let task_id = motif_types::TaskId::new();
        ledger
            .debit(
                &account.id,
                1_000,
                TransactionCategory::TaskCharge,
                TransactionRefs {
                    task_id: Some(task_id.clone()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let result = ledger.settle(&account.id, &task_id, 1_000, 1_000).await.unwrap();
        assert!(result.is_none());
        assert_eq!(ledger.get_account(&account.id).await.unwrap().balance, 0);
    }

    #[tokio::test]
    async fn settle_refunds_when_actual_below_expected() {
        let ledger = Ledger::new();
        let account = funded_account(&ledger, 1_000).await;
        let task_id = motif_types::TaskId::new();
        ledger
            .debit(
                &account.id,
                1_000,
                TransactionCategory::TaskCharge,
                TransactionRefs {
                    task_id: Some(task_id.clone()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        ledger.settle(&account.id, &task_id, 1_000, 400).await.unwrap();
        assert_eq!(ledger.get_account(&account.id).await.unwrap().balance, 600);
    }

    #[tokio::test]
    async fn double_recharge_callback_is_idempotent() {
        let ledger = Ledger::new();
        let account = ledger.create_account(UserId::new()).await;
        let order = ledger
            .create_recharge_order(account.id.clone(), 5_000, "stripe".into(), "ORD-1".into())
            .await;

        let first = ledger
            .apply_recharge_callback(&order.out_trade_no, "ext-1".into(), 5_000)
            .await
            .unwrap();
        let second = ledger
            .apply_recharge_callback(&order.out_trade_no, "ext-1".into(), 5_000)
            .await
            .unwrap();

        assert_eq!(first.transaction_id, second.transaction_id);
        assert_eq!(ledger.get_account(&account.id).await.unwrap().balance, 5_000);
        assert_eq!(ledger.history(&account.id).await.len(), 1);
    }

    #[tokio::test]
    async fn sum_of_transactions_matches_balance() {
        let ledger = Ledger::new();
        let account = ledger.create_account(UserId::new()).await;
        ledger
            .credit(&account.id, 10_000, TransactionCategory::Recharge, TransactionRefs::default())
            .await
            .unwrap();
        ledger
            .debit(
                &account.id,
                2_500,
                TransactionCategory::TaskCharge,
                TransactionRefs::default(),
            )
            .await
            .unwrap();
        let sum: i64 = ledger.history(&account.id).await.iter().map(|t| t.amount).sum();
        assert_eq!(sum, ledger.get_account(&account.id).await.unwrap().balance);
    }
}
