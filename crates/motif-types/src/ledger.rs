use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AccountId, RechargeOrderId, TaskId, TransactionId, UserId};

/// One user's prepaid balance. Mutated only through `motif-ledger`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub user_id: UserId,
    /// Minor currency units (e.g. cents). Invariant: `balance >= 0`.
    pub balance: i64,
}

impl Account {
    pub fn new(user_id: UserId) -> Self {
        Self {
            id: AccountId::new(),
            user_id,
            balance: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionCategory {
    TaskCharge,
    TaskRefund,
    Recharge,
    AnalysisCharge,
}

/// Immutable ledger entry. Never updated or deleted once inserted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub account_id: AccountId,
    pub category: TransactionCategory,
    /// Signed: positive credit, negative debit.
    pub amount: i64,
    pub balance_before: i64,
    pub balance_after: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recharge_order_id: Option<RechargeOrderId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_method: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RechargeOrderStatus {
    Pending,
    Processing,
    Success,
    Failed,
    Closed,
}

impl RechargeOrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RechargeOrderStatus::Success
                | RechargeOrderStatus::Failed
                | RechargeOrderStatus::Closed
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RechargeOrder {
    pub id: RechargeOrderId,
    pub account_id: AccountId,
    pub amount: i64,
    pub provider: String,
    /// Merchant-side idempotency key. Unique.
    pub out_trade_no: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_transaction_id: Option<String>,
    pub status: RechargeOrderStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paid_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<TransactionId>,
    pub created_at: DateTime<Utc>,
}
