//! Response shapes handed to the API layer. The shapes are fixed per
//! operation; `SCHEMA_VERSION` changes whenever one of them does.

use crate::gateway::IntentId;
use crate::money::Money;
use crate::registry::Registration;
use crate::transactions::Transaction;
use crate::types::{PaymentId, UserId, WalletId};
use serde::Serialize;

pub const SCHEMA_VERSION: u16 = 1;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WalletSummary {
    pub schema_version: u16,
    pub user_id: UserId,
    pub wallet_id: WalletId,
    pub balance: Money,
    /// Newest first.
    pub recent_transactions: Vec<Transaction>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RegisterOutcome {
    Registered {
        registration: Registration,
    },
    /// Card checkout must be finished client-side, then `confirm_payment`.
    AwaitingConfirmation {
        payment_id: PaymentId,
        intent_id: IntentId,
        client_secret: String,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConfirmOutcome {
    Registered { registration: Registration },
    Deposited { transaction: Transaction, balance: Money },
    /// Gateway has not finished; call again later.
    Pending { payment_id: PaymentId },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CancelOutcome {
    pub schema_version: u16,
    /// Zero for free events.
    pub refunded: Money,
    pub balance: Option<Money>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TopUpIntent {
    pub schema_version: u16,
    pub payment_id: PaymentId,
    pub intent_id: IntentId,
    pub client_secret: String,
}

/// Flat row for CSV export of wallets.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WalletRow {
    pub user: UserId,
    pub balance: Money,
    pub transactions: usize,
}
