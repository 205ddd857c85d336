use crate::errors::{EngineError, Result};
use crate::money::Money;
use crate::types::{EventKey, PaymentId, TxId, WalletId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Deposit,
    Payment,
    Refund,
}

impl TransactionType {
    /// Deposits and refunds credit the wallet, payments debit it.
    pub fn check_sign(self, amount: Money) -> Result<()> {
        let ok = match self {
            TransactionType::Deposit | TransactionType::Refund => !amount.is_negative(),
            TransactionType::Payment => !amount.is_positive(),
        };
        if ok {
            Ok(())
        } else {
            Err(EngineError::InvalidAmount(format!(
                "{} transaction cannot carry amount {}",
                self, amount
            )))
        }
    }
}

impl Display for TransactionType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransactionType::Deposit => "deposit",
            TransactionType::Payment => "payment",
            TransactionType::Refund => "refund",
        };
        f.write_str(name)
    }
}

/// An immutable ledger record. `seq` is assigned by the owning wallet at
/// append time and is strictly increasing within that wallet.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Transaction {
    pub id: TxId,
    pub wallet_id: WalletId,
    pub seq: u64,
    pub tx_type: TransactionType,
    pub amount: Money,
    pub description: String,
    pub event: Option<EventKey>,
    pub related_payment_id: Option<PaymentId>,
    pub created_at: DateTime<Utc>,
}

/// A request to append one transaction to a wallet.
#[derive(Clone, Debug)]
pub struct NewTransaction {
    pub tx_type: TransactionType,
    pub amount: Money,
    pub description: String,
    pub event: Option<EventKey>,
    pub related_payment_id: Option<PaymentId>,
    pub idempotency_key: Option<String>,
    pub at: DateTime<Utc>,
}

impl NewTransaction {
    pub fn new(
        tx_type: TransactionType,
        amount: Money,
        description: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        NewTransaction {
            tx_type,
            amount,
            description: description.into(),
            event: None,
            related_payment_id: None,
            idempotency_key: None,
            at,
        }
    }

    pub fn for_event(mut self, event: EventKey) -> Self {
        self.event = Some(event);
        self
    }

    pub fn for_payment(mut self, payment: PaymentId) -> Self {
        self.related_payment_id = Some(payment);
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Explicit key wins; otherwise a payment correlation plus the type.
    pub fn dedup_key(&self) -> Option<String> {
        self.idempotency_key.clone().or_else(|| {
            self.related_payment_id
                .map(|payment| payment_dedup_key(payment, self.tx_type))
        })
    }
}

pub fn payment_dedup_key(payment: PaymentId, tx_type: TransactionType) -> String {
    format!("{}:{}", payment, tx_type)
}
