use crate::errors::{EngineError, Result};
use crate::money::Money;
use crate::transactions::{NewTransaction, Transaction, TransactionType};
use crate::types::{UserId, WalletId};
use std::collections::HashMap;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

pub enum WalletCommand {
    Append {
        request: NewTransaction,
        reply: oneshot::Sender<Result<Transaction>>,
    },
    Balance {
        reply: oneshot::Sender<Money>,
    },
    History {
        limit: Option<usize>,
        reply: oneshot::Sender<Vec<Transaction>>,
    },
}

/// One user's wallet. Owned by a single task that drains `incoming`, so every
/// mutation of one wallet is applied in arrival order and never interleaves.
pub struct Wallet {
    pub id: WalletId,
    pub user: UserId,
    pub balance: Money,
    pub history: Vec<Transaction>,
    dedup: HashMap<String, usize>,
    next_seq: u64,
    incoming: UnboundedReceiver<WalletCommand>,
}
impl Wallet {
    pub fn new(id: WalletId, user: UserId, incoming: UnboundedReceiver<WalletCommand>) -> Self {
        Wallet {
            id,
            user,
            balance: Money::ZERO,
            history: vec![],
            dedup: HashMap::new(),
            next_seq: 1,
            incoming,
        }
    }
    pub async fn process_commands(mut self) -> Self {
        while let Some(command) = self.incoming.recv().await {
            self.handle_command(command);
        }
        self
    }
    /// Sum of every recorded amount; equals `balance` at all times.
    pub fn ledger_total(&self) -> Money {
        self.history.iter().map(|tx| tx.amount).sum()
    }
    fn handle_command(&mut self, command: WalletCommand) {
        match command {
            WalletCommand::Append { request, reply } => {
                let result = self.append(request);
                if let Err(e) = &result {
                    debug!(user = self.user, error = %e, "wallet append rejected");
                }
                // The caller may have gone away; the append stands either way.
                let _ = reply.send(result);
            }
            WalletCommand::Balance { reply } => {
                let _ = reply.send(self.balance);
            }
            WalletCommand::History { limit, reply } => {
                let newest_first = self
                    .history
                    .iter()
                    .rev()
                    .take(limit.unwrap_or(usize::MAX))
                    .cloned()
                    .collect();
                let _ = reply.send(newest_first);
            }
        }
    }
    fn append(&mut self, request: NewTransaction) -> Result<Transaction> {
        request.tx_type.check_sign(request.amount)?;
        let key = request.dedup_key();
        if let Some(index) = key.as_ref().and_then(|k| self.dedup.get(k)) {
            let existing = &self.history[*index];
            if existing.amount != request.amount || existing.tx_type != request.tx_type {
                return Err(EngineError::DataIntegrity(format!(
                    "idempotency key {} reused with {} {} (recorded {} {})",
                    key.unwrap_or_default(),
                    request.tx_type,
                    request.amount,
                    existing.tx_type,
                    existing.amount
                )));
            }
            debug!(user = self.user, seq = existing.seq, "duplicate append ignored");
            return Ok(existing.clone());
        }
        let balance = self.balance.checked_add(request.amount).ok_or_else(|| {
            EngineError::InvalidAmount(format!("{} overflows the wallet balance", request.amount))
        })?;
        if request.tx_type == TransactionType::Payment && balance.is_negative() {
            return Err(EngineError::InsufficientFunds {
                user: self.user,
                balance: self.balance,
                requested: request.amount.abs(),
            });
        }
        let tx = Transaction {
            id: Uuid::new_v4(),
            wallet_id: self.id,
            seq: self.next_seq,
            tx_type: request.tx_type,
            amount: request.amount,
            description: request.description,
            event: request.event,
            related_payment_id: request.related_payment_id,
            created_at: request.at,
        };
        self.next_seq += 1;
        if let Some(key) = key {
            self.dedup.insert(key, self.history.len());
        }
        self.history.push(tx.clone());
        self.balance = balance;
        debug!(
            user = self.user,
            seq = tx.seq,
            tx_type = %tx.tx_type,
            amount = %tx.amount,
            balance = %self.balance,
            "wallet transaction appended"
        );
        Ok(tx)
    }
}
