use crate::errors::{EngineError, Result};
use crate::money::Money;
use crate::transactions::{NewTransaction, Transaction};
use crate::types::{UserId, WalletId};
use crate::wallet::{Wallet, WalletCommand};
use std::collections::BTreeMap;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

struct WalletHandle {
    id: WalletId,
    sender: UnboundedSender<WalletCommand>,
    task: JoinHandle<Wallet>,
}

/// Routes ledger operations to one task per wallet. Commands for the same
/// wallet are serialized by that task's queue; different wallets never wait
/// on each other.
pub struct WalletLedger {
    wallets: RwLock<BTreeMap<UserId, WalletHandle>>,
}

#[derive(Debug, PartialEq)]
pub struct WalletSnapshot {
    pub wallet_id: WalletId,
    pub balance: Money,
    pub transactions: usize,
    pub ledger_total: Money,
}

impl Default for WalletLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl WalletLedger {
    pub fn new() -> Self {
        WalletLedger {
            wallets: RwLock::new(BTreeMap::new()),
        }
    }

    /// Creates the user's wallet if it does not exist yet.
    pub async fn open_wallet(&self, user: UserId) -> WalletId {
        if let Some(handle) = self.wallets.read().await.get(&user) {
            return handle.id;
        }
        let mut wallets = self.wallets.write().await;
        if let Some(handle) = wallets.get(&user) {
            return handle.id;
        }
        let (sender, receiver) = unbounded_channel();
        let id = Uuid::new_v4();
        let wallet = Wallet::new(id, user, receiver);
        let task = tokio::spawn(async move { wallet.process_commands().await });
        wallets.insert(user, WalletHandle { id, sender, task });
        info!(user, wallet = %id, "wallet opened");
        id
    }

    pub async fn wallet_id(&self, user: UserId) -> Result<WalletId> {
        self.wallets
            .read()
            .await
            .get(&user)
            .map(|handle| handle.id)
            .ok_or_else(|| wallet_not_found(user))
    }

    pub async fn get_balance(&self, user: UserId) -> Result<Money> {
        let (reply, response) = oneshot::channel();
        self.send(user, WalletCommand::Balance { reply }).await?;
        response.await.map_err(|_| wallet_stopped(user))
    }

    /// Appends a transaction and moves the balance by its amount in one step.
    pub async fn append_transaction(
        &self,
        user: UserId,
        request: NewTransaction,
    ) -> Result<Transaction> {
        let (reply, response) = oneshot::channel();
        self.send(user, WalletCommand::Append { request, reply }).await?;
        response.await.map_err(|_| wallet_stopped(user))?
    }

    /// Newest first, ordered by the wallet's append sequence.
    pub async fn history(&self, user: UserId, limit: Option<usize>) -> Result<Vec<Transaction>> {
        let (reply, response) = oneshot::channel();
        self.send(user, WalletCommand::History { limit, reply }).await?;
        response.await.map_err(|_| wallet_stopped(user))
    }

    /// Closes every wallet task and reports what each one ended with.
    pub async fn shutdown(&self) -> BTreeMap<UserId, WalletSnapshot> {
        let wallets = std::mem::take(&mut *self.wallets.write().await);
        let mut result = BTreeMap::new();
        for (user, handle) in wallets {
            drop(handle.sender);
            match handle.task.await {
                Ok(wallet) => {
                    result.insert(
                        user,
                        WalletSnapshot {
                            wallet_id: wallet.id,
                            balance: wallet.balance,
                            transactions: wallet.history.len(),
                            ledger_total: wallet.ledger_total(),
                        },
                    );
                }
                Err(e) => error!(user, error = %e, "wallet task failed"),
            }
        }
        result
    }

    async fn send(&self, user: UserId, command: WalletCommand) -> Result<()> {
        let sender = self
            .wallets
            .read()
            .await
            .get(&user)
            .map(|handle| handle.sender.clone())
            .ok_or_else(|| wallet_not_found(user))?;
        sender.send(command).map_err(|_| wallet_stopped(user))
    }
}

fn wallet_not_found(user: UserId) -> EngineError {
    EngineError::NotFound(format!("wallet of user {}", user))
}

fn wallet_stopped(user: UserId) -> EngineError {
    EngineError::DataIntegrity(format!("wallet task of user {} is not running", user))
}
