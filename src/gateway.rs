use crate::errors::{EngineError, Result};
use crate::money::Money;
use crate::types::UserId;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type IntentId = String;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Intent {
    pub id: IntentId,
    pub client_secret: String,
}

#[derive(Clone, Debug)]
pub struct IntentMetadata {
    /// Stable per logical payment; the provider deduplicates on it.
    pub idempotency_key: String,
    pub user_id: UserId,
    pub description: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    Succeeded,
    Failed,
    Pending,
}

#[derive(Clone, Debug, PartialEq)]
pub struct IntentConfirmation {
    pub status: IntentStatus,
    /// Provider response, kept for audit logs only.
    pub raw: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefundStatus {
    Succeeded,
    Pending,
    Failed,
}

/// External card processor. Calls may be slow, may fail, and are not
/// idempotent on the wire unless the idempotency key is reused.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_intent(
        &self,
        amount: Money,
        currency: &str,
        metadata: IntentMetadata,
    ) -> Result<Intent>;

    async fn confirm_intent(&self, intent_id: &str) -> Result<IntentConfirmation>;

    async fn refund(&self, intent_id: &str, amount: Money) -> Result<RefundStatus>;
}

struct SimulatedIntent {
    amount: Money,
    currency: String,
    client_secret: String,
    status: IntentStatus,
    refunded: Money,
}

#[derive(Default)]
struct SimulatedState {
    intents: HashMap<IntentId, SimulatedIntent>,
    by_key: HashMap<String, IntentId>,
    outages: u32,
    next_id: u64,
}

/// In-process card processor. Intents start `pending` until `approve` or
/// `decline` is called, which stands in for the card holder finishing
/// checkout on the client.
pub struct SimulatedGateway {
    min_charge: Money,
    state: Mutex<SimulatedState>,
}

impl SimulatedGateway {
    pub fn new(min_charge: Money) -> Self {
        SimulatedGateway {
            min_charge,
            state: Mutex::new(SimulatedState::default()),
        }
    }

    pub async fn approve(&self, intent_id: &str) -> bool {
        self.settle(intent_id, IntentStatus::Succeeded).await
    }

    pub async fn decline(&self, intent_id: &str) -> bool {
        self.settle(intent_id, IntentStatus::Failed).await
    }

    /// The next `count` calls fail with `GatewayUnavailable`.
    pub async fn fail_next(&self, count: u32) {
        self.state.lock().await.outages = count;
    }

    pub async fn intent_count(&self) -> usize {
        self.state.lock().await.intents.len()
    }

    async fn settle(&self, intent_id: &str, status: IntentStatus) -> bool {
        let mut state = self.state.lock().await;
        match state.intents.get_mut(intent_id) {
            Some(intent) if intent.status == IntentStatus::Pending => {
                intent.status = status;
                true
            }
            _ => false,
        }
    }
}

fn take_outage(state: &mut SimulatedState) -> Result<()> {
    if state.outages > 0 {
        state.outages -= 1;
        warn!("simulated gateway outage");
        return Err(EngineError::GatewayUnavailable("simulated outage".to_string()));
    }
    Ok(())
}

#[async_trait]
impl PaymentGateway for SimulatedGateway {
    async fn create_intent(
        &self,
        amount: Money,
        currency: &str,
        metadata: IntentMetadata,
    ) -> Result<Intent> {
        let mut state = self.state.lock().await;
        take_outage(&mut state)?;
        if !amount.is_positive() || amount < self.min_charge {
            return Err(EngineError::InvalidAmount(format!(
                "{} {} is below the minimum charge of {}",
                amount, currency, self.min_charge
            )));
        }
        if let Some(id) = state.by_key.get(&metadata.idempotency_key) {
            let existing = &state.intents[id];
            if existing.amount != amount || existing.currency != currency {
                return Err(EngineError::DataIntegrity(format!(
                    "idempotency key {} reused for a different charge",
                    metadata.idempotency_key
                )));
            }
            debug!(intent = %id, "intent reused for idempotency key");
            return Ok(Intent {
                id: id.clone(),
                client_secret: existing.client_secret.clone(),
            });
        }
        state.next_id += 1;
        let id = format!("pi_{:08}", state.next_id);
        let client_secret = format!("{}_secret_{}", id, Uuid::new_v4().simple());
        state.intents.insert(
            id.clone(),
            SimulatedIntent {
                amount,
                currency: currency.to_string(),
                client_secret: client_secret.clone(),
                status: IntentStatus::Pending,
                refunded: Money::ZERO,
            },
        );
        state.by_key.insert(metadata.idempotency_key, id.clone());
        info!(intent = %id, user = metadata.user_id, %amount, "intent created: {}", metadata.description);
        Ok(Intent { id, client_secret })
    }

    async fn confirm_intent(&self, intent_id: &str) -> Result<IntentConfirmation> {
        let mut state = self.state.lock().await;
        take_outage(&mut state)?;
        let intent = state
            .intents
            .get(intent_id)
            .ok_or_else(|| EngineError::NotFound(format!("intent {}", intent_id)))?;
        Ok(IntentConfirmation {
            status: intent.status,
            raw: format!(
                "id={} status={:?} amount={} currency={}",
                intent_id, intent.status, intent.amount, intent.currency
            ),
        })
    }

    async fn refund(&self, intent_id: &str, amount: Money) -> Result<RefundStatus> {
        let mut state = self.state.lock().await;
        take_outage(&mut state)?;
        let intent = state
            .intents
            .get_mut(intent_id)
            .ok_or_else(|| EngineError::NotFound(format!("intent {}", intent_id)))?;
        if intent.status != IntentStatus::Succeeded {
            return Ok(RefundStatus::Failed);
        }
        if !amount.is_positive() || intent.refunded + amount > intent.amount {
            return Err(EngineError::InvalidAmount(format!(
                "cannot refund {} of {} ({} already refunded)",
                amount, intent.amount, intent.refunded
            )));
        }
        intent.refunded = intent.refunded + amount;
        Ok(RefundStatus::Succeeded)
    }
}
