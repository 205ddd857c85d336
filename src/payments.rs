use crate::errors::{EngineError, Result};
use crate::gateway::{Intent, IntentId};
use crate::money::Money;
use crate::types::{EventKey, PaymentId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Wallet,
    Gateway,
}

impl FromStr for PaymentMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "wallet" => Ok(PaymentMethod::Wallet),
            "gateway" | "card" => Ok(PaymentMethod::Gateway),
            other => Err(format!("unknown payment method `{}`", other)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Succeeded,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn can_transition_to(self, next: PaymentStatus) -> bool {
        matches!(
            (self, next),
            (PaymentStatus::Pending, PaymentStatus::Succeeded)
                | (PaymentStatus::Pending, PaymentStatus::Failed)
                | (PaymentStatus::Succeeded, PaymentStatus::Refunded)
        )
    }
}

impl Display for PaymentStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentPurpose {
    Registration(EventKey),
    TopUp,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Payment {
    pub id: PaymentId,
    pub user_id: UserId,
    pub purpose: PaymentPurpose,
    pub amount: Money,
    pub method: PaymentMethod,
    pub status: PaymentStatus,
    pub gateway_intent_id: Option<IntentId>,
    #[serde(skip)]
    pub client_secret: Option<String>,
    pub created_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
}

impl Payment {
    pub fn pending(
        user_id: UserId,
        purpose: PaymentPurpose,
        amount: Money,
        method: PaymentMethod,
        created_at: DateTime<Utc>,
    ) -> Self {
        Payment {
            id: Uuid::new_v4(),
            user_id,
            purpose,
            amount,
            method,
            status: PaymentStatus::Pending,
            gateway_intent_id: None,
            client_secret: None,
            created_at,
            confirmed_at: None,
        }
    }

    pub fn event(&self) -> Option<&EventKey> {
        match &self.purpose {
            PaymentPurpose::Registration(event) => Some(event),
            PaymentPurpose::TopUp => None,
        }
    }
}

/// Outcome of a check-and-set on a payment's status.
#[derive(Clone, Debug, PartialEq)]
pub enum Transition {
    Applied(Payment),
    /// The status had already moved on; carries the payment as found.
    Rejected(Payment),
}

/// Durable record of payment attempts. Status changes are check-and-set so
/// concurrent confirmations and sweeps cannot both win.
#[derive(Default)]
pub struct PaymentStore {
    payments: RwLock<HashMap<PaymentId, Payment>>,
}

impl PaymentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, payment: Payment) {
        self.payments.write().await.insert(payment.id, payment);
    }

    pub async fn get(&self, id: PaymentId) -> Result<Payment> {
        self.payments
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("payment {}", id)))
    }

    pub async fn attach_intent(&self, id: PaymentId, intent: &Intent) -> Result<Payment> {
        let mut payments = self.payments.write().await;
        let payment = payments
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound(format!("payment {}", id)))?;
        if payment.status != PaymentStatus::Pending {
            return Err(EngineError::DataIntegrity(format!(
                "cannot attach intent to {} payment {}",
                payment.status, id
            )));
        }
        payment.gateway_intent_id = Some(intent.id.clone());
        payment.client_secret = Some(intent.client_secret.clone());
        Ok(payment.clone())
    }

    pub async fn transition(
        &self,
        id: PaymentId,
        to: PaymentStatus,
        at: DateTime<Utc>,
    ) -> Result<Transition> {
        let mut payments = self.payments.write().await;
        let payment = payments
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound(format!("payment {}", id)))?;
        if !payment.status.can_transition_to(to) {
            return Ok(Transition::Rejected(payment.clone()));
        }
        payment.status = to;
        if to == PaymentStatus::Succeeded {
            payment.confirmed_at = Some(at);
        }
        Ok(Transition::Applied(payment.clone()))
    }

    /// The most recent pending gateway payment for this user and event.
    pub async fn find_pending(&self, user: UserId, event: &EventKey) -> Option<Payment> {
        self.payments
            .read()
            .await
            .values()
            .filter(|p| {
                p.user_id == user
                    && p.status == PaymentStatus::Pending
                    && p.event() == Some(event)
            })
            .max_by_key(|p| p.created_at)
            .cloned()
    }

    /// Returns the open gateway checkout matching `payment`'s user, event and
    /// amount, or stores `payment` as the new one. The flag is `true` when
    /// `payment` was stored. Lookup and insert share one write lock.
    pub async fn find_or_insert_pending(&self, payment: Payment) -> (Payment, bool) {
        let mut payments = self.payments.write().await;
        let existing = payments
            .values()
            .filter(|p| {
                p.user_id == payment.user_id
                    && p.status == PaymentStatus::Pending
                    && p.method == PaymentMethod::Gateway
                    && p.amount == payment.amount
                    && p.event().is_some()
                    && p.event() == payment.event()
            })
            .max_by_key(|p| p.created_at)
            .cloned();
        match existing {
            Some(existing) => (existing, false),
            None => {
                payments.insert(payment.id, payment.clone());
                (payment, true)
            }
        }
    }

    /// Refunded registration payments, oldest first.
    pub async fn refunded_registrations(&self) -> Vec<Payment> {
        let mut refunded: Vec<Payment> = self
            .payments
            .read()
            .await
            .values()
            .filter(|p| p.status == PaymentStatus::Refunded && p.event().is_some())
            .cloned()
            .collect();
        refunded.sort_by_key(|p| p.created_at);
        refunded
    }

    pub async fn pending_created_before(&self, cutoff: DateTime<Utc>) -> Vec<PaymentId> {
        self.payments
            .read()
            .await
            .values()
            .filter(|p| p.status == PaymentStatus::Pending && p.created_at <= cutoff)
            .map(|p| p.id)
            .collect()
    }
}
