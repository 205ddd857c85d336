use crate::errors::{EngineError, Result};
use crate::types::{EventKey, EventType, PaymentId, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Registration {
    pub user_id: UserId,
    pub event: EventKey,
    /// `None` for free events.
    pub payment_id: Option<PaymentId>,
    /// Tracked for workshops only.
    pub certificate_sent: Option<bool>,
    pub created_at: DateTime<Utc>,
}

impl Registration {
    pub fn new(
        user_id: UserId,
        event: EventKey,
        payment_id: Option<PaymentId>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let certificate_sent = (event.event_type == EventType::Workshop).then_some(false);
        Registration {
            user_id,
            event,
            payment_id,
            certificate_sent,
            created_at,
        }
    }
}

/// Capacity counter and registration records, owned outside this engine.
/// `reserve_slot` is atomic in the implementation.
#[async_trait]
pub trait RegistrationStore: Send + Sync {
    async fn reserve_slot(&self, event: &EventKey) -> Result<()>;
    async fn release_slot(&self, event: &EventKey) -> Result<()>;
    async fn create_registration(&self, registration: Registration) -> Result<()>;
    async fn find_registration(&self, user: UserId, event: &EventKey) -> Result<Option<Registration>>;
    async fn delete_registration(&self, user: UserId, event: &EventKey) -> Result<()>;
}

#[derive(Default)]
struct Capacity {
    limit: Option<u32>,
    taken: u32,
}

#[derive(Default)]
struct RegistryState {
    capacity: HashMap<EventKey, Capacity>,
    registrations: HashMap<(UserId, EventKey), Registration>,
    failing_creates: u32,
    failing_deletes: u32,
}

#[derive(Default)]
pub struct InMemoryRegistry {
    state: RwLock<RegistryState>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` means unlimited.
    pub async fn set_capacity(&self, event: EventKey, limit: Option<u32>) {
        self.state.write().await.capacity.entry(event).or_default().limit = limit;
    }

    pub async fn taken(&self, event: &EventKey) -> u32 {
        self.state
            .read()
            .await
            .capacity
            .get(event)
            .map(|c| c.taken)
            .unwrap_or(0)
    }

    pub async fn registration_count(&self) -> usize {
        self.state.read().await.registrations.len()
    }

    /// The next `count` record creations fail as if the store were down.
    pub async fn fail_next_creates(&self, count: u32) {
        self.state.write().await.failing_creates = count;
    }

    /// The next `count` deletions fail as if the store were down.
    pub async fn fail_next_deletes(&self, count: u32) {
        self.state.write().await.failing_deletes = count;
    }
}

#[async_trait]
impl RegistrationStore for InMemoryRegistry {
    async fn reserve_slot(&self, event: &EventKey) -> Result<()> {
        let mut state = self.state.write().await;
        let capacity = state.capacity.entry(event.clone()).or_default();
        if capacity.limit.is_some_and(|limit| capacity.taken >= limit) {
            return Err(EngineError::CapacityExceeded(event.clone()));
        }
        capacity.taken += 1;
        Ok(())
    }

    async fn release_slot(&self, event: &EventKey) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(capacity) = state.capacity.get_mut(event) {
            capacity.taken = capacity.taken.saturating_sub(1);
        }
        Ok(())
    }

    async fn create_registration(&self, registration: Registration) -> Result<()> {
        let mut state = self.state.write().await;
        if state.failing_creates > 0 {
            state.failing_creates -= 1;
            return Err(EngineError::DataIntegrity("registration store unavailable".into()));
        }
        let key = (registration.user_id, registration.event.clone());
        if state.registrations.contains_key(&key) {
            return Err(EngineError::AlreadyRegistered {
                user: registration.user_id,
                event: registration.event,
            });
        }
        state.registrations.insert(key, registration);
        Ok(())
    }

    async fn find_registration(&self, user: UserId, event: &EventKey) -> Result<Option<Registration>> {
        Ok(self
            .state
            .read()
            .await
            .registrations
            .get(&(user, event.clone()))
            .cloned())
    }

    async fn delete_registration(&self, user: UserId, event: &EventKey) -> Result<()> {
        let mut state = self.state.write().await;
        if state.failing_deletes > 0 {
            state.failing_deletes -= 1;
            return Err(EngineError::DataIntegrity("registration store unavailable".into()));
        }
        // Deleting an absent record is success; retries rely on it.
        state.registrations.remove(&(user, event.clone()));
        Ok(())
    }
}
