use crate::errors::{EngineError, Result};
use crate::money::Money;
use crate::policy::EventSchedule;
use crate::types::EventKey;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Read side of the event catalog, owned by the event CRUD layer.
#[async_trait]
pub trait EventCatalog: Send + Sync {
    async fn event_price(&self, event: &EventKey) -> Result<Money>;
    async fn event_schedule(&self, event: &EventKey) -> Result<EventSchedule>;
}

#[derive(Clone, Debug)]
pub struct CatalogEntry {
    pub price: Money,
    pub schedule: EventSchedule,
}

#[derive(Default)]
pub struct InMemoryCatalog {
    events: RwLock<HashMap<EventKey, CatalogEntry>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, event: EventKey, price: Money, schedule: EventSchedule) {
        self.events
            .write()
            .await
            .insert(event, CatalogEntry { price, schedule });
    }

    async fn entry(&self, event: &EventKey) -> Result<CatalogEntry> {
        self.events
            .read()
            .await
            .get(event)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("event {}", event)))
    }
}

#[async_trait]
impl EventCatalog for InMemoryCatalog {
    async fn event_price(&self, event: &EventKey) -> Result<Money> {
        let price = self.entry(event).await?.price;
        if price.is_negative() {
            return Err(EngineError::DataIntegrity(format!(
                "event {} has negative price {}",
                event, price
            )));
        }
        Ok(price)
    }

    async fn event_schedule(&self, event: &EventKey) -> Result<EventSchedule> {
        Ok(self.entry(event).await?.schedule)
    }
}
