use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use uuid::Uuid;

pub type UserId = u32;
pub type WalletId = Uuid;
pub type TxId = Uuid;
pub type PaymentId = Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Workshop,
    Trip,
    Bazaar,
    Conference,
}

impl Display for EventType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EventType::Workshop => "workshop",
            EventType::Trip => "trip",
            EventType::Bazaar => "bazaar",
            EventType::Conference => "conference",
        };
        f.write_str(name)
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "workshop" => Ok(EventType::Workshop),
            "trip" => Ok(EventType::Trip),
            "bazaar" => Ok(EventType::Bazaar),
            "conference" => Ok(EventType::Conference),
            other => Err(format!("unknown event type `{}`", other)),
        }
    }
}

/// Identifies one event instance across the catalog, registry and payments.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventKey {
    pub event_type: EventType,
    pub event_id: String,
}

impl EventKey {
    pub fn new(event_type: EventType, event_id: impl Into<String>) -> Self {
        EventKey {
            event_type,
            event_id: event_id.into(),
        }
    }
}

impl Display for EventKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.event_type, self.event_id)
    }
}
