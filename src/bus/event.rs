//! Event record and the closed set of event kinds.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The fixed enumeration of event kinds the bus carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Price,
    OrderUpdate,
    Trade,
    Position,
    Balance,
    Strategy,
    Log,
    Error,
    Snapshot,
    Connected,
    Disconnected,
    SystemStatus,
    Connection,
}

impl EventKind {
    /// Snake-case wire representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Price => "price",
            EventKind::OrderUpdate => "order_update",
            EventKind::Trade => "trade",
            EventKind::Position => "position",
            EventKind::Balance => "balance",
            EventKind::Strategy => "strategy",
            EventKind::Log => "log",
            EventKind::Error => "error",
            EventKind::Snapshot => "snapshot",
            EventKind::Connected => "connected",
            EventKind::Disconnected => "disconnected",
            EventKind::SystemStatus => "system_status",
            EventKind::Connection => "connection",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "price" => Ok(EventKind::Price),
            "order_update" => Ok(EventKind::OrderUpdate),
            "trade" => Ok(EventKind::Trade),
            "position" => Ok(EventKind::Position),
            "balance" => Ok(EventKind::Balance),
            "strategy" => Ok(EventKind::Strategy),
            "log" => Ok(EventKind::Log),
            "error" => Ok(EventKind::Error),
            "snapshot" => Ok(EventKind::Snapshot),
            "connected" => Ok(EventKind::Connected),
            "disconnected" => Ok(EventKind::Disconnected),
            "system_status" => Ok(EventKind::SystemStatus),
            "connection" => Ok(EventKind::Connection),
            other => Err(format!("unknown event kind: {other}")),
        }
    }
}

/// One published event. Immutable once published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}
