//! # Real-Time Events
//!
//! Change events delivered by the feed, channel status reports, and the
//! per-topic connection states the supervisor moves through.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Type of row change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    /// New row inserted
    Insert,
    /// Existing row updated
    Update,
    /// Row deleted
    Delete,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Insert => write!(f, "INSERT"),
            EventType::Update => write!(f, "UPDATE"),
            EventType::Delete => write!(f, "DELETE"),
        }
    }
}

/// A row change observed on a watched table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Change type
    pub event_type: EventType,

    /// Schema name (default: "public")
    #[serde(default = "default_schema")]
    pub schema: String,

    /// Source table, which is also the bus topic
    pub table: String,

    /// Row after the change (INSERT/UPDATE)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_record: Option<Value>,

    /// Row before the change (UPDATE/DELETE)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_record: Option<Value>,

    /// When the change was committed upstream
    pub commit_timestamp: DateTime<Utc>,
}

fn default_schema() -> String {
    "public".to_string()
}

impl ChangeEvent {
    /// Create an INSERT event
    pub fn insert(table: impl Into<String>, record: Value) -> Self {
        Self::new(EventType::Insert, table.into(), Some(record), None)
    }

    /// Create an UPDATE event
    pub fn update(table: impl Into<String>, old_record: Value, new_record: Value) -> Self {
        Self::new(
            EventType::Update,
            table.into(),
            Some(new_record),
            Some(old_record),
        )
    }

    /// Create a DELETE event
    pub fn delete(table: impl Into<String>, record: Value) -> Self {
        Self::new(EventType::Delete, table.into(), None, Some(record))
    }

    fn new(
        event_type: EventType,
        table: String,
        new_record: Option<Value>,
        old_record: Option<Value>,
    ) -> Self {
        Self {
            event_type,
            schema: default_schema(),
            table,
            new_record,
            old_record,
            commit_timestamp: Utc::now(),
        }
    }

    /// Bus topic for this event. Topics are named after the source table.
    pub fn topic(&self) -> &str {
        &self.table
    }

    /// The most recent known version of the row
    pub fn record(&self) -> Option<&Value> {
        self.new_record.as_ref().or(self.old_record.as_ref())
    }
}

/// Status reported by the change-feed client for one channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    Subscribed,
    Closed,
    ChannelError,
    TimedOut,
    /// Anything else the client reports; logged, never acted on
    Other(String),
}

impl ChannelStatus {
    /// Parse the status strings used by Supabase-style realtime clients
    pub fn parse(raw: &str) -> Self {
        match raw {
            "SUBSCRIBED" => ChannelStatus::Subscribed,
            "CLOSED" => ChannelStatus::Closed,
            "CHANNEL_ERROR" => ChannelStatus::ChannelError,
            "TIMED_OUT" => ChannelStatus::TimedOut,
            other => ChannelStatus::Other(other.to_string()),
        }
    }

    /// State a feed moves to on this status; `None` for unrecognised reports
    pub fn connection_state(&self) -> Option<ConnectionState> {
        match self {
            ChannelStatus::Subscribed => Some(ConnectionState::Subscribed),
            ChannelStatus::Closed => Some(ConnectionState::Closed),
            ChannelStatus::ChannelError => Some(ConnectionState::Errored),
            ChannelStatus::TimedOut => Some(ConnectionState::TimedOut),
            ChannelStatus::Other(_) => None,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ChannelStatus::Subscribed => "SUBSCRIBED",
            ChannelStatus::Closed => "CLOSED",
            ChannelStatus::ChannelError => "CHANNEL_ERROR",
            ChannelStatus::TimedOut => "TIMED_OUT",
            ChannelStatus::Other(raw) => raw,
        }
    }
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection state of one logical feed
///
/// `Disconnected → Subscribing → Subscribed → (Closed|Errored|TimedOut)
/// → BackoffWait → Subscribing → …`, with `Degraded` as the terminal state
/// once the attempt cap is hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Disconnected,
    Subscribing,
    Subscribed,
    Closed,
    Errored,
    TimedOut,
    BackoffWait,
    Degraded,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Subscribing => "SUBSCRIBING",
            ConnectionState::Subscribed => "SUBSCRIBED",
            ConnectionState::Closed => "CLOSED",
            ConnectionState::Errored => "ERROR",
            ConnectionState::TimedOut => "TIMEOUT",
            ConnectionState::BackoffWait => "BACKOFF_WAIT",
            ConnectionState::Degraded => "DEGRADED",
        }
    }

    /// States that still need a reconnect to recover
    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            ConnectionState::Closed | ConnectionState::Errored | ConnectionState::TimedOut
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_type_display() {
        assert_eq!(EventType::Insert.to_string(), "INSERT");
        assert_eq!(EventType::Update.to_string(), "UPDATE");
        assert_eq!(EventType::Delete.to_string(), "DELETE");
    }

    #[test]
    fn test_insert_event_topic_is_table() {
        let event = ChangeEvent::insert("leads", json!({"id": "x"}));

        assert_eq!(event.topic(), "leads");
        assert_eq!(event.schema, "public");
        assert_eq!(event.record(), Some(&json!({"id": "x"})));
        assert!(event.old_record.is_none());
    }

    #[test]
    fn test_update_and_delete_records() {
        let update = ChangeEvent::update("bookings", json!({"v": 1}), json!({"v": 2}));
        assert_eq!(update.record(), Some(&json!({"v": 2})));

        let delete = ChangeEvent::delete("bookings", json!({"v": 2}));
        assert!(delete.new_record.is_none());
        assert_eq!(delete.record(), Some(&json!({"v": 2})));
    }

    #[test]
    fn test_event_deserializes_with_default_schema() {
        let event: ChangeEvent = serde_json::from_value(json!({
            "event_type": "DELETE",
            "table": "services",
            "old_record": {"id": 4},
            "commit_timestamp": "2024-05-01T10:00:00Z"
        }))
        .unwrap();

        assert_eq!(event.event_type, EventType::Delete);
        assert_eq!(event.schema, "public");
        assert_eq!(event.topic(), "services");
    }

    #[test]
    fn test_status_parse() {
        assert_eq!(ChannelStatus::parse("SUBSCRIBED"), ChannelStatus::Subscribed);
        assert_eq!(ChannelStatus::parse("TIMED_OUT"), ChannelStatus::TimedOut);
        assert_eq!(
            ChannelStatus::parse("JOINING"),
            ChannelStatus::Other("JOINING".into())
        );
    }

    #[test]
    fn test_status_to_state() {
        assert_eq!(
            ChannelStatus::ChannelError.connection_state(),
            Some(ConnectionState::Errored)
        );
        assert_eq!(ChannelStatus::Other("x".into()).connection_state(), None);
    }
}
