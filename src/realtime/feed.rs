//! # Change-Feed Collaborator
//!
//! The supervisor does not speak any wire protocol. It drives an injected
//! [`ChangeFeedClient`] that can open a table subscription, release it,
//! report on the session, and perform a cheap liveness read.
//!
//! Each opened subscription gets a [`FeedSink`]: the status and payload
//! callbacks, bound to one topic and one generation of that topic.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::errors::RealtimeResult;
use super::event::{ChangeEvent, ChannelStatus};

/// One logical feed: a topic name and the remote table it watches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedSpec {
    /// Stable bus topic (e.g. "leads")
    pub topic: String,

    /// Watched remote table
    pub source_table: String,

    /// Schema name (default: "public")
    #[serde(default = "default_schema")]
    pub schema: String,
}

fn default_schema() -> String {
    "public".to_string()
}

impl FeedSpec {
    /// Feed whose topic is the table name itself
    pub fn table(name: &str) -> Self {
        Self {
            topic: name.to_string(),
            source_table: name.to_string(),
            schema: default_schema(),
        }
    }

    /// Channel name in the `realtime:<schema>:<table>` convention
    pub fn channel_name(&self) -> String {
        format!("realtime:{}:{}", self.schema, self.source_table)
    }
}

/// Session as reported by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// A valid session exists
    Active,
    /// A session exists but its access token expired
    Expired,
    /// No session at all
    Absent,
}

/// Message from a sink to the supervisor's pump
#[derive(Debug)]
pub(crate) enum FeedSignal {
    Status {
        topic: String,
        generation: u64,
        status: ChannelStatus,
    },
    Change {
        topic: String,
        generation: u64,
        event: ChangeEvent,
    },
}

/// Status and payload callbacks for one opened subscription
///
/// Cheap to clone. Reports made after the supervisor shut down, or after
/// this subscription was torn down, are dropped.
#[derive(Debug, Clone)]
pub struct FeedSink {
    topic: String,
    generation: u64,
    subscription_id: Uuid,
    tx: mpsc::UnboundedSender<FeedSignal>,
}

impl FeedSink {
    pub(crate) fn new(
        topic: String,
        generation: u64,
        subscription_id: Uuid,
        tx: mpsc::UnboundedSender<FeedSignal>,
    ) -> Self {
        Self {
            topic,
            generation,
            subscription_id,
            tx,
        }
    }

    /// Report a channel status. Returns false if the supervisor is gone.
    pub fn status(&self, status: ChannelStatus) -> bool {
        self.tx
            .send(FeedSignal::Status {
                topic: self.topic.clone(),
                generation: self.generation,
                status,
            })
            .is_ok()
    }

    /// Deliver one change event. Returns false if the supervisor is gone.
    pub fn change(&self, event: ChangeEvent) -> bool {
        self.tx
            .send(FeedSignal::Change {
                topic: self.topic.clone(),
                generation: self.generation,
                event,
            })
            .is_ok()
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Unique id of this subscription instance
    pub fn subscription_id(&self) -> Uuid {
        self.subscription_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Change-feed client capability
///
/// `Handle` is owned exclusively by the supervisor and is handed back to
/// [`ChangeFeedClient::close`] exactly once.
#[async_trait]
pub trait ChangeFeedClient: Send + Sync + 'static {
    /// Opaque subscription resource
    type Handle: Send + 'static;

    /// Open a subscription to change events on `spec.source_table`.
    /// Status and payloads are reported through `sink`.
    async fn open(&self, spec: &FeedSpec, sink: FeedSink) -> RealtimeResult<Self::Handle>;

    /// Close and release a subscription
    async fn close(&self, handle: Self::Handle) -> RealtimeResult<()>;

    /// Current credential/session state
    async fn session_state(&self) -> RealtimeResult<SessionState>;

    /// Refresh an expired session
    async fn refresh_session(&self) -> RealtimeResult<()> {
        Ok(())
    }

    /// Minimal read against the backing store to validate liveness
    async fn probe(&self) -> RealtimeResult<()>;
}
