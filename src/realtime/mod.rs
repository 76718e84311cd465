//! # Realtime Connection Manager
//!
//! Keeps the dashboard's table change feeds alive and fans their events
//! out to UI listeners.
//!
//! ## Architecture
//!
//! - **Supervisor**: one subscription per feed, backoff, keepalive, and
//!   reactions to visibility/network/auth signals
//! - **Bus**: in-process topic fan-out with per-listener fault isolation
//! - **Visibility**: debounced foreground/background flag
//! - **Feed**: the change-feed client capability the supervisor drives

pub mod backoff;
pub mod bus;
pub mod config;
pub mod errors;
pub mod event;
pub mod feed;
pub mod signals;
pub mod supervisor;
pub mod visibility;

pub use backoff::{apply_jitter, backoff_delay, BackoffPolicy};
pub use bus::{DeliveryReport, EventBus, Listener, ListenerHandle};
pub use config::{RealtimeConfig, ReconnectConfig};
pub use errors::{RealtimeError, RealtimeResult};
pub use event::{ChangeEvent, ChannelStatus, ConnectionState, EventType};
pub use feed::{ChangeFeedClient, FeedSink, FeedSpec, SessionState};
pub use signals::{AuthEvent, HostSignal, SignalHub};
pub use supervisor::{
    ConnectionSupervisor, FeedSnapshot, ResubscribeTrigger, SupervisorBuilder,
    SupervisorSnapshot, TransitionRecord,
};
pub use visibility::{VisibilityGate, VisibilityTransition};
