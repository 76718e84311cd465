//! crm-realtime - realtime connection manager for the CRM dashboard
//!
//! Keeps live change-feed subscriptions for the dashboard's tables, recovers
//! them with bounded backoff, and delivers row changes to in-process
//! listeners.

pub mod observability;
pub mod realtime;

pub use realtime::{
    AuthEvent, ChangeEvent, ChangeFeedClient, ConnectionState, ConnectionSupervisor, EventBus,
    HostSignal, RealtimeConfig, RealtimeError, RealtimeResult, SignalHub, VisibilityGate,
};
