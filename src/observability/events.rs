//! Observable supervisor events
//!
//! Every lifecycle step and state transition the supervisor logs has a
//! typed event here, so log consumers can match on stable names.

use std::fmt;

use super::logger::Severity;

/// Observable events of the realtime supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    // Lifecycle
    /// First `initialize()` call
    InitStart,
    /// All feeds opened (or scheduled for retry)
    InitComplete,
    /// Repeated `initialize()` call, ignored
    InitIgnored,
    /// `shutdown()` began
    ShutdownStart,
    /// `shutdown()` finished
    ShutdownComplete,
    /// Configuration loaded
    ConfigLoaded,

    // Feeds
    /// Per-topic state transition
    StateTransition,
    /// Raw status report from the client
    ChannelStatus,
    /// `open` failed outright
    ChannelOpenFailed,
    /// Handle release failed
    ChannelReleaseFailed,
    /// Status report from an already torn-down handle
    StaleStatusIgnored,

    // Reconnect
    /// Backoff timer armed
    ReconnectScheduled,
    /// Request dropped because a cycle or timer is active
    ReconnectSkipped,
    /// Teardown and reopen began
    ReconnectStart,
    /// Teardown and reopen finished
    ReconnectComplete,
    /// Attempt cap reached
    ReconnectDegraded,

    // Session
    /// Session check failed or session expired and refresh failed
    SessionCheckFailed,
    /// Auth collaborator event handled
    AuthEvent,

    // Keepalive
    /// Probe round-trip succeeded
    KeepaliveOk,
    /// Probe failed or timed out
    KeepaliveFailed,

    // Host
    /// Visibility signal handled
    VisibilityChanged,
    /// Visibility flip inside the debounce window
    VisibilityDebounced,
    /// Network came back
    NetworkOnline,
    /// Network went away
    NetworkOffline,
    /// Page unload teardown
    Unload,

    // Bus
    /// A local listener panicked
    ListenerFault,
}

impl Event {
    /// Returns the string representation of the event
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::InitStart => "REALTIME_INIT_BEGIN",
            Event::InitComplete => "REALTIME_INIT_COMPLETE",
            Event::InitIgnored => "REALTIME_INIT_IGNORED",
            Event::ShutdownStart => "REALTIME_SHUTDOWN_BEGIN",
            Event::ShutdownComplete => "REALTIME_SHUTDOWN_COMPLETE",
            Event::ConfigLoaded => "CONFIG_LOADED",

            Event::StateTransition => "FEED_STATE_TRANSITION",
            Event::ChannelStatus => "CHANNEL_STATUS",
            Event::ChannelOpenFailed => "CHANNEL_OPEN_FAILED",
            Event::ChannelReleaseFailed => "CHANNEL_RELEASE_FAILED",
            Event::StaleStatusIgnored => "CHANNEL_STALE_STATUS",

            Event::ReconnectScheduled => "RECONNECT_SCHEDULED",
            Event::ReconnectSkipped => "RECONNECT_SKIPPED",
            Event::ReconnectStart => "RECONNECT_BEGIN",
            Event::ReconnectComplete => "RECONNECT_COMPLETE",
            Event::ReconnectDegraded => "RECONNECT_DEGRADED",

            Event::SessionCheckFailed => "SESSION_CHECK_FAILED",
            Event::AuthEvent => "AUTH_EVENT",

            Event::KeepaliveOk => "KEEPALIVE_OK",
            Event::KeepaliveFailed => "KEEPALIVE_FAILED",

            Event::VisibilityChanged => "VISIBILITY_CHANGED",
            Event::VisibilityDebounced => "VISIBILITY_DEBOUNCED",
            Event::NetworkOnline => "NETWORK_ONLINE",
            Event::NetworkOffline => "NETWORK_OFFLINE",
            Event::Unload => "PAGE_UNLOAD",

            Event::ListenerFault => "LISTENER_FAULT",
        }
    }

    /// Default severity this event is logged at
    pub fn severity(&self) -> Severity {
        match self {
            Event::ReconnectDegraded | Event::ListenerFault => Severity::Error,
            Event::ChannelOpenFailed
            | Event::ChannelReleaseFailed
            | Event::SessionCheckFailed
            | Event::KeepaliveFailed
            | Event::NetworkOffline => Severity::Warn,
            Event::KeepaliveOk
            | Event::StaleStatusIgnored
            | Event::ReconnectSkipped
            | Event::VisibilityDebounced => Severity::Trace,
            _ => Severity::Info,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
