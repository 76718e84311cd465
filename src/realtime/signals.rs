//! # Host and Auth Signals
//!
//! The host environment (document visibility, network, unload) and the auth
//! collaborator push their events through a [`SignalHub`]. The supervisor
//! subscribes while initialized and drops its receivers on shutdown.

use tokio::sync::broadcast;

/// Signal from the hosting environment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostSignal {
    /// Document visibility changed
    VisibilityChanged { visible: bool },
    /// Network came back
    Online,
    /// Network went away
    Offline,
    /// Page is being unloaded
    Unload,
}

/// Event from the auth collaborator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    SignedIn,
    TokenRefreshed,
    SignedOut,
    /// Anything else (user updated, password recovery, ...); ignored
    Other(String),
}

impl AuthEvent {
    /// Parse Supabase-style auth event names
    pub fn parse(raw: &str) -> Self {
        match raw {
            "SIGNED_IN" => AuthEvent::SignedIn,
            "TOKEN_REFRESHED" => AuthEvent::TokenRefreshed,
            "SIGNED_OUT" => AuthEvent::SignedOut,
            other => AuthEvent::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            AuthEvent::SignedIn => "SIGNED_IN",
            AuthEvent::TokenRefreshed => "TOKEN_REFRESHED",
            AuthEvent::SignedOut => "SIGNED_OUT",
            AuthEvent::Other(raw) => raw,
        }
    }
}

/// Fan-out point for host and auth signals
#[derive(Debug, Clone)]
pub struct SignalHub {
    host: broadcast::Sender<HostSignal>,
    auth: broadcast::Sender<AuthEvent>,
}

impl Default for SignalHub {
    fn default() -> Self {
        Self::new(64)
    }
}

impl SignalHub {
    pub fn new(capacity: usize) -> Self {
        let (host, _) = broadcast::channel(capacity.max(1));
        let (auth, _) = broadcast::channel(capacity.max(1));
        Self { host, auth }
    }

    /// Emit a host signal. Returns the number of receivers reached.
    pub fn emit_host(&self, signal: HostSignal) -> usize {
        self.host.send(signal).unwrap_or(0)
    }

    /// Emit an auth event. Returns the number of receivers reached.
    pub fn emit_auth(&self, event: AuthEvent) -> usize {
        self.auth.send(event).unwrap_or(0)
    }

    pub fn subscribe_host(&self) -> broadcast::Receiver<HostSignal> {
        self.host.subscribe()
    }

    pub fn subscribe_auth(&self) -> broadcast::Receiver<AuthEvent> {
        self.auth.subscribe()
    }

    /// Number of live host-signal receivers
    pub fn host_listener_count(&self) -> usize {
        self.host.receiver_count()
    }

    /// Number of live auth-event receivers
    pub fn auth_listener_count(&self) -> usize {
        self.auth.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_event_parse() {
        assert_eq!(AuthEvent::parse("SIGNED_IN"), AuthEvent::SignedIn);
        assert_eq!(AuthEvent::parse("TOKEN_REFRESHED"), AuthEvent::TokenRefreshed);
        assert_eq!(AuthEvent::parse("SIGNED_OUT"), AuthEvent::SignedOut);
        assert_eq!(
            AuthEvent::parse("USER_UPDATED"),
            AuthEvent::Other("USER_UPDATED".into())
        );
        assert_eq!(AuthEvent::parse("USER_UPDATED").as_str(), "USER_UPDATED");
    }

    #[test]
    fn test_emit_without_listeners() {
        let hub = SignalHub::default();
        assert_eq!(hub.emit_host(HostSignal::Online), 0);
        assert_eq!(hub.emit_auth(AuthEvent::SignedOut), 0);
    }

    #[tokio::test]
    async fn test_fan_out() {
        let hub = SignalHub::new(8);
        let mut host_rx = hub.subscribe_host();
        let mut auth_rx = hub.subscribe_auth();
        assert_eq!(hub.host_listener_count(), 1);

        hub.emit_host(HostSignal::VisibilityChanged { visible: false });
        hub.emit_auth(AuthEvent::TokenRefreshed);

        assert_eq!(
            host_rx.recv().await.unwrap(),
            HostSignal::VisibilityChanged { visible: false }
        );
        assert_eq!(auth_rx.recv().await.unwrap(), AuthEvent::TokenRefreshed);

        drop(host_rx);
        assert_eq!(hub.host_listener_count(), 0);
    }
}
