//! # Visibility Gate
//!
//! Tracks whether the host document is foregrounded.
//!
//! The boolean always follows the host signal. Only *reactions* are
//! debounced: a flip within the debounce window of the last accepted
//! transition is reported as [`VisibilityTransition::Debounced`] so rapid
//! tab switching does not trigger a resubscribe storm.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

/// Result of recording one visibility signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisibilityTransition {
    /// Genuine transition to foreground
    Foregrounded,
    /// Genuine transition to background
    Backgrounded,
    /// Flip inside the debounce window
    Debounced,
    /// Same value as before
    Unchanged,
}

#[derive(Debug)]
struct GateState {
    visible: bool,
    last_change: Option<Instant>,
}

/// Shared foreground/background flag with change notification
#[derive(Debug)]
pub struct VisibilityGate {
    state: Mutex<GateState>,
    debounce: Duration,
    notify: watch::Sender<bool>,
}

impl Default for VisibilityGate {
    fn default() -> Self {
        Self::new(true, Duration::from_secs(1))
    }
}

impl VisibilityGate {
    pub fn new(initially_visible: bool, debounce: Duration) -> Self {
        let (notify, _) = watch::channel(initially_visible);
        Self {
            state: Mutex::new(GateState {
                visible: initially_visible,
                last_change: None,
            }),
            debounce,
            notify,
        }
    }

    /// Whether the document is currently foregrounded
    pub fn is_visible(&self) -> bool {
        self.state.lock().map(|s| s.visible).unwrap_or(true)
    }

    /// Receiver that observes every change of the flag
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.notify.subscribe()
    }

    /// Instant of the last accepted (non-debounced) transition
    pub fn last_change(&self) -> Option<Instant> {
        self.state.lock().ok().and_then(|s| s.last_change)
    }

    pub fn debounce_window(&self) -> Duration {
        self.debounce
    }

    /// Record a host visibility signal observed now
    pub fn record(&self, visible: bool) -> VisibilityTransition {
        self.record_at(visible, Instant::now())
    }

    /// Record a host visibility signal observed at `now`
    pub fn record_at(&self, visible: bool, now: Instant) -> VisibilityTransition {
        let transition = {
            let Ok(mut state) = self.state.lock() else {
                return VisibilityTransition::Unchanged;
            };
            if state.visible == visible {
                return VisibilityTransition::Unchanged;
            }
            state.visible = visible;

            let within_window = state
                .last_change
                .is_some_and(|last| now.saturating_duration_since(last) < self.debounce);
            if within_window {
                VisibilityTransition::Debounced
            } else {
                state.last_change = Some(now);
                if visible {
                    VisibilityTransition::Foregrounded
                } else {
                    VisibilityTransition::Backgrounded
                }
            }
        };

        self.notify.send_replace(visible);
        transition
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(1);

    #[test]
    fn test_same_value_is_unchanged() {
        let gate = VisibilityGate::new(true, WINDOW);
        assert_eq!(gate.record(true), VisibilityTransition::Unchanged);
        assert!(gate.last_change().is_none());
    }

    #[test]
    fn test_genuine_transitions() {
        let gate = VisibilityGate::new(true, WINDOW);
        let t0 = Instant::now();

        assert_eq!(gate.record_at(false, t0), VisibilityTransition::Backgrounded);
        assert!(!gate.is_visible());

        let t1 = t0 + Duration::from_secs(5);
        assert_eq!(gate.record_at(true, t1), VisibilityTransition::Foregrounded);
        assert!(gate.is_visible());
        assert_eq!(gate.last_change(), Some(t1));
    }

    #[test]
    fn test_rapid_flips_are_debounced() {
        let gate = VisibilityGate::new(false, WINDOW);
        let t0 = Instant::now();

        assert_eq!(gate.record_at(true, t0), VisibilityTransition::Foregrounded);
        assert_eq!(
            gate.record_at(false, t0 + Duration::from_millis(300)),
            VisibilityTransition::Debounced
        );
        assert_eq!(
            gate.record_at(true, t0 + Duration::from_millis(600)),
            VisibilityTransition::Debounced
        );
        // Flag still follows the host
        assert!(gate.is_visible());
        // Window is measured from the last accepted transition
        assert_eq!(gate.last_change(), Some(t0));

        assert_eq!(
            gate.record_at(false, t0 + Duration::from_millis(1500)),
            VisibilityTransition::Backgrounded
        );
    }

    #[tokio::test]
    async fn test_watch_sees_changes() {
        let gate = VisibilityGate::new(true, WINDOW);
        let mut rx = gate.watch();

        gate.record(false);
        rx.changed().await.unwrap();
        assert!(!*rx.borrow());
    }
}
