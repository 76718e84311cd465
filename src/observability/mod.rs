//! Observability for the realtime supervisor
//!
//! - Structured logging (JSON lines)
//! - Typed lifecycle events
//! - Counters
//!
//! Observability is diagnostic only: nothing here feeds back into
//! supervisor decisions, and a failed log write is silently dropped.
//!
//! # Usage
//!
//! ```ignore
//! use crm_realtime::observability::{log_event, log_event_with_fields, Event};
//!
//! log_event(Event::InitStart);
//! log_event_with_fields(Event::ReconnectScheduled, &[("attempt", "1"), ("delay_ms", "1180")]);
//! ```

mod events;
mod logger;
mod metrics;

pub use events::Event;
pub use logger::{Logger, Severity};
pub use metrics::{MetricsRegistry, MetricsSnapshot};

/// Log a lifecycle event at its default severity
pub fn log_event(event: Event) {
    Logger::log(event.severity(), event.as_str(), &[]);
}

/// Log a lifecycle event with fields at its default severity
pub fn log_event_with_fields(event: Event, fields: &[(&str, &str)]) {
    Logger::log(event.severity(), event.as_str(), fields);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_event() {
        log_event(Event::InitStart);
        log_event(Event::ShutdownComplete);
    }

    #[test]
    fn test_log_event_with_fields() {
        log_event_with_fields(
            Event::ChannelStatus,
            &[("topic", "leads"), ("status", "SUBSCRIBED")],
        );
    }
}
