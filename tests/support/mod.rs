//! Shared test harness: a scriptable change-feed client.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crm_realtime::observability::Severity;
use crm_realtime::realtime::{
    ChangeEvent, ChangeFeedClient, ChannelStatus, FeedSink, FeedSpec, RealtimeConfig,
    RealtimeError, RealtimeResult, SessionState,
};

/// How the mock answers `open`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Open succeeds and reports SUBSCRIBED
    Subscribe,
    /// Open succeeds and reports CHANNEL_ERROR
    ReportError,
    /// Open fails outright
    Refuse,
}

/// In-memory change-feed client
pub struct MockFeedClient {
    mode: Mutex<OpenMode>,
    session: Mutex<SessionState>,
    probe_ok: AtomicBool,
    open_delay: Mutex<Duration>,
    next_handle: AtomicU64,
    opens: AtomicUsize,
    closes: AtomicUsize,
    refreshes: AtomicUsize,
    probes: AtomicUsize,
    /// Live handles and the sink each was opened with
    live: Mutex<HashMap<u64, FeedSink>>,
    /// Most recent sink per topic
    latest: Mutex<HashMap<String, FeedSink>>,
}

impl Default for MockFeedClient {
    fn default() -> Self {
        Self {
            mode: Mutex::new(OpenMode::Subscribe),
            session: Mutex::new(SessionState::Active),
            probe_ok: AtomicBool::new(true),
            open_delay: Mutex::new(Duration::ZERO),
            next_handle: AtomicU64::new(1),
            opens: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            refreshes: AtomicUsize::new(0),
            probes: AtomicUsize::new(0),
            live: Mutex::new(HashMap::new()),
            latest: Mutex::new(HashMap::new()),
        }
    }
}

impl MockFeedClient {
    pub fn set_mode(&self, mode: OpenMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn set_session(&self, state: SessionState) {
        *self.session.lock().unwrap() = state;
    }

    /// Make every `open` take `delay` before answering
    pub fn set_open_delay(&self, delay: Duration) {
        *self.open_delay.lock().unwrap() = delay;
    }

    pub fn set_probe_ok(&self, ok: bool) {
        self.probe_ok.store(ok, Ordering::SeqCst);
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    /// Handles opened and not yet closed
    pub fn live_handles(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    /// Sink of the most recent subscription on `topic`
    pub fn sink(&self, topic: &str) -> FeedSink {
        self.latest.lock().unwrap()[topic].clone()
    }

    /// Report a status on the most recent subscription of `topic`
    pub fn emit_status(&self, topic: &str, status: ChannelStatus) -> bool {
        self.sink(topic).status(status)
    }

    /// Deliver a change on the most recent subscription of `topic`
    pub fn emit_change(&self, topic: &str, event: ChangeEvent) -> bool {
        self.sink(topic).change(event)
    }
}

#[async_trait]
impl ChangeFeedClient for MockFeedClient {
    type Handle = u64;

    async fn open(&self, spec: &FeedSpec, sink: FeedSink) -> RealtimeResult<u64> {
        let delay = *self.open_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        let mode = *self.mode.lock().unwrap();
        if mode == OpenMode::Refuse {
            return Err(RealtimeError::ChannelFailed {
                topic: spec.topic.clone(),
                message: "connection refused".into(),
            });
        }

        let id = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.latest
            .lock()
            .unwrap()
            .insert(spec.topic.clone(), sink.clone());
        self.live.lock().unwrap().insert(id, sink.clone());

        match mode {
            OpenMode::Subscribe => sink.status(ChannelStatus::Subscribed),
            _ => sink.status(ChannelStatus::ChannelError),
        };
        Ok(id)
    }

    async fn close(&self, handle: u64) -> RealtimeResult<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        let sink = self.live.lock().unwrap().remove(&handle);
        // A real channel reports CLOSED while being removed.
        if let Some(sink) = sink {
            sink.status(ChannelStatus::Closed);
        }
        Ok(())
    }

    async fn session_state(&self) -> RealtimeResult<SessionState> {
        Ok(*self.session.lock().unwrap())
    }

    async fn refresh_session(&self) -> RealtimeResult<()> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        self.set_session(SessionState::Active);
        Ok(())
    }

    async fn probe(&self) -> RealtimeResult<()> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.probe_ok.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RealtimeError::ProbeFailed("liveness read failed".into()))
        }
    }
}

pub const CRM_TOPICS: [&str; 4] = ["leads", "services", "bookings", "assessments"];

/// Default config with keepalive pushed out of the way and quiet logs
pub fn test_config() -> RealtimeConfig {
    let config = RealtimeConfig {
        keepalive_interval_ms: 3_600_000,
        log_level: Severity::Error,
        ..RealtimeConfig::default()
    };
    config.apply_log_level();
    config
}

/// Let spawned tasks run until they block
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

/// Move paused time forward and let woken tasks run
pub async fn advance(by: Duration) {
    tokio::time::sleep(by).await;
    settle().await;
}
