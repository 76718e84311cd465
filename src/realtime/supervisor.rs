//! # Connection Supervisor
//!
//! Keeps one live subscription per configured feed and recovers them.
//!
//! ## Recovery paths
//!
//! - Channel failure (CLOSED / CHANNEL_ERROR / TIMED_OUT) and keepalive
//!   failure arm a backoff timer. When it fires, every handle is torn down,
//!   the session is checked, and every feed is reopened.
//! - Foregrounding, network-online, sign-in, token refresh and a manual
//!   refresh reset the attempt counter and resubscribe immediately.
//! - After `max_attempts` consecutive failures the supervisor stops and
//!   stays DEGRADED until one of the immediate triggers above.
//!
//! ## Concurrency
//!
//! All mutable state lives in one `Mutex` that is never held across an
//! `.await`. At most one reconnect cycle runs at a time: the `reconnecting`
//! flag is taken without waiting and a backoff request that finds it set
//! is dropped. An immediate trigger that finds it set is remembered and
//! runs once the cycle finishes. A started cycle is never cancelled, not
//! even by `shutdown()`, which waits for it instead.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use super::backoff::BackoffPolicy;
use super::bus::EventBus;
use super::config::RealtimeConfig;
use super::errors::RealtimeError;
use super::event::{ChangeEvent, ChannelStatus, ConnectionState};
use super::feed::{ChangeFeedClient, FeedSignal, FeedSink, FeedSpec, SessionState};
use super::signals::{AuthEvent, HostSignal, SignalHub};
use super::visibility::{VisibilityGate, VisibilityTransition};
use crate::observability::{
    log_event, log_event_with_fields, Event, Logger, MetricsRegistry, MetricsSnapshot,
};

/// What asked for an immediate resubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResubscribeTrigger {
    Foreground,
    NetworkOnline,
    SignedIn,
    TokenRefreshed,
    Manual,
}

impl ResubscribeTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResubscribeTrigger::Foreground => "foreground",
            ResubscribeTrigger::NetworkOnline => "network_online",
            ResubscribeTrigger::SignedIn => "signed_in",
            ResubscribeTrigger::TokenRefreshed => "token_refreshed",
            ResubscribeTrigger::Manual => "manual",
        }
    }
}

/// One recorded state change of a feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionRecord {
    pub topic: String,
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub at: DateTime<Utc>,
}

/// Diagnostic view of one feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeedSnapshot {
    pub topic: String,
    pub source_table: String,
    pub state: ConnectionState,
    pub has_handle: bool,
}

/// Diagnostic view of the supervisor
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SupervisorSnapshot {
    pub initialized: bool,
    pub session_active: bool,
    /// Consecutive failures counted toward the cap
    pub attempts: u32,
    /// Jittered delay of the most recently armed timer
    pub last_delay: Option<Duration>,
    /// A backoff timer is armed and has not started its cycle
    pub reconnect_pending: bool,
    /// A teardown/reopen cycle is running
    pub reconnect_in_flight: bool,
    pub degraded: bool,
    pub keepalive_running: bool,
    pub active_handles: usize,
    pub feeds: Vec<FeedSnapshot>,
    pub metrics: MetricsSnapshot,
}

struct FeedEntry<H> {
    spec: FeedSpec,
    state: ConnectionState,
    /// Generation of the handle currently held; reports from others are stale
    live_generation: Option<u64>,
    handle: Option<H>,
}

/// Timer or immediate cycle occupying the reconnect slot
struct ReconnectTask {
    id: u64,
    handle: JoinHandle<()>,
}

struct SupervisorState<H> {
    initialized: bool,
    session_active: bool,
    feeds: Vec<FeedEntry<H>>,
    attempts: u32,
    last_delay: Option<Duration>,
    reconnecting: bool,
    /// Immediate trigger that arrived while a cycle was running
    deferred_resubscribe: Option<ResubscribeTrigger>,
    degraded: bool,
    next_generation: u64,
    next_task_id: u64,
    reconnect_task: Option<ReconnectTask>,
    keepalive: Option<JoinHandle<()>>,
    pump: Option<JoinHandle<()>>,
    listeners: Vec<JoinHandle<()>>,
    signal_tx: Option<mpsc::UnboundedSender<FeedSignal>>,
    transitions: VecDeque<TransitionRecord>,
    history_limit: usize,
}

impl<H> SupervisorState<H> {
    fn feed_index(&self, topic: &str) -> Option<usize> {
        self.feeds.iter().position(|f| f.spec.topic == topic)
    }

    fn transition(&mut self, index: usize, to: ConnectionState) {
        let entry = &mut self.feeds[index];
        let from = entry.state;
        if from == to {
            return;
        }
        entry.state = to;

        let record = TransitionRecord {
            topic: entry.spec.topic.clone(),
            from,
            to,
            at: Utc::now(),
        };
        log_event_with_fields(
            Event::StateTransition,
            &[
                ("topic", record.topic.as_str()),
                ("from", from.as_str()),
                ("to", to.as_str()),
                ("at", &record.at.to_rfc3339()),
            ],
        );

        if self.history_limit == 0 {
            return;
        }
        if self.transitions.len() == self.history_limit {
            self.transitions.pop_front();
        }
        self.transitions.push_back(record);
    }

    fn any_feed_failed(&self) -> bool {
        self.feeds
            .iter()
            .any(|f| f.live_generation.is_some() && f.state.is_failed())
    }

    fn active_handles(&self) -> usize {
        self.feeds.iter().filter(|f| f.handle.is_some()).count()
    }
}

struct Inner<C: ChangeFeedClient> {
    config: RealtimeConfig,
    policy: BackoffPolicy,
    client: C,
    bus: Arc<EventBus>,
    visibility: Arc<VisibilityGate>,
    signals: SignalHub,
    metrics: Arc<MetricsRegistry>,
    rng: Mutex<StdRng>,
    state: Mutex<SupervisorState<C::Handle>>,
}

/// Builder for [`ConnectionSupervisor`]
pub struct SupervisorBuilder<C: ChangeFeedClient> {
    client: C,
    config: RealtimeConfig,
    bus: Option<Arc<EventBus>>,
    visibility: Option<Arc<VisibilityGate>>,
    signals: Option<SignalHub>,
    metrics: Option<Arc<MetricsRegistry>>,
    rng_seed: Option<u64>,
}

impl<C: ChangeFeedClient> SupervisorBuilder<C> {
    pub fn config(mut self, config: RealtimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Share an existing bus with UI consumers
    pub fn bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn visibility(mut self, visibility: Arc<VisibilityGate>) -> Self {
        self.visibility = Some(visibility);
        self
    }

    pub fn signals(mut self, signals: SignalHub) -> Self {
        self.signals = Some(signals);
        self
    }

    pub fn metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Deterministic jitter
    pub fn rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    pub fn build(self) -> ConnectionSupervisor<C> {
        let metrics = self
            .metrics
            .unwrap_or_else(|| Arc::new(MetricsRegistry::new()));
        let bus = self
            .bus
            .unwrap_or_else(|| Arc::new(EventBus::with_metrics(Arc::clone(&metrics))));
        let visibility = self.visibility.unwrap_or_else(|| {
            Arc::new(VisibilityGate::new(true, self.config.visibility_debounce()))
        });
        let rng = match self.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let feeds = self
            .config
            .feeds
            .iter()
            .map(|spec| FeedEntry {
                spec: spec.clone(),
                state: ConnectionState::Disconnected,
                live_generation: None,
                handle: None,
            })
            .collect();

        let state = SupervisorState {
            initialized: false,
            session_active: false,
            feeds,
            attempts: 0,
            last_delay: None,
            reconnecting: false,
            deferred_resubscribe: None,
            degraded: false,
            next_generation: 1,
            next_task_id: 1,
            reconnect_task: None,
            keepalive: None,
            pump: None,
            listeners: Vec::new(),
            signal_tx: None,
            transitions: VecDeque::new(),
            history_limit: self.config.transition_history,
        };

        ConnectionSupervisor {
            inner: Arc::new(Inner {
                policy: self.config.backoff_policy(),
                config: self.config,
                client: self.client,
                bus,
                visibility,
                signals: self.signals.unwrap_or_default(),
                metrics,
                rng: Mutex::new(rng),
                state: Mutex::new(state),
            }),
        }
    }
}

/// Long-lived realtime connection manager
///
/// Construct one at application startup and hand clones to whoever needs
/// it. Clones share the same state.
pub struct ConnectionSupervisor<C: ChangeFeedClient> {
    inner: Arc<Inner<C>>,
}

impl<C: ChangeFeedClient> Clone for ConnectionSupervisor<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: ChangeFeedClient> ConnectionSupervisor<C> {
    pub fn builder(client: C) -> SupervisorBuilder<C> {
        SupervisorBuilder {
            client,
            config: RealtimeConfig::default(),
            bus: None,
            visibility: None,
            signals: None,
            metrics: None,
            rng_seed: None,
        }
    }

    /// Supervisor with default bus, gate and signal hub
    pub fn new(config: RealtimeConfig, client: C) -> Self {
        Self::builder(client).config(config).build()
    }

    /// Open every feed and start keepalive and signal listeners.
    /// Repeated calls only log.
    pub async fn initialize(&self) {
        self.inner.initialize().await;
    }

    /// Cancel every timer and listener, then release every handle.
    /// Safe to call at any time, any number of times.
    pub async fn shutdown(&self) {
        self.inner.shutdown().await;
    }

    /// User-initiated refresh: resets the attempt counter, leaves
    /// DEGRADED, and resubscribes now.
    pub fn force_reconnect(&self) {
        self.inner.resubscribe_now(ResubscribeTrigger::Manual);
    }

    /// Feed a host signal directly instead of through the [`SignalHub`]
    pub async fn handle_host_signal(&self, signal: HostSignal) {
        self.inner.handle_host_signal(signal).await;
    }

    /// Feed an auth event directly instead of through the [`SignalHub`]
    pub async fn handle_auth_event(&self, event: AuthEvent) {
        self.inner.handle_auth_event(event).await;
    }

    pub fn snapshot(&self) -> SupervisorSnapshot {
        self.inner.snapshot()
    }

    /// Recorded state transitions, oldest first
    pub fn transitions(&self) -> Vec<TransitionRecord> {
        self.inner.lock().transitions.iter().cloned().collect()
    }

    pub fn state_of(&self, topic: &str) -> Option<ConnectionState> {
        let st = self.inner.lock();
        st.feed_index(topic).map(|i| st.feeds[i].state)
    }

    pub fn is_degraded(&self) -> bool {
        self.inner.lock().degraded
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.inner.bus
    }

    pub fn visibility(&self) -> &Arc<VisibilityGate> {
        &self.inner.visibility
    }

    pub fn signals(&self) -> &SignalHub {
        &self.inner.signals
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.inner.metrics
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.inner.config
    }

    pub fn client(&self) -> &C {
        &self.inner.client
    }
}

/// Clears the in-flight flag when a cycle ends, however it ends
struct CycleGuard<C: ChangeFeedClient> {
    inner: Arc<Inner<C>>,
    task_id: u64,
}

impl<C: ChangeFeedClient> Drop for CycleGuard<C> {
    fn drop(&mut self) {
        let mut st = self.inner.lock();
        st.reconnecting = false;
        if st.reconnect_task.as_ref().map(|t| t.id) == Some(self.task_id) {
            st.reconnect_task = None;
        }
    }
}

impl<C: ChangeFeedClient> Inner<C> {
    fn lock(&self) -> MutexGuard<'_, SupervisorState<C::Handle>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ==================
    // Lifecycle
    // ==================

    async fn initialize(self: &Arc<Self>) {
        {
            let mut st = self.lock();
            if st.initialized {
                log_event(Event::InitIgnored);
                return;
            }
            log_event_with_fields(
                Event::InitStart,
                &[("feeds", &st.feeds.len().to_string())],
            );
            st.initialized = true;
            st.session_active = true;
            st.attempts = 0;
            st.degraded = false;

            let (tx, rx) = mpsc::unbounded_channel();
            st.signal_tx = Some(tx);
            st.pump = Some(tokio::spawn(pump_loop(Arc::downgrade(self), rx)));

            let host_rx = self.signals.subscribe_host();
            let auth_rx = self.signals.subscribe_auth();
            st.listeners
                .push(tokio::spawn(host_loop(Arc::downgrade(self), host_rx)));
            st.listeners
                .push(tokio::spawn(auth_loop(Arc::downgrade(self), auth_rx)));

            self.ensure_keepalive(&mut st);
        }

        let failures = self.open_all().await;
        log_event_with_fields(
            Event::InitComplete,
            &[("open_failures", &failures.to_string())],
        );
        self.reschedule_if_failed();
    }

    async fn shutdown(self: &Arc<Self>) {
        let (was_initialized, in_flight, reconnect, mut timers, handles) = {
            let mut st = self.lock();
            let was_initialized = st.initialized;
            st.initialized = false;
            st.session_active = false;
            st.signal_tx = None;
            st.deferred_resubscribe = None;

            let in_flight = st.reconnecting;
            let reconnect = st.reconnect_task.take().map(|t| t.handle);
            let mut timers: Vec<JoinHandle<()>> = st.listeners.drain(..).collect();
            timers.extend(st.keepalive.take());
            timers.extend(st.pump.take());

            let handles = self.detach_handles(&mut st, true);
            (was_initialized, in_flight, reconnect, timers, handles)
        };

        log_event_with_fields(
            Event::ShutdownStart,
            &[("was_initialized", if was_initialized { "true" } else { "false" })],
        );

        // A started cycle runs to completion; it releases what it opens.
        let cycle = match reconnect {
            Some(task) if in_flight => Some(task),
            Some(task) => {
                timers.push(task);
                None
            }
            None => None,
        };
        for task in &timers {
            task.abort();
        }
        for task in timers {
            let _ = task.await;
        }
        if let Some(cycle) = cycle {
            let _ = cycle.await;
        }

        self.release_all(handles).await;
        log_event(Event::ShutdownComplete);
    }

    // ==================
    // Opening and teardown
    // ==================

    /// Open one subscription per feed. Returns how many opens failed outright.
    async fn open_all(self: &Arc<Self>) -> usize {
        let (plan, tx) = {
            let mut st = self.lock();
            if !st.initialized || !st.session_active {
                return 0;
            }
            let Some(tx) = st.signal_tx.clone() else {
                return 0;
            };

            let mut plan = Vec::with_capacity(st.feeds.len());
            for index in 0..st.feeds.len() {
                let generation = st.next_generation;
                st.next_generation += 1;
                st.feeds[index].live_generation = Some(generation);
                st.transition(index, ConnectionState::Subscribing);
                plan.push((st.feeds[index].spec.clone(), generation));
            }
            (plan, tx)
        };

        let mut failures = 0;
        for (spec, generation) in plan {
            let sink = FeedSink::new(spec.topic.clone(), generation, Uuid::new_v4(), tx.clone());
            match self.client.open(&spec, sink).await {
                Ok(handle) => {
                    self.metrics.increment_feeds_opened();
                    let orphan = {
                        let mut st = self.lock();
                        match st.feed_index(&spec.topic) {
                            Some(index)
                                if st.initialized
                                    && st.session_active
                                    && st.feeds[index].live_generation == Some(generation) =>
                            {
                                st.feeds[index].handle.replace(handle)
                            }
                            _ => Some(handle),
                        }
                    };
                    // Superseded while opening, or torn down by shutdown/sign-out.
                    if let Some(orphan) = orphan {
                        self.release(&spec.topic, orphan).await;
                    }
                }
                Err(err) => {
                    failures += 1;
                    self.metrics.increment_open_failures();
                    log_event_with_fields(
                        Event::ChannelOpenFailed,
                        &[
                            ("topic", spec.topic.as_str()),
                            ("code", err.code()),
                            ("error", &err.to_string()),
                        ],
                    );
                    let mut st = self.lock();
                    if let Some(index) = st.feed_index(&spec.topic) {
                        if st.feeds[index].live_generation == Some(generation) {
                            st.transition(index, ConnectionState::Errored);
                        }
                    }
                }
            }
        }
        failures
    }

    /// Take every handle out of the state. Reports from them become stale.
    fn detach_handles(
        &self,
        st: &mut SupervisorState<C::Handle>,
        mark_disconnected: bool,
    ) -> Vec<(String, C::Handle)> {
        let mut handles = Vec::new();
        for index in 0..st.feeds.len() {
            st.feeds[index].live_generation = None;
            if let Some(handle) = st.feeds[index].handle.take() {
                handles.push((st.feeds[index].spec.topic.clone(), handle));
            }
            if mark_disconnected {
                st.transition(index, ConnectionState::Disconnected);
            }
        }
        handles
    }

    async fn teardown_all(self: &Arc<Self>, mark_disconnected: bool) {
        let handles = {
            let mut st = self.lock();
            self.detach_handles(&mut st, mark_disconnected)
        };
        self.release_all(handles).await;
    }

    async fn release_all(&self, handles: Vec<(String, C::Handle)>) {
        join_all(
            handles
                .into_iter()
                .map(|(topic, handle)| async move { self.release(&topic, handle).await }),
        )
        .await;
    }

    async fn release(&self, topic: &str, handle: C::Handle) {
        if let Err(err) = self.client.close(handle).await {
            log_event_with_fields(
                Event::ChannelReleaseFailed,
                &[("topic", topic), ("error", &err.to_string())],
            );
        }
        self.metrics.increment_feeds_released();
    }

    // ==================
    // Feed signals
    // ==================

    fn on_status(self: &Arc<Self>, topic: &str, generation: u64, status: ChannelStatus) {
        {
            let mut st = self.lock();
            if !st.initialized {
                return;
            }
            let Some(index) = st.feed_index(topic) else {
                return;
            };
            if st.feeds[index].live_generation != Some(generation) {
                log_event_with_fields(
                    Event::StaleStatusIgnored,
                    &[("topic", topic), ("status", status.as_str())],
                );
                return;
            }

            log_event_with_fields(
                Event::ChannelStatus,
                &[("topic", topic), ("status", status.as_str())],
            );

            match status.connection_state() {
                None => return,
                Some(ConnectionState::Subscribed) => {
                    st.transition(index, ConnectionState::Subscribed);
                    st.attempts = 0;
                    st.degraded = false;
                    return;
                }
                Some(failed) => st.transition(index, failed),
            }
        }
        self.schedule_reconnect();
    }

    fn on_change(&self, topic: &str, generation: u64, event: ChangeEvent) {
        {
            let st = self.lock();
            if !st.initialized {
                return;
            }
            let live = st
                .feed_index(topic)
                .and_then(|index| st.feeds[index].live_generation);
            if live != Some(generation) {
                Logger::trace(
                    "STALE_CHANGE_IGNORED",
                    &[("topic", topic), ("event_type", &event.event_type.to_string())],
                );
                return;
            }
        }
        let report = self.bus.publish(topic, &event);
        Logger::trace(
            "CHANGE_PUBLISHED",
            &[
                ("topic", topic),
                ("event_type", &event.event_type.to_string()),
                ("delivered", &report.delivered.to_string()),
            ],
        );
    }

    // ==================
    // Reconnect
    // ==================

    /// Arm the backoff timer unless a cycle or timer is already active or
    /// the attempt budget is spent.
    fn schedule_reconnect(self: &Arc<Self>) {
        let mut st = self.lock();
        if !st.initialized || !st.session_active {
            return;
        }
        if st.reconnecting || st.reconnect_task.is_some() {
            self.metrics.increment_reconnects_skipped();
            log_event_with_fields(
                Event::ReconnectSkipped,
                &[("in_flight", if st.reconnecting { "true" } else { "false" })],
            );
            return;
        }

        if self.policy.is_exhausted(st.attempts) {
            if !st.degraded {
                st.degraded = true;
                log_event_with_fields(
                    Event::ReconnectDegraded,
                    &[("attempts", &st.attempts.to_string())],
                );
            }
            for index in 0..st.feeds.len() {
                if st.feeds[index].state.is_failed() {
                    st.transition(index, ConnectionState::Degraded);
                }
            }
            return;
        }

        let delay = {
            let mut rng = self.rng.lock().unwrap_or_else(|p| p.into_inner());
            self.policy.delay_for(st.attempts, &mut *rng)
        };
        st.attempts += 1;
        st.last_delay = Some(delay);
        for index in 0..st.feeds.len() {
            if st.feeds[index].state.is_failed() {
                st.transition(index, ConnectionState::BackoffWait);
            }
        }

        let id = st.next_task_id;
        st.next_task_id += 1;
        let inner = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.run_cycle(id).await;
        });
        st.reconnect_task = Some(ReconnectTask { id, handle });

        self.metrics.increment_reconnects_scheduled();
        log_event_with_fields(
            Event::ReconnectScheduled,
            &[
                ("attempt", &st.attempts.to_string()),
                ("delay_ms", &delay.as_millis().to_string()),
            ],
        );
    }

    /// Reset the counter and resubscribe without waiting. An armed backoff
    /// timer is cancelled. While a cycle is running the trigger is deferred
    /// until that cycle ends.
    fn resubscribe_now(self: &Arc<Self>, trigger: ResubscribeTrigger) {
        let mut st = self.lock();
        if !st.initialized || !st.session_active {
            return;
        }
        if st.reconnecting {
            // Runs once the current cycle releases the guard.
            st.deferred_resubscribe = Some(trigger);
            self.metrics.increment_reconnects_skipped();
            log_event_with_fields(
                Event::ReconnectSkipped,
                &[
                    ("trigger", trigger.as_str()),
                    ("in_flight", "true"),
                    ("deferred", "true"),
                ],
            );
            return;
        }

        st.attempts = 0;
        st.degraded = false;
        if let Some(pending) = st.reconnect_task.take() {
            pending.handle.abort();
        }

        let id = st.next_task_id;
        st.next_task_id += 1;
        let inner = Arc::clone(self);
        let handle = tokio::spawn(async move { inner.run_cycle(id).await });
        st.reconnect_task = Some(ReconnectTask { id, handle });

        log_event_with_fields(Event::ReconnectScheduled, &[("trigger", trigger.as_str())]);
    }

    async fn run_cycle(self: Arc<Self>, task_id: u64) {
        {
            let mut st = self.lock();
            let owns_slot = st.reconnect_task.as_ref().map(|t| t.id) == Some(task_id);
            if !owns_slot {
                return;
            }
            if !st.initialized || st.reconnecting {
                st.reconnect_task = None;
                return;
            }
            st.reconnecting = true;
        }
        let guard = CycleGuard {
            inner: Arc::clone(&self),
            task_id,
        };

        self.metrics.increment_reconnect_cycles();
        log_event(Event::ReconnectStart);

        self.teardown_all(false).await;
        self.verify_session().await;
        let failures = self.open_all().await;

        log_event_with_fields(
            Event::ReconnectComplete,
            &[("open_failures", &failures.to_string())],
        );
        drop(guard);

        // A trigger that arrived mid-cycle (sign-in after a sign-out, say)
        // may have seen its feeds released by this cycle.
        let deferred = self.lock().deferred_resubscribe.take();
        match deferred {
            Some(trigger) => self.resubscribe_now(trigger),
            // Failures reported while the guard was held were dropped; retry them now.
            None => self.reschedule_if_failed(),
        }
    }

    fn reschedule_if_failed(self: &Arc<Self>) {
        let failed = self.lock().any_feed_failed();
        if failed {
            self.schedule_reconnect();
        }
    }

    async fn verify_session(&self) {
        match self.client.session_state().await {
            Ok(SessionState::Active) | Ok(SessionState::Absent) => {}
            Ok(SessionState::Expired) => {
                if let Err(err) = self.client.refresh_session().await {
                    log_event_with_fields(
                        Event::SessionCheckFailed,
                        &[("code", err.code()), ("error", &err.to_string())],
                    );
                }
            }
            Err(err) => {
                log_event_with_fields(
                    Event::SessionCheckFailed,
                    &[("code", err.code()), ("error", &err.to_string())],
                );
            }
        }
    }

    // ==================
    // Keepalive
    // ==================

    fn ensure_keepalive(self: &Arc<Self>, st: &mut SupervisorState<C::Handle>) {
        let running = st.keepalive.as_ref().is_some_and(|k| !k.is_finished());
        if !running && st.initialized {
            st.keepalive = Some(tokio::spawn(keepalive_loop(
                Arc::downgrade(self),
                self.config.keepalive_interval(),
            )));
        }
    }

    async fn keepalive(self: &Arc<Self>) {
        {
            let st = self.lock();
            if !st.initialized || !st.session_active {
                return;
            }
        }

        let budget = self.config.probe_timeout();
        let outcome = match tokio::time::timeout(budget, self.client.probe()).await {
            Ok(result) => result,
            Err(_) => Err(RealtimeError::ChannelTimeout(format!(
                "probe gave no answer within {}ms",
                budget.as_millis()
            ))),
        };

        match outcome {
            Ok(()) => log_event(Event::KeepaliveOk),
            Err(err) => {
                self.metrics.increment_keepalive_failures();
                log_event_with_fields(
                    Event::KeepaliveFailed,
                    &[("code", err.code()), ("error", &err.to_string())],
                );
                self.schedule_reconnect();
            }
        }
    }

    // ==================
    // Host and auth signals
    // ==================

    async fn handle_host_signal(self: &Arc<Self>, signal: HostSignal) {
        match signal {
            HostSignal::VisibilityChanged { visible } => {
                match self.visibility.record(visible) {
                    VisibilityTransition::Foregrounded => {
                        log_event_with_fields(Event::VisibilityChanged, &[("visible", "true")]);
                        self.resubscribe_now(ResubscribeTrigger::Foreground);
                    }
                    VisibilityTransition::Backgrounded => {
                        log_event_with_fields(Event::VisibilityChanged, &[("visible", "false")]);
                    }
                    VisibilityTransition::Debounced => {
                        log_event_with_fields(
                            Event::VisibilityDebounced,
                            &[("visible", if visible { "true" } else { "false" })],
                        );
                    }
                    VisibilityTransition::Unchanged => {}
                }
            }
            HostSignal::Online => {
                log_event(Event::NetworkOnline);
                self.resubscribe_now(ResubscribeTrigger::NetworkOnline);
            }
            HostSignal::Offline => log_event(Event::NetworkOffline),
            HostSignal::Unload => {
                log_event(Event::Unload);
                // Shutdown awaits the listener tasks, including the caller's.
                let inner = Arc::clone(self);
                tokio::spawn(async move { inner.shutdown().await });
            }
        }
    }

    async fn handle_auth_event(self: &Arc<Self>, event: AuthEvent) {
        let trigger = match event {
            AuthEvent::SignedIn => ResubscribeTrigger::SignedIn,
            AuthEvent::TokenRefreshed => ResubscribeTrigger::TokenRefreshed,
            AuthEvent::SignedOut => {
                self.on_signed_out().await;
                return;
            }
            AuthEvent::Other(_) => return,
        };

        {
            let mut st = self.lock();
            if !st.initialized {
                return;
            }
            log_event_with_fields(Event::AuthEvent, &[("event", event.as_str())]);
            st.session_active = true;
            self.ensure_keepalive(&mut st);
        }
        self.resubscribe_now(trigger);
    }

    async fn on_signed_out(self: &Arc<Self>) {
        let handles = {
            let mut st = self.lock();
            if !st.initialized {
                return;
            }
            log_event_with_fields(Event::AuthEvent, &[("event", "SIGNED_OUT")]);
            st.session_active = false;
            st.deferred_resubscribe = None;
            if !st.reconnecting {
                if let Some(pending) = st.reconnect_task.take() {
                    pending.handle.abort();
                }
            }
            if let Some(keepalive) = st.keepalive.take() {
                keepalive.abort();
            }
            self.detach_handles(&mut st, true)
        };
        self.release_all(handles).await;
    }

    // ==================
    // Diagnostics
    // ==================

    fn snapshot(&self) -> SupervisorSnapshot {
        let st = self.lock();
        SupervisorSnapshot {
            initialized: st.initialized,
            session_active: st.session_active,
            attempts: st.attempts,
            last_delay: st.last_delay,
            reconnect_pending: st.reconnect_task.is_some() && !st.reconnecting,
            reconnect_in_flight: st.reconnecting,
            degraded: st.degraded,
            keepalive_running: st.keepalive.as_ref().is_some_and(|k| !k.is_finished()),
            active_handles: st.active_handles(),
            feeds: st
                .feeds
                .iter()
                .map(|f| FeedSnapshot {
                    topic: f.spec.topic.clone(),
                    source_table: f.spec.source_table.clone(),
                    state: f.state,
                    has_handle: f.handle.is_some(),
                })
                .collect(),
            metrics: self.metrics.snapshot(),
        }
    }
}

// ==================
// Background tasks
// ==================
//
// Long-lived tasks hold a `Weak` so a supervisor dropped without
// `shutdown()` does not keep itself alive through its own tasks.

async fn pump_loop<C: ChangeFeedClient>(
    inner: Weak<Inner<C>>,
    mut rx: mpsc::UnboundedReceiver<FeedSignal>,
) {
    while let Some(signal) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match signal {
            FeedSignal::Status {
                topic,
                generation,
                status,
            } => inner.on_status(&topic, generation, status),
            FeedSignal::Change {
                topic,
                generation,
                event,
            } => inner.on_change(&topic, generation, event),
        }
    }
}

async fn keepalive_loop<C: ChangeFeedClient>(inner: Weak<Inner<C>>, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.keepalive().await;
    }
}

async fn host_loop<C: ChangeFeedClient>(
    inner: Weak<Inner<C>>,
    mut rx: broadcast::Receiver<HostSignal>,
) {
    loop {
        match rx.recv().await {
            Ok(signal) => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                inner.handle_host_signal(signal).await;
            }
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn auth_loop<C: ChangeFeedClient>(
    inner: Weak<Inner<C>>,
    mut rx: broadcast::Receiver<AuthEvent>,
) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                inner.handle_auth_event(event).await;
            }
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::errors::RealtimeResult;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Client that accepts every open and reports SUBSCRIBED immediately
    #[derive(Default)]
    struct StubClient {
        opened: AtomicUsize,
        closed: AtomicUsize,
        refuse_opens: AtomicBool,
        sinks: Mutex<Vec<FeedSink>>,
    }

    #[async_trait]
    impl ChangeFeedClient for StubClient {
        type Handle = u64;

        async fn open(&self, spec: &FeedSpec, sink: FeedSink) -> RealtimeResult<u64> {
            if self.refuse_opens.load(Ordering::SeqCst) {
                return Err(RealtimeError::ChannelFailed {
                    topic: spec.topic.clone(),
                    message: "refused".into(),
                });
            }
            sink.status(ChannelStatus::Subscribed);
            let generation = sink.generation();
            self.sinks.lock().unwrap().push(sink);
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(generation)
        }

        async fn close(&self, _handle: u64) -> RealtimeResult<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn session_state(&self) -> RealtimeResult<SessionState> {
            Ok(SessionState::Active)
        }

        async fn probe(&self) -> RealtimeResult<()> {
            Ok(())
        }
    }

    fn feed_config(topics: &[&str]) -> RealtimeConfig {
        RealtimeConfig {
            feeds: topics.iter().map(|t| FeedSpec::table(t)).collect(),
            ..RealtimeConfig::default()
        }
    }

    fn stub_supervisor(topics: &[&str]) -> ConnectionSupervisor<StubClient> {
        ConnectionSupervisor::new(feed_config(topics), StubClient::default())
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_trigger_names() {
        assert_eq!(ResubscribeTrigger::Foreground.as_str(), "foreground");
        assert_eq!(ResubscribeTrigger::Manual.as_str(), "manual");
    }

    #[test]
    fn test_history_is_bounded() {
        let mut st: SupervisorState<u64> = SupervisorState {
            initialized: true,
            session_active: true,
            feeds: vec![FeedEntry {
                spec: FeedSpec::table("leads"),
                state: ConnectionState::Disconnected,
                live_generation: None,
                handle: None,
            }],
            attempts: 0,
            last_delay: None,
            reconnecting: false,
            deferred_resubscribe: None,
            degraded: false,
            next_generation: 1,
            next_task_id: 1,
            reconnect_task: None,
            keepalive: None,
            pump: None,
            listeners: Vec::new(),
            signal_tx: None,
            transitions: VecDeque::new(),
            history_limit: 2,
        };

        st.transition(0, ConnectionState::Subscribing);
        st.transition(0, ConnectionState::Subscribing);
        st.transition(0, ConnectionState::Subscribed);
        st.transition(0, ConnectionState::Errored);

        let kept: Vec<_> = st.transitions.iter().map(|t| t.to).collect();
        assert_eq!(
            kept,
            vec![ConnectionState::Subscribed, ConnectionState::Errored]
        );
    }

    #[tokio::test]
    async fn test_snapshot_before_initialize() {
        let sup = stub_supervisor(&["leads", "services"]);
        let snap = sup.snapshot();

        assert!(!snap.initialized);
        assert_eq!(snap.active_handles, 0);
        assert_eq!(snap.feeds.len(), 2);
        assert!(snap
            .feeds
            .iter()
            .all(|f| f.state == ConnectionState::Disconnected));
    }

    #[tokio::test]
    async fn test_initialize_twice_opens_once() {
        let sup = stub_supervisor(&["leads", "services"]);

        sup.initialize().await;
        sup.initialize().await;
        settle().await;

        assert_eq!(sup.client().opened.load(Ordering::SeqCst), 2);
        assert_eq!(sup.state_of("leads"), Some(ConnectionState::Subscribed));
        assert_eq!(sup.snapshot().active_handles, 2);

        sup.shutdown().await;
        assert_eq!(sup.client().closed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_stale_generation_is_ignored() {
        let sup = stub_supervisor(&["leads"]);
        sup.initialize().await;
        settle().await;

        let old_sink = sup.client().sinks.lock().unwrap()[0].clone();
        sup.force_reconnect();
        settle().await;
        assert_eq!(sup.client().opened.load(Ordering::SeqCst), 2);

        // The first subscription was torn down; its error must not count.
        old_sink.status(ChannelStatus::ChannelError);
        settle().await;

        let snap = sup.snapshot();
        assert_eq!(snap.attempts, 0);
        assert!(!snap.reconnect_pending);
        assert_eq!(sup.state_of("leads"), Some(ConnectionState::Subscribed));

        sup.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_outright_open_failure_schedules_reconnect() {
        let client = StubClient::default();
        client.refuse_opens.store(true, Ordering::SeqCst);
        let sup = ConnectionSupervisor::builder(client)
            .config(feed_config(&["leads"]))
            .rng_seed(7)
            .build();

        sup.initialize().await;
        let snap = sup.snapshot();
        assert_eq!(snap.attempts, 1);
        assert!(snap.reconnect_pending);
        assert_eq!(snap.metrics.open_failures, 1);
        assert_eq!(sup.state_of("leads"), Some(ConnectionState::BackoffWait));

        sup.client().refuse_opens.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(2)).await;
        settle().await;

        assert_eq!(sup.state_of("leads"), Some(ConnectionState::Subscribed));
        assert_eq!(sup.snapshot().attempts, 0);

        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_without_initialize() {
        let sup = stub_supervisor(&["leads"]);
        sup.shutdown().await;
        sup.shutdown().await;
        assert!(!sup.snapshot().initialized);
        assert_eq!(sup.client().closed.load(Ordering::SeqCst), 0);
    }
}
