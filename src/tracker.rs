//! Event buffer and dispatcher.
//!
//! `track` enriches and queues synchronously; `flush` snapshots the head of the queue and
//! hands it to the transport on a detached task. A failed batch is merged back by the
//! sequence numbers its events were queued under, ahead of whatever was tracked meanwhile,
//! so order is preserved across concurrent failures and nothing is sent twice.

use crate::config::{PathFilter, TrackingOptions};
use crate::dom::{element_metadata, element_path, ElementNode};
use crate::env::Environment;
use crate::error::ConfigError;
use crate::event::{encode_uri, EventDraft, EventType, Metadata, TrackEvent};
use crate::fingerprint::get_or_create_fingerprint;
use crate::ids::{DeviceFingerprint, SessionId};
use crate::log_bridge::Logger;
use crate::platform::detect_platform;
use crate::session::{create_or_reuse_session, update_activity};
use crate::transport::{DeliveryContext, Transport};
use once_cell::sync::Lazy;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use thiserror::Error;
use tokio::runtime::{Handle, Runtime};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Runtime for hosts that construct the tracker outside of a tokio context.
static FALLBACK_RUNTIME: Lazy<Option<Runtime>> = Lazy::new(|| {
    match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("site-tracker")
        .enable_all()
        .build()
    {
        Ok(rt) => Some(rt),
        Err(e) => {
            tracing::error!(error = %e, "failed to start tracking runtime");
            None
        }
    }
});

pub(crate) fn runtime_handle() -> Option<Handle> {
    Handle::try_current()
        .ok()
        .or_else(|| FALLBACK_RUNTIME.as_ref().map(|rt| rt.handle().clone()))
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackerState {
    Constructed,
    Running,
    Disposing,
    Disposed,
}

impl TrackerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => TrackerState::Constructed,
            1 => TrackerState::Running,
            2 => TrackerState::Disposing,
            _ => TrackerState::Disposed,
        }
    }
}

#[derive(Debug, Error)]
enum EnrichError {
    #[error("page path is empty")]
    EmptyPagePath,
    #[error("event type is empty")]
    EmptyEventType,
}

/// Pending events in tracking order, each tagged with the sequence number it was queued
/// under. Batches that fail out of order merge back by that number.
#[derive(Debug, Default)]
struct EventQueue {
    next_seq: u64,
    items: VecDeque<(u64, TrackEvent)>,
}

/// Events handed to one delivery.
#[derive(Debug)]
struct Batch {
    seqs: Vec<u64>,
    events: Vec<TrackEvent>,
}

impl EventQueue {
    /// Append and return the new length.
    fn push(&mut self, event: TrackEvent) -> usize {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.items.push_back((seq, event));
        self.items.len()
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn events(&self) -> impl Iterator<Item = &TrackEvent> {
        self.items.iter().map(|(_, e)| e)
    }

    /// Remove up to `max` events from the head.
    fn take(&mut self, max: usize) -> Option<Batch> {
        if self.items.is_empty() {
            return None;
        }
        let n = self.items.len().min(max);
        let (seqs, events) = self.items.drain(..n).unzip();
        Some(Batch { seqs, events })
    }

    /// Merge a batch back in. Both runs are sorted by sequence number.
    fn restore(&mut self, batch: Batch) {
        let mut failed = batch.seqs.into_iter().zip(batch.events).peekable();
        let mut merged = VecDeque::with_capacity(self.items.len() + failed.len());
        for item in self.items.drain(..) {
            while let Some(earlier) = failed.next_if(|(seq, _)| *seq < item.0) {
                merged.push_back(earlier);
            }
            merged.push_back(item);
        }
        merged.extend(failed);
        self.items = merged;
    }
}

/// Page currently open, baseline for the next page view duration.
#[derive(Debug)]
struct OpenPage {
    path: String,
    entered_at: u64,
}

struct Inner<T: Transport> {
    options: TrackingOptions,
    env: Arc<dyn Environment>,
    transport: Arc<T>,
    log: Logger,
    filter: PathFilter,
    session_id: SessionId,
    fingerprint: DeviceFingerprint,
    user_id: Mutex<Option<String>>,
    queue: Mutex<EventQueue>,
    page: Mutex<Option<OpenPage>>,
    state: AtomicU8,
    runtime: Option<Handle>,
    timer: Mutex<Option<JoinHandle<()>>>,
    in_flight: Mutex<Vec<JoinHandle<()>>>,
}

/// Client-side event tracker. Clones share one queue.
pub struct Tracker<T: Transport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for Tracker<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> Tracker<T> {
    /// Validate options, resolve identity and start the batch timer.
    ///
    /// The timer and deliveries run on the tokio runtime current at this call, or on a
    /// private fallback runtime when there is none.
    pub fn new(options: TrackingOptions, env: Arc<dyn Environment>, transport: T) -> Result<Self, ConfigError> {
        let options = options.validate()?;
        let filter = PathFilter::new(&options.exclude_paths)?;
        let log = Logger::new(options.debug, "[Tracker]");

        let fingerprint = get_or_create_fingerprint(env.as_ref(), &options.storage_keys.fingerprint, &log);
        let session_id = create_or_reuse_session(env.as_ref(), &options.storage_keys, &fingerprint, &log);

        let inner = Arc::new(Inner {
            options,
            env,
            transport: Arc::new(transport),
            log,
            filter,
            session_id: SessionId::new(session_id),
            fingerprint: DeviceFingerprint::new(fingerprint),
            user_id: Mutex::new(None),
            queue: Mutex::new(EventQueue::default()),
            page: Mutex::new(None),
            state: AtomicU8::new(TrackerState::Constructed as u8),
            runtime: runtime_handle(),
            timer: Mutex::new(None),
            in_flight: Mutex::new(Vec::new()),
        });
        inner.start_timer();
        inner.state.store(TrackerState::Running as u8, Ordering::SeqCst);
        inner.log.info(format_args!(
            "initialized session={} fingerprint={}",
            inner.session_id, inner.fingerprint
        ));
        Ok(Self { inner })
    }

    /// Enrich and queue an event. Never blocks and never fails.
    pub fn track(&self, draft: EventDraft) {
        self.inner.track(draft);
    }

    /// Hand up to `max_events_per_request` queued events to the transport. Returns the
    /// number of events handed over.
    pub fn flush(&self) -> usize {
        self.inner.flush()
    }

    /// Track a page view. `event_duration` is the time since the previous page view on
    /// this tracker, in whole seconds; absent on the first one.
    pub fn track_page_view(&self, path: &str, referrer: Option<&str>, extra: Option<Metadata>) {
        self.inner.track_page_view(path, referrer, extra);
    }

    pub fn track_click(&self, element: &ElementNode, path: &str) {
        self.inner.track_element(EventType::Click, element, path);
    }

    pub fn track_exposure(&self, element: &ElementNode, path: &str) {
        self.inner.track_element(EventType::Exposure, element, path);
    }

    /// Track an event with an arbitrary tag (`CUSTOM` when the tag is `"CUSTOM"`).
    pub fn track_custom(&self, name: &str, path: &str, metadata: Option<Metadata>) {
        let draft = EventDraft::custom(name, path).metadata(metadata.unwrap_or_default());
        self.inner.track(draft);
    }

    /// Override `user_id` for events tracked from now on.
    pub fn set_user_id(&self, user_id: impl Into<String>) {
        let user_id = user_id.into();
        self.inner.log.debug(format_args!("user id set to {user_id}"));
        *lock(&self.inner.user_id) = Some(user_id);
    }

    /// Emit the final page view, stop the timer and flush. Later calls do nothing.
    pub fn dispose(&self) {
        self.inner.dispose();
    }

    /// Wait for every delivery started so far, including requeues.
    pub async fn settle(&self) {
        loop {
            let pending: Vec<JoinHandle<()>> = std::mem::take(&mut *lock(&self.inner.in_flight));
            if pending.is_empty() {
                break;
            }
            for handle in pending {
                if let Err(e) = handle.await {
                    tracing::debug!(error = %e, "delivery task join failed");
                }
            }
        }
    }

    /// [`dispose`](Self::dispose) followed by [`settle`](Self::settle).
    pub async fn shutdown(&self) {
        self.dispose();
        self.settle().await;
    }

    /// Snapshot of the queue, oldest first.
    pub fn queued(&self) -> Vec<TrackEvent> {
        lock(&self.inner.queue).events().cloned().collect()
    }

    pub fn pending(&self) -> usize {
        lock(&self.inner.queue).len()
    }

    pub fn session_id(&self) -> &SessionId {
        &self.inner.session_id
    }

    pub fn device_fingerprint(&self) -> &DeviceFingerprint {
        &self.inner.fingerprint
    }

    /// Identity attached as `user_id`: the override if set, else the device fingerprint.
    pub fn user_id(&self) -> String {
        self.inner.user_id()
    }

    pub fn state(&self) -> TrackerState {
        self.inner.state()
    }

    pub fn options(&self) -> &TrackingOptions {
        &self.inner.options
    }

    pub fn env(&self) -> &Arc<dyn Environment> {
        &self.inner.env
    }

    pub fn logger(&self) -> &Logger {
        &self.inner.log
    }

    pub fn drain_logs(&self) -> Vec<String> {
        self.inner.log.drain()
    }
}

impl<T: Transport> std::fmt::Debug for Tracker<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracker")
            .field("session_id", &self.inner.session_id)
            .field("state", &self.inner.state())
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

impl<T: Transport> Inner<T> {
    fn state(&self) -> TrackerState {
        TrackerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn user_id(&self) -> String {
        lock(&self.user_id)
            .clone()
            .unwrap_or_else(|| self.fingerprint.to_string())
    }

    fn start_timer(self: &Arc<Self>) {
        if !self.env.is_browser() {
            return;
        }
        let Some(handle) = &self.runtime else {
            self.log.error(format_args!("no async runtime, batch timer disabled"));
            return;
        };
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.options.interval();
        let task = handle.spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                if matches!(inner.state(), TrackerState::Disposing | TrackerState::Disposed) {
                    break;
                }
                if !lock(&inner.queue).is_empty() {
                    inner.flush();
                }
            }
        });
        *lock(&self.timer) = Some(task);
    }

    fn track(self: &Arc<Self>, draft: EventDraft) {
        if !self.env.is_browser() {
            return;
        }
        if self.state() == TrackerState::Disposed {
            self.log.debug(format_args!("tracker disposed, {} event ignored", draft.event_type));
            return;
        }

        update_activity(self.env.as_ref(), &self.options.storage_keys.session_data, &self.log);

        if !(self.env.random_f64() < self.options.sampling) {
            self.log.debug(format_args!("{} event dropped by sampling", draft.event_type));
            return;
        }
        if self.filter.is_excluded(&draft.page_path) {
            self.log.debug(format_args!("path {} excluded", draft.page_path));
            return;
        }

        let event = match self.enrich(&draft) {
            Ok(event) => event,
            Err(e) => {
                self.log.error(format_args!("failed to enrich {} event: {e}", draft.event_type));
                self.fallback_event(&draft, &e)
            }
        };

        let len = lock(&self.queue).push(event);
        self.log.debug(format_args!("{} event queued ({len} pending)", draft.event_type));

        if len >= self.options.batch_size {
            self.flush();
        }
    }

    fn enrich(&self, draft: &EventDraft) -> Result<TrackEvent, EnrichError> {
        if draft.event_type.as_str().trim().is_empty() {
            return Err(EnrichError::EmptyEventType);
        }
        if draft.page_path.trim().is_empty() {
            return Err(EnrichError::EmptyPagePath);
        }
        let now = self.env.now_ms();
        let mut metadata = draft.metadata.clone();
        metadata.insert("client_timestamp".into(), Value::from(now));
        Ok(TrackEvent {
            event_type: draft.event_type.clone(),
            page_path: encode_uri(&draft.page_path),
            session_id: self.session_id.to_string(),
            user_id: self.user_id(),
            timestamp: now,
            element_path: draft.element_path.clone(),
            referrer: draft.referrer.clone(),
            platform: Some(
                draft
                    .platform
                    .clone()
                    .unwrap_or_else(|| detect_platform(self.env.as_ref())),
            ),
            event_duration: draft.event_duration,
            metadata,
        })
    }

    /// Minimal event kept when enrichment fails.
    fn fallback_event(&self, draft: &EventDraft, error: &EnrichError) -> TrackEvent {
        let event_type = match error {
            EnrichError::EmptyEventType => EventType::Custom,
            EnrichError::EmptyPagePath => draft.event_type.clone(),
        };
        let page_path = match error {
            EnrichError::EmptyPagePath => {
                let current = self.env.document().pathname;
                if current.trim().is_empty() {
                    "/".to_string()
                } else {
                    encode_uri(&current)
                }
            }
            EnrichError::EmptyEventType => encode_uri(&draft.page_path),
        };
        let mut metadata = Metadata::new();
        metadata.insert("enrichment_error".into(), Value::String(error.to_string()));
        TrackEvent {
            event_type,
            page_path,
            session_id: self.session_id.to_string(),
            user_id: self.user_id(),
            timestamp: self.env.now_ms(),
            element_path: None,
            referrer: None,
            platform: None,
            event_duration: None,
            metadata,
        }
    }

    fn flush(self: &Arc<Self>) -> usize {
        if !self.env.is_browser() {
            return 0;
        }
        let Some(batch) = lock(&self.queue).take(self.options.max_events_per_request) else {
            return 0;
        };
        let count = batch.events.len();

        let Some(handle) = &self.runtime else {
            self.log.error(format_args!("no async runtime, {count} events kept queued"));
            self.requeue(batch);
            return 0;
        };

        let context = DeliveryContext {
            session_id: self.session_id.clone(),
            device_fingerprint: self.fingerprint.clone(),
        };
        let inner = Arc::clone(self);
        let transport = Arc::clone(&self.transport);
        let task = handle.spawn(async move {
            match transport.send(&batch.events, &context).await {
                Ok(()) => inner.log.debug(format_args!("sent {count} events")),
                Err(e) => {
                    inner.log.error(format_args!("failed to send {count} events: {e}"));
                    inner.requeue(batch);
                }
            }
        });

        let mut in_flight = lock(&self.in_flight);
        in_flight.retain(|h| !h.is_finished());
        in_flight.push(task);
        count
    }

    /// Put a failed batch back ahead of events queued since it was taken.
    fn requeue(&self, batch: Batch) {
        lock(&self.queue).restore(batch);
    }

    fn track_page_view(self: &Arc<Self>, path: &str, referrer: Option<&str>, extra: Option<Metadata>) {
        if !self.env.is_browser() || self.state() == TrackerState::Disposed {
            return;
        }
        let now = self.env.now_ms();
        let encoded_path = encode_uri(path);
        let previous = lock(&self.page).replace(OpenPage {
            path: encoded_path.clone(),
            entered_at: now,
        });

        let doc = self.env.document();
        let referrer = referrer.map(str::to_string).unwrap_or(doc.referrer);
        let mut draft = EventDraft::pageview(encoded_path)
            .meta("title", doc.title)
            .meta("url", doc.url);
        if !referrer.is_empty() {
            draft = draft.referrer(encode_uri(&referrer));
        }
        if let Some(previous) = previous {
            draft = draft.duration(now.saturating_sub(previous.entered_at) / 1000);
        }
        if let Some(extra) = extra {
            draft = draft.metadata(extra);
        }
        self.track(draft);
    }

    fn track_element(self: &Arc<Self>, event_type: EventType, element: &ElementNode, path: &str) {
        if !self.env.is_browser() {
            return;
        }
        let draft = EventDraft::new(event_type, path)
            .element_path(element_path(element))
            .metadata(element_metadata(element));
        self.track(draft);
    }

    fn dispose(self: &Arc<Self>) {
        if self
            .state
            .compare_exchange(
                TrackerState::Running as u8,
                TrackerState::Disposing as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            self.log.debug(format_args!("dispose called again, ignored"));
            return;
        }

        if let Some(task) = lock(&self.timer).take() {
            task.abort();
        }

        if self.env.is_browser() {
            // Taking the page clears the duration baseline.
            let open = lock(&self.page).take();
            if let Some(page) = open {
                let now = self.env.now_ms();
                let doc = self.env.document();
                let draft = EventDraft::pageview(page.path)
                    .duration(now.saturating_sub(page.entered_at) / 1000)
                    .meta("title", doc.title)
                    .meta("url", doc.url)
                    .meta("is_last_page", true);
                self.track(draft);
            }
            // Only what is queued now; a batch that fails meanwhile is requeued, not resent.
            let mut remaining = lock(&self.queue).len();
            while remaining > 0 {
                let sent = self.flush();
                if sent == 0 {
                    break;
                }
                remaining = remaining.saturating_sub(sent);
            }
        }

        self.state.store(TrackerState::Disposed as u8, Ordering::SeqCst);
        self.log.info(format_args!("disposed"));
    }
}

impl<T: Transport> Drop for Inner<T> {
    fn drop(&mut self) {
        if let Some(task) = self.timer.get_mut().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
    }
}
