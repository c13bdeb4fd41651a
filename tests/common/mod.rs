//! Shared helpers: recording transport, test page environment, tracing setup.

use site_tracker::env::{FixedRandom, ManualClock};
use site_tracker::{
    DeliveryContext, DeliveryError, DeviceInfo, DocumentInfo, Environment, HostEnvironment,
    TrackEvent, Tracker, TrackingOptions, Transport,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use tokio::sync::Semaphore;

pub const START_MS: u64 = 1_700_000_000_000;

pub const CHROME_LINUX_UA: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
    (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
pub const EDGE_WINDOWS_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
    (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36 Edg/120.0.0.0";

static TRACING: Once = Once::new();

/// Install a `tracing` subscriber once per test binary, filtered by `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

#[derive(Default)]
struct Recorded {
    fail: AtomicBool,
    fail_next: AtomicUsize,
    attempts: AtomicUsize,
    batches: Mutex<Vec<Vec<TrackEvent>>>,
    contexts: Mutex<Vec<DeliveryContext>>,
}

/// Transport that records delivered batches. Clones share the record. Optionally fails
/// every send or the next few, or holds each send until a gate permit is added.
#[derive(Clone, Default)]
pub struct RecordingTransport {
    recorded: Arc<Recorded>,
    gate: Option<Arc<Semaphore>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let t = Self::default();
        t.set_failing(true);
        t
    }

    /// Every send waits for one permit on the returned semaphore.
    pub fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let t = Self {
            recorded: Arc::default(),
            gate: Some(Arc::clone(&gate)),
        };
        (t, gate)
    }

    pub fn set_failing(&self, fail: bool) {
        self.recorded.fail.store(fail, Ordering::SeqCst);
    }

    /// Fail the next `n` sends, then deliver again.
    pub fn fail_next(&self, n: usize) {
        self.recorded.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.recorded.attempts.load(Ordering::SeqCst)
    }

    pub fn batches(&self) -> Vec<Vec<TrackEvent>> {
        self.recorded.batches.lock().expect("batches").clone()
    }

    pub fn sent(&self) -> Vec<TrackEvent> {
        self.batches().into_iter().flatten().collect()
    }

    pub fn contexts(&self) -> Vec<DeliveryContext> {
        self.recorded.contexts.lock().expect("contexts").clone()
    }
}

impl Transport for RecordingTransport {
    async fn send(&self, events: &[TrackEvent], context: &DeliveryContext) -> Result<(), DeliveryError> {
        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("gate open").forget();
        }
        self.recorded.attempts.fetch_add(1, Ordering::SeqCst);
        let fail_next = self
            .recorded
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail_next || self.recorded.fail.load(Ordering::SeqCst) {
            return Err(DeliveryError::Status(503));
        }
        self.recorded.batches.lock().expect("batches").push(events.to_vec());
        self.recorded.contexts.lock().expect("contexts").push(context.clone());
        Ok(())
    }
}

/// A browser tab: device, document, hand-driven clock and constant randomness.
pub struct TestPage {
    pub env: Arc<HostEnvironment>,
    pub clock: ManualClock,
}

impl TestPage {
    pub fn new() -> Self {
        Self::with_env(HostEnvironment::new(device(CHROME_LINUX_UA)))
    }

    /// Wrap `env`, replacing its clock with a manual one and its randomness with 0.5.
    pub fn with_env(env: HostEnvironment) -> Self {
        init_tracing();
        let clock = ManualClock::new(START_MS);
        let env = env
            .with_clock(Arc::new(clock.clone()))
            .with_random(Arc::new(FixedRandom::unit(0.5)))
            .with_document(document("/"));
        Self {
            env: Arc::new(env),
            clock,
        }
    }

    pub fn env(&self) -> Arc<dyn Environment> {
        self.env.clone()
    }

    pub fn navigate_document(&self, path: &str) {
        self.env.set_document(document(path));
    }

    pub fn tracker<T: Transport>(&self, options: TrackingOptions, transport: T) -> Tracker<T> {
        Tracker::new(options, self.env(), transport).expect("tracker")
    }
}

pub fn device(user_agent: &str) -> DeviceInfo {
    DeviceInfo {
        user_agent: user_agent.to_string(),
        screen_width: 2560,
        screen_height: 1440,
        color_depth: 24,
        timezone_offset_minutes: -480,
        language: "zh-CN".into(),
        hardware_concurrency: 12,
        platform: "Linux x86_64".into(),
        cookie_enabled: true,
        ..DeviceInfo::default()
    }
}

pub fn document(path: &str) -> DocumentInfo {
    DocumentInfo {
        title: format!("blog {path}"),
        url: format!("https://blog.example{path}"),
        referrer: String::new(),
        pathname: path.to_string(),
    }
}

pub fn options() -> TrackingOptions {
    TrackingOptions::new("/api/tracking/batch")
}

pub fn paths(events: &[TrackEvent]) -> Vec<&str> {
    events.iter().map(|e| e.page_path.as_str()).collect()
}
