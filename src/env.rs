//! Environment capability injected into the tracker once, at construction: device
//! attributes, the current document, both storage scopes, time and randomness.
//!
//! A browser host bridges these to `navigator`, `screen`, `document`, `localStorage` and
//! `sessionStorage`. Native hosts and tests use [`HostEnvironment`]; server-side code
//! uses [`Headless`], which turns every tracker entry point into a no-op.

use crate::storage::{MemoryStorage, Storage};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

/// Attributes the device fingerprint and platform detection are derived from.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeviceInfo {
    pub user_agent: String,
    pub screen_width: u32,
    pub screen_height: u32,
    pub color_depth: u32,
    /// Minutes, with the sign convention of `Date.prototype.getTimezoneOffset` (UTC+8 is -480).
    pub timezone_offset_minutes: i32,
    pub language: String,
    pub hardware_concurrency: u32,
    pub platform: String,
    pub cookie_enabled: bool,
    pub do_not_track: Option<String>,
    pub vendor: String,
    pub max_touch_points: u32,
    pub device_memory: Option<f64>,
    pub connection_type: Option<String>,
}

impl DeviceInfo {
    /// Attributes of the running process, for native hosts.
    pub fn native() -> Self {
        let os = std::env::consts::OS;
        let arch = std::env::consts::ARCH;
        let os_token = match os {
            "windows" => "Windows NT 10.0",
            "macos" => "Macintosh; Intel Mac OS X",
            "linux" => "X11; Linux",
            "android" => "Linux; Android",
            "ios" => "iPhone; CPU iPhone OS",
            other => other,
        };
        let language = std::env::var("LANG")
            .ok()
            .and_then(|l| l.split('.').next().map(|s| s.replace('_', "-")))
            .filter(|l| !l.is_empty() && l != "C" && l != "POSIX")
            .unwrap_or_else(|| "unknown".to_string());
        let utc_offset_secs = chrono::Local::now().offset().local_minus_utc();
        Self {
            user_agent: format!(
                "{}/{} ({}; {})",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION"),
                os_token,
                arch
            ),
            language,
            timezone_offset_minutes: -(utc_offset_secs / 60),
            hardware_concurrency: std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(0),
            platform: format!("{os} {arch}"),
            ..Self::default()
        }
    }
}

/// Snapshot of the current document.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DocumentInfo {
    pub title: String,
    pub url: String,
    pub referrer: String,
    pub pathname: String,
}

/// Milliseconds since the Unix epoch.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        chrono::Utc::now().timestamp_millis().max(0) as u64
    }
}

/// Clock advanced by hand. Clones share the same time.
#[derive(Debug, Default, Clone)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Source of uniformly distributed random bits.
pub trait RandomSource: Send + Sync {
    fn next_u64(&self) -> u64;

    /// Uniform value in `[0, 1)`.
    fn next_f64(&self) -> f64 {
        unit_f64(self.next_u64())
    }
}

fn unit_f64(bits: u64) -> f64 {
    (bits >> 11) as f64 / (1u64 << 53) as f64
}

/// Operating-system randomness.
#[derive(Debug, Default)]
pub struct SystemRandom {
    fallback: AtomicU64,
}

impl RandomSource for SystemRandom {
    fn next_u64(&self) -> u64 {
        let mut buf = [0u8; 8];
        match getrandom::getrandom(&mut buf) {
            Ok(()) => u64::from_le_bytes(buf),
            Err(e) => {
                tracing::warn!(error = %e, "getrandom failed, using time-seeded fallback");
                let nanos = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_nanos() as u64)
                    .unwrap_or(0);
                splitmix64(nanos ^ self.fallback.fetch_add(0x9E37_79B9_7F4A_7C15, Ordering::Relaxed))
            }
        }
    }
}

fn splitmix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Always returns the same bits.
#[derive(Debug, Clone, Copy)]
pub struct FixedRandom(u64);

impl FixedRandom {
    pub fn new(bits: u64) -> Self {
        Self(bits)
    }

    /// Random source whose `next_f64` returns `value` (clamped into `[0, 1)`).
    pub fn unit(value: f64) -> Self {
        let v = value.clamp(0.0, 1.0 - f64::EPSILON);
        Self(((v * (1u64 << 53) as f64) as u64) << 11)
    }
}

impl RandomSource for FixedRandom {
    fn next_u64(&self) -> u64 {
        self.0
    }
}

/// Capabilities the tracking pipeline needs from its host.
pub trait Environment: Send + Sync + 'static {
    /// False on server-side rendering and other non-interactive hosts.
    fn is_browser(&self) -> bool;

    /// `None` when device attributes cannot be read.
    fn device(&self) -> Option<DeviceInfo>;

    fn document(&self) -> DocumentInfo;

    /// Survives across browsing contexts (`localStorage`).
    fn persistent_storage(&self) -> &dyn Storage;

    /// Scoped to one browsing context (`sessionStorage`).
    fn session_storage(&self) -> &dyn Storage;

    fn now_ms(&self) -> u64;

    fn random_u64(&self) -> u64;

    fn random_f64(&self) -> f64 {
        unit_f64(self.random_u64())
    }
}

/// Environment assembled from parts.
pub struct HostEnvironment {
    device: Option<DeviceInfo>,
    document: Mutex<DocumentInfo>,
    persistent: Box<dyn Storage>,
    session: Box<dyn Storage>,
    clock: Arc<dyn Clock>,
    random: Arc<dyn RandomSource>,
}

impl HostEnvironment {
    pub fn new(device: DeviceInfo) -> Self {
        Self {
            device: Some(device),
            document: Mutex::new(DocumentInfo::default()),
            persistent: Box::new(MemoryStorage::new()),
            session: Box::new(MemoryStorage::new()),
            clock: Arc::new(SystemClock),
            random: Arc::new(SystemRandom::default()),
        }
    }

    /// Native process: detected device attributes, in-memory storage.
    pub fn native() -> Self {
        Self::new(DeviceInfo::native())
    }

    pub fn with_persistent_storage(mut self, storage: impl Storage + 'static) -> Self {
        self.persistent = Box::new(storage);
        self
    }

    pub fn with_session_storage(mut self, storage: impl Storage + 'static) -> Self {
        self.session = Box::new(storage);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_random(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.random = random;
        self
    }

    pub fn with_document(self, document: DocumentInfo) -> Self {
        self.set_document(document);
        self
    }

    /// Device attributes cannot be read (fingerprint falls back to a temporary id).
    pub fn without_device(mut self) -> Self {
        self.device = None;
        self
    }

    pub fn set_document(&self, document: DocumentInfo) {
        *self.document.lock().unwrap_or_else(|e| e.into_inner()) = document;
    }
}

impl Default for HostEnvironment {
    fn default() -> Self {
        Self::new(DeviceInfo::default())
    }
}

impl Environment for HostEnvironment {
    fn is_browser(&self) -> bool {
        true
    }

    fn device(&self) -> Option<DeviceInfo> {
        self.device.clone()
    }

    fn document(&self) -> DocumentInfo {
        self.document.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn persistent_storage(&self) -> &dyn Storage {
        self.persistent.as_ref()
    }

    fn session_storage(&self) -> &dyn Storage {
        self.session.as_ref()
    }

    fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    fn random_u64(&self) -> u64 {
        self.random.next_u64()
    }
}

/// Non-browser environment (server-side rendering, build scripts).
#[derive(Debug, Default)]
pub struct Headless {
    persistent: MemoryStorage,
    session: MemoryStorage,
    random: SystemRandom,
}

impl Headless {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Environment for Headless {
    fn is_browser(&self) -> bool {
        false
    }

    fn device(&self) -> Option<DeviceInfo> {
        None
    }

    fn document(&self) -> DocumentInfo {
        DocumentInfo::default()
    }

    fn persistent_storage(&self) -> &dyn Storage {
        &self.persistent
    }

    fn session_storage(&self) -> &dyn Storage {
        &self.session
    }

    fn now_ms(&self) -> u64 {
        SystemClock.now_ms()
    }

    fn random_u64(&self) -> u64 {
        self.random.next_u64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_clones_share_time() {
        let clock = ManualClock::new(1_000);
        let other = clock.clone();
        other.advance(2_500);
        assert_eq!(clock.now_ms(), 3_500);
        clock.set(10);
        assert_eq!(other.now_ms(), 10);
    }

    #[test]
    fn fixed_random_unit_round_trips() {
        let r = FixedRandom::unit(0.25);
        assert!((r.next_f64() - 0.25).abs() < 1e-12);
        assert!(FixedRandom::unit(1.0).next_f64() < 1.0);
        assert_eq!(FixedRandom::unit(0.0).next_f64(), 0.0);
    }

    #[test]
    fn system_random_is_in_unit_interval() {
        let r = SystemRandom::default();
        for _ in 0..100 {
            let v = r.next_f64();
            assert!((0.0..1.0).contains(&v));
        }
    }

    #[test]
    fn native_device_info_names_this_os() {
        let info = DeviceInfo::native();
        assert!(info.user_agent.starts_with("site-tracker/"));
        assert!(info.platform.contains(std::env::consts::OS));
    }

    #[test]
    fn host_environment_document_is_replaceable() {
        let env = HostEnvironment::default().with_document(DocumentInfo {
            title: "Home".into(),
            pathname: "/".into(),
            ..DocumentInfo::default()
        });
        assert_eq!(env.document().title, "Home");
        env.set_document(DocumentInfo {
            title: "Post".into(),
            ..DocumentInfo::default()
        });
        assert_eq!(env.document().title, "Post");
    }

    #[test]
    fn headless_is_not_a_browser() {
        let env = Headless::new();
        assert!(!env.is_browser());
        assert!(env.device().is_none());
    }
}
