//! Tracker configuration: options, environment loading, validation and the compiled
//! path-exclusion filter.

use crate::error::ConfigError;
use crate::event::decode_uri;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Collector path the blog backend serves batches on.
pub const DEFAULT_ENDPOINT: &str = "/api/tracking/batch";
pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const DEFAULT_BATCH_INTERVAL_MS: u64 = 5_000;
/// The collector truncates larger batches.
pub const DEFAULT_MAX_EVENTS_PER_REQUEST: usize = 200;

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_batch_interval_ms() -> u64 {
    DEFAULT_BATCH_INTERVAL_MS
}

fn default_sampling() -> f64 {
    1.0
}

fn default_max_events_per_request() -> usize {
    DEFAULT_MAX_EVENTS_PER_REQUEST
}

fn yes() -> bool {
    true
}

/// Which auto-instrumentation hooks are active.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoTrackOptions {
    #[serde(default = "yes")]
    pub pageview: bool,
    #[serde(default = "yes")]
    pub click: bool,
    #[serde(default)]
    pub exposure: bool,
}

impl Default for AutoTrackOptions {
    fn default() -> Self {
        Self {
            pageview: true,
            click: true,
            exposure: false,
        }
    }
}

/// Storage keys for the fingerprint (persistent scope) and the session (context scope).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageKeys {
    #[serde(alias = "fingerprintKey")]
    pub fingerprint: String,
    #[serde(alias = "sessionIdKey")]
    pub session_id: String,
    #[serde(alias = "sessionDataKey")]
    pub session_data: String,
}

impl Default for StorageKeys {
    fn default() -> Self {
        Self {
            fingerprint: "track_device_fingerprint".to_string(),
            session_id: "track_session_id".to_string(),
            session_data: "track_session_data".to_string(),
        }
    }
}

/// Options recognised by the tracker. camelCase names are accepted as aliases.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackingOptions {
    pub endpoint: String,
    #[serde(default = "default_batch_size", alias = "batchSize")]
    pub batch_size: usize,
    #[serde(
        default = "default_batch_interval_ms",
        alias = "batchInterval",
        alias = "batch_interval"
    )]
    pub batch_interval_ms: u64,
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_sampling")]
    pub sampling: f64,
    #[serde(default, alias = "excludePaths")]
    pub exclude_paths: Vec<String>,
    #[serde(default, alias = "includeElementSelector")]
    pub include_element_selector: Vec<String>,
    #[serde(default, alias = "enableAutoTrack")]
    pub enable_auto_track: AutoTrackOptions,
    #[serde(default, alias = "storageKeys")]
    pub storage_keys: StorageKeys,
    #[serde(default = "default_max_events_per_request", alias = "maxEventsPerRequest")]
    pub max_events_per_request: usize,
}

impl TrackingOptions {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            batch_size: DEFAULT_BATCH_SIZE,
            batch_interval_ms: DEFAULT_BATCH_INTERVAL_MS,
            debug: false,
            sampling: 1.0,
            exclude_paths: Vec::new(),
            include_element_selector: Vec::new(),
            enable_auto_track: AutoTrackOptions::default(),
            storage_keys: StorageKeys::default(),
            max_events_per_request: DEFAULT_MAX_EVENTS_PER_REQUEST,
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut options =
            Self::new(lookup("TRACKING_ENDPOINT").unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()));
        if let Some(v) = lookup("TRACKING_BATCH_SIZE") {
            options.batch_size = parse("TRACKING_BATCH_SIZE", &v)?;
        }
        if let Some(v) = lookup("TRACKING_BATCH_INTERVAL_MS") {
            options.batch_interval_ms = parse("TRACKING_BATCH_INTERVAL_MS", &v)?;
        }
        if let Some(v) = lookup("TRACKING_SAMPLING") {
            options.sampling = parse("TRACKING_SAMPLING", &v)?;
        }
        if let Some(v) = lookup("TRACKING_DEBUG") {
            options.debug = matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }
        if let Some(v) = lookup("TRACKING_EXCLUDE_PATHS") {
            options.exclude_paths = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        Ok(options)
    }

    pub fn batch_size(mut self, n: usize) -> Self {
        self.batch_size = n;
        self
    }

    pub fn batch_interval(mut self, interval: Duration) -> Self {
        self.batch_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn debug(mut self, on: bool) -> Self {
        self.debug = on;
        self
    }

    pub fn sampling(mut self, rate: f64) -> Self {
        self.sampling = rate;
        self
    }

    pub fn exclude_paths<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_paths = patterns.into_iter().map(Into::into).collect();
        self
    }

    pub fn include_element_selector<I, S>(mut self, selectors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.include_element_selector = selectors.into_iter().map(Into::into).collect();
        self
    }

    pub fn auto_track(mut self, auto: AutoTrackOptions) -> Self {
        self.enable_auto_track = auto;
        self
    }

    pub fn storage_keys(mut self, keys: StorageKeys) -> Self {
        self.storage_keys = keys;
        self
    }

    pub fn max_events_per_request(mut self, n: usize) -> Self {
        self.max_events_per_request = n;
        self
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_ms)
    }

    /// Normalise and check the options.
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        if self.endpoint.trim().is_empty() {
            return Err(ConfigError::MissingEndpoint);
        }
        if self.batch_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "batch_interval",
                value: "0".to_string(),
            });
        }
        if !self.sampling.is_finite() {
            return Err(ConfigError::InvalidValue {
                field: "sampling",
                value: self.sampling.to_string(),
            });
        }
        self.sampling = self.sampling.clamp(0.0, 1.0);
        self.batch_size = self.batch_size.max(1);
        self.max_events_per_request = self.max_events_per_request.max(1);
        Ok(self)
    }
}

fn parse<T: std::str::FromStr>(field: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        field,
        value: raw.to_string(),
    })
}

enum PathPattern {
    Exact(String),
    Glob(Regex),
}

/// Compiled `exclude_paths`: exact strings, or `*` globs anchored at both ends.
pub struct PathFilter {
    patterns: Vec<PathPattern>,
}

impl PathFilter {
    pub fn new(patterns: &[String]) -> Result<Self, ConfigError> {
        let patterns = patterns
            .iter()
            .map(|p| {
                if !p.contains('*') {
                    return Ok(PathPattern::Exact(p.clone()));
                }
                let body = p.split('*').map(regex::escape).collect::<Vec<_>>().join(".*");
                Regex::new(&format!("^{body}$"))
                    .map(PathPattern::Glob)
                    .map_err(|e| ConfigError::InvalidValue {
                        field: "exclude_paths",
                        value: format!("{p}: {e}"),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// True when `path` (encoded or not) matches any pattern.
    pub fn is_excluded(&self, path: &str) -> bool {
        if self.patterns.is_empty() {
            return false;
        }
        let decoded = decode_uri(path);
        self.patterns.iter().any(|p| match p {
            PathPattern::Exact(s) => s == path || *s == decoded,
            PathPattern::Glob(re) => re.is_match(path) || re.is_match(&decoded),
        })
    }
}

impl std::fmt::Debug for PathFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathFilter")
            .field("patterns", &self.patterns.len())
            .finish()
    }
}
