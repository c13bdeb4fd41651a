//! Client-side event tracking for the blog.
//!
//! A [`Tracker`] enriches events with the device fingerprint and browsing-context session,
//! buffers them and delivers batches to the collector by size or interval, requeueing
//! failed batches. [`AutoTracker`] and [`TrackingPlugin`] feed it from page navigation,
//! visibility and click signals.
//!
//! Hosts bridge the page through an [`Environment`]; [`Headless`] makes every entry point
//! a no-op for server-side rendering.

pub mod config;
pub mod dom;
pub mod env;
pub mod error;
pub mod event;
pub mod fingerprint;
pub mod hooks;
pub mod ids;
pub mod log_bridge;
pub mod platform;
pub mod plugin;
pub mod session;
pub mod storage;
pub mod tracker;
pub mod transport;

pub use config::{AutoTrackOptions, StorageKeys, TrackingOptions};
pub use dom::{ElementNode, Selector, SelectorList};
pub use env::{DeviceInfo, DocumentInfo, Environment, Headless, HostEnvironment};
pub use error::{ConfigError, DeliveryError, SelectorError, StorageError};
pub use event::{EventDraft, EventType, Metadata, TrackEvent};
pub use hooks::{AutoTracker, HostSignal, NavigationSignal, SignalSource};
pub use ids::{DeviceFingerprint, SessionId};
pub use log_bridge::Logger;
pub use plugin::TrackingPlugin;
pub use storage::{MemoryStorage, SqliteStorage, Storage};
pub use tracker::{Tracker, TrackerState};
pub use transport::{DeliveryContext, HttpTransport, Transport};
