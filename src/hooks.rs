//! Auto-instrumentation: turns host navigation, visibility and click signals into tracker
//! calls.
//!
//! Hosts push [`HostSignal`]s through a [`SignalSource`], the one seam between the page
//! framework (router callbacks, wrapped `history` methods, `popstate`,
//! `visibilitychange`, a capturing document click listener) and the tracker.

use crate::config::AutoTrackOptions;
use crate::dom::{ElementNode, SelectorList};
use crate::event::{encode_uri, Metadata};
use crate::log_bridge::Logger;
use crate::tracker::{runtime_handle, Tracker};
use crate::transport::Transport;
use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Page navigation as reported by the host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NavigationSignal {
    /// Router callback after a client-side route change.
    RouteChanged { to: String, from: Option<String> },
    /// `history.pushState`.
    HistoryPush { path: String },
    /// `history.replaceState`.
    HistoryReplace { path: String },
    /// Back/forward navigation.
    PopState { path: String },
    VisibilityChanged { visible: bool },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostSignal {
    Navigation(NavigationSignal),
    Click { target: ElementNode, path: String },
    Exposure { target: ElementNode, path: String },
    /// Page is being unloaded.
    Close,
}

impl HostSignal {
    pub fn route_changed(to: &str, from: Option<&str>) -> Self {
        HostSignal::Navigation(NavigationSignal::RouteChanged {
            to: to.to_string(),
            from: from.map(str::to_string),
        })
    }

    pub fn history_push(path: &str) -> Self {
        HostSignal::Navigation(NavigationSignal::HistoryPush { path: path.to_string() })
    }

    pub fn history_replace(path: &str) -> Self {
        HostSignal::Navigation(NavigationSignal::HistoryReplace { path: path.to_string() })
    }

    pub fn pop_state(path: &str) -> Self {
        HostSignal::Navigation(NavigationSignal::PopState { path: path.to_string() })
    }

    pub fn visibility(visible: bool) -> Self {
        HostSignal::Navigation(NavigationSignal::VisibilityChanged { visible })
    }

    pub fn click(target: ElementNode, path: &str) -> Self {
        HostSignal::Click {
            target,
            path: path.to_string(),
        }
    }

    pub fn exposure(target: ElementNode, path: &str) -> Self {
        HostSignal::Exposure {
            target,
            path: path.to_string(),
        }
    }
}

/// Stream of host signals. `None` ends the listener.
pub trait SignalSource: Send + 'static {
    fn next_signal(&mut self) -> impl Future<Output = Option<HostSignal>> + Send;
}

impl SignalSource for mpsc::UnboundedReceiver<HostSignal> {
    async fn next_signal(&mut self) -> Option<HostSignal> {
        self.recv().await
    }
}

impl SignalSource for mpsc::Receiver<HostSignal> {
    async fn next_signal(&mut self) -> Option<HostSignal> {
        self.recv().await
    }
}

const OPT_OUT_ATTRIBUTE: &str = "data-track-ignore";
const SENSITIVE_TAGS: [&str; 3] = ["input", "textarea", "select"];

pub struct AutoTracker<T: Transport> {
    tracker: Tracker<T>,
    auto: AutoTrackOptions,
    include: Option<SelectorList>,
    default_clickable: SelectorList,
    current_path: Mutex<Option<String>>,
    log: Logger,
}

impl<T: Transport> AutoTracker<T> {
    /// Hooks configured from the tracker's own options. Unparseable include selectors are
    /// logged and skipped.
    pub fn new(tracker: Tracker<T>) -> Self {
        let auto = tracker.options().enable_auto_track.clone();
        let selectors = tracker.options().include_element_selector.clone();
        Self::with_options(tracker, auto, &selectors)
    }

    pub fn with_options(tracker: Tracker<T>, auto: AutoTrackOptions, include_selectors: &[String]) -> Self {
        let log = tracker.logger().clone();
        let mut include = SelectorList::default();
        for raw in include_selectors {
            match SelectorList::parse(raw) {
                Ok(list) => include.extend(list),
                Err(e) => log.error(format_args!("ignoring include selector {raw:?}: {e}")),
            }
        }
        Self {
            tracker,
            auto,
            include: (!include.is_empty()).then_some(include),
            default_clickable: SelectorList::clickable(),
            current_path: Mutex::new(None),
            log,
        }
    }

    pub fn tracker(&self) -> &Tracker<T> {
        &self.tracker
    }

    pub fn current_path(&self) -> Option<String> {
        self.current_path.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Initial page view.
    pub fn install(&self, initial_path: &str) {
        if initial_path.trim().is_empty() {
            return;
        }
        self.navigate(initial_path, None);
    }

    pub fn on_navigation(&self, signal: NavigationSignal) {
        match signal {
            NavigationSignal::RouteChanged { to, from } => {
                if !to.trim().is_empty() {
                    self.navigate(&to, from.filter(|f| !f.is_empty()));
                }
            }
            NavigationSignal::HistoryPush { path }
            | NavigationSignal::HistoryReplace { path }
            | NavigationSignal::PopState { path } => {
                if !path.trim().is_empty() {
                    self.navigate(&path, None);
                }
            }
            NavigationSignal::VisibilityChanged { visible: true } => self.on_visible(),
            NavigationSignal::VisibilityChanged { visible: false } => {
                let sent = self.tracker.flush();
                self.log.debug(format_args!("page hidden, flushed {sent} events"));
            }
        }
    }

    /// Record a navigation. Returns false when `path` is already the current page, which
    /// happens when the router callback and the history hook report the same navigation.
    fn navigate(&self, path: &str, referrer: Option<String>) -> bool {
        let encoded = encode_uri(path);
        let previous = {
            let mut current = self.current_path.lock().unwrap_or_else(|e| e.into_inner());
            if current.as_deref() == Some(encoded.as_str()) {
                return false;
            }
            current.replace(encoded.clone())
        };
        if self.auto.pageview {
            let referrer = referrer.or(previous);
            self.tracker.track_page_view(&encoded, referrer.as_deref(), None);
        }
        true
    }

    fn on_visible(&self) {
        if !self.auto.pageview {
            return;
        }
        let path = self
            .current_path()
            .unwrap_or_else(|| self.tracker.env().document().pathname);
        if path.trim().is_empty() {
            return;
        }
        let mut extra = Metadata::new();
        extra.insert("visibility_change".into(), Value::Bool(true));
        self.tracker.track_page_view(&path, None, Some(extra));
    }

    pub fn on_click(&self, target: &ElementNode, path: &str) {
        if !self.auto.click {
            return;
        }
        if self.click_target(target).is_none() {
            return;
        }
        match self.resolve_path(path) {
            Some(path) => self.tracker.track_click(target, &path),
            None => self.log.debug(format_args!("click ignored, no current path")),
        }
    }

    pub fn on_exposure(&self, target: &ElementNode, path: &str) {
        if !self.auto.exposure {
            return;
        }
        if target.self_and_ancestors().any(|n| n.has_attribute(OPT_OUT_ATTRIBUTE)) {
            return;
        }
        if let Some(path) = self.resolve_path(path) {
            self.tracker.track_exposure(target, &path);
        }
    }

    fn resolve_path(&self, path: &str) -> Option<String> {
        if !path.trim().is_empty() {
            return Some(path.to_string());
        }
        self.current_path()
            .or_else(|| Some(self.tracker.env().document().pathname))
            .filter(|p| !p.trim().is_empty())
    }

    /// Allow-listed element that makes a click on `target` trackable, or `None` when the
    /// click is not tracked. The event itself always describes `target`.
    ///
    /// The opt-out attribute on the target or any ancestor wins. Password inputs are never
    /// tracked; other form controls only when an include selector names them. Otherwise
    /// the target or its nearest ancestor must match the include selectors (or, without
    /// any, be a link, button or ARIA button/link/menuitem).
    pub fn click_target<'a>(&self, target: &'a ElementNode) -> Option<&'a ElementNode> {
        if target.self_and_ancestors().any(|n| n.has_attribute(OPT_OUT_ATTRIBUTE)) {
            return None;
        }
        if target.is_password_input() {
            return None;
        }
        if SENSITIVE_TAGS.contains(&target.tag.as_str()) {
            let allowed = self.include.as_ref().map_or(false, |list| list.matches(target));
            if !allowed {
                return None;
            }
        }
        let allow = self.include.as_ref().unwrap_or(&self.default_clickable);
        target.closest(|n| allow.matches(n))
    }

    /// Dispatch host signals until the source ends or the page closes.
    pub async fn run<S: SignalSource>(&self, mut source: S) {
        while let Some(signal) = source.next_signal().await {
            match signal {
                HostSignal::Navigation(nav) => self.on_navigation(nav),
                HostSignal::Click { target, path } => self.on_click(&target, &path),
                HostSignal::Exposure { target, path } => self.on_exposure(&target, &path),
                HostSignal::Close => {
                    self.tracker.dispose();
                    break;
                }
            }
        }
        self.log.debug(format_args!("signal listener stopped"));
    }

    /// Spawn [`run`](Self::run) on the tracker's runtime.
    pub fn listen<S: SignalSource>(self: &Arc<Self>, source: S) -> Option<JoinHandle<()>> {
        let Some(handle) = runtime_handle() else {
            self.log.error(format_args!("no async runtime, auto-tracking disabled"));
            return None;
        };
        let this = Arc::clone(self);
        Some(handle.spawn(async move { this.run(source).await }))
    }
}
