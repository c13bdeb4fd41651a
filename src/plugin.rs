//! Bootstrap owned by the application: builds the tracker and its hooks, records the
//! initial page view and listens for host signals.

use crate::config::TrackingOptions;
use crate::env::Environment;
use crate::error::ConfigError;
use crate::hooks::{AutoTracker, HostSignal};
use crate::tracker::Tracker;
use crate::transport::Transport;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub struct TrackingPlugin<T: Transport> {
    hooks: Arc<AutoTracker<T>>,
    sender: mpsc::UnboundedSender<HostSignal>,
    listener: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl<T: Transport> TrackingPlugin<T> {
    pub fn install(
        options: TrackingOptions,
        env: Arc<dyn Environment>,
        transport: T,
        initial_path: &str,
    ) -> Result<Self, ConfigError> {
        let tracker = Tracker::new(options, env, transport)?;
        let hooks = Arc::new(AutoTracker::new(tracker));
        hooks.install(initial_path);

        let (sender, receiver) = mpsc::unbounded_channel();
        let listener = hooks.listen(receiver);
        Ok(Self {
            hooks,
            sender,
            listener: Mutex::new(listener),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn tracker(&self) -> &Tracker<T> {
        self.hooks.tracker()
    }

    pub fn hooks(&self) -> &Arc<AutoTracker<T>> {
        &self.hooks
    }

    /// Sender the host feeds navigation, visibility and click signals into.
    pub fn signals(&self) -> mpsc::UnboundedSender<HostSignal> {
        self.sender.clone()
    }

    /// Dispose the tracker and stop listening. Later calls do nothing.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.tracker().dispose();
        if let Some(listener) = self.take_listener() {
            listener.abort();
        }
    }

    /// Let the listener handle every signal sent so far, then dispose and wait for the
    /// final deliveries.
    pub async fn close(&self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            let listener = self.take_listener();
            match listener {
                Some(listener) if self.sender.send(HostSignal::Close).is_ok() => {
                    if let Err(e) = listener.await {
                        tracing::debug!(error = %e, "signal listener join failed");
                    }
                }
                Some(listener) => listener.abort(),
                None => {}
            }
            // No-op when the listener already handled Close.
            self.tracker().dispose();
        }
        self.tracker().settle().await;
    }

    fn take_listener(&self) -> Option<JoinHandle<()>> {
        self.listener.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

impl<T: Transport> Drop for TrackingPlugin<T> {
    fn drop(&mut self) {
        if let Some(listener) = self.take_listener() {
            listener.abort();
        }
    }
}
