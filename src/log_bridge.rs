//! Tracker logging. Lines go to `tracing` and into a bounded buffer the host can drain
//! (a page without a console, or a test asserting on what was logged).

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

const MAX_BUFFER_LEN: usize = 500;

/// Log level of a buffered line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    fn as_str(self) -> &'static str {
        match self {
            Level::Debug => "",
            Level::Info => " Info",
            Level::Warn => " Warning",
            Level::Error => " Error",
        }
    }
}

/// Prefixed logger gated by the `debug` option. Errors are always emitted.
#[derive(Clone)]
pub struct Logger {
    debug: bool,
    prefix: Arc<str>,
    buffer: Arc<Mutex<VecDeque<String>>>,
}

impl Logger {
    pub fn new(debug: bool, prefix: &str) -> Self {
        Self {
            debug,
            prefix: Arc::from(prefix),
            buffer: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn debug(&self, args: fmt::Arguments<'_>) {
        if self.debug {
            tracing::debug!(prefix = %self.prefix, "{}", args);
            self.push(Level::Debug, args);
        }
    }

    pub fn info(&self, args: fmt::Arguments<'_>) {
        if self.debug {
            tracing::info!(prefix = %self.prefix, "{}", args);
            self.push(Level::Info, args);
        }
    }

    pub fn warn(&self, args: fmt::Arguments<'_>) {
        if self.debug {
            tracing::warn!(prefix = %self.prefix, "{}", args);
            self.push(Level::Warn, args);
        }
    }

    pub fn error(&self, args: fmt::Arguments<'_>) {
        tracing::error!(prefix = %self.prefix, "{}", args);
        self.push(Level::Error, args);
    }

    fn push(&self, level: Level, args: fmt::Arguments<'_>) {
        let line = format!("{}{} {}", self.prefix, level.as_str(), args);
        if let Ok(mut v) = self.buffer.lock() {
            v.push_back(line);
            while v.len() > MAX_BUFFER_LEN {
                v.pop_front();
            }
        }
    }

    /// Drain and clear buffered lines.
    pub fn drain(&self) -> Vec<String> {
        self.buffer
            .lock()
            .map(|mut v| v.drain(..).collect())
            .unwrap_or_default()
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("debug", &self.debug)
            .field("prefix", &self.prefix)
            .finish()
    }
}
