//! `OS/Browser` classification from the user agent.

use crate::env::Environment;
use once_cell::sync::Lazy;
use regex::Regex;

pub const UNKNOWN: &str = "unknown";

struct Rule {
    name: &'static str,
    pattern: Regex,
}

fn rule(name: &'static str, pattern: &str) -> Option<Rule> {
    match Regex::new(pattern) {
        Ok(pattern) => Some(Rule { name, pattern }),
        Err(e) => {
            tracing::error!(rule = name, error = %e, "invalid platform pattern");
            None
        }
    }
}

// First match wins.
static OS_RULES: Lazy<Vec<Rule>> = Lazy::new(|| {
    [
        ("Windows", r"(?i)windows"),
        ("macOS", r"(?i)macintosh|mac os x"),
        ("Linux", r"(?i)linux"),
        ("Android", r"(?i)android"),
        ("iOS", r"(?i)iphone|ipad|ipod"),
    ]
    .into_iter()
    .filter_map(|(name, p)| rule(name, p))
    .collect()
});

static EDGE: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"(?i)edg/|edge/").ok());
static CHROME: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"(?i)chrome/").ok());
static FIREFOX: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"(?i)firefox/").ok());
static SAFARI: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"(?i)safari/").ok());
static OPERA: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"(?i)opera|opr/").ok());

fn hit(re: &Lazy<Option<Regex>>, ua: &str) -> bool {
    re.as_ref().map_or(false, |r| r.is_match(ua))
}

pub fn detect_os(ua: &str) -> &'static str {
    OS_RULES
        .iter()
        .find(|r| r.pattern.is_match(ua))
        .map_or(UNKNOWN, |r| r.name)
}

/// Browser family. Edge user agents also name Chrome, and Chrome ones name Safari, so
/// the checks run in a fixed priority order.
pub fn detect_browser(ua: &str) -> &'static str {
    let edge = hit(&EDGE, ua);
    let chrome = hit(&CHROME, ua);
    if edge {
        "Edge"
    } else if chrome {
        "Chrome"
    } else if hit(&FIREFOX, ua) {
        "Firefox"
    } else if hit(&SAFARI, ua) {
        "Safari"
    } else if hit(&OPERA, ua) {
        "Opera"
    } else {
        UNKNOWN
    }
}

/// `"OS/Browser"`, e.g. `"Windows/Chrome"`. Never fails.
pub fn detect_platform(env: &dyn Environment) -> String {
    if !env.is_browser() {
        return format!("{UNKNOWN}/{UNKNOWN}");
    }
    match env.device() {
        Some(device) => format!(
            "{}/{}",
            detect_os(&device.user_agent),
            detect_browser(&device.user_agent)
        ),
        None => format!("{UNKNOWN}/{UNKNOWN}"),
    }
}
