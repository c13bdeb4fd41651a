//! Event data model.
//! Wire format is snake_case JSON; the collector stores every field but `metadata` as a column.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;

/// Open metadata mapping. Later writes win on key collision.
pub type Metadata = Map<String, Value>;

/// Kind of tracked occurrence. Custom events may use any tag.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum EventType {
    Pageview,
    Click,
    Exposure,
    Custom,
    Other(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            EventType::Pageview => "PAGEVIEW",
            EventType::Click => "CLICK",
            EventType::Exposure => "EXPOSURE",
            EventType::Custom => "CUSTOM",
            EventType::Other(tag) => tag,
        }
    }

    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "PAGEVIEW" => EventType::Pageview,
            "CLICK" => EventType::Click,
            "EXPOSURE" => EventType::Exposure,
            "CUSTOM" => EventType::Custom,
            other => EventType::Other(other.to_string()),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventType {
    fn serialize<S: Serializer>(&self, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D: Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        String::deserialize(de).map(|s| EventType::from_tag(&s))
    }
}

/// One event as delivered to the collector.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TrackEvent {
    pub event_type: EventType,
    pub page_path: String,
    pub session_id: String,
    pub user_id: String,
    /// Milliseconds since the Unix epoch, taken at enqueue time.
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    /// Whole seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_duration: Option<u64>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl TrackEvent {
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    pub fn meta_bool(&self, key: &str) -> Option<bool> {
        self.metadata.get(key).and_then(Value::as_bool)
    }
}

/// Producer input: everything but the identity and timestamp, which the tracker attaches.
#[derive(Clone, Debug, PartialEq)]
pub struct EventDraft {
    pub event_type: EventType,
    pub page_path: String,
    pub element_path: Option<String>,
    pub referrer: Option<String>,
    pub platform: Option<String>,
    pub event_duration: Option<u64>,
    pub metadata: Metadata,
}

impl EventDraft {
    pub fn new(event_type: EventType, page_path: impl Into<String>) -> Self {
        Self {
            event_type,
            page_path: page_path.into(),
            element_path: None,
            referrer: None,
            platform: None,
            event_duration: None,
            metadata: Metadata::new(),
        }
    }

    pub fn pageview(page_path: impl Into<String>) -> Self {
        Self::new(EventType::Pageview, page_path)
    }

    pub fn click(page_path: impl Into<String>) -> Self {
        Self::new(EventType::Click, page_path)
    }

    pub fn custom(tag: &str, page_path: impl Into<String>) -> Self {
        Self::new(EventType::from_tag(tag), page_path)
    }

    pub fn element_path(mut self, path: impl Into<String>) -> Self {
        self.element_path = Some(path.into());
        self
    }

    pub fn referrer(mut self, referrer: impl Into<String>) -> Self {
        self.referrer = Some(referrer.into());
        self
    }

    pub fn platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }

    pub fn duration(mut self, seconds: u64) -> Self {
        self.event_duration = Some(seconds);
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Merge `extra` into the metadata; keys in `extra` win.
    pub fn metadata(mut self, extra: Metadata) -> Self {
        self.metadata.extend(extra);
        self
    }
}

/// Characters `encodeURI` leaves alone besides ASCII alphanumerics.
const URI_KEEP: &str = ";,/?:@&=+$-_.!~*'()#";

/// Percent-encode a path or URL, keeping URI delimiters. Existing `%XX` escapes are kept
/// as they are (`%2F` stays distinct from `/`), so encoding twice gives the same result.
pub fn encode_uri(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = String::with_capacity(input.len());
    let mut buf = [0u8; 4];
    let mut chars = input.char_indices();
    while let Some((i, c)) = chars.next() {
        if c == '%' && is_escape(bytes, i) {
            out.push_str(&input[i..i + 3]);
            chars.nth(1);
        } else if c.is_ascii_alphanumeric() || URI_KEEP.contains(c) {
            out.push(c);
        } else {
            out.push_str(&urlencoding::encode(c.encode_utf8(&mut buf)));
        }
    }
    out
}

fn is_escape(bytes: &[u8], at: usize) -> bool {
    at + 2 < bytes.len() && bytes[at + 1].is_ascii_hexdigit() && bytes[at + 2].is_ascii_hexdigit()
}

/// Percent-decode, returning the input unchanged when it does not decode to UTF-8.
pub fn decode_uri(input: &str) -> String {
    urlencoding::decode(input)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| input.to_string())
}
