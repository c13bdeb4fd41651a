//! Owned DOM snapshots handed to the tracker by the host, plus the selector subset used
//! to decide which clicks are tracked.

use crate::error::SelectorError;
use crate::event::Metadata;
use serde_json::Value;
use std::collections::BTreeMap;

/// Ancestors included in an element path, counting the element itself.
pub const MAX_PATH_DEPTH: usize = 5;
pub const MAX_TEXT_CHARS: usize = 50;

/// Snapshot of one element and its ancestor chain.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ElementNode {
    pub tag: String,
    pub id: String,
    pub classes: Vec<String>,
    pub attributes: BTreeMap<String, String>,
    /// Text content.
    pub text: String,
    /// 1-based position among the parent's element children.
    pub nth_child: Option<usize>,
    pub parent: Option<Box<ElementNode>>,
}

impl ElementNode {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_ascii_lowercase(),
            ..Self::default()
        }
    }

    pub fn id(mut self, id: &str) -> Self {
        self.id = id.to_string();
        self
    }

    /// Whitespace-separated class list, as in the `class` attribute.
    pub fn class(mut self, class_name: &str) -> Self {
        self.classes = class_name.split_whitespace().map(String::from).collect();
        self
    }

    pub fn attr(mut self, name: &str, value: &str) -> Self {
        self.attributes.insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    pub fn text(mut self, text: &str) -> Self {
        self.text = text.to_string();
        self
    }

    /// Attach `child` as the `nth` (1-based) child of `self` and return the child.
    pub fn child(self, nth: usize, mut child: ElementNode) -> ElementNode {
        child.nth_child = Some(nth);
        child.parent = Some(Box::new(self));
        child
    }

    /// Attribute value. `id` and `class` read the dedicated fields.
    pub fn attribute(&self, name: &str) -> Option<String> {
        match name {
            "id" if !self.id.is_empty() => Some(self.id.clone()),
            "id" => self.attributes.get("id").cloned(),
            "class" if !self.classes.is_empty() => Some(self.class_name()),
            other => self.attributes.get(other).cloned(),
        }
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.attribute(name).is_some()
    }

    pub fn class_name(&self) -> String {
        self.classes.join(" ")
    }

    pub fn parent(&self) -> Option<&ElementNode> {
        self.parent.as_deref()
    }

    /// The element itself, then each ancestor up to the root.
    pub fn self_and_ancestors(&self) -> impl Iterator<Item = &ElementNode> {
        std::iter::successors(Some(self), |n| n.parent())
    }

    pub fn ancestors(&self) -> impl Iterator<Item = &ElementNode> {
        self.self_and_ancestors().skip(1)
    }

    /// Nearest of the element itself and its ancestors satisfying `pred`.
    pub fn closest<F>(&self, pred: F) -> Option<&ElementNode>
    where
        F: Fn(&ElementNode) -> bool,
    {
        self.self_and_ancestors().find(|n| pred(n))
    }

    pub fn is_password_input(&self) -> bool {
        self.tag == "input"
            && self
                .attributes
                .get("type")
                .map_or(false, |t| t.eq_ignore_ascii_case("password"))
    }
}

/// `tagname[#id | .c1.c2][:nth-child(n)]` for the element and up to four ancestors, most
/// distant first, joined by `" > "`.
pub fn element_path(node: &ElementNode) -> String {
    let mut segments: Vec<String> = node
        .self_and_ancestors()
        .take(MAX_PATH_DEPTH)
        .map(path_segment)
        .collect();
    segments.reverse();
    segments.join(" > ")
}

fn path_segment(node: &ElementNode) -> String {
    let mut segment = if node.tag.is_empty() {
        "unknown".to_string()
    } else {
        node.tag.clone()
    };
    if !node.id.is_empty() {
        segment.push('#');
        segment.push_str(&urlencoding::encode(&node.id));
    } else if !node.classes.is_empty() {
        for class in &node.classes {
            segment.push('.');
            segment.push_str(&urlencoding::encode(class));
        }
    }
    if let (Some(_), Some(n)) = (&node.parent, node.nth_child) {
        segment.push_str(&format!(":nth-child({n})"));
    }
    segment
}

/// Click metadata: trimmed text (at most 50 chars), tag, class, id and link target.
pub fn element_metadata(node: &ElementNode) -> Metadata {
    let mut meta = Metadata::new();
    let text: String = node.text.trim().chars().take(MAX_TEXT_CHARS).collect();
    meta.insert("text".into(), Value::String(text));
    meta.insert("tag_name".into(), Value::String(node.tag.clone()));
    meta.insert("class_name".into(), Value::String(node.class_name()));
    meta.insert("id".into(), Value::String(node.id.clone()));
    if node.tag == "a" {
        if let Some(href) = node.attributes.get("href") {
            meta.insert("href".into(), Value::String(href.clone()));
        }
    }
    meta
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct AttrMatch {
    name: String,
    value: Option<String>,
}

/// Compound selector: optional tag, then any number of `#id`, `.class`, `[attr]` and
/// `[attr="value"]` parts. Combinators are not supported.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Selector {
    tag: Option<String>,
    id: Option<String>,
    classes: Vec<String>,
    attrs: Vec<AttrMatch>,
}

fn ident_len(s: &str) -> usize {
    s.find(|c: char| !(c.is_alphanumeric() || c == '-' || c == '_'))
        .unwrap_or(s.len())
}

impl Selector {
    pub fn tag(tag: &str) -> Self {
        Self {
            tag: Some(tag.to_ascii_lowercase()),
            ..Self::default()
        }
    }

    pub fn attr_eq(name: &str, value: &str) -> Self {
        Self {
            attrs: vec![AttrMatch {
                name: name.to_ascii_lowercase(),
                value: Some(value.to_string()),
            }],
            ..Self::default()
        }
    }

    pub fn parse(input: &str) -> Result<Self, SelectorError> {
        let source = input.trim();
        if source.is_empty() {
            return Err(SelectorError::Empty);
        }
        let unsupported = |found: char| SelectorError::Unsupported {
            selector: source.to_string(),
            found,
        };

        let mut sel = Selector::default();
        let mut rest = source;
        if let Some(stripped) = rest.strip_prefix('*') {
            rest = stripped;
        } else {
            let n = ident_len(rest);
            if n > 0 {
                sel.tag = Some(rest[..n].to_ascii_lowercase());
                rest = &rest[n..];
            }
        }

        while let Some(c) = rest.chars().next() {
            match c {
                '#' | '.' => {
                    let body = &rest[1..];
                    let n = ident_len(body);
                    if n == 0 {
                        return Err(unsupported(c));
                    }
                    let name = body[..n].to_string();
                    if c == '#' {
                        sel.id = Some(name);
                    } else {
                        sel.classes.push(name);
                    }
                    rest = &body[n..];
                }
                '[' => {
                    let end = rest
                        .find(']')
                        .ok_or_else(|| SelectorError::UnclosedAttribute(source.to_string()))?;
                    sel.attrs.push(parse_attr(&rest[1..end]).ok_or_else(|| unsupported('['))?);
                    rest = &rest[end + 1..];
                }
                other => return Err(unsupported(other)),
            }
        }
        Ok(sel)
    }

    pub fn matches(&self, node: &ElementNode) -> bool {
        if let Some(tag) = &self.tag {
            if *tag != node.tag {
                return false;
            }
        }
        if let Some(id) = &self.id {
            if *id != node.id {
                return false;
            }
        }
        if !self.classes.iter().all(|c| node.classes.contains(c)) {
            return false;
        }
        self.attrs.iter().all(|a| match (node.attribute(&a.name), &a.value) {
            (Some(actual), Some(expected)) => actual == *expected,
            (Some(_), None) => true,
            (None, _) => false,
        })
    }
}

fn parse_attr(inner: &str) -> Option<AttrMatch> {
    let (name, value) = match inner.split_once('=') {
        Some((name, value)) => {
            let value = value.trim();
            let unquoted = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
                .unwrap_or(value);
            (name.trim(), Some(unquoted.to_string()))
        }
        None => (inner.trim(), None),
    };
    if name.is_empty() || ident_len(name) != name.len() {
        return None;
    }
    Some(AttrMatch {
        name: name.to_ascii_lowercase(),
        value,
    })
}

/// Comma-separated selector list; matches when any member matches.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SelectorList {
    selectors: Vec<Selector>,
}

impl SelectorList {
    pub fn parse(input: &str) -> Result<Self, SelectorError> {
        let mut selectors = Vec::new();
        let mut depth = 0usize;
        let mut start = 0usize;
        for (i, c) in input.char_indices() {
            match c {
                '[' => depth += 1,
                ']' => depth = depth.saturating_sub(1),
                ',' if depth == 0 => {
                    selectors.push(Selector::parse(&input[start..i])?);
                    start = i + 1;
                }
                _ => {}
            }
        }
        selectors.push(Selector::parse(&input[start..])?);
        Ok(Self { selectors })
    }

    /// Links, buttons and ARIA button/link/menuitem roles.
    pub fn clickable() -> Self {
        Self {
            selectors: vec![
                Selector::tag("a"),
                Selector::tag("button"),
                Selector::attr_eq("role", "button"),
                Selector::attr_eq("role", "link"),
                Selector::attr_eq("role", "menuitem"),
            ],
        }
    }

    pub fn extend(&mut self, other: SelectorList) {
        self.selectors.extend(other.selectors);
    }

    pub fn is_empty(&self) -> bool {
        self.selectors.is_empty()
    }

    pub fn matches(&self, node: &ElementNode) -> bool {
        self.selectors.iter().any(|s| s.matches(node))
    }
}
