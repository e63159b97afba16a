//! Wildcard key patterns.
//!
//! Patterns use a single marker, `*`, standing for any run of characters
//! (including none). Everything else matches literally: `item:*` is a prefix
//! rule, `response:*:/items*` a prefix plus ordered substring rule. There is
//! no regex syntax and no escaping.

use std::fmt;

pub const WILDCARD: char = '*';

/// A pattern compiled into literal segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPattern {
    source: String,
    matcher: Matcher,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Matcher {
    /// No wildcard at all.
    Exact,
    /// `*` alone.
    Any,
    /// Literal pieces between wildcards. `anchored_start`/`anchored_end`
    /// record whether the pattern begins/ends with a literal.
    Segments {
        parts: Vec<String>,
        anchored_start: bool,
        anchored_end: bool,
    },
}

impl KeyPattern {
    pub fn new(pattern: impl Into<String>) -> Self {
        let source = pattern.into();
        let matcher = compile(&source);
        Self { source, matcher }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn is_exact(&self) -> bool {
        matches!(self.matcher, Matcher::Exact)
    }

    /// The literal text before the first wildcard.
    pub fn literal_prefix(&self) -> &str {
        match self.source.find(WILDCARD) {
            Some(idx) => &self.source[..idx],
            None => &self.source,
        }
    }

    pub fn matches(&self, key: &str) -> bool {
        match &self.matcher {
            Matcher::Exact => key == self.source,
            Matcher::Any => true,
            Matcher::Segments {
                parts,
                anchored_start,
                anchored_end,
            } => segments_match(key, parts, *anchored_start, *anchored_end),
        }
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl From<&str> for KeyPattern {
    fn from(pattern: &str) -> Self {
        Self::new(pattern)
    }
}

impl From<String> for KeyPattern {
    fn from(pattern: String) -> Self {
        Self::new(pattern)
    }
}

fn compile(source: &str) -> Matcher {
    if !source.contains(WILDCARD) {
        return Matcher::Exact;
    }

    let parts: Vec<String> = source
        .split(WILDCARD)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect();

    if parts.is_empty() {
        return Matcher::Any;
    }

    Matcher::Segments {
        parts,
        anchored_start: !source.starts_with(WILDCARD),
        anchored_end: !source.ends_with(WILDCARD),
    }
}

fn segments_match(key: &str, parts: &[String], anchored_start: bool, anchored_end: bool) -> bool {
    let mut rest = key;

    for (index, part) in parts.iter().enumerate() {
        let is_first = index == 0;
        let is_last = index + 1 == parts.len();

        if is_first && anchored_start {
            match rest.strip_prefix(part.as_str()) {
                Some(tail) => rest = tail,
                None => return false,
            }
            if is_last && anchored_end {
                return rest.is_empty();
            }
            continue;
        }

        if is_last && anchored_end {
            return rest.ends_with(part.as_str());
        }

        match rest.find(part.as_str()) {
            Some(idx) => rest = &rest[idx + part.len()..],
            None => return false,
        }
    }

    true
}
