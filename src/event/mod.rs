//! Event identity.
//!
//! Events are dot-delimited names (`log.pub`) paired with a delivery mode.
//! Names are split into segments once, at the API boundary, and wildcard
//! matching works on segments:
//!
//! - `*` matches exactly one segment
//! - `**` matches zero or more segments
//!
//! When an `ALL` subscription is bound to the topic exchange, `**` is
//! translated to the AMQP multi-word wildcard `#`.

use std::fmt;

/// Single-segment wildcard.
pub const WILDCARD_ONE: &str = "*";
/// Multi-segment wildcard in event names.
pub const WILDCARD_MANY: &str = "**";
/// Multi-word wildcard in AMQP topic patterns.
pub const TOPIC_WILDCARD_MANY: &str = "#";

/// Delivery mode for a distributed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventMode {
    /// Request/response. One shared queue per event, competing consumers.
    One,
    /// Publish/subscribe. One exclusive queue per subscribing process.
    All,
}

impl EventMode {
    /// Segment prepended to the event name to form the registry id.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventMode::One => "one",
            EventMode::All => "all",
        }
    }
}

impl fmt::Display for EventMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A dot-delimited event name held as ordered segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventName {
    segments: Vec<String>,
}

impl EventName {
    /// Build a name from already-split segments.
    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// True if the name has at least one segment and no empty segments.
    pub fn is_valid(&self) -> bool {
        !self.segments.is_empty() && self.segments.iter().all(|s| !s.is_empty())
    }

    /// True if any segment is a wildcard.
    pub fn has_wildcards(&self) -> bool {
        self.segments
            .iter()
            .any(|s| s == WILDCARD_ONE || s == WILDCARD_MANY)
    }

    /// Whether this name, read as a pattern, matches the concrete `name`.
    pub fn matches(&self, name: &EventName) -> bool {
        let pattern: Vec<&str> = self.segments.iter().map(String::as_str).collect();
        let concrete: Vec<&str> = name.segments.iter().map(String::as_str).collect();
        match_segments(&pattern, &concrete, WILDCARD_MANY)
    }

    /// AMQP topic pattern for binding an `ALL` queue to the exchange.
    pub fn topic_pattern(&self) -> String {
        self.segments
            .iter()
            .map(|s| {
                if s == WILDCARD_MANY {
                    TOPIC_WILDCARD_MANY
                } else {
                    s.as_str()
                }
            })
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Prepend a segment, producing a new name.
    pub fn prefixed(&self, head: &str) -> EventName {
        let mut segments = Vec::with_capacity(self.segments.len() + 1);
        segments.push(head.to_string());
        segments.extend(self.segments.iter().cloned());
        EventName { segments }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("."))
    }
}

impl From<&str> for EventName {
    fn from(name: &str) -> Self {
        Self::from_segments(name.split('.'))
    }
}

impl From<String> for EventName {
    fn from(name: String) -> Self {
        Self::from(name.as_str())
    }
}

impl From<&String> for EventName {
    fn from(name: &String) -> Self {
        Self::from(name.as_str())
    }
}

impl From<&[&str]> for EventName {
    fn from(segments: &[&str]) -> Self {
        Self::from_segments(segments.iter().copied())
    }
}

impl<const N: usize> From<[&str; N]> for EventName {
    fn from(segments: [&str; N]) -> Self {
        Self::from_segments(segments)
    }
}

impl From<Vec<String>> for EventName {
    fn from(segments: Vec<String>) -> Self {
        Self { segments }
    }
}

/// Typed (mode, name) pair identifying a distributed event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventId {
    pub mode: EventMode,
    pub name: EventName,
}

impl EventId {
    pub fn new(mode: EventMode, name: impl Into<EventName>) -> Self {
        Self {
            mode,
            name: name.into(),
        }
    }

    pub fn one(name: impl Into<EventName>) -> Self {
        Self::new(EventMode::One, name)
    }

    pub fn all(name: impl Into<EventName>) -> Self {
        Self::new(EventMode::All, name)
    }

    /// Registry key: the mode segment followed by the name segments.
    pub fn registry_key(&self) -> EventName {
        self.name.prefixed(self.mode.as_str())
    }

    /// Inverse of `registry_key`.
    pub fn from_registry_key(key: &EventName) -> Option<EventId> {
        let (mode, rest) = key.segments().split_first()?;
        let mode = match mode.as_str() {
            "one" => EventMode::One,
            "all" => EventMode::All,
            _ => return None,
        };
        Some(EventId::new(mode, rest.to_vec()))
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.mode, self.name)
    }
}

/// Segment-wise wildcard match.
///
/// `*` matches exactly one segment; `multi` matches zero or more.
pub(crate) fn match_segments(pattern: &[&str], name: &[&str], multi: &str) -> bool {
    match pattern.split_first() {
        None => name.is_empty(),
        Some((&head, rest)) if head == multi => {
            // Collapse runs of multi-wildcards.
            if rest.first() == Some(&multi) {
                return match_segments(rest, name, multi);
            }
            (0..=name.len()).any(|skip| match_segments(rest, &name[skip..], multi))
        }
        Some((&head, rest)) => match name.split_first() {
            Some((&first, name_rest)) if head == WILDCARD_ONE || head == first => {
                match_segments(rest, name_rest, multi)
            }
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests;
