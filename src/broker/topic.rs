//! Topic names, subscription filters and the matcher between them.
//!
//! A topic is split on `/` into segments. Empty segments are ordinary literal
//! segments, so `a//b` has three segments and only matches filters that also
//! carry an empty middle segment. Filters may use `+` (exactly one segment)
//! and `#` (the rest of the topic, including nothing at all, last segment
//! only).
//!
//! Topics whose first segment starts with `$` are reserved for broker-internal
//! use: a filter that starts with a wildcard never matches them.

use std::fmt;
use std::str::{FromStr, Split};

use crate::utils::error::TopicError;

pub const SEPARATOR: char = '/';
pub const SINGLE_LEVEL: &str = "+";
pub const MULTI_LEVEL: &str = "#";
const RESERVED_PREFIX: char = '$';

/// A validated topic name as carried by a PUBLISH. Never contains wildcards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicName(String);

impl TopicName {
    pub fn new(name: impl Into<String>) -> Result<Self, TopicError> {
        let name = name.into();
        if name.is_empty() {
            return Err(TopicError::Empty);
        }
        if name.contains('\0') {
            return Err(TopicError::NullCharacter);
        }
        if name.contains(['+', '#']) {
            return Err(TopicError::WildcardInTopic(name));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> Split<'_, char> {
        self.0.split(SEPARATOR)
    }

    pub fn first_segment(&self) -> &str {
        self.segments().next().unwrap_or_default()
    }

    /// Whether the topic lives in the `$`-prefixed internal namespace.
    pub fn is_reserved(&self) -> bool {
        self.0.starts_with(RESERVED_PREFIX)
    }

    /// The remainder of the topic below `prefix`, if the topic lives there.
    ///
    /// `strip_prefix("hmi")` on `hmi/la1/forward` yields `la1/forward`, on
    /// `hmi` yields an empty string and on `hmix/a` yields `None`.
    pub fn strip_prefix(&self, prefix: &str) -> Option<&str> {
        let rest = self.0.strip_prefix(prefix)?;
        if rest.is_empty() {
            Some(rest)
        } else {
            rest.strip_prefix(SEPARATOR)
        }
    }
}

impl fmt::Display for TopicName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TopicName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for TopicName {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// A validated subscription filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicFilter(String);

impl TopicFilter {
    /// Parse a filter. `#` anywhere but as the final whole segment, or a
    /// wildcard sharing a segment with other characters, is rejected here so
    /// that a bad filter never reaches the registry.
    pub fn new(filter: impl Into<String>) -> Result<Self, TopicError> {
        let filter = filter.into();
        if filter.is_empty() {
            return Err(TopicError::Empty);
        }
        if filter.contains('\0') {
            return Err(TopicError::NullCharacter);
        }

        let mut segments = filter.split(SEPARATOR).peekable();
        while let Some(segment) = segments.next() {
            if segment.contains('#') {
                if segment != MULTI_LEVEL || segments.peek().is_some() {
                    return Err(TopicError::MisplacedMultiLevel(filter));
                }
            } else if segment.contains('+') && segment != SINGLE_LEVEL {
                return Err(TopicError::PartialWildcard(filter));
            }
        }

        Ok(Self(filter))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> Split<'_, char> {
        self.0.split(SEPARATOR)
    }

    pub fn first_segment(&self) -> &str {
        self.segments().next().unwrap_or_default()
    }

    pub fn has_wildcards(&self) -> bool {
        self.segments()
            .any(|segment| segment == SINGLE_LEVEL || segment == MULTI_LEVEL)
    }

    pub fn starts_with_wildcard(&self) -> bool {
        matches!(self.first_segment(), SINGLE_LEVEL | MULTI_LEVEL)
    }

    pub fn matches(&self, topic: &TopicName) -> bool {
        matches(self, topic)
    }

    pub fn overlaps(&self, other: &TopicFilter) -> bool {
        filters_overlap(self, other)
    }

    /// The filter covering `prefix` and everything below it.
    pub fn namespace(prefix: &str) -> Result<Self, TopicError> {
        Self::new(format!("{prefix}{SEPARATOR}{MULTI_LEVEL}"))
    }
}

impl fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TopicFilter {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for TopicFilter {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Whether `topic` is matched by `filter`.
pub fn matches(filter: &TopicFilter, topic: &TopicName) -> bool {
    if topic.is_reserved() && filter.starts_with_wildcard() {
        return false;
    }

    let mut filter_segments = filter.segments();
    let mut topic_segments = topic.segments();
    loop {
        match (filter_segments.next(), topic_segments.next()) {
            (Some(MULTI_LEVEL), _) => return true,
            (Some(SINGLE_LEVEL), Some(_)) => continue,
            (Some(expected), Some(actual)) if expected == actual => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Whether some topic exists that both filters match.
pub fn filters_overlap(left: &TopicFilter, right: &TopicFilter) -> bool {
    let mut left_segments = left.segments();
    let mut right_segments = right.segments();
    loop {
        match (left_segments.next(), right_segments.next()) {
            (Some(MULTI_LEVEL), _) | (_, Some(MULTI_LEVEL)) => return true,
            (Some(SINGLE_LEVEL), Some(_)) | (Some(_), Some(SINGLE_LEVEL)) => continue,
            (Some(l), Some(r)) if l == r => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
