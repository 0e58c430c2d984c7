//! MQTT topic names and filters
//!
//! Topics are slash-separated levels: `nfc_relay/clients/alice-transmitter-001/control`
//!
//! Filters may contain wildcards, each occupying a whole level:
//! - `+` matches exactly one level
//! - `#` matches any remaining levels and must be last
//!
//! Access rules compare levels literally, so `+` and `#` are just strings to
//! them. A filter can only reach what its literal levels already name.

use std::fmt;
use thiserror::Error;

/// MQTT limit on the encoded topic length
const MAX_TOPIC_LEN: usize = 65_535;

pub const SINGLE_LEVEL_WILDCARD: &str = "+";
pub const MULTI_LEVEL_WILDCARD: &str = "#";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicError {
    #[error("topic cannot be empty")]
    Empty,

    #[error("topic exceeds 65535 bytes")]
    TooLong,

    #[error("topic contains a NUL character")]
    NullChar,

    #[error("wildcard misplaced in level '{0}'")]
    InvalidWildcard(String),

    #[error("wildcards are not allowed in topic names")]
    WildcardInName,
}

/// A validated topic name or filter
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    name: String,
    /// Start offset of each level
    levels: Vec<usize>,
    has_wildcards: bool,
}

impl Topic {
    /// Parse a topic filter (wildcards allowed)
    pub fn parse_filter(name: &str) -> Result<Self, TopicError> {
        if name.is_empty() {
            return Err(TopicError::Empty);
        }
        if name.len() > MAX_TOPIC_LEN {
            return Err(TopicError::TooLong);
        }
        if name.contains('\0') {
            return Err(TopicError::NullChar);
        }

        let count = name.split('/').count();
        let mut levels = Vec::with_capacity(count);
        let mut has_wildcards = false;
        let mut offset = 0;

        for (i, level) in name.split('/').enumerate() {
            levels.push(offset);
            offset += level.len() + 1;

            match level {
                SINGLE_LEVEL_WILDCARD => has_wildcards = true,
                MULTI_LEVEL_WILDCARD if i + 1 == count => has_wildcards = true,
                _ if level.contains(|c: char| c == '+' || c == '#') => {
                    return Err(TopicError::InvalidWildcard(level.to_string()))
                }
                _ => {}
            }
        }

        Ok(Self {
            name: name.to_string(),
            levels,
            has_wildcards,
        })
    }

    /// Parse a concrete topic name (no wildcards)
    pub fn parse_name(name: &str) -> Result<Self, TopicError> {
        let topic = Self::parse_filter(name)?;
        if topic.has_wildcards {
            return Err(TopicError::WildcardInName);
        }
        Ok(topic)
    }

    pub fn as_str(&self) -> &str {
        &self.name
    }

    pub fn has_wildcards(&self) -> bool {
        self.has_wildcards
    }

    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    pub fn level(&self, index: usize) -> Option<&str> {
        let start = *self.levels.get(index)?;
        let end = match self.levels.get(index + 1) {
            Some(next) => next - 1,
            None => self.name.len(),
        };
        Some(&self.name[start..end])
    }

    pub fn levels(&self) -> impl Iterator<Item = &str> {
        self.name.split('/')
    }

    /// If the leading levels equal `prefix`, the number of levels after it
    pub fn levels_after<S: AsRef<str>>(&self, prefix: &[S]) -> Option<usize> {
        if prefix.len() > self.levels.len() {
            return None;
        }
        let matches = prefix
            .iter()
            .enumerate()
            .all(|(i, p)| self.level(i) == Some(p.as_ref()));
        matches.then(|| self.levels.len() - prefix.len())
    }

    /// Strictly below `prefix`: at least one more level
    pub fn is_under<S: AsRef<str>>(&self, prefix: &[S]) -> bool {
        matches!(self.levels_after(prefix), Some(n) if n > 0)
    }

    /// Exactly the levels of `path`
    pub fn is_exactly<S: AsRef<str>>(&self, path: &[S]) -> bool {
        self.levels_after(path) == Some(0)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}
