//! Topic names and topic filters.
//!
//! - `+` matches exactly one topic level
//! - `#` matches any number of remaining levels, including none (must be last)
//! - topics starting with `$` are not matched by a leading wildcard

use crate::error::{Error, Result};

/// Validate a topic name used for publishing.
pub fn validate_topic(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(Error::InvalidTopic("empty topic".to_string()));
    }
    if topic.len() > u16::MAX as usize {
        return Err(Error::InvalidTopic("topic longer than 65535 bytes".to_string()));
    }
    if topic.contains(['+', '#']) {
        return Err(Error::InvalidTopic(format!("wildcard in topic name: {}", topic)));
    }
    if topic.contains('\0') {
        return Err(Error::InvalidTopic("NUL in topic name".to_string()));
    }
    Ok(())
}

/// Validate a subscription topic filter.
pub fn validate_filter(filter: &str) -> Result<()> {
    if filter.is_empty() {
        return Err(Error::InvalidTopic("empty topic filter".to_string()));
    }
    if filter.len() > u16::MAX as usize {
        return Err(Error::InvalidTopic("topic filter longer than 65535 bytes".to_string()));
    }
    if filter.contains('\0') {
        return Err(Error::InvalidTopic("NUL in topic filter".to_string()));
    }

    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        match level {
            "+" => {}
            "#" => {
                if levels.peek().is_some() {
                    return Err(Error::InvalidTopic(format!("# must be the last level: {}", filter)));
                }
            }
            _ if level.contains(['+', '#']) => {
                return Err(Error::InvalidTopic(format!(
                    "wildcard must occupy a whole level: {}",
                    filter
                )));
            }
            _ => {}
        }
    }

    Ok(())
}

/// Whether `topic` matches `filter`.
///
/// Both are assumed valid; matching is level by level with no partial
/// matches inside a level.
pub fn matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
