//! Topic name validation and topic filter matching
//!
//! Implements the MQTT 3.1.1 rules: `+` matches exactly one level, `#` matches
//! the parent level and everything below it and must be last, and topics
//! beginning with `$` are never matched by a wildcard in the first level.

use thiserror::Error;

/// Validation errors for topic names and filters
#[derive(Debug, Error, PartialEq)]
pub enum TopicError {
    #[error("Topic cannot be empty")]
    Empty,
    #[error("Topic exceeds 65535 bytes")]
    TooLong,
    #[error("Topic contains NUL character")]
    NulCharacter,
    #[error("Topic name contains wildcard character: '{0}'")]
    WildcardInName(char),
    #[error("Wildcard '{0}' must occupy an entire topic level")]
    MisplacedWildcard(char),
    #[error("Multi-level wildcard '#' must be the last level")]
    HashNotLast,
}

fn validate_common(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }
    if topic.len() > usize::from(u16::MAX) {
        return Err(TopicError::TooLong);
    }
    if topic.contains('\0') {
        return Err(TopicError::NulCharacter);
    }
    Ok(())
}

/// Validate a topic name used for PUBLISH (no wildcards)
pub fn validate_topic_name(topic: &str) -> Result<(), TopicError> {
    validate_common(topic)?;

    if let Some(ch) = topic.chars().find(|c| *c == '+' || *c == '#') {
        return Err(TopicError::WildcardInName(ch));
    }

    Ok(())
}

/// Validate a topic filter used for SUBSCRIBE/UNSUBSCRIBE
pub fn validate_topic_filter(filter: &str) -> Result<(), TopicError> {
    validate_common(filter)?;

    let levels: Vec<&str> = filter.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') {
            if *level != "#" {
                return Err(TopicError::MisplacedWildcard('#'));
            }
            if i != levels.len() - 1 {
                return Err(TopicError::HashNotLast);
            }
        }
        if level.contains('+') && *level != "+" {
            return Err(TopicError::MisplacedWildcard('+'));
        }
    }

    Ok(())
}

/// Whether `topic` is matched by `filter`
///
/// Both arguments are assumed valid; an invalid filter simply fails to match.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if filter == topic {
        return true;
    }

    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            // "a/#" also matches the parent level "a"
            (Some("#"), _) => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Whether a filter contains any wildcard level
pub fn is_wildcard_filter(filter: &str) -> bool {
    filter.split('/').any(|level| level == "+" || level == "#")
}

/// Ranking used to choose one handler when several filters match a topic
///
/// Higher is more specific: an exact filter beats any wildcard filter, then
/// more literal levels win, then `+` beats `#`.
pub fn filter_specificity(filter: &str) -> (bool, usize, bool) {
    let literal_levels = filter
        .split('/')
        .filter(|level| *level != "+" && *level != "#")
        .count();
    (
        !is_wildcard_filter(filter),
        literal_levels,
        !filter.ends_with('#'),
    )
}
