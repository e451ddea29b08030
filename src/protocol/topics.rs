//! Topic name and topic filter validation
//!
//! Publish topics must be concrete names; subscription filters may use the
//! single-level `+` and multi-level `#` wildcards, each occupying a whole level
//! and `#` only as the last level.

use super::codec::MAX_STRING_LEN;
use thiserror::Error;

pub fn validate_topic_name(topic: &str) -> Result<(), ValidationError> {
    check_common(topic)?;
    if let Some(ch) = topic.chars().find(|ch| matches!(ch, '+' | '#')) {
        return Err(ValidationError::WildcardInTopicName(ch));
    }
    Ok(())
}

pub fn validate_topic_filter(filter: &str) -> Result<(), ValidationError> {
    check_common(filter)?;

    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    for (index, level) in levels.iter().enumerate() {
        match *level {
            "+" => {}
            "#" if index == last => {}
            "#" => return Err(ValidationError::MultiLevelWildcardNotLast),
            other if other.contains(['+', '#']) => {
                return Err(ValidationError::WildcardNotWholeLevel(other.to_string()))
            }
            _ => {}
        }
    }
    Ok(())
}

fn check_common(topic: &str) -> Result<(), ValidationError> {
    if topic.is_empty() {
        return Err(ValidationError::EmptyTopic);
    }
    if topic.len() > MAX_STRING_LEN {
        return Err(ValidationError::TopicTooLong(topic.len()));
    }
    if topic.contains('\0') {
        return Err(ValidationError::NulCharacter);
    }
    Ok(())
}

/// Whether a concrete topic name is matched by a subscription filter.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    // Filters starting with a wildcard never match $-prefixed system topics
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

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

/// Topic validation errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Topic cannot be empty")]
    EmptyTopic,
    #[error("Topic of {0} bytes exceeds 65535 bytes")]
    TopicTooLong(usize),
    #[error("Topic contains a NUL character")]
    NulCharacter,
    #[error("Topic name contains wildcard character: '{0}'")]
    WildcardInTopicName(char),
    #[error("'#' must be the last level of a topic filter")]
    MultiLevelWildcardNotLast,
    #[error("Wildcard must occupy a whole level, found '{0}'")]
    WildcardNotWholeLevel(String),
}
