//! Topic filter validation and matching
//!
//! Filters follow MQTT rules: levels are separated by `/`, `+` matches exactly
//! one level and `#` matches the remaining levels (including none) when it is
//! the last level of the filter.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopicError {
    #[error("Topic filter cannot be empty")]
    EmptyFilter,
    #[error("Multi-level wildcard must be the last level: {0}")]
    MisplacedMultiLevel(String),
    #[error("Wildcards must occupy a whole level: {0}")]
    PartialWildcard(String),
    #[error("Topic name cannot contain wildcards: {0}")]
    WildcardInTopic(String),
}

pub fn validate_filter(filter: &str) -> Result<(), TopicError> {
    if filter.is_empty() {
        return Err(TopicError::EmptyFilter);
    }

    let levels: Vec<&str> = filter.split('/').collect();
    for (index, level) in levels.iter().enumerate() {
        if level.len() > 1 && (level.contains('+') || level.contains('#')) {
            return Err(TopicError::PartialWildcard(filter.to_string()));
        }
        if *level == "#" && index != levels.len() - 1 {
            return Err(TopicError::MisplacedMultiLevel(filter.to_string()));
        }
    }

    Ok(())
}

pub fn validate_topic_name(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::EmptyFilter);
    }
    if topic.contains('+') || topic.contains('#') {
        return Err(TopicError::WildcardInTopic(topic.to_string()));
    }
    Ok(())
}

/// Does `topic` (a concrete topic name) match `filter`?
pub fn topic_matches(topic: &str, filter: &str) -> bool {
    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/').peekable();

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) if filter_levels.peek().is_none() => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_exact_match() {
        assert!(topic_matches("sensors/kitchen/temp", "sensors/kitchen/temp"));
        assert!(!topic_matches("sensors/kitchen/temp", "sensors/kitchen"));
        assert!(!topic_matches("sensors/kitchen", "sensors/kitchen/temp"));
    }

    #[test]
    fn test_single_level_wildcard() {
        assert!(topic_matches("sensors/kitchen/temp", "sensors/+/temp"));
        assert!(!topic_matches("sensors/kitchen/oven/temp", "sensors/+/temp"));
        assert!(topic_matches("sensors//temp", "sensors/+/temp"));
    }

    #[test]
    fn test_multi_level_wildcard() {
        assert!(topic_matches("sensors/kitchen/temp", "sensors/#"));
        assert!(topic_matches("sensors", "sensors/#"));
        assert!(topic_matches("anything/at/all", "#"));
        assert!(!topic_matches("actuators/valve", "sensors/#"));
    }

    #[test]
    fn test_misplaced_hash_is_literal() {
        assert!(!topic_matches("a/b/c", "a/#/c"));
    }

    #[test]
    fn test_filter_validation() {
        assert!(validate_filter("a/+/c").is_ok());
        assert!(validate_filter("a/#").is_ok());
        assert_eq!(validate_filter(""), Err(TopicError::EmptyFilter));
        assert!(matches!(
            validate_filter("a/#/c"),
            Err(TopicError::MisplacedMultiLevel(_))
        ));
        assert!(matches!(
            validate_filter("a/b+/c"),
            Err(TopicError::PartialWildcard(_))
        ));
    }

    #[test]
    fn test_topic_name_validation() {
        assert!(validate_topic_name("a/b").is_ok());
        assert!(validate_topic_name("a/+").is_err());
        assert!(validate_topic_name("").is_err());
    }

    proptest! {
        #[test]
        fn plain_topic_matches_itself(topic in "[a-z0-9]{1,8}(/[a-z0-9]{1,8}){0,5}") {
            prop_assert!(topic_matches(&topic, &topic));
        }

        #[test]
        fn hash_matches_every_topic(topic in "[a-z0-9]{1,8}(/[a-z0-9]{1,8}){0,5}") {
            prop_assert!(topic_matches(&topic, "#"));
        }

        #[test]
        fn plus_per_level_matches_same_depth(topic in "[a-z0-9]{1,8}(/[a-z0-9]{1,8}){0,5}") {
            let depth = topic.split('/').count();
            let filter = vec!["+"; depth].join("/");
            prop_assert!(topic_matches(&topic, &filter));
            let deeper = format!("{filter}/+");
            prop_assert!(!topic_matches(&topic, &deeper));
        }
    }
}
