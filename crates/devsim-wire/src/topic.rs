//! Topic names and topic filters
//!
//! Topic levels are separated by `/`. Filters may use `+` for exactly one
//! level and a trailing `#` for any number of levels, including zero.

use devsim_core::{DeviceError, DeviceResult};

/// Longest topic a packet can carry (u16 length prefix)
pub const MAX_TOPIC_LEN: usize = u16::MAX as usize;

/// Validate a topic name used in PUBLISH
pub fn validate_topic(topic: &str) -> DeviceResult<()> {
    if topic.is_empty() {
        return Err(DeviceError::InvalidWireFormat("Empty topic".into()));
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(DeviceError::InvalidWireFormat("Topic too long".into()));
    }
    if topic.contains(['+', '#', '\0']) {
        return Err(DeviceError::InvalidWireFormat(format!(
            "Topic {topic:?} contains a wildcard"
        )));
    }
    Ok(())
}

/// Validate a topic filter used in SUBSCRIBE
pub fn validate_filter(filter: &str) -> DeviceResult<()> {
    if filter.is_empty() || filter.len() > MAX_TOPIC_LEN {
        return Err(DeviceError::InvalidWireFormat(format!(
            "Invalid filter length {}",
            filter.len()
        )));
    }

    let levels: Vec<&str> = filter.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        let bad_hash = level.contains('#') && (*level != "#" || i != levels.len() - 1);
        let bad_plus = level.contains('+') && *level != "+";
        if bad_hash || bad_plus {
            return Err(DeviceError::InvalidWireFormat(format!(
                "Filter {filter:?} misuses a wildcard"
            )));
        }
    }
    Ok(())
}

/// Does `filter` match `topic`?
///
/// Topics starting with `$` are not matched by a leading wildcard.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
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

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_device_namespace_filter() {
        assert!(topic_matches("mqtt/#", "mqtt/device-1"));
        assert!(topic_matches("mqtt/#", "mqtt/a/b/c"));
        assert!(topic_matches("mqtt/#", "mqtt"));
        assert!(!topic_matches("mqtt/#", "other/device-1"));
        assert!(!topic_matches("mqtt/#", "mqttx/device-1"));
    }

    #[test]
    fn test_single_level_wildcard() {
        assert!(topic_matches("mqtt/+", "mqtt/a"));
        assert!(!topic_matches("mqtt/+", "mqtt/a/b"));
        assert!(!topic_matches("mqtt/+", "mqtt"));
        assert!(topic_matches("+/+/c", "a/b/c"));
        assert!(topic_matches("mqtt/+", "mqtt/"));
    }

    #[test]
    fn test_system_topics() {
        assert!(!topic_matches("#", "$SYS/uptime"));
        assert!(!topic_matches("+/uptime", "$SYS/uptime"));
        assert!(topic_matches("$SYS/#", "$SYS/uptime"));
    }

    #[test]
    fn test_filter_validation() {
        assert!(validate_filter("mqtt/#").is_ok());
        assert!(validate_filter("#").is_ok());
        assert!(validate_filter("a/+/c").is_ok());
        assert!(validate_filter("a/#/c").is_err());
        assert!(validate_filter("a/b#").is_err());
        assert!(validate_filter("a/b+").is_err());
        assert!(validate_filter("").is_err());
    }

    #[test]
    fn test_topic_validation() {
        assert!(validate_topic("mqtt/device-1").is_ok());
        assert!(validate_topic("").is_err());
        assert!(validate_topic("mqtt/+").is_err());
    }

    proptest! {
        #[test]
        fn prop_topic_matches_itself(levels in proptest::collection::vec("[a-z0-9-]{1,8}", 1..6)) {
            let topic = levels.join("/");
            prop_assert!(topic_matches(&topic, &topic));
            prop_assert!(topic_matches("#", &topic));
            let prefix_filter = format!("{}/#", levels[0]);
            prop_assert!(topic_matches(&prefix_filter, &topic));
        }
    }
}
