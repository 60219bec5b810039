// Copyright (c) 2024 EmberMQ contributors. All rights reserved.
// Use of this source is governed by an Apache-2.0 license that can be found
// in the LICENSE file.

//! Topic name/filter syntax (§4.1, §6) and the share-group prefix used by
//! shared subscriptions (`$share/<group>/<filter>`).

use crate::error::DecodeError;

pub const TOPIC_MAX_LEN: usize = 65535;

/// A topic filter split into its shared-subscription group (if any) and the
/// plain filter that follows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFilter {
    pub share_name: Option<String>,
    pub filter: String,
}

/// `ValidTopicName` (§8): non-empty, `<= 65535` bytes, no `+` or `#`.
pub fn validate_topic_name(topic: &str) -> Result<(), DecodeError> {
    if topic.is_empty() || topic.len() > TOPIC_MAX_LEN {
        return Err(DecodeError::InvalidTopicName);
    }
    if topic.contains('+') || topic.contains('#') {
        return Err(DecodeError::InvalidTopicName);
    }
    Ok(())
}

/// `ValidTopicFilter` (§8): non-empty, `<= 65535` bytes, `+` occupies a
/// whole level, `#` is the last character and whole final level. Handles
/// the `$share/<group>/<filter>` prefix by validating the group separately
/// and then validating the remainder as an ordinary filter.
pub fn validate_topic_filter(filter: &str) -> Result<(), DecodeError> {
    if filter.is_empty() || filter.len() > TOPIC_MAX_LEN {
        return Err(DecodeError::InvalidTopicFilter);
    }
    if let Some(rest) = filter.strip_prefix("$share/") {
        let mut parts = rest.splitn(2, '/');
        let group = parts.next().unwrap_or("");
        let remainder = parts.next().ok_or(DecodeError::InvalidTopicFilter)?;
        if group.is_empty() || group.contains('+') || group.contains('#') {
            return Err(DecodeError::InvalidTopicFilter);
        }
        return validate_plain_filter(remainder);
    }
    validate_plain_filter(filter)
}

fn validate_plain_filter(filter: &str) -> Result<(), DecodeError> {
    if filter.is_empty() {
        return Err(DecodeError::InvalidTopicFilter);
    }
    let levels: Vec<&str> = filter.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') && *level != "#" {
            return Err(DecodeError::InvalidTopicFilter);
        }
        if *level == "#" && i != levels.len() - 1 {
            return Err(DecodeError::InvalidTopicFilter);
        }
        if level.contains('+') && *level != "+" {
            return Err(DecodeError::InvalidTopicFilter);
        }
    }
    Ok(())
}

/// Split `$share/<group>/<filter>` into its parts, or treat the whole
/// string as a non-shared filter. Does not validate; call
/// [`validate_topic_filter`] first.
#[must_use]
pub fn parse_filter(filter: &str) -> ParsedFilter {
    if let Some(rest) = filter.strip_prefix("$share/") {
        if let Some((group, remainder)) = rest.split_once('/') {
            return ParsedFilter {
                share_name: Some(group.to_string()),
                filter: remainder.to_string(),
            };
        }
    }
    ParsedFilter {
        share_name: None,
        filter: filter.to_string(),
    }
}

#[must_use]
pub fn is_system_topic(topic: &str) -> bool {
    topic.starts_with('$')
}

/// Match a concrete topic name against a (non-shared) topic filter,
/// following §4.2's walk: `+` matches exactly one level, `#` matches the
/// rest, and a filter starting with a wildcard never matches a system
/// topic.
#[must_use]
pub fn topic_matches_filter(name: &str, filter: &str) -> bool {
    let name_levels: Vec<&str> = name.split('/').collect();
    let filter_levels: Vec<&str> = filter.split('/').collect();

    if is_system_topic(name) && matches!(filter_levels.first(), Some(&"+") | Some(&"#")) {
        return false;
    }

    match_levels(&name_levels, &filter_levels)
}

fn match_levels(name: &[&str], filter: &[&str]) -> bool {
    match (name.first(), filter.first()) {
        (_, Some(&"#")) => true,
        (Some(_), Some(&"+")) => match_levels(&name[1..], &filter[1..]),
        (Some(n), Some(f)) => *n == *f && match_levels(&name[1..], &filter[1..]),
        (None, None) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_name_rules() {
        assert!(validate_topic_name("a/b/c").is_ok());
        assert!(validate_topic_name("a/+").is_err());
        assert!(validate_topic_name("").is_err());
        assert!(validate_topic_name(&"a".repeat(65536)).is_err());
    }

    #[test]
    fn topic_filter_rules() {
        assert!(validate_topic_filter("sport/#").is_ok());
        assert!(validate_topic_filter("sport/#/rank").is_err());
        assert!(validate_topic_filter("+").is_ok());
        assert!(validate_topic_filter("/+1").is_err());
        assert!(validate_topic_filter("$share/group/a/+").is_ok());
        assert!(validate_topic_filter("$share//a/+").is_err());
        assert!(validate_topic_filter("$share/a+b/x").is_err());
    }

    #[test]
    fn matches_plus_wildcard_single_level() {
        assert!(topic_matches_filter("a/x/c", "a/+/c"));
        assert!(!topic_matches_filter("a/x/y", "a/+/c"));
    }

    #[test]
    fn hash_matches_everything_below_but_not_system_topics() {
        assert!(topic_matches_filter("a/b/c", "#"));
        assert!(!topic_matches_filter("$SYS/uptime", "#"));
        assert!(!topic_matches_filter("$SYS/uptime", "+/uptime"));
    }

    #[test]
    fn parses_share_prefix() {
        let parsed = parse_filter("$share/workers/a/b");
        assert_eq!(parsed.share_name.as_deref(), Some("workers"));
        assert_eq!(parsed.filter, "a/b");

        let parsed = parse_filter("a/b");
        assert_eq!(parsed.share_name, None);
        assert_eq!(parsed.filter, "a/b");
    }
}
