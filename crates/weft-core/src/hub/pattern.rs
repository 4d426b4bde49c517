//! Event-name filters for hub subscriptions.
//!
//! Patterns are compiled once when a listener subscribes:
//! - `"*"` matches every event
//! - `"**"` matches every event, nested namespaces included
//! - `"agent:*"` matches any name starting with `agent:`
//! - anything else is an exact name
//!
//! A filter built from several patterns matches when any of them does.

/// One compiled event-name pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPattern {
    Any,
    DeepWildcard,
    Prefix(String),
    Exact(String),
}

impl EventPattern {
    pub fn parse(pattern: &str) -> Self {
        match pattern {
            "*" => EventPattern::Any,
            "**" => EventPattern::DeepWildcard,
            p => match p.strip_suffix("**").or_else(|| p.strip_suffix('*')) {
                Some(prefix) => EventPattern::Prefix(prefix.to_string()),
                None => EventPattern::Exact(p.to_string()),
            },
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        match self {
            EventPattern::Any | EventPattern::DeepWildcard => true,
            EventPattern::Prefix(prefix) => name.starts_with(prefix.as_str()),
            EventPattern::Exact(exact) => name == exact,
        }
    }
}

/// Match-any set of patterns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFilter {
    patterns: Vec<EventPattern>,
}

impl EventFilter {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            patterns: patterns
                .into_iter()
                .map(|p| EventPattern::parse(p.as_ref()))
                .collect(),
        }
    }

    pub fn all() -> Self {
        Self {
            patterns: vec![EventPattern::Any],
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(name))
    }
}

impl From<&str> for EventFilter {
    fn from(pattern: &str) -> Self {
        Self::new([pattern])
    }
}

impl From<String> for EventFilter {
    fn from(pattern: String) -> Self {
        Self::new([pattern])
    }
}

impl From<&[&str]> for EventFilter {
    fn from(patterns: &[&str]) -> Self {
        Self::new(patterns.iter().copied())
    }
}

impl<const N: usize> From<[&str; N]> for EventFilter {
    fn from(patterns: [&str; N]) -> Self {
        Self::new(patterns)
    }
}

impl From<Vec<String>> for EventFilter {
    fn from(patterns: Vec<String>) -> Self {
        Self::new(patterns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_forms() {
        assert_eq!(EventPattern::parse("*"), EventPattern::Any);
        assert_eq!(EventPattern::parse("**"), EventPattern::DeepWildcard);
        assert_eq!(EventPattern::parse("agent:*"), EventPattern::Prefix("agent:".into()));
        assert_eq!(EventPattern::parse("agent:**"), EventPattern::Prefix("agent:".into()));
        assert_eq!(EventPattern::parse("node:start"), EventPattern::Exact("node:start".into()));
    }

    #[test]
    fn test_prefix_pattern() {
        let filter = EventFilter::from("agent:*");
        assert!(filter.matches("agent:start"));
        assert!(filter.matches("agent:tool:call"));
        assert!(!filter.matches("harness:start"));
    }

    #[test]
    fn test_deep_wildcard_matches_everything() {
        let filter = EventFilter::from("**");
        assert!(filter.matches("agent:start"));
        assert!(filter.matches("harness:start"));
        assert!(filter.matches("a:b:c:d"));
    }

    #[test]
    fn test_exact_pattern() {
        let filter = EventFilter::from("node:start");
        assert!(filter.matches("node:start"));
        assert!(!filter.matches("node:started"));
        assert!(!filter.matches("node"));
    }

    #[test]
    fn test_array_filter_is_match_any() {
        let filter = EventFilter::from(["flow:complete", "node:*"]);
        assert!(filter.matches("flow:complete"));
        assert!(filter.matches("node:failed"));
        assert!(!filter.matches("flow:start"));
        assert!(!EventFilter::new(Vec::<String>::new()).matches("anything"));
    }
}
