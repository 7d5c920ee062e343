use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Name of the nameless default exchange. It routes every message to the
/// queue whose name equals the routing key.
pub const DEFAULT_EXCHANGE: &str = "";

/// Routing behaviour of an exchange.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    /// Routing key must equal the binding key.
    #[default]
    Direct,

    /// Routing key is ignored; every bound queue receives the message.
    Fanout,

    /// Dot-separated words; `*` in a binding matches one word, `#` matches
    /// zero or more words.
    Topic,
}

impl ExchangeKind {
    /// Whether a message published with `routing_key` reaches a queue bound
    /// with `binding_key`.
    #[must_use]
    pub fn matches(self, binding_key: &str, routing_key: &str) -> bool {
        match self {
            Self::Direct => binding_key == routing_key,
            Self::Fanout => true,
            Self::Topic => {
                let pattern: Vec<&str> = binding_key.split('.').collect();
                let words: Vec<&str> = routing_key.split('.').collect();
                topic_matches(&pattern, &words)
            }
        }
    }
}

fn topic_matches(pattern: &[&str], words: &[&str]) -> bool {
    match pattern.split_first() {
        None => words.is_empty(),
        Some((&"#", rest)) => (0..=words.len()).any(|skip| topic_matches(rest, &words[skip..])),
        Some((&head, rest)) => match words.split_first() {
            Some((&word, remaining)) => {
                (head == "*" || head == word) && topic_matches(rest, remaining)
            }
            None => false,
        },
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Self::Direct => "direct",
            Self::Fanout => "fanout",
            Self::Topic => "topic",
        };
        f.write_str(kind)
    }
}

/// Returned when parsing an exchange kind that is not supported.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("unknown exchange kind: {0}")]
pub struct UnknownExchangeKind(pub String);

impl FromStr for ExchangeKind {
    type Err = UnknownExchangeKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(Self::Direct),
            "fanout" => Ok(Self::Fanout),
            "topic" => Ok(Self::Topic),
            _ => Err(UnknownExchangeKind(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_requires_exact_key() {
        assert!(ExchangeKind::Direct.matches("request_key", "request_key"));
        assert!(!ExchangeKind::Direct.matches("request_key", "request_key.extra"));
    }

    #[test]
    fn test_fanout_ignores_key() {
        assert!(ExchangeKind::Fanout.matches("", "anything"));
    }

    #[test]
    fn test_topic_wildcards() {
        let topic = ExchangeKind::Topic;

        assert!(topic.matches("orders.*", "orders.created"));
        assert!(!topic.matches("orders.*", "orders.created.eu"));
        assert!(topic.matches("orders.#", "orders"));
        assert!(topic.matches("orders.#", "orders.created.eu"));
        assert!(topic.matches("#.eu", "orders.created.eu"));
        assert!(topic.matches("*.created.#", "orders.created"));
        assert!(!topic.matches("*.created", "orders.deleted"));
    }

    #[test]
    fn test_parse_kind() {
        assert_eq!("direct".parse(), Ok(ExchangeKind::Direct));
        assert_eq!("Topic".parse(), Ok(ExchangeKind::Topic));
        assert_eq!(
            "headers".parse::<ExchangeKind>(),
            Err(UnknownExchangeKind("headers".to_string()))
        );
        assert_eq!(ExchangeKind::Fanout.to_string(), "fanout");
    }
}
