use crate::observer::{Observer, TracingObserver};

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Content type stamped on requests and responses unless overridden.
pub const DEFAULT_CONTENT_TYPE: &str = "text/plain";

/// Default deadline for a call when none is given.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound on a single publish.
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// What the delivery loop does with a delivery whose handler failed.
///
/// Successful deliveries are always acknowledged.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AckPolicy {
    /// Acknowledge anyway. The failed message is not redelivered.
    #[default]
    AckAlways,

    /// Reject and ask the broker to redeliver.
    NackRequeue,

    /// Reject without requeue so the broker dead-letters or drops it.
    NackDeadLetter,
}

impl fmt::Display for AckPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::AckAlways => "ack-always",
            Self::NackRequeue => "nack-requeue",
            Self::NackDeadLetter => "nack-dead-letter",
        })
    }
}

/// Returned when parsing an unknown ack policy.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("unknown ack policy: {0}")]
pub struct UnknownAckPolicy(pub String);

impl FromStr for AckPolicy {
    type Err = UnknownAckPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ack-always" | "ack" => Ok(Self::AckAlways),
            "nack-requeue" | "requeue" => Ok(Self::NackRequeue),
            "nack-dead-letter" | "dead-letter" => Ok(Self::NackDeadLetter),
            _ => Err(UnknownAckPolicy(s.to_string())),
        }
    }
}

/// How a client receives responses to its calls.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReplyMode {
    /// One reply queue per client, consumed by a single router that hands
    /// each response to the waiting call.
    #[default]
    Shared,

    /// A fresh exclusive reply queue per call, matched by a single-shot
    /// subscription and released when the call returns.
    PerCall,
}

impl fmt::Display for ReplyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Shared => "shared",
            Self::PerCall => "per-call",
        })
    }
}

/// Returned when parsing an unknown reply mode.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("unknown reply mode: {0}")]
pub struct UnknownReplyMode(pub String);

impl FromStr for ReplyMode {
    type Err = UnknownReplyMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "shared" => Ok(Self::Shared),
            "per-call" | "percall" => Ok(Self::PerCall),
            _ => Err(UnknownReplyMode(s.to_string())),
        }
    }
}

/// Options for a [`Client`](crate::Client).
#[derive(Clone, Debug)]
pub struct ClientOptions {
    /// Policy for consume and serve subscriptions started by the client.
    pub ack_policy: AckPolicy,

    /// Deadline used when a call does not set its own.
    pub call_timeout: Duration,

    /// Content type for requests and responses. `None` leaves it unset.
    pub content_type: Option<String>,

    /// Receives handler failures, reply failures and other loop events.
    pub observer: Arc<dyn Observer>,

    /// Bound on each publish that is not part of a call.
    pub publish_timeout: Duration,

    /// How responses are received.
    pub reply_mode: ReplyMode,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            ack_policy: AckPolicy::default(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            content_type: Some(DEFAULT_CONTENT_TYPE.to_string()),
            observer: Arc::new(TracingObserver),
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
            reply_mode: ReplyMode::default(),
        }
    }
}

/// Options for a single delivery loop.
#[derive(Clone, Debug)]
pub struct SubscriptionOptions {
    /// What to do with deliveries whose handler failed.
    pub ack_policy: AckPolicy,

    /// External cancellation. The loop stops when this token, or the
    /// subscription's own token, is cancelled.
    pub cancellation: Option<CancellationToken>,

    /// Receives handler failures and loop events.
    pub observer: Arc<dyn Observer>,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            ack_policy: AckPolicy::default(),
            cancellation: None,
            observer: Arc::new(TracingObserver),
        }
    }
}

impl SubscriptionOptions {
    /// Sets the ack policy.
    #[must_use]
    pub const fn with_ack_policy(mut self, ack_policy: AckPolicy) -> Self {
        self.ack_policy = ack_policy;
        self
    }

    /// Ties the loop to an external cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = Some(cancellation);
        self
    }

    /// Sets the observer.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }
}

/// Per-call overrides.
#[derive(Clone, Debug, Default)]
pub struct CallOptions {
    /// Cancels the call when triggered.
    pub cancellation: Option<CancellationToken>,

    /// Correlation id to use instead of a generated one. It must not
    /// collide with another call outstanding on the same client.
    pub correlation_id: Option<String>,

    /// Deadline for the whole call, falling back to the client default.
    pub timeout: Option<Duration>,
}

impl CallOptions {
    /// Options with only a timeout set.
    #[must_use]
    pub const fn with_timeout(timeout: Duration) -> Self {
        Self {
            cancellation: None,
            correlation_id: None,
            timeout: Some(timeout),
        }
    }

    /// Sets the cancellation token.
    #[must_use]
    pub fn cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = Some(cancellation);
        self
    }

    /// Sets an explicit correlation id.
    #[must_use]
    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_policy_parse() {
        assert_eq!("ack-always".parse(), Ok(AckPolicy::AckAlways));
        assert_eq!("NACK-REQUEUE".parse(), Ok(AckPolicy::NackRequeue));
        assert_eq!("dead-letter".parse(), Ok(AckPolicy::NackDeadLetter));
        assert_eq!(
            "drop".parse::<AckPolicy>(),
            Err(UnknownAckPolicy("drop".to_string()))
        );
    }

    #[test]
    fn test_ack_policy_display_parses_back() {
        for policy in [
            AckPolicy::AckAlways,
            AckPolicy::NackRequeue,
            AckPolicy::NackDeadLetter,
        ] {
            assert_eq!(policy.to_string().parse(), Ok(policy));
        }
    }

    #[test]
    fn test_reply_mode_parse() {
        assert_eq!("shared".parse(), Ok(ReplyMode::Shared));
        assert_eq!("per-call".parse(), Ok(ReplyMode::PerCall));
        assert!("fanout".parse::<ReplyMode>().is_err());
    }

    #[test]
    fn test_client_defaults() {
        let options = ClientOptions::default();
        assert_eq!(options.ack_policy, AckPolicy::AckAlways);
        assert_eq!(options.call_timeout, Duration::from_secs(10));
        assert_eq!(options.content_type.as_deref(), Some("text/plain"));
        assert_eq!(options.reply_mode, ReplyMode::Shared);
    }
}
