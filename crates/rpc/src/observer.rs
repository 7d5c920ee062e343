use std::any::Any;
use std::error::Error as StdError;
use std::fmt::Debug;

use thiserror::Error;
use tracing::{debug, error, warn};

/// Boxed error returned by application handlers.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Why a handler did not complete normally.
#[derive(Debug, Error)]
pub enum HandlerFailure {
    /// The handler returned an error.
    #[error("handler failed: {0}")]
    Error(BoxError),

    /// The handler panicked.
    #[error("handler panicked: {0}")]
    Panic(String),
}

impl HandlerFailure {
    /// Wraps a handler error.
    pub fn error(error: impl Into<BoxError>) -> Self {
        Self::Error(error.into())
    }

    pub(crate) fn from_panic(payload: &(dyn Any + Send + 'static)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Self::Panic(message)
    }
}

/// What happened to a request taken off a serve queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestOutcome {
    /// A response was published to the reply address.
    Replied,

    /// The request carried no reply address, so nothing was published.
    NoReply,

    /// Publishing the response failed.
    ReplyFailed,

    /// The handler failed, so nothing was published.
    HandlerFailed,
}

/// Receives events from delivery loops and calls.
///
/// Every method has an empty default, so implementors override only the
/// events they care about.
pub trait Observer: Debug + Send + Sync + 'static {
    /// A handler returned an error or panicked.
    fn on_handler_failed(&self, _queue: &str, _correlation_id: &str, _failure: &HandlerFailure) {}

    /// Publishing a response failed. The request is still acknowledged.
    fn on_reply_failed(
        &self,
        _queue: &str,
        _reply_to: &str,
        _correlation_id: &str,
        _error: &dyn StdError,
    ) {
    }

    /// A request taken off a serve queue was finished.
    fn on_request_completed(&self, _queue: &str, _correlation_id: &str, _outcome: RequestOutcome) {}

    /// Acknowledging or rejecting a delivery failed.
    fn on_ack_failed(&self, _queue: &str, _delivery_tag: u64, _error: &dyn StdError) {}

    /// A reply arrived that no outstanding call was waiting for.
    fn on_unmatched_reply(&self, _queue: &str, _correlation_id: &str) {}

    /// The transport reported an error and the loop stopped.
    fn on_subscription_error(&self, _queue: &str, _error: &dyn StdError) {}
}

/// Reports every event through `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn on_handler_failed(&self, queue: &str, correlation_id: &str, failure: &HandlerFailure) {
        error!(queue, correlation_id, "error handling message: {failure}");
    }

    fn on_reply_failed(
        &self,
        queue: &str,
        reply_to: &str,
        correlation_id: &str,
        error: &dyn StdError,
    ) {
        error!(queue, reply_to, correlation_id, "failed to publish response: {error}");
    }

    fn on_request_completed(&self, queue: &str, correlation_id: &str, outcome: RequestOutcome) {
        debug!(queue, correlation_id, ?outcome, "request completed");
    }

    fn on_ack_failed(&self, queue: &str, delivery_tag: u64, error: &dyn StdError) {
        error!(queue, delivery_tag, "failed to settle delivery: {error}");
    }

    fn on_unmatched_reply(&self, queue: &str, correlation_id: &str) {
        debug!(queue, correlation_id, "dropping reply with no waiting call");
    }

    fn on_subscription_error(&self, queue: &str, error: &dyn StdError) {
        warn!(queue, "subscription failed: {error}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::panic;

    #[test]
    fn test_panic_payload_messages() {
        let payload = panic::catch_unwind(|| panic!("static message")).unwrap_err();
        assert!(matches!(
            HandlerFailure::from_panic(payload.as_ref()),
            HandlerFailure::Panic(m) if m == "static message"
        ));

        let payload = panic::catch_unwind(|| panic!("formatted {}", 42)).unwrap_err();
        assert!(matches!(
            HandlerFailure::from_panic(payload.as_ref()),
            HandlerFailure::Panic(m) if m == "formatted 42"
        ));

        let payload = panic::catch_unwind(|| panic::panic_any(7_u32)).unwrap_err();
        assert!(matches!(
            HandlerFailure::from_panic(payload.as_ref()),
            HandlerFailure::Panic(m) if m == "non-string panic payload"
        ));
    }

    #[test]
    fn test_handler_error_display() {
        let failure = HandlerFailure::error("bad input");
        assert_eq!(failure.to_string(), "handler failed: bad input");
    }
}
