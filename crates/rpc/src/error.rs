use bridge_broker::BrokerError;
use thiserror::Error;

/// Errors returned by the request/response layer.
#[derive(Debug, Error)]
pub enum Error<BE>
where
    BE: BrokerError,
{
    /// Transport error, propagated unchanged.
    #[error(transparent)]
    Broker(BE),

    /// The call was cancelled before a response arrived.
    #[error("call {correlation_id} cancelled")]
    Cancelled {
        /// Correlation id of the call.
        correlation_id: String,
    },

    /// The client was shut down.
    #[error("client shut down")]
    ClientShutdown,

    /// A call with this correlation id is already outstanding.
    #[error("correlation id {0} is already outstanding")]
    CorrelationIdInUse(String),

    /// Publishing did not complete within the publish timeout.
    #[error("timed out publishing to {exchange:?} with routing key {routing_key:?}")]
    PublishTimeout {
        /// Target exchange.
        exchange: String,
        /// Target routing key.
        routing_key: String,
    },

    /// The reply subscription ended, so no response can arrive any more.
    #[error("reply channel closed before a response to {correlation_id} arrived")]
    ReplyChannelClosed {
        /// Correlation id of the call.
        correlation_id: String,
    },

    /// No matching response arrived before the deadline.
    #[error("no response to {correlation_id} before the deadline")]
    Timeout {
        /// Correlation id of the call.
        correlation_id: String,
    },
}

impl<BE> Error<BE>
where
    BE: BrokerError,
{
    /// Whether the error is a deadline expiry.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::PublishTimeout { .. })
    }
}
