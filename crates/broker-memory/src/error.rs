use bridge_broker::{AckError, BrokerError, ExchangeKind};
use thiserror::Error;

/// Errors that can occur in the in-memory broker.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// The connection was closed.
    #[error("connection closed")]
    Closed,

    /// Exchange redeclared with a different kind.
    #[error("exchange {name} already declared as {existing}, not {requested}")]
    ExchangeKindMismatch {
        /// Exchange name.
        name: String,
        /// Kind it was first declared with.
        existing: ExchangeKind,
        /// Kind of the conflicting declaration.
        requested: ExchangeKind,
    },

    /// No exchange with this name.
    #[error("exchange not found: {0}")]
    ExchangeNotFound(String),

    /// Exclusive queue owned by another connection.
    #[error("queue {0} is exclusive to another connection")]
    QueueExclusive(String),

    /// No queue with this name.
    #[error("queue not found: {0}")]
    QueueNotFound(String),

    /// The default exchange cannot be declared or bound.
    #[error("the default exchange cannot be redeclared or bound")]
    ReservedExchange,

    /// The delivery tag is not outstanding on its queue.
    #[error("unknown delivery tag: {0}")]
    UnknownDelivery(u64),
}

impl AckError for Error {}
impl BrokerError for Error {}
