//! Abstract interface for a routing message broker.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Brokers publish messages and open subscriptions on queues.
pub mod broker;

/// Deliveries pair a received message with its acknowledgment handle.
pub mod delivery;

/// Exchanges route published messages to bound queues.
pub mod exchange;

/// Messages are immutable payloads plus routing metadata.
pub mod message;

/// Queues buffer messages for consumers.
pub mod queue;

pub use broker::{Broker, BrokerError};
pub use delivery::{AckError, Acker, Delivery};
pub use exchange::{DEFAULT_EXCHANGE, ExchangeKind, UnknownExchangeKind};
pub use message::{Message, PublishOptions};
pub use queue::QueueOptions;
