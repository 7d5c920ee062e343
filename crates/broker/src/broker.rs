use crate::delivery::{Acker, Delivery};
use crate::exchange::ExchangeKind;
use crate::message::PublishOptions;
use crate::queue::QueueOptions;

use std::error::Error;
use std::fmt::Debug;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;

/// Marker trait for broker errors
pub trait BrokerError: Error + Send + Sync + 'static {}

/// A provisioned channel to a message broker.
///
/// Handles are cheap to clone and every operation may be called
/// concurrently from several tasks; implementations serialise internally
/// where the underlying transport requires it.
#[async_trait]
pub trait Broker
where
    Self: Clone + Debug + Send + Sync + 'static,
{
    /// The error type for the broker.
    type Error: BrokerError;

    /// The acknowledgment handle attached to each delivery.
    type Acker: Acker;

    /// Stream of deliveries returned by `subscribe`.
    ///
    /// The stream ends when the broker is closed. Dropping it cancels the
    /// consumer.
    type Subscription: Stream<Item = Result<Delivery<Self::Acker>, Self::Error>>
        + Send
        + Unpin
        + 'static;

    /// Declares an exchange. Redeclaring with the same kind is a no-op.
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), Self::Error>;

    /// Declares a queue and returns its name. An empty `name` asks the
    /// broker to generate one.
    async fn declare_queue(&self, name: &str, options: QueueOptions)
    -> Result<String, Self::Error>;

    /// Declares a broker-named, exclusive, auto-deleted, non-durable queue.
    async fn declare_exclusive_queue(&self) -> Result<String, Self::Error> {
        self.declare_queue("", QueueOptions::exclusive_auto_delete())
            .await
    }

    /// Binds `queue` to `exchange` for `routing_key`.
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), Self::Error>;

    /// Publishes a message. Messages that match no binding are dropped.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Bytes,
        options: PublishOptions,
    ) -> Result<(), Self::Error>;

    /// Starts consuming `queue` with explicit acknowledgment.
    async fn subscribe(&self, queue: &str) -> Result<Self::Subscription, Self::Error>;

    /// Releases the channel. Calling it more than once is a no-op.
    async fn close(&self) -> Result<(), Self::Error>;
}
