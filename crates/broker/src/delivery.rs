use crate::message::Message;

use std::error::Error;
use std::fmt::Debug;

use async_trait::async_trait;
use bytes::Bytes;

/// Marker trait for acknowledgment errors
pub trait AckError: Error + Send + Sync + 'static {}

/// Settles a single delivery with the broker.
///
/// Both methods take `self`, so a delivery can be settled at most once.
#[async_trait]
pub trait Acker
where
    Self: Debug + Send + Sync + 'static,
{
    /// The error type for the acker.
    type Error: AckError;

    /// Marks the delivery as processed so the broker can forget it.
    async fn ack(self) -> Result<(), Self::Error>;

    /// Rejects the delivery. With `requeue` the broker redelivers it,
    /// otherwise it is dead-lettered (or dropped if the queue has no
    /// dead-letter exchange).
    async fn nack(self, requeue: bool) -> Result<(), Self::Error>;
}

/// A message received from a subscription together with its acker.
#[derive(Debug)]
pub struct Delivery<A>
where
    A: Acker,
{
    acker: A,
    delivery_tag: u64,
    message: Message,
    redelivered: bool,
}

impl<A> Delivery<A>
where
    A: Acker,
{
    /// Creates a new delivery.
    #[must_use]
    pub const fn new(message: Message, delivery_tag: u64, redelivered: bool, acker: A) -> Self {
        Self {
            acker,
            delivery_tag,
            message,
            redelivered,
        }
    }

    /// Broker-assigned tag, unique per broker for the life of the delivery.
    #[must_use]
    pub const fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// The delivered message.
    #[must_use]
    pub const fn message(&self) -> &Message {
        &self.message
    }

    /// The message payload.
    #[must_use]
    pub const fn payload(&self) -> &Bytes {
        &self.message.payload
    }

    /// Whether the broker delivered this message before.
    #[must_use]
    pub const fn redelivered(&self) -> bool {
        self.redelivered
    }

    /// Splits the delivery so the message can be handed to a handler while
    /// the caller keeps the acknowledgment.
    #[must_use]
    pub fn into_parts(self) -> (Message, A) {
        (self.message, self.acker)
    }

    /// Acknowledges the delivery.
    ///
    /// # Errors
    /// Returns the broker error if the acknowledgment could not be recorded.
    pub async fn ack(self) -> Result<(), A::Error> {
        self.acker.ack().await
    }

    /// Negatively acknowledges the delivery.
    ///
    /// # Errors
    /// Returns the broker error if the rejection could not be recorded.
    pub async fn nack(self, requeue: bool) -> Result<(), A::Error> {
        self.acker.nack(requeue).await
    }
}
