use crate::observer::{BoxError, HandlerFailure};

use std::fmt;
use std::future::Future;

use async_trait::async_trait;
use bridge_broker::Message;
use bytes::Bytes;

/// Processes raw messages taken off a queue by a delivery loop.
///
/// The loop settles the delivery from the returned result, so
/// implementations never see the acknowledgment handle.
#[async_trait]
pub trait DeliveryHandler
where
    Self: Send + Sync + 'static,
{
    /// Handles one message.
    async fn handle(&self, message: Message) -> Result<(), HandlerFailure>;
}

/// Application handler for fire-and-forget consumption.
#[async_trait]
pub trait ConsumerHandler
where
    Self: Send + Sync + 'static,
{
    /// The error type returned when a message cannot be processed.
    type Error: Into<BoxError> + Send + 'static;

    /// Handles one payload.
    async fn handle(&self, payload: Bytes) -> Result<(), Self::Error>;
}

/// Application handler for consumption that needs the message properties,
/// such as the reply address, correlation id or headers.
#[async_trait]
pub trait MessageHandler
where
    Self: Send + Sync + 'static,
{
    /// The error type returned when a message cannot be processed.
    type Error: Into<BoxError> + Send + 'static;

    /// Handles one message.
    async fn handle(&self, message: Message) -> Result<(), Self::Error>;
}

/// Application handler for request/response serving.
#[async_trait]
pub trait RequestHandler
where
    Self: Send + Sync + 'static,
{
    /// The error type returned when a request cannot be answered.
    type Error: Into<BoxError> + Send + 'static;

    /// Produces the response payload for a request. `reply_to` and
    /// `correlation_id` are empty when the request carried none.
    async fn handle(
        &self,
        payload: Bytes,
        reply_to: &str,
        correlation_id: &str,
    ) -> Result<Bytes, Self::Error>;
}

/// A [`ConsumerHandler`] backed by a closure. See [`consumer_fn`].
pub struct ConsumerFn<F>(F);

impl<F> fmt::Debug for ConsumerFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ConsumerFn")
    }
}

/// Wraps an async closure as a [`ConsumerHandler`].
pub const fn consumer_fn<F, Fut, E>(f: F) -> ConsumerFn<F>
where
    F: Fn(Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Into<BoxError> + Send + 'static,
{
    ConsumerFn(f)
}

#[async_trait]
impl<F, Fut, E> ConsumerHandler for ConsumerFn<F>
where
    F: Fn(Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Into<BoxError> + Send + 'static,
{
    type Error = E;

    async fn handle(&self, payload: Bytes) -> Result<(), Self::Error> {
        (self.0)(payload).await
    }
}

/// A [`MessageHandler`] backed by a closure. See [`message_fn`].
pub struct MessageFn<F>(F);

impl<F> fmt::Debug for MessageFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MessageFn")
    }
}

/// Wraps an async closure as a [`MessageHandler`].
pub const fn message_fn<F, Fut, E>(f: F) -> MessageFn<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Into<BoxError> + Send + 'static,
{
    MessageFn(f)
}

#[async_trait]
impl<F, Fut, E> MessageHandler for MessageFn<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Into<BoxError> + Send + 'static,
{
    type Error = E;

    async fn handle(&self, message: Message) -> Result<(), Self::Error> {
        (self.0)(message).await
    }
}

/// A [`RequestHandler`] backed by a closure. See [`request_fn`].
pub struct RequestFn<F>(F);

impl<F> fmt::Debug for RequestFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RequestFn")
    }
}

/// Wraps an async closure as a [`RequestHandler`]. The closure receives
/// the payload, reply address and correlation id.
pub const fn request_fn<F, Fut, E>(f: F) -> RequestFn<F>
where
    F: Fn(Bytes, String, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Bytes, E>> + Send + 'static,
    E: Into<BoxError> + Send + 'static,
{
    RequestFn(f)
}

#[async_trait]
impl<F, Fut, E> RequestHandler for RequestFn<F>
where
    F: Fn(Bytes, String, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Bytes, E>> + Send + 'static,
    E: Into<BoxError> + Send + 'static,
{
    type Error = E;

    async fn handle(
        &self,
        payload: Bytes,
        reply_to: &str,
        correlation_id: &str,
    ) -> Result<Bytes, Self::Error> {
        (self.0)(payload, reply_to.to_string(), correlation_id.to_string()).await
    }
}

/// Feeds payloads to a [`ConsumerHandler`].
pub(crate) struct ConsumerAdapter<H> {
    handler: H,
}

impl<H> ConsumerAdapter<H> {
    pub(crate) const fn new(handler: H) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl<H> DeliveryHandler for ConsumerAdapter<H>
where
    H: ConsumerHandler,
{
    async fn handle(&self, message: Message) -> Result<(), HandlerFailure> {
        self.handler
            .handle(message.payload)
            .await
            .map_err(HandlerFailure::error)
    }
}

/// Feeds whole messages to a [`MessageHandler`].
pub(crate) struct MessageAdapter<H> {
    handler: H,
}

impl<H> MessageAdapter<H> {
    pub(crate) const fn new(handler: H) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl<H> DeliveryHandler for MessageAdapter<H>
where
    H: MessageHandler,
{
    async fn handle(&self, message: Message) -> Result<(), HandlerFailure> {
        self.handler
            .handle(message)
            .await
            .map_err(HandlerFailure::error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bridge_broker::PublishOptions;

    #[tokio::test]
    async fn test_request_fn_sees_addressing() {
        let handler = request_fn(|payload: Bytes, reply_to, correlation_id| async move {
            Ok::<_, String>(Bytes::from(format!(
                "{}|{reply_to}|{correlation_id}",
                String::from_utf8_lossy(&payload)
            )))
        });

        let response = handler
            .handle(Bytes::from_static(b"ping"), "replies", "c-1")
            .await
            .unwrap();
        assert_eq!(response, Bytes::from_static(b"ping|replies|c-1"));
    }

    #[tokio::test]
    async fn test_message_adapter_passes_properties() {
        let adapter = MessageAdapter::new(message_fn(|message: Message| async move {
            if message.reply_to() == "replies" && message.correlation_id() == "c-1" {
                Ok(())
            } else {
                Err(format!("unexpected addressing on {}", message.routing_key))
            }
        }));

        let addressed = Message::new(
            "",
            "q",
            Bytes::from_static(b"x"),
            PublishOptions::request("replies", "c-1"),
        );
        assert!(adapter.handle(addressed).await.is_ok());

        let bare = Message::new("", "q", Bytes::from_static(b"x"), PublishOptions::default());
        let failure = adapter.handle(bare).await.unwrap_err();
        assert_eq!(failure.to_string(), "handler failed: unexpected addressing on q");
    }

    #[tokio::test]
    async fn test_consumer_adapter_maps_errors() {
        let adapter = ConsumerAdapter::new(consumer_fn(|payload: Bytes| async move {
            if payload.is_empty() {
                Err("empty payload")
            } else {
                Ok(())
            }
        }));

        let ok = Message::new("", "q", Bytes::from_static(b"x"), PublishOptions::default());
        assert!(adapter.handle(ok).await.is_ok());

        let empty = Message::new("", "q", Bytes::new(), PublishOptions::default());
        let failure = adapter.handle(empty).await.unwrap_err();
        assert_eq!(failure.to_string(), "handler failed: empty payload");
    }
}
