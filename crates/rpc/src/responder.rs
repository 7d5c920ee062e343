use crate::error::Error;
use crate::handler::{DeliveryHandler, RequestHandler};
use crate::observer::{HandlerFailure, Observer, RequestOutcome};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bridge_broker::{Broker, DEFAULT_EXCHANGE, Message, PublishOptions};
use bytes::Bytes;
use tracing::debug;

/// Publishes `payload` through `broker`, giving up after `publish_timeout`.
pub(crate) async fn publish_bounded<B>(
    broker: &B,
    exchange: &str,
    routing_key: &str,
    payload: Bytes,
    options: PublishOptions,
    publish_timeout: Duration,
) -> Result<(), Error<B::Error>>
where
    B: Broker,
{
    tokio::time::timeout(
        publish_timeout,
        broker.publish(exchange, routing_key, payload, options),
    )
    .await
    .map_err(|_| Error::PublishTimeout {
        exchange: exchange.to_string(),
        routing_key: routing_key.to_string(),
    })?
    .map_err(Error::Broker)
}

/// Publishes a response directly to the queue named `reply_to` through
/// the default exchange.
pub(crate) async fn publish_response<B>(
    broker: &B,
    reply_to: &str,
    correlation_id: &str,
    payload: Bytes,
    content_type: Option<&str>,
    publish_timeout: Duration,
) -> Result<(), Error<B::Error>>
where
    B: Broker,
{
    let mut options = PublishOptions::response(correlation_id);
    options.content_type = content_type.map(str::to_string);

    publish_bounded(
        broker,
        DEFAULT_EXCHANGE,
        reply_to,
        payload,
        options,
        publish_timeout,
    )
    .await
}

/// Turns a [`RequestHandler`] into a delivery handler that publishes the
/// handler's result back to the request's reply address.
///
/// At most one response is published per request. A request without a
/// reply address is handled and acknowledged without a response. A failed
/// response publish is reported but does not fail the delivery, so the
/// request is not redelivered.
pub(crate) struct RequestAdapter<B, H> {
    broker: B,
    content_type: Option<String>,
    handler: H,
    observer: Arc<dyn Observer>,
    publish_timeout: Duration,
    queue: String,
}

impl<B, H> RequestAdapter<B, H> {
    pub(crate) const fn new(
        broker: B,
        queue: String,
        handler: H,
        observer: Arc<dyn Observer>,
        content_type: Option<String>,
        publish_timeout: Duration,
    ) -> Self {
        Self {
            broker,
            content_type,
            handler,
            observer,
            publish_timeout,
            queue,
        }
    }
}

#[async_trait]
impl<B, H> DeliveryHandler for RequestAdapter<B, H>
where
    B: Broker,
    H: RequestHandler,
{
    async fn handle(&self, message: Message) -> Result<(), HandlerFailure> {
        let reply_to = message.reply_to().to_string();
        let correlation_id = message.correlation_id().to_string();

        let response = match self
            .handler
            .handle(message.payload, &reply_to, &correlation_id)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                self.observer.on_request_completed(
                    &self.queue,
                    &correlation_id,
                    RequestOutcome::HandlerFailed,
                );
                return Err(HandlerFailure::error(e));
            }
        };

        let outcome = if reply_to.is_empty() {
            debug!(queue = %self.queue, %correlation_id, "request has no reply address");
            RequestOutcome::NoReply
        } else {
            match publish_response(
                &self.broker,
                &reply_to,
                &correlation_id,
                response,
                self.content_type.as_deref(),
                self.publish_timeout,
            )
            .await
            {
                Ok(()) => RequestOutcome::Replied,
                Err(e) => {
                    self.observer
                        .on_reply_failed(&self.queue, &reply_to, &correlation_id, &e);
                    RequestOutcome::ReplyFailed
                }
            }
        };

        self.observer
            .on_request_completed(&self.queue, &correlation_id, outcome);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::handler::request_fn;
    use crate::observer::TracingObserver;

    use bridge_broker::QueueOptions;
    use bridge_broker_memory::MemoryBroker;
    use futures::StreamExt;
    use tokio::time::timeout;

    fn adapter(
        broker: &MemoryBroker,
    ) -> RequestAdapter<MemoryBroker, impl RequestHandler + use<>> {
        RequestAdapter::new(
            broker.clone(),
            "requests".to_string(),
            request_fn(|payload: Bytes, _reply_to, _correlation_id| async move {
                if payload.as_ref() == b"bad" {
                    return Err("bad request");
                }
                let mut response = b"echo:".to_vec();
                response.extend_from_slice(&payload);
                Ok(Bytes::from(response))
            }),
            Arc::new(TracingObserver),
            Some("text/plain".to_string()),
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn test_replies_to_reply_address() {
        let broker = MemoryBroker::new();
        let replies = broker
            .declare_queue("replies", QueueOptions::default())
            .await
            .unwrap();
        let mut subscription = broker.subscribe(&replies).await.unwrap();

        let request = Message::new(
            "",
            "requests",
            Bytes::from_static(b"hi"),
            PublishOptions::request("replies", "c-1"),
        );
        adapter(&broker).handle(request).await.unwrap();

        let delivery = timeout(Duration::from_secs(1), subscription.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(delivery.payload(), &Bytes::from_static(b"echo:hi"));
        assert_eq!(delivery.message().correlation_id(), "c-1");
        assert_eq!(
            delivery.message().properties.content_type.as_deref(),
            Some("text/plain")
        );
    }

    #[tokio::test]
    async fn test_no_reply_address_publishes_nothing() {
        let broker = MemoryBroker::new();
        broker
            .declare_queue("replies", QueueOptions::default())
            .await
            .unwrap();

        let request = Message::new(
            "",
            "requests",
            Bytes::from_static(b"hi"),
            PublishOptions::default(),
        );
        adapter(&broker).handle(request).await.unwrap();

        assert_eq!(broker.message_count("replies"), Some(0));
    }

    #[tokio::test]
    async fn test_handler_error_publishes_nothing() {
        let broker = MemoryBroker::new();
        broker
            .declare_queue("replies", QueueOptions::default())
            .await
            .unwrap();

        let request = Message::new(
            "",
            "requests",
            Bytes::from_static(b"bad"),
            PublishOptions::request("replies", "c-1"),
        );
        let failure = adapter(&broker).handle(request).await.unwrap_err();

        assert_eq!(failure.to_string(), "handler failed: bad request");
        assert_eq!(broker.message_count("replies"), Some(0));
    }

    #[tracing_test::traced_test]
    #[tokio::test]
    async fn test_reply_failure_still_succeeds() {
        let broker = MemoryBroker::new();
        let adapter = adapter(&broker);
        broker.close().await.unwrap();

        let request = Message::new(
            "",
            "requests",
            Bytes::from_static(b"hi"),
            PublishOptions::request("replies", "c-1"),
        );
        adapter.handle(request).await.unwrap();

        assert!(logs_contain("failed to publish response"));
    }
}
