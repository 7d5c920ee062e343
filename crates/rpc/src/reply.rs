use crate::correlation::CorrelationTable;
use crate::error::Error;
use crate::handler::DeliveryHandler;
use crate::observer::{HandlerFailure, Observer};

use std::sync::Arc;

use async_trait::async_trait;
use bridge_broker::{Acker, Broker, Message};
use bytes::Bytes;
use futures::StreamExt;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Routes responses on a shared reply queue to the calls waiting for them.
///
/// Responses nobody is waiting for are reported and dropped. When the
/// router is dropped, which happens when its delivery loop exits, the
/// table is closed so that waiting calls fail instead of running into
/// their deadlines.
#[derive(Debug)]
pub struct ReplyRouter {
    observer: Arc<dyn Observer>,
    queue: String,
    table: CorrelationTable,
}

impl ReplyRouter {
    /// Creates a router for `queue` resolving calls in `table`.
    pub fn new(
        queue: impl Into<String>,
        table: CorrelationTable,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self {
            observer,
            queue: queue.into(),
            table,
        }
    }
}

#[async_trait]
impl DeliveryHandler for ReplyRouter {
    async fn handle(&self, message: Message) -> Result<(), HandlerFailure> {
        let Message {
            payload,
            properties,
            ..
        } = message;
        let correlation_id = properties.correlation_id.unwrap_or_default();

        if self.table.resolve(&correlation_id, payload) {
            debug!(queue = %self.queue, %correlation_id, "routed reply");
        } else {
            self.observer.on_unmatched_reply(&self.queue, &correlation_id);
        }

        Ok(())
    }
}

impl Drop for ReplyRouter {
    fn drop(&mut self) {
        self.table.close();
    }
}

/// Waits for the response to one call on `reply_queue`.
///
/// Subscribes for the duration of the wait. Every delivery is acknowledged
/// and deliveries with a different correlation id are discarded. The
/// subscription is released on every exit path.
///
/// # Errors
/// Fails on deadline, cancellation, transport errors, or if the stream
/// ends before the response arrives.
pub async fn await_reply<B>(
    broker: &B,
    reply_queue: &str,
    correlation_id: &str,
    deadline: Instant,
    cancellation: &CancellationToken,
    observer: &dyn Observer,
) -> Result<Bytes, Error<B::Error>>
where
    B: Broker,
{
    let deliveries = broker.subscribe(reply_queue).await.map_err(Error::Broker)?;
    match_reply::<B>(
        deliveries,
        reply_queue,
        correlation_id,
        deadline,
        cancellation,
        observer,
    )
    .await
}

/// Matches deliveries from an open reply subscription against
/// `correlation_id`. Consumes the subscription.
pub(crate) async fn match_reply<B>(
    mut deliveries: B::Subscription,
    reply_queue: &str,
    correlation_id: &str,
    deadline: Instant,
    cancellation: &CancellationToken,
    observer: &dyn Observer,
) -> Result<Bytes, Error<B::Error>>
where
    B: Broker,
{
    loop {
        let next = tokio::select! {
            biased;
            () = cancellation.cancelled() => {
                return Err(Error::Cancelled { correlation_id: correlation_id.to_string() });
            }
            () = sleep_until(deadline) => {
                return Err(Error::Timeout { correlation_id: correlation_id.to_string() });
            }
            next = deliveries.next() => next,
        };

        match next {
            Some(Ok(delivery)) => {
                let delivery_tag = delivery.delivery_tag();
                let (message, acker) = delivery.into_parts();
                if let Err(e) = acker.ack().await {
                    observer.on_ack_failed(reply_queue, delivery_tag, &e);
                }

                if message.correlation_id() == correlation_id {
                    return Ok(message.payload);
                }
                observer.on_unmatched_reply(reply_queue, message.correlation_id());
            }
            Some(Err(e)) => return Err(Error::Broker(e)),
            None => {
                return Err(Error::ReplyChannelClosed {
                    correlation_id: correlation_id.to_string(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::observer::TracingObserver;

    use std::time::Duration;

    use bridge_broker::PublishOptions;
    use bridge_broker_memory::MemoryBroker;
    use tokio::time::timeout;

    fn reply(correlation_id: &str, payload: &'static [u8]) -> Message {
        Message::new(
            "",
            "replies",
            Bytes::from_static(payload),
            PublishOptions::response(correlation_id),
        )
    }

    #[tokio::test]
    async fn test_router_resolves_matching_reply() {
        let table = CorrelationTable::new();
        let router = ReplyRouter::new("replies", table.clone(), Arc::new(TracingObserver));
        let pending = table
            .register("c-1", Instant::now() + Duration::from_secs(1))
            .unwrap();

        router.handle(reply("c-1", b"pong")).await.unwrap();
        assert_eq!(
            pending.wait(&CancellationToken::new()).await.unwrap(),
            Bytes::from_static(b"pong")
        );
    }

    #[tracing_test::traced_test]
    #[tokio::test]
    async fn test_router_drops_unmatched_reply() {
        let table = CorrelationTable::new();
        let router = ReplyRouter::new("replies", table.clone(), Arc::new(TracingObserver));
        let _pending = table
            .register("c-1", Instant::now() + Duration::from_secs(1))
            .unwrap();

        router.handle(reply("stranger", b"?")).await.unwrap();
        assert_eq!(table.len(), 1);
        assert!(logs_contain("dropping reply with no waiting call"));
    }

    #[tokio::test]
    async fn test_dropping_router_closes_table() {
        let table = CorrelationTable::new();
        let router = ReplyRouter::new("replies", table.clone(), Arc::new(TracingObserver));
        let pending = table
            .register("c-1", Instant::now() + Duration::from_secs(1))
            .unwrap();

        drop(router);
        assert!(table.is_closed());
        assert!(pending.wait(&CancellationToken::new()).await.is_err());
    }

    #[tracing_test::traced_test]
    #[tokio::test]
    async fn test_await_reply_skips_other_correlation_ids() {
        let broker = MemoryBroker::new();
        let queue = broker.declare_exclusive_queue().await.unwrap();

        for (id, payload) in [("other", b"nope".as_slice()), ("mine", b"yes".as_slice())] {
            broker
                .publish(
                    "",
                    &queue,
                    Bytes::copy_from_slice(payload),
                    PublishOptions::response(id),
                )
                .await
                .unwrap();
        }

        let response = await_reply(
            &broker,
            &queue,
            "mine",
            Instant::now() + Duration::from_secs(1),
            &CancellationToken::new(),
            &TracingObserver,
        )
        .await
        .unwrap();

        assert_eq!(response, Bytes::from_static(b"yes"));
        // The subscription was released, so the auto-delete queue is gone.
        assert!(!broker.queue_exists(&queue));
    }

    #[tokio::test]
    async fn test_await_reply_times_out() {
        let broker = MemoryBroker::new();
        let queue = broker.declare_exclusive_queue().await.unwrap();

        let result = timeout(
            Duration::from_secs(1),
            await_reply(
                &broker,
                &queue,
                "c-1",
                Instant::now() + Duration::from_millis(20),
                &CancellationToken::new(),
                &TracingObserver,
            ),
        )
        .await
        .unwrap();

        assert!(
            matches!(result, Err(Error::Timeout { correlation_id }) if correlation_id == "c-1")
        );
        assert!(!broker.queue_exists(&queue));
    }

    #[tokio::test]
    async fn test_await_reply_deadline_holds_while_unmatched_replies_arrive() {
        let broker = MemoryBroker::new();
        let queue = broker.declare_exclusive_queue().await.unwrap();

        for _ in 0..100_000 {
            broker
                .publish("", &queue, Bytes::new(), PublishOptions::response("other"))
                .await
                .unwrap();
        }
        broker
            .publish(
                "",
                &queue,
                Bytes::from_static(b"too late"),
                PublishOptions::response("mine"),
            )
            .await
            .unwrap();

        let result = await_reply(
            &broker,
            &queue,
            "mine",
            Instant::now() + Duration::from_millis(5),
            &CancellationToken::new(),
            &TracingObserver,
        )
        .await;

        assert!(
            matches!(result, Err(Error::Timeout { correlation_id }) if correlation_id == "mine")
        );
    }

    #[tokio::test]
    async fn test_await_reply_cancelled() {
        let broker = MemoryBroker::new();
        let queue = broker.declare_exclusive_queue().await.unwrap();
        let token = CancellationToken::new();
        token.cancel();

        let result = await_reply(
            &broker,
            &queue,
            "c-1",
            Instant::now() + Duration::from_secs(1),
            &token,
            &TracingObserver,
        )
        .await;

        assert!(matches!(result, Err(Error::Cancelled { .. })));
    }

    #[tokio::test]
    async fn test_await_reply_stream_end() {
        let broker = MemoryBroker::new();
        let queue = broker.declare_exclusive_queue().await.unwrap();

        let waiter = {
            let broker = broker.clone();
            let queue = queue.clone();
            tokio::spawn(async move {
                await_reply(
                    &broker,
                    &queue,
                    "c-1",
                    Instant::now() + Duration::from_secs(5),
                    &CancellationToken::new(),
                    &TracingObserver,
                )
                .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.close().await.unwrap();

        let result = timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::ReplyChannelClosed { .. })));
    }
}
