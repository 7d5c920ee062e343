use crate::error::Error;
use crate::handler::DeliveryHandler;
use crate::observer::{HandlerFailure, Observer};
use crate::options::{AckPolicy, SubscriptionOptions};

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bridge_broker::{Acker, Broker, Delivery};
use futures::{FutureExt, StreamExt};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

/// A running delivery loop on one queue.
///
/// Deliveries are handed to the handler one at a time, in arrival order,
/// and each is settled exactly once after its handler returns. The loop
/// stops when it is shut down, when its cancellation token fires, when the
/// transport ends the stream or reports an error, or when the subscription
/// is dropped. A handler that is running when the stop is requested runs
/// to completion and its delivery is still settled.
#[derive(Debug)]
pub struct Subscription {
    queue: String,
    shutdown_token: CancellationToken,
    task_tracker: TaskTracker,
}

impl Subscription {
    /// Subscribes to `queue` and starts the delivery loop.
    ///
    /// # Errors
    /// Returns the broker error if the subscription could not be opened.
    pub async fn start<B, H>(
        broker: &B,
        queue: impl Into<String>,
        handler: H,
        options: SubscriptionOptions,
    ) -> Result<Self, Error<B::Error>>
    where
        B: Broker,
        H: DeliveryHandler,
    {
        let queue = queue.into();
        let deliveries = broker.subscribe(&queue).await.map_err(Error::Broker)?;

        let shutdown_token = options
            .cancellation
            .as_ref()
            .map_or_else(CancellationToken::new, CancellationToken::child_token);
        let task_tracker = TaskTracker::new();

        let delivery_loop = DeliveryLoop {
            ack_policy: options.ack_policy,
            handler,
            observer: options.observer,
            queue: queue.clone(),
        };
        task_tracker.spawn(delivery_loop.run::<B>(deliveries, shutdown_token.clone()));
        task_tracker.close();

        debug!(%queue, "started delivery loop");

        Ok(Self {
            queue,
            shutdown_token,
            task_tracker,
        })
    }

    /// Name of the consumed queue.
    #[must_use]
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Whether the loop has exited.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.task_tracker.is_empty()
    }

    /// Token that stops the loop when cancelled.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Stops the loop and waits for the in-flight delivery, if any, to be
    /// settled.
    pub async fn shutdown(&self) {
        self.shutdown_token.cancel();
        self.task_tracker.wait().await;
    }

    /// Waits for the loop to exit without asking it to.
    pub async fn wait(&self) {
        self.task_tracker.wait().await;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.shutdown_token.cancel();
    }
}

struct DeliveryLoop<H> {
    ack_policy: AckPolicy,
    handler: H,
    observer: Arc<dyn Observer>,
    queue: String,
}

impl<H> DeliveryLoop<H>
where
    H: DeliveryHandler,
{
    async fn run<B>(self, mut deliveries: B::Subscription, shutdown_token: CancellationToken)
    where
        B: Broker,
    {
        loop {
            let next = tokio::select! {
                biased;
                () = shutdown_token.cancelled() => {
                    debug!(queue = %self.queue, "shutdown token cancelled, exiting delivery loop");
                    break;
                }
                next = deliveries.next() => next,
            };

            match next {
                Some(Ok(delivery)) => self.process(delivery).await,
                Some(Err(e)) => {
                    self.observer.on_subscription_error(&self.queue, &e);
                    break;
                }
                None => {
                    debug!(queue = %self.queue, "delivery stream ended, exiting delivery loop");
                    break;
                }
            }
        }
    }

    async fn process<A>(&self, delivery: Delivery<A>)
    where
        A: Acker,
    {
        let delivery_tag = delivery.delivery_tag();
        let (message, acker) = delivery.into_parts();
        let correlation_id = message.correlation_id().to_string();

        let result = AssertUnwindSafe(self.handler.handle(message))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(HandlerFailure::from_panic(panic.as_ref())));

        let settled = match result {
            Ok(()) => acker.ack().await,
            Err(failure) => {
                self.observer
                    .on_handler_failed(&self.queue, &correlation_id, &failure);
                match self.ack_policy {
                    AckPolicy::AckAlways => acker.ack().await,
                    AckPolicy::NackRequeue => acker.nack(true).await,
                    AckPolicy::NackDeadLetter => acker.nack(false).await,
                }
            }
        };

        if let Err(e) = settled {
            self.observer.on_ack_failed(&self.queue, delivery_tag, &e);
        }
    }
}
