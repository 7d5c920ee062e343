use crate::correlation::{CorrelationIdGenerator, CorrelationTable, RegisterError, WaitError};
use crate::error::Error;
use crate::handler::{
    ConsumerAdapter, ConsumerHandler, MessageAdapter, MessageHandler, RequestHandler,
};
use crate::options::{AckPolicy, CallOptions, ClientOptions, ReplyMode, SubscriptionOptions};
use crate::reply::{ReplyRouter, await_reply, match_reply};
use crate::responder::{RequestAdapter, publish_bounded, publish_response};
use crate::subscription::Subscription;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bridge_broker::{Broker, ExchangeKind, PublishOptions, QueueOptions};
use bytes::Bytes;
use tokio::sync::OnceCell;
use tokio::time::{Instant, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Reply queue shared by all calls of a client, and the router consuming it.
#[derive(Debug)]
struct SharedReply {
    queue: String,
    subscription: Subscription,
    table: CorrelationTable,
}

/// Request/response and fire-and-forget messaging over a [`Broker`].
///
/// Clones share the broker handle, the reply queue and the outstanding
/// calls, so a client can be handed to many tasks.
#[derive(Clone, Debug)]
pub struct Client<B>
where
    B: Broker,
{
    broker: B,
    ids: Arc<CorrelationIdGenerator>,
    options: ClientOptions,
    reply: Arc<OnceCell<SharedReply>>,
    shutdown_token: CancellationToken,
}

impl<B> Client<B>
where
    B: Broker,
{
    /// Creates a client with default options.
    pub fn new(broker: B) -> Self {
        Self::with_options(broker, ClientOptions::default())
    }

    /// Creates a client.
    pub fn with_options(broker: B, options: ClientOptions) -> Self {
        Self {
            broker,
            ids: Arc::new(CorrelationIdGenerator::new()),
            options,
            reply: Arc::new(OnceCell::new()),
            shutdown_token: CancellationToken::new(),
        }
    }

    /// The underlying broker handle.
    pub const fn broker(&self) -> &B {
        &self.broker
    }

    /// The client options.
    pub const fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Declares a durable exchange.
    ///
    /// # Errors
    /// Returns the broker error.
    pub async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
    ) -> Result<(), Error<B::Error>> {
        self.broker
            .declare_exchange(name, kind)
            .await
            .map_err(Error::Broker)
    }

    /// Declares a durable queue.
    ///
    /// # Errors
    /// Returns the broker error.
    pub async fn declare_queue(&self, name: &str) -> Result<String, Error<B::Error>> {
        self.broker
            .declare_queue(name, QueueOptions::durable())
            .await
            .map_err(Error::Broker)
    }

    /// Declares a queue with explicit options.
    ///
    /// # Errors
    /// Returns the broker error.
    pub async fn declare_queue_with(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> Result<String, Error<B::Error>> {
        self.broker
            .declare_queue(name, options)
            .await
            .map_err(Error::Broker)
    }

    /// Declares a broker-named exclusive queue for receiving replies.
    ///
    /// # Errors
    /// Returns the broker error.
    pub async fn declare_reply_queue(&self) -> Result<String, Error<B::Error>> {
        self.broker
            .declare_exclusive_queue()
            .await
            .map_err(Error::Broker)
    }

    /// Binds `queue` to `exchange` for `routing_key`.
    ///
    /// # Errors
    /// Returns the broker error.
    pub async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), Error<B::Error>> {
        self.broker
            .bind_queue(queue, exchange, routing_key)
            .await
            .map_err(Error::Broker)
    }

    /// Publishes a message with the client's content type.
    ///
    /// # Errors
    /// Returns the broker error, or [`Error::PublishTimeout`].
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Bytes,
    ) -> Result<(), Error<B::Error>> {
        let options = PublishOptions {
            content_type: self.options.content_type.clone(),
            ..PublishOptions::default()
        };
        self.publish_with_options(exchange, routing_key, payload, options)
            .await
    }

    /// Publishes a message with explicit properties.
    ///
    /// # Errors
    /// Returns the broker error, or [`Error::PublishTimeout`].
    pub async fn publish_with_options(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Bytes,
        options: PublishOptions,
    ) -> Result<(), Error<B::Error>> {
        publish_bounded(
            &self.broker,
            exchange,
            routing_key,
            payload,
            options,
            self.options.publish_timeout,
        )
        .await
    }

    /// Publishes a response to the queue named `reply_to`.
    ///
    /// # Errors
    /// Returns the broker error, or [`Error::PublishTimeout`].
    pub async fn publish_response(
        &self,
        reply_to: &str,
        correlation_id: &str,
        payload: Bytes,
    ) -> Result<(), Error<B::Error>> {
        publish_response(
            &self.broker,
            reply_to,
            correlation_id,
            payload,
            self.options.content_type.as_deref(),
            self.options.publish_timeout,
        )
        .await
    }

    /// Options for subscriptions started by this client: the client's ack
    /// policy and observer, stopped when the client shuts down.
    #[must_use]
    pub fn subscription_options(&self) -> SubscriptionOptions {
        SubscriptionOptions {
            ack_policy: self.options.ack_policy,
            cancellation: Some(self.shutdown_token.clone()),
            observer: self.options.observer.clone(),
        }
    }

    /// Consumes `queue`, passing each payload to `handler`.
    ///
    /// # Errors
    /// Returns the broker error if the subscription could not be opened.
    pub async fn consume<H>(&self, queue: &str, handler: H) -> Result<Subscription, Error<B::Error>>
    where
        H: ConsumerHandler,
    {
        self.consume_with(queue, handler, self.subscription_options())
            .await
    }

    /// Like [`consume`](Self::consume) with explicit subscription options.
    ///
    /// # Errors
    /// Returns the broker error if the subscription could not be opened.
    pub async fn consume_with<H>(
        &self,
        queue: &str,
        handler: H,
        options: SubscriptionOptions,
    ) -> Result<Subscription, Error<B::Error>>
    where
        H: ConsumerHandler,
    {
        self.ensure_running()?;
        Subscription::start(&self.broker, queue, ConsumerAdapter::new(handler), options).await
    }

    /// Consumes `queue`, passing each whole message to `handler` so it can
    /// read the reply address, correlation id and headers.
    ///
    /// # Errors
    /// Returns the broker error if the subscription could not be opened.
    pub async fn consume_message<H>(
        &self,
        queue: &str,
        handler: H,
    ) -> Result<Subscription, Error<B::Error>>
    where
        H: MessageHandler,
    {
        self.consume_message_with(queue, handler, self.subscription_options())
            .await
    }

    /// Like [`consume_message`](Self::consume_message) with explicit
    /// subscription options.
    ///
    /// # Errors
    /// Returns the broker error if the subscription could not be opened.
    pub async fn consume_message_with<H>(
        &self,
        queue: &str,
        handler: H,
        options: SubscriptionOptions,
    ) -> Result<Subscription, Error<B::Error>>
    where
        H: MessageHandler,
    {
        self.ensure_running()?;
        Subscription::start(&self.broker, queue, MessageAdapter::new(handler), options).await
    }

    /// Serves requests on `queue`, publishing each handler result to the
    /// request's reply address.
    ///
    /// # Errors
    /// Returns the broker error if the subscription could not be opened.
    pub async fn serve<H>(&self, queue: &str, handler: H) -> Result<Subscription, Error<B::Error>>
    where
        H: RequestHandler,
    {
        self.serve_with(queue, handler, self.subscription_options())
            .await
    }

    /// Like [`serve`](Self::serve) with explicit subscription options.
    ///
    /// # Errors
    /// Returns the broker error if the subscription could not be opened.
    pub async fn serve_with<H>(
        &self,
        queue: &str,
        handler: H,
        options: SubscriptionOptions,
    ) -> Result<Subscription, Error<B::Error>>
    where
        H: RequestHandler,
    {
        self.ensure_running()?;
        let adapter = RequestAdapter::new(
            self.broker.clone(),
            queue.to_string(),
            handler,
            options.observer.clone(),
            self.options.content_type.clone(),
            self.options.publish_timeout,
        );
        Subscription::start(&self.broker, queue, adapter, options).await
    }

    /// Waits for one response with `correlation_id` on `reply_queue`,
    /// discarding other deliveries.
    ///
    /// # Errors
    /// Returns [`Error::Timeout`] if nothing matches in time, or the error
    /// that ended the subscription.
    pub async fn wait_for_response(
        &self,
        reply_queue: &str,
        correlation_id: &str,
        timeout: Duration,
    ) -> Result<Bytes, Error<B::Error>> {
        await_reply(
            &self.broker,
            reply_queue,
            correlation_id,
            Instant::now() + timeout,
            &self.shutdown_token,
            self.options.observer.as_ref(),
        )
        .await
    }

    /// Sends a request and waits up to `timeout` for its response.
    ///
    /// # Errors
    /// See [`call_with`](Self::call_with).
    pub async fn call(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, Error<B::Error>> {
        self.call_with(exchange, routing_key, payload, CallOptions::with_timeout(timeout))
            .await
    }

    /// Sends a request and waits for its response.
    ///
    /// The whole call, including provisioning a reply queue and publishing
    /// the request, is bounded by the call's timeout. Every exit path
    /// releases what the call registered.
    ///
    /// # Errors
    /// - [`Error::Timeout`] if no response arrived in time.
    /// - [`Error::Cancelled`] if the call's token was cancelled.
    /// - [`Error::CorrelationIdInUse`] if an explicit id collides.
    /// - [`Error::ReplyChannelClosed`] if the reply subscription ended.
    /// - [`Error::ClientShutdown`] if the client was shut down.
    /// - [`Error::Broker`] for transport failures.
    pub async fn call_with(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Bytes,
        options: CallOptions,
    ) -> Result<Bytes, Error<B::Error>> {
        self.ensure_running()?;

        let deadline = Instant::now() + options.timeout.unwrap_or(self.options.call_timeout);
        let correlation_id = options
            .correlation_id
            .unwrap_or_else(|| self.ids.next_id());

        // The call itself always observes client shutdown. A caller's own
        // token is raced around it.
        let call = Call {
            cancellation: self.shutdown_token.child_token(),
            correlation_id,
            deadline,
            exchange,
            routing_key,
        };

        let Some(cancellation) = options.cancellation else {
            return self.dispatch(call, payload).await;
        };
        let correlation_id = call.correlation_id.clone();
        tokio::select! {
            biased;
            () = cancellation.cancelled() => Err(Error::Cancelled { correlation_id }),
            result = self.dispatch(call, payload) => result,
        }
    }

    async fn dispatch(&self, call: Call<'_>, payload: Bytes) -> Result<Bytes, Error<B::Error>> {
        match self.options.reply_mode {
            ReplyMode::Shared => self.call_shared(call, payload).await,
            ReplyMode::PerCall => self.call_per_call(call, payload).await,
        }
    }

    async fn call_shared(&self, call: Call<'_>, payload: Bytes) -> Result<Bytes, Error<B::Error>> {
        let reply = self.bounded(&call, self.shared_reply()).await??;

        let pending = reply
            .table
            .register(call.correlation_id.clone(), call.deadline)
            .map_err(|e| match e {
                RegisterError::Closed if self.shutdown_token.is_cancelled() => {
                    Error::ClientShutdown
                }
                RegisterError::Closed => Error::ReplyChannelClosed {
                    correlation_id: call.correlation_id.clone(),
                },
                RegisterError::InUse(correlation_id) => Error::CorrelationIdInUse(correlation_id),
            })?;

        self.publish_request(&call, &reply.queue, payload).await?;

        pending
            .wait(&call.cancellation)
            .await
            .map_err(|e| self.wait_error(&call, e))
    }

    async fn call_per_call(
        &self,
        call: Call<'_>,
        payload: Bytes,
    ) -> Result<Bytes, Error<B::Error>> {
        let reply_queue = self
            .bounded(&call, self.broker.declare_exclusive_queue())
            .await?
            .map_err(Error::Broker)?;
        // Subscribe before publishing so the reply cannot be missed. Dropping
        // the subscription on any path below releases the queue.
        let deliveries = self
            .bounded(&call, self.broker.subscribe(&reply_queue))
            .await?
            .map_err(Error::Broker)?;

        self.publish_request(&call, &reply_queue, payload).await?;

        match_reply::<B>(
            deliveries,
            &reply_queue,
            &call.correlation_id,
            call.deadline,
            &call.cancellation,
            self.options.observer.as_ref(),
        )
        .await
        .map_err(|e| match e {
            Error::Cancelled { .. } if self.shutdown_token.is_cancelled() => Error::ClientShutdown,
            e => e,
        })
    }

    async fn publish_request(
        &self,
        call: &Call<'_>,
        reply_to: &str,
        payload: Bytes,
    ) -> Result<(), Error<B::Error>> {
        let mut options = PublishOptions::request(reply_to, call.correlation_id.clone());
        options.content_type.clone_from(&self.options.content_type);

        self.bounded(
            call,
            self.broker
                .publish(call.exchange, call.routing_key, payload, options),
        )
        .await?
        .map_err(Error::Broker)?;

        debug!(
            exchange = call.exchange,
            routing_key = call.routing_key,
            correlation_id = %call.correlation_id,
            reply_to,
            "published request"
        );
        Ok(())
    }

    async fn shared_reply(&self) -> Result<&SharedReply, Error<B::Error>> {
        self.reply
            .get_or_try_init(|| async {
                let queue = self
                    .broker
                    .declare_exclusive_queue()
                    .await
                    .map_err(Error::Broker)?;
                let table = CorrelationTable::new();
                let router =
                    ReplyRouter::new(queue.clone(), table.clone(), self.options.observer.clone());

                let options = SubscriptionOptions {
                    ack_policy: AckPolicy::AckAlways,
                    cancellation: Some(self.shutdown_token.clone()),
                    observer: self.options.observer.clone(),
                };
                let subscription =
                    Subscription::start(&self.broker, &queue, router, options).await?;

                info!(%queue, "provisioned reply queue");
                Ok::<_, Error<B::Error>>(SharedReply {
                    queue,
                    subscription,
                    table,
                })
            })
            .await
    }

    /// Address of the shared reply queue, once the first call created it.
    #[must_use]
    pub fn reply_queue(&self) -> Option<&str> {
        self.reply.get().map(|reply| reply.queue.as_str())
    }

    /// Number of calls waiting on the shared reply queue.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.reply.get().map_or(0, |reply| reply.table.len())
    }

    /// Stops every subscription the client started, fails outstanding
    /// calls and refuses new ones. The broker stays open.
    pub async fn shutdown(&self) {
        if self.shutdown_token.is_cancelled() {
            return;
        }
        self.shutdown_token.cancel();

        if let Some(reply) = self.reply.get() {
            reply.subscription.shutdown().await;
            reply.table.close();
        }
        info!("client shut down");
    }

    /// Shuts the client down and closes the broker.
    ///
    /// # Errors
    /// Returns the broker error from closing.
    pub async fn close(&self) -> Result<(), Error<B::Error>> {
        self.shutdown().await;
        self.broker.close().await.map_err(Error::Broker)
    }

    fn ensure_running(&self) -> Result<(), Error<B::Error>> {
        if self.shutdown_token.is_cancelled() {
            Err(Error::ClientShutdown)
        } else {
            Ok(())
        }
    }

    /// Runs `future` unless the call's deadline passes or it is cancelled
    /// first.
    async fn bounded<F>(&self, call: &Call<'_>, future: F) -> Result<F::Output, Error<B::Error>>
    where
        F: Future,
    {
        tokio::select! {
            biased;
            () = call.cancellation.cancelled() => Err(self.cancelled_error(call)),
            result = timeout_at(call.deadline, future) => result.map_err(|_| Error::Timeout {
                correlation_id: call.correlation_id.clone(),
            }),
        }
    }

    fn cancelled_error(&self, call: &Call<'_>) -> Error<B::Error> {
        if self.shutdown_token.is_cancelled() {
            Error::ClientShutdown
        } else {
            Error::Cancelled {
                correlation_id: call.correlation_id.clone(),
            }
        }
    }

    fn wait_error(&self, call: &Call<'_>, error: WaitError) -> Error<B::Error> {
        match error {
            WaitError::Cancelled => self.cancelled_error(call),
            WaitError::Closed if self.shutdown_token.is_cancelled() => Error::ClientShutdown,
            WaitError::Closed => Error::ReplyChannelClosed {
                correlation_id: call.correlation_id.clone(),
            },
            WaitError::TimedOut => Error::Timeout {
                correlation_id: call.correlation_id.clone(),
            },
        }
    }
}

/// State of one outstanding call.
struct Call<'a> {
    cancellation: CancellationToken,
    correlation_id: String,
    deadline: Instant,
    exchange: &'a str,
    routing_key: &'a str,
}
