//! In-memory implementation of the broker crate.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod acker;
mod error;
mod state;
mod subscription;

pub use acker::MemoryAcker;
pub use error::Error;
pub use subscription::MemorySubscription;

use state::{Connection, Server};

use std::sync::Arc;

use async_trait::async_trait;
use bridge_broker::{Broker, ExchangeKind, Message, PublishOptions, QueueOptions};
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

/// A connection to an in-process broker.
///
/// Clones share the connection. [`MemoryBroker::connect`] opens another
/// connection to the same broker, which is what exclusive queues and
/// `close` are scoped to.
#[derive(Clone, Debug)]
pub struct MemoryBroker {
    connection: Arc<Connection>,
    server: Arc<Server>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Starts a new broker and returns the first connection to it.
    #[must_use]
    pub fn new() -> Self {
        let server = Arc::new(Server::default());
        Self {
            connection: server.open_connection(),
            server,
        }
    }

    /// Opens another connection to the same broker.
    #[must_use]
    pub fn connect(&self) -> Self {
        Self {
            connection: self.server.open_connection(),
            server: self.server.clone(),
        }
    }

    /// Whether a queue with this name exists.
    #[must_use]
    pub fn queue_exists(&self, queue: &str) -> bool {
        self.server.state.lock().queue_exists(queue)
    }

    /// Number of consumers attached to a queue.
    #[must_use]
    pub fn consumer_count(&self, queue: &str) -> Option<usize> {
        self.server.state.lock().consumer_count(queue)
    }

    /// Number of messages waiting to be delivered.
    #[must_use]
    pub fn message_count(&self, queue: &str) -> Option<usize> {
        self.server.state.lock().message_count(queue)
    }

    /// Number of delivered messages not yet settled.
    #[must_use]
    pub fn unacked_count(&self, queue: &str) -> Option<usize> {
        self.server.state.lock().unacked_count(queue)
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.connection.is_closed() {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    type Error = Error;

    type Acker = MemoryAcker;

    type Subscription = MemorySubscription;

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), Self::Error> {
        self.ensure_open()?;
        self.server.state.lock().declare_exchange(name, kind)
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> Result<String, Self::Error> {
        self.ensure_open()?;
        self.server
            .state
            .lock()
            .declare_queue(self.connection.id, name, options)
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), Self::Error> {
        self.ensure_open()?;
        self.server
            .state
            .lock()
            .bind_queue(queue, exchange, routing_key)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Bytes,
        options: PublishOptions,
    ) -> Result<(), Self::Error> {
        self.ensure_open()?;
        let message = Message::new(exchange, routing_key, payload, options);
        self.server
            .state
            .lock()
            .route(&Arc::downgrade(&self.server), message)
    }

    async fn subscribe(&self, queue: &str) -> Result<Self::Subscription, Self::Error> {
        self.ensure_open()?;
        let (sender, receiver) = mpsc::unbounded_channel();
        let weak_server = Arc::downgrade(&self.server);

        let consumer_id =
            self.server
                .state
                .lock()
                .add_consumer(&weak_server, &self.connection, queue, sender)?;

        Ok(MemorySubscription::new(
            weak_server,
            queue.to_string(),
            consumer_id,
            receiver,
        ))
    }

    async fn close(&self) -> Result<(), Self::Error> {
        if self.connection.close() {
            debug!(connection = self.connection.id, "closing memory broker connection");
            self.server
                .state
                .lock()
                .close_connection(&Arc::downgrade(&self.server), self.connection.id);
        }
        Ok(())
    }
}
