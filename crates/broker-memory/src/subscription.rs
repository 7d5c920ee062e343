use crate::acker::MemoryAcker;
use crate::error::Error;
use crate::state::Server;

use std::pin::Pin;
use std::sync::Weak;
use std::task::{Context, Poll};

use bridge_broker::Delivery;
use futures::Stream;
use tokio::sync::mpsc;

/// Deliveries pushed to one consumer of an in-memory queue.
///
/// Dropping the subscription detaches the consumer. Deliveries that were
/// pushed but never pulled go back to the head of the queue.
#[derive(Debug)]
pub struct MemorySubscription {
    consumer_id: u64,
    queue: String,
    receiver: mpsc::UnboundedReceiver<Result<Delivery<MemoryAcker>, Error>>,
    server: Weak<Server>,
}

impl MemorySubscription {
    pub(crate) const fn new(
        server: Weak<Server>,
        queue: String,
        consumer_id: u64,
        receiver: mpsc::UnboundedReceiver<Result<Delivery<MemoryAcker>, Error>>,
    ) -> Self {
        Self {
            consumer_id,
            queue,
            receiver,
            server,
        }
    }

    /// Name of the consumed queue.
    #[must_use]
    pub fn queue(&self) -> &str {
        &self.queue
    }
}

impl Stream for MemorySubscription {
    type Item = Result<Delivery<MemoryAcker>, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        self.receiver.close();

        let mut returned = Vec::new();
        while let Ok(item) = self.receiver.try_recv() {
            if let Ok(delivery) = item {
                returned.push(delivery.delivery_tag());
            }
        }

        if let Some(server) = self.server.upgrade() {
            server
                .state
                .lock()
                .remove_consumer(&self.server, &self.queue, self.consumer_id, returned);
        }
    }
}
