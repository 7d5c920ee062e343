use crate::error::Error;
use crate::state::{Connection, Server};

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bridge_broker::Acker;

/// Settles a delivery made by the in-memory broker.
#[derive(Debug)]
pub struct MemoryAcker {
    connection: Arc<Connection>,
    queue: String,
    server: Weak<Server>,
    tag: u64,
}

impl MemoryAcker {
    pub(crate) const fn new(
        server: Weak<Server>,
        connection: Arc<Connection>,
        queue: String,
        tag: u64,
    ) -> Self {
        Self {
            connection,
            queue,
            server,
            tag,
        }
    }

    fn server(&self) -> Result<Arc<Server>, Error> {
        if self.connection.is_closed() {
            return Err(Error::Closed);
        }
        self.server.upgrade().ok_or(Error::Closed)
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    type Error = Error;

    async fn ack(self) -> Result<(), Self::Error> {
        let server = self.server()?;
        let mut state = server.state.lock();
        state.ack(&self.queue, self.tag)
    }

    async fn nack(self, requeue: bool) -> Result<(), Self::Error> {
        let server = self.server()?;
        let mut state = server.state.lock();
        state.nack(&self.server, &self.queue, self.tag, requeue)
    }
}
