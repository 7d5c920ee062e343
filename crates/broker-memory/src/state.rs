use crate::acker::MemoryAcker;
use crate::error::Error;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bridge_broker::{DEFAULT_EXCHANGE, Delivery, ExchangeKind, Message, QueueOptions};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use uuid::Uuid;

pub type DeliverySender = mpsc::UnboundedSender<Result<Delivery<MemoryAcker>, Error>>;

/// Broker state shared by every connection.
#[derive(Debug, Default)]
pub struct Server {
    next_connection_id: AtomicU64,
    pub state: Mutex<State>,
}

impl Server {
    pub fn open_connection(&self) -> Arc<Connection> {
        Arc::new(Connection {
            closed: AtomicBool::new(false),
            id: self.next_connection_id.fetch_add(1, Ordering::Relaxed),
        })
    }
}

#[derive(Debug)]
pub struct Connection {
    closed: AtomicBool,
    pub id: u64,
}

impl Connection {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns `false` if the connection was already closed.
    pub fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }
}

#[derive(Debug)]
struct Exchange {
    bindings: Vec<Binding>,
    kind: ExchangeKind,
}

#[derive(Debug, PartialEq, Eq)]
struct Binding {
    queue: String,
    routing_key: String,
}

#[derive(Debug)]
struct Consumer {
    connection: Arc<Connection>,
    id: u64,
    sender: DeliverySender,
}

#[derive(Debug)]
struct Queued {
    message: Message,
    redelivered: bool,
}

#[derive(Debug)]
struct Unacked {
    connection_id: u64,
    message: Message,
}

#[derive(Debug)]
struct Queue {
    consumers: Vec<Consumer>,
    cursor: usize,
    options: QueueOptions,
    owner: Option<u64>,
    ready: VecDeque<Queued>,
    unacked: HashMap<u64, Unacked>,
}

impl Queue {
    fn requeue(&mut self, mut tags: Vec<u64>) {
        tags.sort_unstable();
        for tag in tags.into_iter().rev() {
            if let Some(unacked) = self.unacked.remove(&tag) {
                self.ready.push_front(Queued {
                    message: unacked.message,
                    redelivered: true,
                });
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct State {
    exchanges: HashMap<String, Exchange>,
    next_consumer_id: u64,
    next_tag: u64,
    queues: HashMap<String, Queue>,
}

impl State {
    pub fn declare_exchange(&mut self, name: &str, kind: ExchangeKind) -> Result<(), Error> {
        if name == DEFAULT_EXCHANGE {
            return Err(Error::ReservedExchange);
        }

        match self.exchanges.get(name) {
            Some(existing) if existing.kind != kind => Err(Error::ExchangeKindMismatch {
                name: name.to_string(),
                existing: existing.kind,
                requested: kind,
            }),
            Some(_) => Ok(()),
            None => {
                debug!(exchange = name, %kind, "declared exchange");
                self.exchanges.insert(
                    name.to_string(),
                    Exchange {
                        bindings: Vec::new(),
                        kind,
                    },
                );
                Ok(())
            }
        }
    }

    pub fn declare_queue(
        &mut self,
        connection_id: u64,
        name: &str,
        options: QueueOptions,
    ) -> Result<String, Error> {
        let name = if name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            name.to_string()
        };

        if let Some(existing) = self.queues.get(&name) {
            if existing.owner.is_some_and(|owner| owner != connection_id) {
                return Err(Error::QueueExclusive(name));
            }
            return Ok(name);
        }

        debug!(queue = %name, ?options, "declared queue");
        self.queues.insert(
            name.clone(),
            Queue {
                consumers: Vec::new(),
                cursor: 0,
                owner: options.exclusive.then_some(connection_id),
                options,
                ready: VecDeque::new(),
                unacked: HashMap::new(),
            },
        );

        Ok(name)
    }

    pub fn bind_queue(
        &mut self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), Error> {
        if exchange == DEFAULT_EXCHANGE {
            return Err(Error::ReservedExchange);
        }
        if !self.queues.contains_key(queue) {
            return Err(Error::QueueNotFound(queue.to_string()));
        }
        let exchange_state = self
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| Error::ExchangeNotFound(exchange.to_string()))?;

        let binding = Binding {
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
        };
        if !exchange_state.bindings.contains(&binding) {
            debug!(queue, exchange, routing_key, "bound queue");
            exchange_state.bindings.push(binding);
        }

        Ok(())
    }

    /// Routes a message to every matching queue and pushes it to consumers.
    pub fn route(&mut self, server: &Weak<Server>, message: Message) -> Result<(), Error> {
        let targets = if message.exchange == DEFAULT_EXCHANGE {
            if self.queues.contains_key(&message.routing_key) {
                vec![message.routing_key.clone()]
            } else {
                Vec::new()
            }
        } else {
            let exchange = self
                .exchanges
                .get(&message.exchange)
                .ok_or_else(|| Error::ExchangeNotFound(message.exchange.clone()))?;

            let mut targets: Vec<String> = Vec::new();
            for binding in &exchange.bindings {
                if exchange.kind.matches(&binding.routing_key, &message.routing_key)
                    && !targets.contains(&binding.queue)
                {
                    targets.push(binding.queue.clone());
                }
            }
            targets
        };

        if targets.is_empty() {
            trace!(
                exchange = %message.exchange,
                routing_key = %message.routing_key,
                "dropping unroutable message"
            );
        }

        for target in targets {
            if let Some(queue) = self.queues.get_mut(&target) {
                queue.ready.push_back(Queued {
                    message: message.clone(),
                    redelivered: false,
                });
            }
            self.dispatch(server, &target);
        }

        Ok(())
    }

    /// Hands ready messages to consumers round-robin.
    fn dispatch(&mut self, server: &Weak<Server>, queue_name: &str) {
        let Self {
            next_tag, queues, ..
        } = self;
        let Some(queue) = queues.get_mut(queue_name) else {
            return;
        };

        while !queue.consumers.is_empty() {
            let Some(queued) = queue.ready.pop_front() else {
                break;
            };

            let index = queue.cursor % queue.consumers.len();
            let consumer = &queue.consumers[index];

            *next_tag += 1;
            let tag = *next_tag;
            let acker = MemoryAcker::new(
                server.clone(),
                consumer.connection.clone(),
                queue_name.to_string(),
                tag,
            );
            let delivery = Delivery::new(queued.message.clone(), tag, queued.redelivered, acker);

            if consumer.sender.send(Ok(delivery)).is_ok() {
                queue.unacked.insert(
                    tag,
                    Unacked {
                        connection_id: consumer.connection.id,
                        message: queued.message,
                    },
                );
                queue.cursor = index + 1;
            } else {
                trace!(queue = queue_name, consumer = consumer.id, "consumer gone");
                queue.consumers.remove(index);
                queue.ready.push_front(queued);
            }
        }
    }

    pub fn add_consumer(
        &mut self,
        server: &Weak<Server>,
        connection: &Arc<Connection>,
        queue_name: &str,
        sender: DeliverySender,
    ) -> Result<u64, Error> {
        let queue = self
            .queues
            .get_mut(queue_name)
            .ok_or_else(|| Error::QueueNotFound(queue_name.to_string()))?;
        if queue.owner.is_some_and(|owner| owner != connection.id) {
            return Err(Error::QueueExclusive(queue_name.to_string()));
        }

        self.next_consumer_id += 1;
        let id = self.next_consumer_id;
        queue.consumers.push(Consumer {
            connection: connection.clone(),
            id,
            sender,
        });
        debug!(queue = queue_name, consumer = id, "consumer attached");

        self.dispatch(server, queue_name);

        Ok(id)
    }

    /// Detaches a consumer. `returned` are tags that were pushed to it but
    /// never pulled; they go back to the head of the queue.
    pub fn remove_consumer(
        &mut self,
        server: &Weak<Server>,
        queue_name: &str,
        consumer_id: u64,
        returned: Vec<u64>,
    ) {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };

        queue.consumers.retain(|consumer| consumer.id != consumer_id);
        queue.requeue(returned);
        debug!(queue = queue_name, consumer = consumer_id, "consumer detached");

        if queue.options.auto_delete && queue.consumers.is_empty() {
            self.delete_queue(queue_name);
        } else {
            self.dispatch(server, queue_name);
        }
    }

    pub fn ack(&mut self, queue_name: &str, tag: u64) -> Result<(), Error> {
        // The queue may have been auto-deleted while the delivery was in flight.
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return Ok(());
        };

        queue
            .unacked
            .remove(&tag)
            .map(|_| ())
            .ok_or(Error::UnknownDelivery(tag))
    }

    pub fn nack(
        &mut self,
        server: &Weak<Server>,
        queue_name: &str,
        tag: u64,
        requeue: bool,
    ) -> Result<(), Error> {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return Ok(());
        };

        let unacked = queue
            .unacked
            .remove(&tag)
            .ok_or(Error::UnknownDelivery(tag))?;

        if requeue {
            queue.ready.push_front(Queued {
                message: unacked.message,
                redelivered: true,
            });
            self.dispatch(server, queue_name);
            return Ok(());
        }

        if let Some(dead_letter_exchange) = queue.options.dead_letter_exchange.clone() {
            let mut dead = unacked.message;
            dead.exchange = dead_letter_exchange;
            dead.properties
                .headers
                .insert("x-first-death-queue".to_string(), queue_name.to_string());

            if let Err(e) = self.route(server, dead) {
                warn!(queue = queue_name, "failed to dead-letter message: {e}");
            }
        } else {
            trace!(queue = queue_name, tag, "rejected message dropped");
        }

        Ok(())
    }

    pub fn close_connection(&mut self, server: &Weak<Server>, connection_id: u64) {
        let names: Vec<String> = self.queues.keys().cloned().collect();

        for name in names {
            let Some(queue) = self.queues.get_mut(&name) else {
                continue;
            };

            if queue.owner == Some(connection_id) {
                self.delete_queue(&name);
                continue;
            }

            let before = queue.consumers.len();
            queue
                .consumers
                .retain(|consumer| consumer.connection.id != connection_id);
            let removed = before != queue.consumers.len();

            let orphaned = queue
                .unacked
                .iter()
                .filter(|(_, unacked)| unacked.connection_id == connection_id)
                .map(|(tag, _)| *tag)
                .collect();
            queue.requeue(orphaned);

            if removed && queue.options.auto_delete && queue.consumers.is_empty() {
                self.delete_queue(&name);
            } else {
                self.dispatch(server, &name);
            }
        }
    }

    fn delete_queue(&mut self, queue_name: &str) {
        if self.queues.remove(queue_name).is_some() {
            debug!(queue = queue_name, "deleted queue");
        }
        for exchange in self.exchanges.values_mut() {
            exchange
                .bindings
                .retain(|binding| binding.queue != queue_name);
        }
    }

    pub fn queue_exists(&self, queue_name: &str) -> bool {
        self.queues.contains_key(queue_name)
    }

    pub fn consumer_count(&self, queue_name: &str) -> Option<usize> {
        self.queues.get(queue_name).map(|queue| queue.consumers.len())
    }

    pub fn message_count(&self, queue_name: &str) -> Option<usize> {
        self.queues.get(queue_name).map(|queue| queue.ready.len())
    }

    pub fn unacked_count(&self, queue_name: &str) -> Option<usize> {
        self.queues.get(queue_name).map(|queue| queue.unacked.len())
    }
}
