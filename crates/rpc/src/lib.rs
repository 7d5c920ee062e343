//! Request/response messaging over a routing message broker.
//!
//! A [`Client`] publishes requests that carry a reply address and a
//! correlation id, and matches responses back to the waiting call. The same
//! client can serve requests, answering each on the address it names, or
//! consume queues fire-and-forget. Every subscription runs a delivery loop
//! that settles each delivery exactly once.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod client;

/// Correlation of responses to outstanding calls.
pub mod correlation;

mod error;

/// Handler traits and closure adapters.
pub mod handler;

/// Observation of loop and call events.
pub mod observer;

/// Client, subscription and call options.
pub mod options;

/// Reply routing for shared and single-shot reply queues.
pub mod reply;

mod responder;

/// Delivery loops.
pub mod subscription;

pub use client::Client;
pub use correlation::{CorrelationIdGenerator, CorrelationTable, PendingCall};
pub use error::Error;
pub use handler::{
    ConsumerFn, ConsumerHandler, DeliveryHandler, MessageFn, MessageHandler, RequestFn,
    RequestHandler, consumer_fn, message_fn, request_fn,
};
pub use observer::{BoxError, HandlerFailure, Observer, RequestOutcome, TracingObserver};
pub use options::{AckPolicy, CallOptions, ClientOptions, ReplyMode, SubscriptionOptions};
pub use reply::{ReplyRouter, await_reply};
pub use subscription::Subscription;
