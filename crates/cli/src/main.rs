//! CLI binary that runs a request/response demo over the in-memory broker.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::convert::Infallible;
use std::time::Duration;

use bridge_broker::ExchangeKind;
use bridge_broker_memory::MemoryBroker;
use bridge_rpc::{
    AckPolicy, CallOptions, Client, ClientOptions, ReplyMode, consumer_fn, request_fn,
};
use bytes::Bytes;
use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// CLI-specific error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A caller task failed to complete
    #[error("caller task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// Messaging error
    #[error(transparent)]
    Rpc(#[from] bridge_rpc::Error<bridge_broker_memory::Error>),
}

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// What to do with requests whose handler failed
    #[arg(long, default_value = "ack-always", env = "BRIDGE_ACK_POLICY")]
    ack_policy: AckPolicy,

    /// Timeout for each call in milliseconds
    #[arg(long, default_value_t = 10_000, env = "BRIDGE_CALL_TIMEOUT_MS")]
    call_timeout_ms: u64,

    /// Number of concurrent callers
    #[arg(long, default_value_t = 4, env = "BRIDGE_CALLERS")]
    callers: usize,

    /// Calls made by each caller
    #[arg(long, default_value_t = 5, env = "BRIDGE_CALLS_PER_CALLER")]
    calls_per_caller: usize,

    /// Topic exchange that receives an event for every answered request
    #[arg(long, default_value = "bridge.events", env = "BRIDGE_EVENTS_EXCHANGE")]
    events_exchange: String,

    /// Timeout for each publish in milliseconds
    #[arg(long, default_value_t = 5_000, env = "BRIDGE_PUBLISH_TIMEOUT_MS")]
    publish_timeout_ms: u64,

    /// How callers receive responses: shared or per-call
    #[arg(long, default_value = "shared", env = "BRIDGE_REPLY_MODE")]
    reply_mode: ReplyMode,

    /// Queue the responder serves
    #[arg(long, default_value = "bridge.requests", env = "BRIDGE_REQUEST_QUEUE")]
    request_queue: String,
}

impl Args {
    fn client_options(&self) -> ClientOptions {
        ClientOptions {
            ack_policy: self.ack_policy,
            call_timeout: Duration::from_millis(self.call_timeout_ms),
            publish_timeout: Duration::from_millis(self.publish_timeout_ms),
            reply_mode: self.reply_mode,
            ..ClientOptions::default()
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let broker = MemoryBroker::new();

    let shutdown_token = CancellationToken::new();
    let signal_shutdown_token = shutdown_token.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received interrupt signal");
        signal_shutdown_token.cancel();
    });

    // Responder: uppercases requests and announces each one on the events
    // exchange.
    let responder = Client::with_options(broker.connect(), args.client_options());
    responder.declare_queue(&args.request_queue).await?;
    responder
        .declare_exchange(&args.events_exchange, ExchangeKind::Topic)
        .await?;

    let serving = {
        let events = responder.clone();
        let events_exchange = args.events_exchange.clone();
        responder
            .serve(
                &args.request_queue,
                request_fn(move |payload: Bytes, _reply_to, correlation_id: String| {
                    let events = events.clone();
                    let events_exchange = events_exchange.clone();
                    async move {
                        let response =
                            Bytes::from(String::from_utf8_lossy(&payload).to_uppercase());
                        if let Err(e) = events
                            .publish(
                                &events_exchange,
                                "request.answered",
                                Bytes::from(correlation_id),
                            )
                            .await
                        {
                            warn!("failed to publish event: {e}");
                        }
                        Ok::<_, Infallible>(response)
                    }
                }),
            )
            .await?
    };

    // Audit consumer: counts answered requests from the events exchange.
    let audit_queue = responder.declare_reply_queue().await?;
    responder
        .bind_queue(&audit_queue, &args.events_exchange, "request.*")
        .await?;
    let auditing = responder
        .consume(
            &audit_queue,
            consumer_fn(|correlation_id: Bytes| async move {
                info!(
                    correlation_id = %String::from_utf8_lossy(&correlation_id),
                    "request answered"
                );
                Ok::<_, Infallible>(())
            }),
        )
        .await?;

    // Callers share one client, and therefore one reply queue in shared mode.
    let caller = Client::with_options(broker.connect(), args.client_options());
    let mut callers = JoinSet::new();
    for caller_id in 0..args.callers {
        let caller = caller.clone();
        let queue = args.request_queue.clone();
        let shutdown_token = shutdown_token.clone();
        let calls = args.calls_per_caller;

        callers.spawn(async move {
            let mut answered = 0_usize;
            for call_id in 0..calls {
                let payload = Bytes::from(format!("hello from caller {caller_id}, call {call_id}"));
                let options = CallOptions::default().cancellation(shutdown_token.clone());

                match caller.call_with("", &queue, payload, options).await {
                    Ok(response) => {
                        info!(
                            caller_id,
                            call_id,
                            response = %String::from_utf8_lossy(&response),
                            "call answered"
                        );
                        answered += 1;
                    }
                    Err(bridge_rpc::Error::Cancelled { .. }) => break,
                    Err(e) => warn!(caller_id, call_id, "call failed: {e}"),
                }
            }
            answered
        });
    }

    let mut answered = 0;
    while let Some(result) = callers.join_next().await {
        answered += result?;
    }
    info!(
        answered,
        total = args.callers * args.calls_per_caller,
        "demo finished"
    );

    caller.close().await?;
    auditing.shutdown().await;
    serving.shutdown().await;
    responder.close().await?;

    Ok(())
}
