//! # Relay Server Facet
//!
//! Request handlers behind the node's RPC routes:
//!
//! - `ClientSimpleSend`: forwards a local client's message to the
//!   receiver's node through the connection pool.
//! - `ClientSimpleRecv`: reads a delivered message from the local mailbox.
//! - `ServerSimpleSend`: stores a message arriving from another node.
//!
//! Every handler runs inside [`respond`], the one place where failures turn
//! into error-shaped [`RelayResponse`]s. Nothing a handler does, panics
//! included, reaches the transport as anything but a well-formed response.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::call::{self, RetryPolicy};
use crate::config::DEFAULT_MESSAGE_TTL;
use crate::error::RelayError;
use crate::mailbox::Mailbox;
use crate::pool::{ChannelFactory, ConnectionPool, PeerChannel};
use crate::rpc::{
    ClientRecvRequest, ClientSendRequest, HealthCheckRequest, HealthCheckResponse, RelayResponse,
    RpcMethod, ServerSendRequest, ServingStatus,
};

// ---------------------------------------------------------------------------
// Translator
// ---------------------------------------------------------------------------

/// Runs `handler` and converts whatever it produces into a response.
///
/// - `Ok(response)` passes through.
/// - A [`RelayError`] anywhere in the error becomes its own code.
/// - Any other error, or a panic, becomes `ServerInternal` (30001).
pub async fn respond<Fut>(method: RpcMethod, handler: Fut) -> RelayResponse
where
    Fut: Future<Output = anyhow::Result<RelayResponse>>,
{
    let start = Instant::now();
    let outcome = AssertUnwindSafe(handler).catch_unwind().await;
    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

    match outcome {
        Ok(Ok(response)) => {
            debug!(method = %method, success = response.success, elapsed_ms, "request handled");
            response
        }
        Ok(Err(err)) => {
            let relay = match err.downcast_ref::<RelayError>() {
                Some(relay) => {
                    warn!(
                        method = %method,
                        code = %relay.code(),
                        error = %relay,
                        elapsed_ms,
                        "request failed"
                    );
                    relay.clone()
                }
                None => {
                    let relay = RelayError::ServerInternal(format!("{:#}", err));
                    error!(
                        method = %method,
                        code = %relay.code(),
                        error = ?err,
                        elapsed_ms,
                        "unhandled error in request handler"
                    );
                    relay
                }
            };
            RelayResponse::from(&relay)
        }
        Err(panic) => {
            let relay = RelayError::ServerInternal(panic_message(panic.as_ref()));
            error!(
                method = %method,
                code = %relay.code(),
                error = %relay,
                elapsed_ms,
                "request handler panicked"
            );
            RelayResponse::from(&relay)
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

// ---------------------------------------------------------------------------
// RelayService
// ---------------------------------------------------------------------------

/// The node's request handlers and the state they share.
pub struct RelayService<F: ChannelFactory> {
    pool: Arc<ConnectionPool<F>>,
    mailbox: Arc<dyn Mailbox>,
    policy: RetryPolicy,
    message_ttl: Duration,
}

impl<F: ChannelFactory> RelayService<F> {
    pub fn new(pool: Arc<ConnectionPool<F>>, mailbox: Arc<dyn Mailbox>) -> Self {
        Self {
            pool,
            mailbox,
            policy: RetryPolicy::default(),
            message_ttl: DEFAULT_MESSAGE_TTL,
        }
    }

    /// Retry policy for forwarding hops.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// How long stored messages stay readable.
    pub fn with_message_ttl(mut self, ttl: Duration) -> Self {
        self.message_ttl = ttl;
        self
    }

    pub fn pool(&self) -> &ConnectionPool<F> {
        &self.pool
    }

    pub fn mailbox(&self) -> &dyn Mailbox {
        self.mailbox.as_ref()
    }

    pub async fn health_check(&self, _request: HealthCheckRequest) -> HealthCheckResponse {
        HealthCheckResponse {
            status: ServingStatus::Serving,
        }
    }

    pub async fn client_simple_send(&self, request: ClientSendRequest) -> RelayResponse {
        respond(RpcMethod::ClientSimpleSend, self.forward(request)).await
    }

    pub async fn client_simple_recv(&self, request: ClientRecvRequest) -> RelayResponse {
        respond(RpcMethod::ClientSimpleRecv, self.read(request)).await
    }

    pub async fn server_simple_send(&self, request: ServerSendRequest) -> RelayResponse {
        respond(RpcMethod::ServerSimpleSend, self.store(request)).await
    }

    /// Relays the message to the receiver's node and hands back its answer
    /// unchanged.
    async fn forward(&self, request: ClientSendRequest) -> anyhow::Result<RelayResponse> {
        let channel = self.pool.get_channel(&request.receiver_id)?;
        let receiver_id = request.receiver_id.clone();
        let hop = ServerSendRequest::from(request);

        let response = call::call(RpcMethod::ServerSimpleSend, &self.policy, &hop, || {
            channel.server_simple_send(&hop)
        })
        .await
        .map_err(RelayError::from)?;

        debug!(
            receiver_id = %receiver_id,
            message_id = %hop.message_id,
            success = response.success,
            "message forwarded"
        );
        Ok(response)
    }

    async fn read(&self, request: ClientRecvRequest) -> anyhow::Result<RelayResponse> {
        let payload = self
            .mailbox
            .get(&request.message_id)
            .await
            .map_err(|e| RelayError::ServerInternal(format!("mailbox read failed: {}", e)))?;

        // Absent and expired both read as an empty success.
        Ok(RelayResponse::with_payload(payload.unwrap_or_default()))
    }

    async fn store(&self, request: ServerSendRequest) -> anyhow::Result<RelayResponse> {
        let stored = self
            .mailbox
            .set(&request.message_id, &request.payload, self.message_ttl)
            .await
            .map_err(|e| RelayError::MailboxWrite(format!("{}: {}", request.message_id, e)))?;

        if !stored {
            return Err(RelayError::MailboxWrite(format!("save message fail: {}", request.message_id)).into());
        }

        debug!(
            message_id = %request.message_id,
            bytes = request.payload.len(),
            ttl_secs = self.message_ttl.as_secs(),
            "message stored"
        );
        Ok(RelayResponse::ok())
    }
}
