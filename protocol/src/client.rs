//! # Relay Client
//!
//! The library a local application links against to talk to its own relay
//! node. It compresses payloads on the way out, decompresses them on the
//! way back, and runs every RPC through the retrying call wrapper.
//!
//! ```no_run
//! # async fn demo() -> Result<(), parley_protocol::client::ClientError> {
//! use parley_protocol::client::RelayClient;
//!
//! let client = RelayClient::new("party_a").with_url("localhost:1235");
//! client.send("party_b", "round-1/share-3", b"secret share").await?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::call::{self, CallError, RetryPolicy};
use crate::codec::{self, CodecError};
use crate::config::{DEFAULT_CALL_TIMEOUT, DEFAULT_LOCAL_URL};
use crate::error::{ErrorCode, RelayError};
use crate::rpc::{
    ClientRecvRequest, ClientSendRequest, HealthCheckRequest, HealthCheckResponse, RelayResponse,
    Service, ServingStatus,
};
use crate::transport::{RelayChannel, TlsIdentity, TransportError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Call(#[from] CallError),

    #[error("could not open channel to local node: {0}")]
    Channel(#[source] TransportError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The node answered with an error-shaped response.
    #[error("node rejected request: {0}")]
    Rejected(RelayError),
}

impl ClientError {
    /// The taxonomy code a caller can branch on.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Rejected(err) => err.code(),
            Self::Call(CallError::InvalidArgument { .. }) | Self::Codec(_) | Self::Channel(_) => {
                ErrorCode::ClientInternal
            }
            Self::Call(_) => ErrorCode::ServerInternal,
        }
    }
}

// ---------------------------------------------------------------------------
// TLS
// ---------------------------------------------------------------------------

/// PEM material for a mutually authenticated channel to the local node.
#[derive(Clone)]
pub struct ClientTls {
    pub ca_pem: Vec<u8>,
    pub identity: TlsIdentity,
}

impl ClientTls {
    /// TLS is enabled only when all three parts are present.
    pub fn from_parts(
        ca_pem: Option<Vec<u8>>,
        key_pem: Option<Vec<u8>>,
        cert_pem: Option<Vec<u8>>,
    ) -> Option<Self> {
        match (ca_pem, key_pem, cert_pem) {
            (Some(ca_pem), Some(key_pem), Some(cert_pem)) => Some(Self {
                ca_pem,
                identity: TlsIdentity::new(cert_pem, key_pem),
            }),
            _ => None,
        }
    }
}

impl fmt::Debug for ClientTls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientTls")
            .field("ca_pem_len", &self.ca_pem.len())
            .field("identity", &self.identity)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// RelayClient
// ---------------------------------------------------------------------------

pub struct RelayClient {
    target_party: String,
    url: String,
    tls: Option<ClientTls>,
    policy: RetryPolicy,
    timeout: Duration,
    channel: Mutex<Option<RelayChannel>>,
}

impl RelayClient {
    /// A client for `target_party`'s node at the default local address.
    pub fn new(target_party: impl Into<String>) -> Self {
        Self {
            target_party: target_party.into(),
            url: DEFAULT_LOCAL_URL.to_string(),
            tls: None,
            policy: RetryPolicy::default(),
            timeout: DEFAULT_CALL_TIMEOUT,
            channel: Mutex::new(None),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_tls(mut self, tls: Option<ClientTls>) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Per-attempt deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn target_party(&self) -> &str {
        &self.target_party
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// The open channel, created on first use.
    fn channel(&self) -> Result<RelayChannel, ClientError> {
        let mut slot = self.channel.lock();
        if let Some(channel) = slot.as_ref() {
            return Ok(channel.clone());
        }

        let channel = match &self.tls {
            Some(tls) => RelayChannel::mutual_tls(&self.url, &tls.ca_pem, &tls.identity, self.timeout),
            None => RelayChannel::insecure(&self.url, self.timeout),
        }
        .map_err(ClientError::Channel)?;

        debug!(
            party = %self.target_party,
            url = %channel.base_url(),
            secure = self.tls.is_some(),
            "opened client channel"
        );
        *slot = Some(channel.clone());
        Ok(channel)
    }

    /// Whether a channel is currently open.
    pub fn is_connected(&self) -> bool {
        self.channel.lock().is_some()
    }

    /// Drops the channel. Safe to call any number of times; the next call
    /// opens a fresh one.
    pub fn close(&self) {
        if self.channel.lock().take().is_some() {
            debug!(party = %self.target_party, "closed client channel");
        }
    }

    /// Calls `method_name` on `service` with retries.
    ///
    /// An unknown method name fails with [`CallError::InvalidArgument`]
    /// before anything is sent.
    pub async fn call<Req, Resp>(
        &self,
        service: Service,
        method_name: &str,
        request: &Req,
    ) -> Result<Resp, ClientError>
    where
        Req: Serialize + fmt::Debug + Sync,
        Resp: DeserializeOwned,
    {
        call::resolve(service, method_name)?;
        let channel = self.channel()?;

        let response = call::call_named(service, method_name, &self.policy, request, |method| {
            let channel = channel.clone();
            async move { channel.unary(method, request).await }
        })
        .await?;
        Ok(response)
    }

    /// Serving status of the local node.
    pub async fn health_check(&self) -> Result<ServingStatus, ClientError> {
        let response: HealthCheckResponse = self
            .call(Service::Health, "Check", &HealthCheckRequest::default())
            .await?;
        Ok(response.status)
    }

    /// Hands `payload` to the local node for delivery to `receiver`.
    ///
    /// Returns the node's `success` flag; a rejected send is logged with its
    /// error code.
    pub async fn send(&self, receiver: &str, message_id: &str, payload: &[u8]) -> Result<bool, ClientError> {
        let request = ClientSendRequest {
            receiver_id: receiver.to_string(),
            message_id: message_id.to_string(),
            payload: codec::compress(payload)?,
        };

        let response: RelayResponse = self
            .call(Service::SimpleRequestServer, "ClientSimpleSend", &request)
            .await?;

        if let Some(err) = response.as_error() {
            warn!(receiver, message_id, code = %err.code(), error = %err, "send rejected");
        }
        Ok(response.success)
    }

    /// Fetches `message_id` from the local node's mailbox.
    ///
    /// An absent or expired message comes back as an empty payload.
    pub async fn recv(&self, message_id: &str) -> Result<Vec<u8>, ClientError> {
        let request = ClientRecvRequest {
            message_id: message_id.to_string(),
        };

        let response: RelayResponse = self
            .call(Service::SimpleRequestServer, "ClientSimpleRecv", &request)
            .await?;

        if let Some(err) = response.as_error() {
            return Err(ClientError::Rejected(err));
        }
        if response.payload.is_empty() {
            return Ok(Vec::new());
        }
        Ok(codec::decompress(&response.payload)?)
    }
}

impl fmt::Debug for RelayClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayClient")
            .field("target_party", &self.target_party)
            .field("url", &self.url)
            .field("tls", &self.tls.is_some())
            .field("policy", &self.policy)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        self.close();
    }
}
