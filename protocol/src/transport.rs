//! # HTTP Transport
//!
//! A [`RelayChannel`] is a reusable connection to one relay server: a
//! `reqwest` client (with its own keep-alive pool) bound to a base URL. It
//! performs unary calls by POSTing a bincode envelope to the method's route.
//!
//! Channels come in two flavours:
//!
//! - plain HTTP, for endpoints that carry no trust material;
//! - mutual TLS, trusting only the peer's root certificate and presenting
//!   the local identity (key + certificate chain).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Certificate, Client, Identity};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::{DEFAULT_CALL_TIMEOUT, RPC_CONTENT_TYPE};
use crate::pool::{ChannelFactory, PeerChannel};
use crate::rpc::{self, RelayResponse, RpcMethod, ServerSendRequest};
use crate::topology::Endpoint;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures below the relay protocol: connecting, talking HTTP, decoding.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request timed out")]
    Timeout,

    #[error("request failed: {0}")]
    Request(String),

    #[error("server answered HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("failed to encode request: {0}")]
    Encode(String),

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("invalid TLS material: {0}")]
    Tls(String),
}

impl TransportError {
    /// Whether retrying the same call may succeed.
    ///
    /// Connection problems, timeouts and 5xx answers are transient. A 4xx
    /// means the request itself is wrong, and encode/decode/TLS problems
    /// will not change between attempts.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connect(_) | Self::Timeout | Self::Request(_) => true,
            Self::Status { status, .. } => *status >= 500,
            Self::Encode(_) | Self::Decode(_) | Self::Tls(_) => false,
        }
    }

    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_connect() {
            Self::Connect(err.to_string())
        } else if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Request(err.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// TLS Material
// ---------------------------------------------------------------------------

/// The local party's PEM key and certificate chain.
#[derive(Clone)]
pub struct TlsIdentity {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

impl TlsIdentity {
    pub fn new(cert_pem: impl Into<Vec<u8>>, key_pem: impl Into<Vec<u8>>) -> Self {
        Self {
            cert_pem: cert_pem.into(),
            key_pem: key_pem.into(),
        }
    }

    fn to_reqwest(&self) -> Result<Identity, TransportError> {
        let mut pem = self.key_pem.clone();
        pem.push(b'\n');
        pem.extend_from_slice(&self.cert_pem);
        Identity::from_pem(&pem).map_err(|e| TransportError::Tls(e.to_string()))
    }
}

impl std::fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("cert_pem_len", &self.cert_pem.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// RelayChannel
// ---------------------------------------------------------------------------

/// A connection to one relay server. Cheap to clone.
#[derive(Debug, Clone)]
pub struct RelayChannel {
    client: Client,
    base_url: String,
}

impl RelayChannel {
    /// Plain HTTP channel.
    pub fn insecure(url: &str, timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Request(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url(url, "http"),
        })
    }

    /// Mutually authenticated channel that trusts only `root_pem`.
    pub fn mutual_tls(
        url: &str,
        root_pem: &[u8],
        identity: &TlsIdentity,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let root = Certificate::from_pem(root_pem).map_err(|e| TransportError::Tls(e.to_string()))?;

        let client = Client::builder()
            .use_rustls_tls()
            .tls_built_in_root_certs(false)
            .add_root_certificate(root)
            .identity(identity.to_reqwest()?)
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Tls(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url(url, "https"),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// One request/response exchange, without retries.
    pub async fn unary<Req, Resp>(&self, method: RpcMethod, request: &Req) -> Result<Resp, TransportError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let body = rpc::encode(request).map_err(|e| TransportError::Encode(e.to_string()))?;
        let url = format!("{}{}", self.base_url, method.path());

        let response = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, RPC_CONTENT_TYPE)
            .body(body)
            .send()
            .await
            .map_err(TransportError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let bytes = response.bytes().await.map_err(TransportError::from_reqwest)?;
        rpc::decode(&bytes).map_err(|e| TransportError::Decode(e.to_string()))
    }
}

#[async_trait]
impl PeerChannel for RelayChannel {
    async fn server_simple_send(
        &self,
        request: &ServerSendRequest,
    ) -> Result<RelayResponse, TransportError> {
        self.unary(RpcMethod::ServerSimpleSend, request).await
    }
}

/// Topology urls are usually bare `host:port`; add the scheme when missing.
fn base_url(url: &str, scheme: &str) -> String {
    let url = url.trim().trim_end_matches('/');
    if url.contains("://") {
        url.to_string()
    } else {
        format!("{}://{}", scheme, url)
    }
}

// ---------------------------------------------------------------------------
// HttpChannelFactory
// ---------------------------------------------------------------------------

/// Builds [`RelayChannel`]s for the connection pool.
#[derive(Debug, Clone)]
pub struct HttpChannelFactory {
    identity: Option<TlsIdentity>,
    timeout: Duration,
}

impl HttpChannelFactory {
    /// `identity` is presented on every mutual-TLS hop. Without one, only
    /// endpoints that carry no trust material are reachable.
    pub fn new(identity: Option<TlsIdentity>) -> Self {
        Self {
            identity,
            timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl ChannelFactory for HttpChannelFactory {
    type Channel = RelayChannel;

    fn connect(&self, _receiver_id: &str, endpoint: &Endpoint) -> Result<RelayChannel, TransportError> {
        match endpoint.trust_material() {
            None => RelayChannel::insecure(&endpoint.url, self.timeout),
            Some(root) => {
                let identity = self.identity.as_ref().ok_or_else(|| {
                    TransportError::Tls(
                        "endpoint requires mutual TLS but no local identity is configured".into(),
                    )
                })?;
                RelayChannel::mutual_tls(&endpoint.url, root.as_bytes(), identity, self.timeout)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::TransportKind;

    #[test]
    fn bare_host_gets_scheme() {
        assert_eq!(base_url("10.0.0.2:1235", "http"), "http://10.0.0.2:1235");
        assert_eq!(base_url("b.internal:1235/", "https"), "https://b.internal:1235");
    }

    #[test]
    fn explicit_scheme_is_kept() {
        assert_eq!(base_url("https://relay.b:443", "http"), "https://relay.b:443");
    }

    #[test]
    fn transient_classification() {
        assert!(TransportError::Connect("refused".into()).is_transient());
        assert!(TransportError::Timeout.is_transient());
        assert!(TransportError::Status { status: 503, message: String::new() }.is_transient());
        assert!(!TransportError::Status { status: 400, message: String::new() }.is_transient());
        assert!(!TransportError::Decode("eof".into()).is_transient());
    }

    #[test]
    fn plain_endpoint_builds_insecure_channel() {
        let endpoint = Endpoint {
            kind: TransportKind::Direct,
            url: "127.0.0.1:1235".into(),
            root_certificate: None,
            whitelist: vec!["*".into()],
        };
        let channel = HttpChannelFactory::new(None).connect("party_b", &endpoint).unwrap();
        assert_eq!(channel.base_url(), "http://127.0.0.1:1235");
    }

    #[test]
    fn secure_endpoint_without_identity_is_refused() {
        let endpoint = Endpoint {
            kind: TransportKind::Direct,
            url: "127.0.0.1:1235".into(),
            root_certificate: Some("-----BEGIN CERTIFICATE-----".into()),
            whitelist: vec!["*".into()],
        };
        let err = HttpChannelFactory::new(None)
            .connect("party_b", &endpoint)
            .unwrap_err();
        assert!(matches!(err, TransportError::Tls(_)));
    }

    #[tokio::test]
    async fn unreachable_server_is_a_transient_failure() {
        // Port 9 (discard) on loopback is closed on any sane test machine.
        let channel = RelayChannel::insecure("127.0.0.1:9", Duration::from_secs(2)).unwrap();
        let err = channel
            .unary::<_, RelayResponse>(
                RpcMethod::ServerSimpleSend,
                &ServerSendRequest {
                    message_id: "m1".into(),
                    payload: vec![1, 2, 3],
                },
            )
            .await
            .unwrap_err();
        assert!(err.is_transient(), "unexpected error: {err}");
    }
}
