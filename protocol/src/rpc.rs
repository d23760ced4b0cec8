//! # RPC Surface
//!
//! Typed definitions for the relay's RPC surface: the two services, their
//! methods, and the request/response envelopes. Envelopes travel as
//! bincode bodies of HTTP `POST` requests; the route of each method is
//! derived from its service and name.
//!
//! ## Method Index
//!
//! | Route                                          | Request             | Response              |
//! |------------------------------------------------|---------------------|-----------------------|
//! | `/parley.Health/Check`                         | `HealthCheckRequest`| `HealthCheckResponse` |
//! | `/parley.SimpleRequestServer/ClientSimpleSend` | `ClientSendRequest` | `RelayResponse`       |
//! | `/parley.SimpleRequestServer/ClientSimpleRecv` | `ClientRecvRequest` | `RelayResponse`       |
//! | `/parley.SimpleRequestServer/ServerSimpleSend` | `ServerSendRequest` | `RelayResponse`       |

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::RPC_PACKAGE;
use crate::error::{ErrorCode, RelayError};

// ---------------------------------------------------------------------------
// Services & Methods
// ---------------------------------------------------------------------------

/// The RPC services a relay node exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    Health,
    SimpleRequestServer,
}

impl Service {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Health => "Health",
            Self::SimpleRequestServer => "SimpleRequestServer",
        }
    }

    /// Methods defined on this service.
    pub fn methods(self) -> &'static [RpcMethod] {
        match self {
            Self::Health => &[RpcMethod::HealthCheck],
            Self::SimpleRequestServer => &[
                RpcMethod::ClientSimpleSend,
                RpcMethod::ClientSimpleRecv,
                RpcMethod::ServerSimpleSend,
            ],
        }
    }

    /// Looks a method up by its wire name. `None` when the service has no
    /// such method.
    pub fn method(self, name: &str) -> Option<RpcMethod> {
        self.methods()
            .iter()
            .copied()
            .find(|method| method.name() == name)
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Every callable RPC method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcMethod {
    /// Liveness of the relay server.
    HealthCheck,
    /// Local client hands a message to its own node for delivery.
    ClientSimpleSend,
    /// Local client fetches a delivered message from its own node.
    ClientSimpleRecv,
    /// One node stores a message in another node's mailbox.
    ServerSimpleSend,
}

impl RpcMethod {
    pub const ALL: [RpcMethod; 4] = [
        Self::HealthCheck,
        Self::ClientSimpleSend,
        Self::ClientSimpleRecv,
        Self::ServerSimpleSend,
    ];

    pub const fn service(self) -> Service {
        match self {
            Self::HealthCheck => Service::Health,
            _ => Service::SimpleRequestServer,
        }
    }

    /// Wire name of the method within its service.
    pub const fn name(self) -> &'static str {
        match self {
            Self::HealthCheck => "Check",
            Self::ClientSimpleSend => "ClientSimpleSend",
            Self::ClientSimpleRecv => "ClientSimpleRecv",
            Self::ServerSimpleSend => "ServerSimpleSend",
        }
    }

    /// HTTP route, e.g. `/parley.SimpleRequestServer/ClientSimpleSend`.
    pub fn path(self) -> String {
        format!("/{}.{}/{}", RPC_PACKAGE, self.service().name(), self.name())
    }
}

impl fmt::Display for RpcMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.service().name(), self.name())
    }
}

// ---------------------------------------------------------------------------
// Envelopes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckRequest {
    /// Service to check; empty means the whole server.
    pub service: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServingStatus {
    Unknown,
    Serving,
    NotServing,
}

impl fmt::Display for ServingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "UNKNOWN",
            Self::Serving => "SERVING",
            Self::NotServing => "NOT_SERVING",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckResponse {
    pub status: ServingStatus,
}

/// A local client asks its node to deliver `payload` to `receiver_id`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSendRequest {
    pub receiver_id: String,
    pub message_id: String,
    /// Compressed application payload.
    pub payload: Vec<u8>,
}

/// A local client asks its node for a delivered message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRecvRequest {
    pub message_id: String,
}

/// Node-to-node hop: store `payload` under `message_id`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSendRequest {
    pub message_id: String,
    pub payload: Vec<u8>,
}

// Payloads can be megabytes; keep them out of debug output.
impl fmt::Debug for ClientSendRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSendRequest")
            .field("receiver_id", &self.receiver_id)
            .field("message_id", &self.message_id)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

impl fmt::Debug for ServerSendRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSendRequest")
            .field("message_id", &self.message_id)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

impl From<ClientSendRequest> for ServerSendRequest {
    fn from(request: ClientSendRequest) -> Self {
        Self {
            message_id: request.message_id,
            payload: request.payload,
        }
    }
}

/// Response of every `SimpleRequestServer` method.
///
/// `success == false` always comes with a code and a message. A successful
/// recv of an absent message carries an empty payload.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayResponse {
    pub success: bool,
    pub payload: Vec<u8>,
    pub error_code: Option<u32>,
    pub error_msg: Option<String>,
}

impl RelayResponse {
    /// A success without payload.
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    /// A success carrying `payload` (possibly empty).
    pub fn with_payload(payload: Vec<u8>) -> Self {
        Self {
            success: true,
            payload,
            ..Self::default()
        }
    }

    /// An error-shaped response.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            payload: Vec::new(),
            error_code: Some(code.as_u32()),
            error_msg: Some(message.into()),
        }
    }

    /// The domain error carried by a failed response, if any.
    pub fn as_error(&self) -> Option<RelayError> {
        if self.success {
            return None;
        }
        Some(RelayError::from_wire(
            self.error_code.unwrap_or(ErrorCode::Unknown.as_u32()),
            self.error_msg.clone().unwrap_or_default(),
        ))
    }
}

impl From<&RelayError> for RelayResponse {
    fn from(err: &RelayError) -> Self {
        Self::error(err.code(), err.to_string())
    }
}

impl fmt::Debug for RelayResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayResponse")
            .field("success", &self.success)
            .field("payload_len", &self.payload.len())
            .field("error_code", &self.error_code)
            .field("error_msg", &self.error_msg)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Body Encoding
// ---------------------------------------------------------------------------

/// Serializes an envelope into an HTTP body.
pub fn encode<T: Serialize + ?Sized>(message: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(message)
}

/// Parses an HTTP body into an envelope.
pub fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, bincode::Error> {
    bincode::deserialize(body)
}
