//! # Relay HTTP API
//!
//! Builds the axum router that exposes the relay's RPC surface. Every RPC is
//! a `POST` whose body is a bincode envelope; the answer is one too.
//!
//! ## Endpoints
//!
//! | Method | Path                                           | Description                  |
//! |--------|------------------------------------------------|------------------------------|
//! | GET    | `/health`                                      | Liveness check (JSON)        |
//! | POST   | `/parley.Health/Check`                         | RPC health check             |
//! | POST   | `/parley.SimpleRequestServer/ClientSimpleSend` | Forward to receiver's node   |
//! | POST   | `/parley.SimpleRequestServer/ClientSimpleRecv` | Read from local mailbox      |
//! | POST   | `/parley.SimpleRequestServer/ServerSimpleSend` | Store from another node      |
//!
//! Relay failures are HTTP 200 with `success = false`; only an undecodable
//! body is answered with 400.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use parley_protocol::config::RPC_CONTENT_TYPE;
use parley_protocol::pool::ChannelFactory;
use parley_protocol::rpc::{self, RelayResponse, RpcMethod};
use parley_protocol::RelayService;

use crate::metrics::SharedMetrics;

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// Shared application state available to all request handlers.
///
/// Cheap to clone, everything sits behind `Arc`.
pub struct AppState<F: ChannelFactory> {
    /// This node's party id.
    pub party: String,
    /// The node's reported version string.
    pub version: String,
    /// Relay handlers, pool and mailbox.
    pub service: Arc<RelayService<F>>,
    /// Reference to Prometheus metrics for in-handler recording.
    pub metrics: SharedMetrics,
}

impl<F: ChannelFactory> Clone for AppState<F> {
    fn clone(&self) -> Self {
        Self {
            party: self.party.clone(),
            version: self.version.clone(),
            service: Arc::clone(&self.service),
            metrics: Arc::clone(&self.metrics),
        }
    }
}

// ---------------------------------------------------------------------------
// Router Construction
// ---------------------------------------------------------------------------

/// Builds the full axum [`Router`] with all relay routes and tracing.
pub fn create_router<F: ChannelFactory>(state: AppState<F>, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler::<F>))
        .route(&RpcMethod::HealthCheck.path(), post(health_check_handler::<F>))
        .route(&RpcMethod::ClientSimpleSend.path(), post(client_simple_send_handler::<F>))
        .route(&RpcMethod::ClientSimpleRecv.path(), post(client_simple_recv_handler::<F>))
        .route(&RpcMethod::ServerSimpleSend.path(), post(server_simple_send_handler::<F>))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Body Helpers
// ---------------------------------------------------------------------------

fn decode_body<T: DeserializeOwned>(method: RpcMethod, body: &[u8]) -> Result<T, Response> {
    rpc::decode(body).map_err(|e| {
        warn!(method = %method, error = %e, bytes = body.len(), "undecodable request body");
        (StatusCode::BAD_REQUEST, format!("invalid {} request: {}", method, e)).into_response()
    })
}

fn encode_reply<T: Serialize>(method: RpcMethod, message: &T) -> Response {
    match rpc::encode(message) {
        Ok(body) => (StatusCode::OK, [(header::CONTENT_TYPE, RPC_CONTENT_TYPE)], body).into_response(),
        Err(e) => {
            error!(method = %method, error = %e, "failed to encode response");
            (StatusCode::INTERNAL_SERVER_ERROR, "response encoding failed").into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /health`: returns 200 if the node is alive.
async fn health_handler<F: ChannelFactory>(State(state): State<AppState<F>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ok",
            "party": state.party,
            "version": state.version,
        })),
    )
}

async fn health_check_handler<F: ChannelFactory>(State(state): State<AppState<F>>, body: Bytes) -> Response {
    let method = RpcMethod::HealthCheck;
    let request = match decode_body(method, &body) {
        Ok(request) => request,
        Err(rejection) => return rejection,
    };
    let response = state.service.health_check(request).await;
    encode_reply(method, &response)
}

async fn client_simple_send_handler<F: ChannelFactory>(
    State(state): State<AppState<F>>,
    body: Bytes,
) -> Response {
    let method = RpcMethod::ClientSimpleSend;
    let request = match decode_body(method, &body) {
        Ok(request) => request,
        Err(rejection) => return rejection,
    };

    let start = Instant::now();
    let response = state.service.client_simple_send(request).await;
    state.metrics.observe(method, &response, start.elapsed());
    state
        .metrics
        .pooled_channels
        .set(state.service.pool().len() as i64);
    encode_reply(method, &response)
}

async fn client_simple_recv_handler<F: ChannelFactory>(
    State(state): State<AppState<F>>,
    body: Bytes,
) -> Response {
    let method = RpcMethod::ClientSimpleRecv;
    let request = match decode_body(method, &body) {
        Ok(request) => request,
        Err(rejection) => return rejection,
    };

    let start = Instant::now();
    let response = state.service.client_simple_recv(request).await;
    state.metrics.observe(method, &response, start.elapsed());
    encode_reply(method, &response)
}

async fn server_simple_send_handler<F: ChannelFactory>(
    State(state): State<AppState<F>>,
    body: Bytes,
) -> Response {
    let method = RpcMethod::ServerSimpleSend;
    let request = match decode_body(method, &body) {
        Ok(request) => request,
        Err(rejection) => return rejection,
    };

    let start = Instant::now();
    let response: RelayResponse = state.service.server_simple_send(request).await;
    state.metrics.observe(method, &response, start.elapsed());
    encode_reply(method, &response)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use parley_protocol::rpc::{
        ClientRecvRequest, ClientSendRequest, HealthCheckRequest, HealthCheckResponse,
        ServerSendRequest, ServingStatus,
    };
    use parley_protocol::{
        ConnectionPool, HttpChannelFactory, Mailbox, MemoryMailbox, RelayClient, SledMailbox,
        Topology,
    };
    use std::time::Duration;
    use tower::ServiceExt;

    const TEST_BODY_LIMIT: usize = 1024 * 1024;

    /// Creates a test AppState for `party` over the given topology and mailbox.
    fn test_app_state(
        party: &str,
        topology_json: &str,
        mailbox: Arc<dyn Mailbox>,
    ) -> AppState<HttpChannelFactory> {
        let topology = Arc::new(Topology::from_json(topology_json, party).unwrap());
        let factory = HttpChannelFactory::new(None).with_timeout(Duration::from_secs(5));
        let pool = Arc::new(ConnectionPool::new(topology, factory));

        AppState {
            party: party.to_string(),
            version: "0.1.0-test".into(),
            service: Arc::new(RelayService::new(pool, mailbox)),
            metrics: Arc::new(crate::metrics::NodeMetrics::new().unwrap()),
        }
    }

    fn isolated_state() -> AppState<HttpChannelFactory> {
        test_app_state(
            "party_a",
            r#"{ "party_b": { "endpoints": [ { "type": 1, "url": "127.0.0.1:9" } ] } }"#,
            Arc::new(MemoryMailbox::new()),
        )
    }

    /// Sends a GET request and returns the (status, body_bytes).
    async fn get(router: &Router, path: &str) -> (StatusCode, Vec<u8>) {
        let req = Request::builder().uri(path).body(Body::empty()).unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes().to_vec();
        (status, body)
    }

    /// POSTs a raw body and returns (status, body_bytes).
    async fn post_raw(router: &Router, method: RpcMethod, body: Vec<u8>) -> (StatusCode, Vec<u8>) {
        let req = Request::builder()
            .method("POST")
            .uri(method.path())
            .header("content-type", RPC_CONTENT_TYPE)
            .body(Body::from(body))
            .unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes().to_vec();
        (status, body)
    }

    async fn post<Req: Serialize, Resp: DeserializeOwned>(
        router: &Router,
        method: RpcMethod,
        request: &Req,
    ) -> Resp {
        let (status, body) = post_raw(router, method, rpc::encode(request).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        rpc::decode(&body).unwrap()
    }

    // -- Routes ---------------------------------------------------------------

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let router = create_router(isolated_state(), TEST_BODY_LIMIT);
        let (status, body) = get(&router, "/health").await;

        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["party"], "party_a");
    }

    #[tokio::test]
    async fn rpc_health_check_is_serving() {
        let router = create_router(isolated_state(), TEST_BODY_LIMIT);
        let response: HealthCheckResponse =
            post(&router, RpcMethod::HealthCheck, &HealthCheckRequest::default()).await;
        assert_eq!(response.status, ServingStatus::Serving);
    }

    #[tokio::test]
    async fn stored_message_can_be_received() {
        let state = isolated_state();
        let metrics = Arc::clone(&state.metrics);
        let router = create_router(state, TEST_BODY_LIMIT);

        let stored: RelayResponse = post(
            &router,
            RpcMethod::ServerSimpleSend,
            &ServerSendRequest {
                message_id: "m1".into(),
                payload: b"compressed".to_vec(),
            },
        )
        .await;
        assert!(stored.success);

        let found: RelayResponse = post(
            &router,
            RpcMethod::ClientSimpleRecv,
            &ClientRecvRequest { message_id: "m1".into() },
        )
        .await;
        assert_eq!(found.payload, b"compressed");

        let stores = metrics
            .requests_total
            .with_label_values(&["ServerSimpleSend", "ok"])
            .get();
        assert_eq!(stores, 1);
    }

    #[tokio::test]
    async fn unknown_receiver_is_error_shaped_200() {
        let router = create_router(isolated_state(), TEST_BODY_LIMIT);
        let response: RelayResponse = post(
            &router,
            RpcMethod::ClientSimpleSend,
            &ClientSendRequest {
                receiver_id: "party_z".into(),
                message_id: "m1".into(),
                payload: vec![1],
            },
        )
        .await;

        assert!(!response.success);
        assert_eq!(response.error_code, Some(30003));
    }

    #[tokio::test]
    async fn garbage_body_is_bad_request() {
        let router = create_router(isolated_state(), TEST_BODY_LIMIT);
        let (status, _) = post_raw(&router, RpcMethod::ClientSimpleRecv, vec![0xff; 3]).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let router = create_router(isolated_state(), 1024);
        let request = ServerSendRequest {
            message_id: "big".into(),
            payload: vec![0; 4096],
        };
        let (status, _) = post_raw(&router, RpcMethod::ServerSimpleSend, rpc::encode(&request).unwrap()).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    }

    // -- Live nodes -----------------------------------------------------------

    /// Two nodes on loopback, wired through their real HTTP channels.
    #[tokio::test]
    async fn message_travels_between_live_nodes() {
        let listener_a = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listener_b = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr_a = listener_a.local_addr().unwrap();
        let addr_b = listener_b.local_addr().unwrap();

        let topology = format!(
            r#"{{
                "party_a": {{ "endpoints": [ {{ "type": 1, "url": "{addr_a}" }} ] }},
                "party_b": {{ "endpoints": [ {{ "type": 1, "url": "{addr_b}" }} ] }}
            }}"#
        );

        let router_a = create_router(
            test_app_state("party_a", &topology, Arc::new(MemoryMailbox::new())),
            TEST_BODY_LIMIT,
        );
        let router_b = create_router(
            test_app_state("party_b", &topology, Arc::new(SledMailbox::open_temporary().unwrap())),
            TEST_BODY_LIMIT,
        );
        let node_a = tokio::spawn(async move { axum::serve(listener_a, router_a).await });
        let node_b = tokio::spawn(async move { axum::serve(listener_b, router_b).await });

        let sender = RelayClient::new("party_a").with_url(addr_a.to_string());
        let receiver = RelayClient::new("party_b").with_url(addr_b.to_string());
        let payload = b"hello".repeat(1024 * 10);

        assert_eq!(sender.health_check().await.unwrap(), ServingStatus::Serving);
        assert!(sender.send("party_b", "m_test_0", &payload).await.unwrap());
        assert_eq!(receiver.recv("m_test_0").await.unwrap(), payload);
        assert!(receiver.recv("m_missing").await.unwrap().is_empty());

        // The sender's own node never stores the message.
        assert!(sender.recv("m_test_0").await.unwrap().is_empty());

        node_a.abort();
        node_b.abort();
    }
}
