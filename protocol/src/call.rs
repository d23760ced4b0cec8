//! # RPC Call Wrapper
//!
//! Runs one logical RPC with bounded retries and uniform error reporting.
//!
//! The call itself is a closure, so the wrapper stays agnostic of the
//! channel type; the method is passed alongside for logging and error
//! messages. [`call_named`] is the entry point for callers that only know a
//! method by name: the name is checked against the service before any
//! attempt is made.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::config::{DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_BACKOFF, LOG_ARGS_LIMIT};
use crate::error::RelayError;
use crate::rpc::{RpcMethod, Service};
use crate::transport::TransportError;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// The method does not exist on the service. Never retried.
    #[error("invalid argument: {method} is not a method of {service}")]
    InvalidArgument { service: Service, method: String },

    /// Every attempt failed with a transient error.
    #[error("failed to call {method} after {attempts} attempts: {last}")]
    RpcExhausted {
        method: RpcMethod,
        attempts: u32,
        #[source]
        last: TransportError,
    },

    /// A non-transient failure, surfaced on the attempt that hit it.
    #[error("{method} failed: {source}")]
    Transport {
        method: RpcMethod,
        #[source]
        source: TransportError,
    },
}

impl From<CallError> for RelayError {
    fn from(err: CallError) -> Self {
        match err {
            CallError::InvalidArgument { .. } => RelayError::ClientInternal(err.to_string()),
            _ => RelayError::ServerInternal(err.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Retry Policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, first one included. Zero is treated as one.
    pub max_attempts: u32,
    /// Fixed pause between two attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }
}

// ---------------------------------------------------------------------------
// Call
// ---------------------------------------------------------------------------

/// Runs `attempt` until it succeeds, fails non-transiently, or the policy's
/// attempts are used up.
///
/// `request` is only used for failure logs, truncated to the first
/// hundred characters of its debug form.
pub async fn call<Req, Resp, F, Fut>(
    method: RpcMethod,
    policy: &RetryPolicy,
    request: &Req,
    mut attempt: F,
) -> Result<Resp, CallError>
where
    Req: fmt::Debug + ?Sized,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Resp, TransportError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let start = Instant::now();
    let mut tries = 0;

    loop {
        tries += 1;
        match attempt().await {
            Ok(response) => {
                debug!(
                    method = %method,
                    attempts = tries,
                    elapsed_ms = elapsed_ms(start),
                    "rpc call succeeded"
                );
                return Ok(response);
            }
            Err(err) if err.is_transient() && tries < max_attempts => {
                warn!(method = %method, attempt = tries, error = %err, "rpc error occurred, retrying");
                tokio::time::sleep(policy.backoff).await;
            }
            Err(err) => {
                error!(
                    method = %method,
                    attempts = tries,
                    elapsed_ms = elapsed_ms(start),
                    args = %truncated_args(request),
                    error = %err,
                    "rpc call failed"
                );
                return Err(if err.is_transient() {
                    CallError::RpcExhausted {
                        method,
                        attempts: tries,
                        last: err,
                    }
                } else {
                    CallError::Transport { method, source: err }
                });
            }
        }
    }
}

/// Resolves `method_name` on `service`, then behaves like [`call`].
///
/// An unknown name fails at once: no attempt, no backoff.
pub async fn call_named<Req, Resp, F, Fut>(
    service: Service,
    method_name: &str,
    policy: &RetryPolicy,
    request: &Req,
    attempt: F,
) -> Result<Resp, CallError>
where
    Req: fmt::Debug + ?Sized,
    F: FnMut(RpcMethod) -> Fut,
    Fut: Future<Output = Result<Resp, TransportError>>,
{
    let method = resolve(service, method_name)?;
    let mut attempt = attempt;
    call(method, policy, request, || attempt(method)).await
}

/// Looks up a method by name on a service.
pub fn resolve(service: Service, method_name: &str) -> Result<RpcMethod, CallError> {
    service
        .method(method_name)
        .ok_or_else(|| CallError::InvalidArgument {
            service,
            method: method_name.to_string(),
        })
}

fn elapsed_ms(start: Instant) -> f64 {
    (start.elapsed().as_secs_f64() * 100_000.0).round() / 100.0
}

fn truncated_args<Req: fmt::Debug + ?Sized>(request: &Req) -> String {
    let mut rendered = format!("{:?}", request);
    if let Some((cut, _)) = rendered.char_indices().nth(LOG_ARGS_LIMIT) {
        rendered.truncate(cut);
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn refused() -> TransportError {
        TransportError::Connect("connection refused".into())
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_after_max_attempts_with_backoff_between() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy::default();
        let start = Instant::now();

        let result: Result<(), _> = call(RpcMethod::ServerSimpleSend, &policy, "m1", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(refused()) }
        })
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(start.elapsed() >= policy.backoff * 2);
        match result.unwrap_err() {
            CallError::RpcExhausted { method, attempts, .. } => {
                assert_eq!(method, RpcMethod::ServerSimpleSend);
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn exhausted_error_names_method_and_attempts() {
        let policy = RetryPolicy::default().with_max_attempts(2);
        let err = call::<_, (), _, _>(RpcMethod::ClientSimpleSend, &policy, "x", || async {
            Err(TransportError::Timeout)
        })
        .await
        .unwrap_err();

        let message = err.to_string();
        assert!(message.contains("SimpleRequestServer.ClientSimpleSend"));
        assert!(message.contains("after 2 attempts"));
    }

    #[tokio::test]
    async fn recovers_after_transient_failure() {
        let attempts = AtomicU32::new(0);
        let result = call(RpcMethod::HealthCheck, &RetryPolicy::default(), "", || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(refused())
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_transient_failure_is_not_retried() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = call(RpcMethod::ClientSimpleRecv, &RetryPolicy::default(), "m1", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async {
                Err(TransportError::Status {
                    status: 400,
                    message: "bad body".into(),
                })
            }
        })
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(CallError::Transport { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_method_fails_without_attempt_or_delay() {
        let attempts = AtomicU32::new(0);
        let start = Instant::now();

        let result: Result<(), _> = call_named(
            Service::SimpleRequestServer,
            "NoSuchMethod",
            &RetryPolicy::default(),
            "m1",
            |_| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            },
        )
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 0);
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(matches!(
            result,
            Err(CallError::InvalidArgument { service: Service::SimpleRequestServer, .. })
        ));
    }

    #[tokio::test]
    async fn named_call_dispatches_resolved_method() {
        let method = call_named(
            Service::Health,
            "Check",
            &RetryPolicy::default(),
            "",
            |method| async move { Ok(method) },
        )
        .await
        .unwrap();
        assert_eq!(method, RpcMethod::HealthCheck);
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        let policy = RetryPolicy::default().with_max_attempts(0);
        assert_eq!(policy.max_attempts.max(1), 1);
    }

    #[test]
    fn long_arguments_are_truncated() {
        let long = "x".repeat(500);
        assert_eq!(truncated_args(long.as_str()).chars().count(), LOG_ARGS_LIMIT);
    }
}
