//! # Relay Configuration & Constants
//!
//! Every tunable default in parley lives here. The node binary exposes most
//! of them as CLI flags / environment variables; library users can pass
//! their own values through the `*Config` structs.

use std::time::Duration;

// ---------------------------------------------------------------------------
// Protocol Version
// ---------------------------------------------------------------------------

/// Wire protocol version. Bump when an envelope changes shape.
pub const PROTOCOL_VERSION: &str = "0.1.0";

/// Prefix shared by every RPC route, e.g. `/parley.Health/Check`.
pub const RPC_PACKAGE: &str = "parley";

/// Content type of every RPC request and response body (bincode).
pub const RPC_CONTENT_TYPE: &str = "application/octet-stream";

// ---------------------------------------------------------------------------
// Network
// ---------------------------------------------------------------------------

/// Port the relay server listens on when nothing else is configured.
pub const DEFAULT_RELAY_PORT: u16 = 1235;

/// Address a local client talks to by default.
pub const DEFAULT_LOCAL_URL: &str = "localhost:1235";

/// Largest request body the server accepts. Payloads arrive compressed,
/// so this bounds the compressed size.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024 * 1024;

/// Topology entry that accepts traffic from every party.
pub const WHITELIST_WILDCARD: &str = "*";

// ---------------------------------------------------------------------------
// Connection Pool
// ---------------------------------------------------------------------------

/// A pooled channel unused for longer than this is closed on the next sweep.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// RPC Calls
// ---------------------------------------------------------------------------

/// Total attempts (not re-tries) for a single logical RPC.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Pause between two attempts of the same call.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(1);

/// Deadline for a single attempt, connection setup included.
///
/// A client uses the same value, which is shorter than a node's worst-case
/// forward (`DEFAULT_MAX_ATTEMPTS` attempts). A slow receiver can therefore
/// see the same hop twice; delivery is at-least-once.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// How much of a request's debug form ends up in a failure log line.
pub const LOG_ARGS_LIMIT: usize = 100;

// ---------------------------------------------------------------------------
// Mailbox
// ---------------------------------------------------------------------------

/// Delivered messages stay readable for one hour.
pub const DEFAULT_MESSAGE_TTL: Duration = Duration::from_secs(60 * 60);

/// Interval of the node's background purge of expired mailbox entries.
pub const MAILBOX_PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Name of the sled tree holding mailbox entries.
pub const MAILBOX_TREE: &str = "mailbox";

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// zstd level used for payload compression. Level 3 is zstd's own default.
pub const COMPRESSION_LEVEL: i32 = 3;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_budget_fits_inside_one_call_timeout() {
        let backoff_total = DEFAULT_RETRY_BACKOFF * (DEFAULT_MAX_ATTEMPTS - 1);
        assert!(backoff_total < DEFAULT_CALL_TIMEOUT);
    }

    #[test]
    fn idle_timeout_is_shorter_than_message_ttl() {
        assert!(DEFAULT_IDLE_TIMEOUT < DEFAULT_MESSAGE_TTL);
    }
}
