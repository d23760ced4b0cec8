// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Parley Protocol: Core Library
//!
//! Parley relays opaque payloads between the parties of a multi-party
//! computation. Every party runs one node; a message travels from a local
//! application to its own node, hops once to the receiver's node, and waits
//! there in a mailbox until the receiving application asks for it.
//!
//! ```text
//! app ──send──▶ node A ──ServerSimpleSend──▶ node B ──▶ mailbox
//!                                                          │
//! app ◀──────────────────recv──────────────── node B ◀─────┘
//! ```
//!
//! ## Modules
//!
//! - **topology**: Which party lives where, and whom each endpoint trusts.
//! - **pool**: One cached channel per receiver, evicted when idle.
//! - **call**: Retries, timing and error shaping around a single RPC.
//! - **client**: What an application links against: send, recv, health.
//! - **server**: Node-side handlers and the error-to-response translator.
//! - **mailbox**: Expiring store for delivered messages (memory or sled).
//! - **transport**: HTTP channels, plain or mutually authenticated.
//! - **rpc**: Services, methods and wire envelopes.
//! - **codec**: Payload compression.
//! - **error**: The numeric error taxonomy shared by both sides.
//! - **config**: Protocol constants and defaults.
//!
//! ## Guarantees (and the lack thereof)
//!
//! 1. A successful send means the message is in the receiver's mailbox.
//! 2. Reads never consume. Unread messages vanish after their TTL, silently.
//! 3. Message ids are the caller's business. Same id, last write wins.

pub mod call;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod mailbox;
pub mod pool;
pub mod rpc;
pub mod server;
pub mod topology;
pub mod transport;

pub use client::{ClientError, ClientTls, RelayClient};
pub use error::{ErrorCode, RelayError, RelayResult};
pub use mailbox::{Mailbox, MemoryMailbox, SledMailbox};
pub use pool::{ChannelFactory, ConnectionPool, PeerChannel};
pub use server::RelayService;
pub use topology::Topology;
pub use transport::{HttpChannelFactory, RelayChannel, TlsIdentity};
