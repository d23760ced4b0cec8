//! # Connection Pool
//!
//! Caches one live channel per receiver party for node-to-node hops.
//!
//! ## Design
//!
//! - The channel map sits behind a single `parking_lot::Mutex`. Lookup,
//!   insert-on-miss and the idle sweep all happen in one critical section,
//!   so two concurrent requests for the same receiver can never both create
//!   a channel.
//! - There is no background timer. Every `get_channel` sweeps the map
//!   before the lookup and drops entries idle for longer than the
//!   threshold, whether or not the lookup then succeeds.
//! - Expired entries are moved out of the map first and closed after the
//!   lock is released.
//! - A hit does not check the peer. A dead channel shows up as a transport
//!   error on the next call and is handled by the call wrapper's retries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::DEFAULT_IDLE_TIMEOUT;
use crate::error::{RelayError, RelayResult};
use crate::rpc::{RelayResponse, ServerSendRequest};
use crate::topology::{Endpoint, Topology};
use crate::transport::TransportError;

// ---------------------------------------------------------------------------
// Channel Traits
// ---------------------------------------------------------------------------

/// The single call a node makes on another node.
#[async_trait]
pub trait PeerChannel: Clone + Send + Sync + 'static {
    async fn server_simple_send(
        &self,
        request: &ServerSendRequest,
    ) -> Result<RelayResponse, TransportError>;
}

/// Opens channels to resolved endpoints.
pub trait ChannelFactory: Send + Sync + 'static {
    type Channel: PeerChannel;

    fn connect(&self, receiver_id: &str, endpoint: &Endpoint) -> Result<Self::Channel, TransportError>;
}

// ---------------------------------------------------------------------------
// ConnectionPool
// ---------------------------------------------------------------------------

struct PooledChannel<C> {
    channel: C,
    last_used: Instant,
}

/// Per-receiver channel cache with opportunistic idle eviction.
pub struct ConnectionPool<F: ChannelFactory> {
    topology: Arc<Topology>,
    factory: F,
    idle_timeout: Duration,
    channels: Mutex<HashMap<String, PooledChannel<F::Channel>>>,
}

impl<F: ChannelFactory> ConnectionPool<F> {
    pub fn new(topology: Arc<Topology>, factory: F) -> Self {
        Self {
            topology,
            factory,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Returns the channel to `receiver_id`, opening one on first use.
    ///
    /// Fails with [`RelayError::NoAvailableConnection`] when the topology
    /// has no endpoint for the receiver that accepts the local party.
    pub fn get_channel(&self, receiver_id: &str) -> RelayResult<F::Channel> {
        let endpoint = self.topology.resolve(receiver_id)?;
        let now = Instant::now();

        let (opened, evicted) = {
            let mut channels = self.channels.lock();
            let evicted = take_idle(&mut channels, now, self.idle_timeout);

            // `connect` only builds a client; the handshake happens on the
            // first request. Keeping it inside the lock is what makes
            // check-then-insert atomic per receiver.
            let opened = match channels.get_mut(receiver_id) {
                Some(entry) => {
                    entry.last_used = now;
                    Ok(entry.channel.clone())
                }
                None => self.factory.connect(receiver_id, endpoint).map(|channel| {
                    debug!(
                        receiver_id,
                        url = %endpoint.url,
                        secure = endpoint.is_secure(),
                        "opened channel"
                    );
                    channels.insert(
                        receiver_id.to_string(),
                        PooledChannel {
                            channel: channel.clone(),
                            last_used: now,
                        },
                    );
                    channel
                }),
            };
            (opened, evicted)
        };

        for (receiver, channel) in evicted {
            drop(channel);
            debug!(receiver_id = %receiver, "closed idle channel");
        }

        opened.map_err(|e| {
            RelayError::ServerInternal(format!("failed to open channel to {}: {}", receiver_id, e))
        })
    }

    /// Number of live channels.
    pub fn len(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.lock().is_empty()
    }

    pub fn contains(&self, receiver_id: &str) -> bool {
        self.channels.lock().contains_key(receiver_id)
    }

    /// Closes every channel. Called once at shutdown.
    pub fn close_all(&self) -> usize {
        let drained: Vec<_> = self.channels.lock().drain().collect();
        let count = drained.len();
        drop(drained);
        info!(count, "connection pool closed");
        count
    }
}

/// Removes and returns every entry idle for strictly longer than `idle`.
fn take_idle<C>(
    channels: &mut HashMap<String, PooledChannel<C>>,
    now: Instant,
    idle: Duration,
) -> Vec<(String, C)> {
    let expired: Vec<String> = channels
        .iter()
        .filter(|(_, entry)| now.duration_since(entry.last_used) > idle)
        .map(|(receiver, _)| receiver.clone())
        .collect();

    expired
        .into_iter()
        .filter_map(|receiver| {
            channels
                .remove_entry(&receiver)
                .map(|(receiver, entry)| (receiver, entry.channel))
        })
        .collect()
}
