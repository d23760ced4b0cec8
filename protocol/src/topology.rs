//! # Node Topology
//!
//! Maps every party in the deployment to the transport endpoints it
//! advertises. Loaded once from a JSON file at startup and never mutated
//! afterwards, so it is shared as a plain `Arc<Topology>` without locks.
//!
//! ## Source format
//!
//! ```json
//! {
//!   "party_b": {
//!     "endpoints": [
//!       { "type": 1, "url": "10.0.0.2:1235",
//!         "certificates": "-----BEGIN CERTIFICATE-----\n...",
//!         "whitelist": ["party_a"] }
//!     ]
//!   }
//! }
//! ```
//!
//! `whitelist` lists the parties allowed to use the endpoint and defaults to
//! `["*"]`. `certificates` is the peer's PEM root certificate; an endpoint
//! without one is reached over plain HTTP.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::WHITELIST_WILDCARD;
use crate::error::{RelayError, RelayResult};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised while loading a topology file.
#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("failed to read topology file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed topology: {0}")]
    Parse(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Transport Kind
// ---------------------------------------------------------------------------

/// How an endpoint is reached. Encoded as an integer in the topology file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum TransportKind {
    Other,
    Direct,
    Proxy,
}

impl TryFrom<u8> for TransportKind {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Other),
            1 => Ok(Self::Direct),
            2 => Ok(Self::Proxy),
            other => Err(format!("unknown transport kind: {}", other)),
        }
    }
}

impl From<TransportKind> for u8 {
    fn from(kind: TransportKind) -> Self {
        match kind {
            TransportKind::Other => 0,
            TransportKind::Direct => 1,
            TransportKind::Proxy => 2,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Other => "other",
            Self::Direct => "direct",
            Self::Proxy => "proxy",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Endpoint / Node
// ---------------------------------------------------------------------------

fn default_whitelist() -> Vec<String> {
    vec![WHITELIST_WILDCARD.to_string()]
}

/// One reachable address of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    #[serde(rename = "type")]
    pub kind: TransportKind,
    /// `host:port`, optionally with an explicit `http://` / `https://` scheme.
    pub url: String,
    /// PEM root certificate of the peer. Present means mutual TLS.
    #[serde(
        rename = "certificates",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub root_certificate: Option<String>,
    /// Parties allowed to use this endpoint.
    #[serde(default = "default_whitelist")]
    pub whitelist: Vec<String>,
}

impl Endpoint {
    /// Whether `party` may send through this endpoint.
    pub fn accepts(&self, party: &str) -> bool {
        self.whitelist
            .iter()
            .any(|entry| entry == party || entry == WHITELIST_WILDCARD)
    }

    /// The root certificate, ignoring an empty string.
    pub fn trust_material(&self) -> Option<&str> {
        self.root_certificate
            .as_deref()
            .filter(|pem| !pem.trim().is_empty())
    }

    pub fn is_secure(&self) -> bool {
        self.trust_material().is_some()
    }
}

/// A party together with its advertised endpoints, in declared order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub party: String,
    pub endpoints: Vec<Endpoint>,
}

#[derive(Debug, Deserialize)]
struct NodeDescriptor {
    #[serde(default)]
    endpoints: Vec<Endpoint>,
}

// ---------------------------------------------------------------------------
// Topology
// ---------------------------------------------------------------------------

/// Immutable party → node mapping, seen from one party's point of view.
#[derive(Debug, Clone)]
pub struct Topology {
    self_party: String,
    nodes: HashMap<String, Node>,
}

impl Topology {
    /// A topology with no nodes. Every resolution fails.
    pub fn empty(self_party: impl Into<String>) -> Self {
        Self {
            self_party: self_party.into(),
            nodes: HashMap::new(),
        }
    }

    /// Parses the JSON source format.
    pub fn from_json(json: &str, self_party: impl Into<String>) -> Result<Self, TopologyError> {
        let raw: HashMap<String, NodeDescriptor> = serde_json::from_str(json)?;
        let nodes = raw
            .into_iter()
            .map(|(party, descriptor)| {
                let node = Node {
                    party: party.clone(),
                    endpoints: descriptor.endpoints,
                };
                (party, node)
            })
            .collect();

        Ok(Self {
            self_party: self_party.into(),
            nodes,
        })
    }

    /// Loads the topology file at `path`.
    ///
    /// A missing file is not fatal: the node starts with an empty topology
    /// and can still receive, it just cannot forward.
    pub fn load(path: impl AsRef<Path>, self_party: impl Into<String>) -> Result<Self, TopologyError> {
        let path = path.as_ref();
        if !path.is_file() {
            warn!(path = %path.display(), "topology file not found, starting with no peers");
            return Ok(Self::empty(self_party));
        }

        let json = std::fs::read_to_string(path).map_err(|source| TopologyError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let topology = Self::from_json(&json, self_party)?;

        info!(
            path = %path.display(),
            parties = topology.nodes.len(),
            self_party = %topology.self_party,
            "topology loaded"
        );
        Ok(topology)
    }

    /// The local party id.
    pub fn self_party(&self) -> &str {
        &self.self_party
    }

    pub fn node(&self, party: &str) -> Option<&Node> {
        self.nodes.get(party)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Picks the endpoint used to reach `receiver_id`.
    ///
    /// The first endpoint, in declared order, that whitelists the local
    /// party (or `*`) wins. Unknown receivers, the local party itself, and
    /// receivers with no accepting endpoint all fail with
    /// [`RelayError::NoAvailableConnection`].
    pub fn resolve(&self, receiver_id: &str) -> RelayResult<&Endpoint> {
        if receiver_id == self.self_party {
            return Err(RelayError::NoAvailableConnection(receiver_id.to_string()));
        }

        self.nodes
            .get(receiver_id)
            .and_then(|node| {
                node.endpoints
                    .iter()
                    .find(|endpoint| endpoint.accepts(&self.self_party))
            })
            .ok_or_else(|| RelayError::NoAvailableConnection(receiver_id.to_string()))
    }

    /// Every remote party's first endpoint of the given kind that accepts
    /// the local party.
    ///
    /// Acceptance is the same rule [`Topology::resolve`] uses, so `*`
    /// whitelists count, and the first match in declared order wins. This
    /// deliberately departs from listing only explicitly named parties and
    /// keeping the last match.
    pub fn remote_endpoints(&self, kind: TransportKind) -> HashMap<String, Endpoint> {
        self.nodes
            .iter()
            .filter(|(party, _)| party.as_str() != self.self_party)
            .filter_map(|(party, node)| {
                node.endpoints
                    .iter()
                    .find(|endpoint| endpoint.kind == kind && endpoint.accepts(&self.self_party))
                    .map(|endpoint| (party.clone(), endpoint.clone()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "party_a": { "endpoints": [ { "type": 1, "url": "a.internal:1235" } ] },
        "party_b": { "endpoints": [
            { "type": 2, "url": "proxy.b:443", "whitelist": ["party_c"] },
            { "type": 1, "url": "b.internal:1235", "whitelist": ["party_a"],
              "certificates": "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----" },
            { "type": 1, "url": "b.backup:1235" }
        ] },
        "party_c": { "endpoints": [ { "type": 1, "url": "c.internal:1235", "whitelist": ["party_b"] } ] }
    }"#;

    fn topology() -> Topology {
        Topology::from_json(SAMPLE, "party_a").unwrap()
    }

    #[test]
    fn resolve_self_fails() {
        let err = topology().resolve("party_a").unwrap_err();
        assert_eq!(err, RelayError::NoAvailableConnection("party_a".into()));
    }

    #[test]
    fn resolve_unknown_fails() {
        let err = topology().resolve("party_z").unwrap_err();
        assert!(matches!(err, RelayError::NoAvailableConnection(_)));
    }

    #[test]
    fn resolve_fails_when_whitelist_excludes_self() {
        let err = topology().resolve("party_c").unwrap_err();
        assert!(matches!(err, RelayError::NoAvailableConnection(_)));
    }

    #[test]
    fn resolve_returns_first_accepting_endpoint() {
        let topo = topology();
        let endpoint = topo.resolve("party_b").unwrap();
        assert_eq!(endpoint.url, "b.internal:1235");
        assert!(endpoint.is_secure());
    }

    #[test]
    fn whitelist_defaults_to_wildcard() {
        let topo = topology();
        let node = topo.node("party_b").unwrap();
        assert_eq!(node.endpoints[2].whitelist, vec!["*".to_string()]);
        assert!(node.endpoints[2].accepts("anyone"));
    }

    #[test]
    fn empty_certificate_is_insecure() {
        let json = r#"{ "party_b": { "endpoints": [ { "type": 1, "url": "b:1", "certificates": "" } ] } }"#;
        let topo = Topology::from_json(json, "party_a").unwrap();
        assert!(!topo.resolve("party_b").unwrap().is_secure());
    }

    #[test]
    fn remote_endpoints_filters_by_kind_and_skips_self() {
        let topo = topology();

        let direct = topo.remote_endpoints(TransportKind::Direct);
        assert_eq!(direct.len(), 1);
        assert_eq!(direct["party_b"].url, "b.internal:1235");
        assert!(!direct.contains_key("party_a"));

        let proxy = topo.remote_endpoints(TransportKind::Proxy);
        assert!(proxy.is_empty());
    }

    #[test]
    fn remote_endpoints_accept_wildcard_and_keep_first_match() {
        let json = r#"{
            "party_b": { "endpoints": [
                { "type": 1, "url": "b.open:1235" },
                { "type": 1, "url": "b.named:1235", "whitelist": ["party_a"] }
            ] }
        }"#;
        let topo = Topology::from_json(json, "party_a").unwrap();

        let direct = topo.remote_endpoints(TransportKind::Direct);
        assert_eq!(direct["party_b"].url, "b.open:1235");
        assert_eq!(topo.resolve("party_b").unwrap().url, "b.open:1235");
    }

    #[test]
    fn out_of_range_transport_kind_is_rejected() {
        let json = r#"{ "party_b": { "endpoints": [ { "type": 7, "url": "b:1" } ] } }"#;
        assert!(matches!(
            Topology::from_json(json, "party_a"),
            Err(TopologyError::Parse(_))
        ));
    }

    #[test]
    fn missing_file_yields_empty_topology() {
        let dir = tempfile::tempdir().unwrap();
        let topo = Topology::load(dir.path().join("absent.json"), "party_a").unwrap();
        assert!(topo.is_empty());
        assert!(topo.resolve("party_b").is_err());
    }

    #[test]
    fn load_reads_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("party.json");
        std::fs::write(&path, SAMPLE).unwrap();

        let topo = Topology::load(&path, "party_b").unwrap();
        assert_eq!(topo.len(), 3);
        assert_eq!(topo.self_party(), "party_b");
        assert_eq!(topo.resolve("party_c").unwrap().url, "c.internal:1235");
    }
}
