//! # CLI Interface
//!
//! Defines the command-line argument structure for `parley-node` using
//! `clap` derive. `run` starts a relay node; `health`, `send` and `recv`
//! act as a client of a running node.
//!
//! Every `run` flag can also come from the environment, using the variable
//! names deployments already set (`PARTY`, `PEM_PATH`, `CONFIG_FILE_PATH`...).

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use parley_protocol::config::{
    DEFAULT_CALL_TIMEOUT, DEFAULT_IDLE_TIMEOUT, DEFAULT_LOCAL_URL, DEFAULT_MAX_MESSAGE_BYTES,
    DEFAULT_MESSAGE_TTL, DEFAULT_RELAY_PORT,
};

/// Parley cross-party message relay.
#[derive(Parser, Debug)]
#[command(
    name = "parley-node",
    about = "Cross-party store-and-forward message relay",
    version,
    propagate_version = true
)]
pub struct ParleyNodeCli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the relay node.
    Run(RunArgs),
    /// Ask a node whether it is serving.
    Health(ClientArgs),
    /// Send a payload to another party through a node.
    Send(SendArgs),
    /// Fetch a delivered payload from a node's mailbox.
    Recv(RecvArgs),
    /// Print version information and exit.
    Version,
}

/// Mailbox backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MailboxKind {
    /// Durable sled database under the data directory.
    Sled,
    /// In-process map, lost on restart.
    Memory,
}

/// Arguments for the `run` subcommand.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Party id of this node.
    #[arg(long, env = "PARTY")]
    pub party: String,

    /// Port the relay listens on.
    #[arg(long, env = "PORT", default_value_t = DEFAULT_RELAY_PORT)]
    pub port: u16,

    /// Topology file (JSON) listing every party's endpoints.
    #[arg(long, env = "CONFIG_FILE_PATH", default_value = "/app/parties/party.json")]
    pub topology: PathBuf,

    /// Directory holding `server.crt`, `server.key` and optionally `ca.crt`.
    #[arg(long, env = "PEM_PATH", default_value = "/app/certs")]
    pub pem_path: PathBuf,

    /// Deployment environment. Values starting with `prod` make TLS
    /// material mandatory.
    #[arg(long, env = "ENV", default_value = "")]
    pub env: String,

    /// Mailbox backend.
    #[arg(long, env = "MAILBOX", value_enum, default_value_t = MailboxKind::Sled)]
    pub mailbox: MailboxKind,

    /// Data directory for the sled mailbox.
    #[arg(long, env = "DATA_DIR", default_value = "/app/data")]
    pub data_dir: PathBuf,

    /// Seconds a delivered message stays readable.
    #[arg(long, env = "MESSAGE_TTL_SECS", default_value_t = DEFAULT_MESSAGE_TTL.as_secs())]
    pub message_ttl_secs: u64,

    /// Seconds an unused node-to-node channel is kept open.
    #[arg(long, env = "IDLE_TIMEOUT_SECS", default_value_t = DEFAULT_IDLE_TIMEOUT.as_secs())]
    pub idle_timeout_secs: u64,

    /// Deadline for one forwarding attempt, in milliseconds.
    #[arg(long, env = "CALL_TIMEOUT_MS", default_value_t = DEFAULT_CALL_TIMEOUT.as_millis() as u64)]
    pub call_timeout_ms: u64,

    /// Largest accepted request body, in bytes.
    #[arg(long, env = "MAX_MESSAGE_BYTES", default_value_t = DEFAULT_MAX_MESSAGE_BYTES)]
    pub max_message_bytes: usize,

    /// Port for the Prometheus metrics endpoint. Disabled when unset.
    #[arg(long, env = "METRICS_PORT")]
    pub metrics_port: Option<u16>,

    /// Default log level, overridden by `RUST_LOG`.
    #[arg(long, env = "LOGGING_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log format: `pretty` or `json`.
    #[arg(long, env = "LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,
}

/// Connection settings shared by the client subcommands.
#[derive(Args, Debug)]
pub struct ClientArgs {
    /// Address of the node to talk to.
    #[arg(long, default_value = DEFAULT_LOCAL_URL)]
    pub url: String,

    /// Party id of that node.
    #[arg(long, env = "PARTY", default_value = "local")]
    pub party: String,

    /// CA certificate that signed the node's certificate.
    #[arg(long)]
    pub ca: Option<PathBuf>,

    /// Client private key (PEM).
    #[arg(long)]
    pub key: Option<PathBuf>,

    /// Client certificate chain (PEM).
    #[arg(long)]
    pub cert: Option<PathBuf>,

    /// Deadline for one attempt, in milliseconds.
    #[arg(long, default_value_t = DEFAULT_CALL_TIMEOUT.as_millis() as u64)]
    pub timeout_ms: u64,
}

/// Arguments for the `send` subcommand.
#[derive(Args, Debug)]
pub struct SendArgs {
    #[command(flatten)]
    pub client: ClientArgs,

    /// Party that should receive the payload.
    #[arg(long)]
    pub receiver: String,

    /// Message id. A random UUID when omitted.
    #[arg(long)]
    pub message_id: Option<String>,

    /// Read the payload from this file instead of stdin.
    #[arg(long)]
    pub file: Option<PathBuf>,
}

/// Arguments for the `recv` subcommand.
#[derive(Args, Debug)]
pub struct RecvArgs {
    #[command(flatten)]
    pub client: ClientArgs,

    /// Message id to fetch.
    #[arg(long)]
    pub message_id: String,

    /// Write the payload to this file instead of stdout.
    #[arg(long)]
    pub out: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli_structure() {
        // Ensures the derive macros produce a valid CLI definition.
        ParleyNodeCli::command().debug_assert();
    }

    #[test]
    fn run_defaults() {
        let cli = ParleyNodeCli::try_parse_from(["parley-node", "run", "--party", "party_a"]).unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.mailbox, MailboxKind::Sled);
        assert_eq!(args.message_ttl_secs, 3600);
        assert_eq!(args.idle_timeout_secs, 60);
        assert!(args.metrics_port.is_none());
    }

    #[test]
    fn send_takes_receiver_and_optional_id() {
        let cli = ParleyNodeCli::try_parse_from([
            "parley-node",
            "send",
            "--receiver",
            "party_b",
            "--url",
            "10.0.0.1:1235",
        ])
        .unwrap();
        let Commands::Send(args) = cli.command else {
            panic!("expected send");
        };
        assert_eq!(args.receiver, "party_b");
        assert_eq!(args.client.url, "10.0.0.1:1235");
        assert!(args.message_id.is_none());
    }
}
