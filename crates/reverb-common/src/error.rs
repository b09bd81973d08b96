use thiserror::Error;

use crate::protocol::GuildId;

#[derive(Error, Debug)]
pub enum ReverbError {
    /// Socket-level failure. Triggers the reconnection path; only surfaced
    /// as fatal once reconnect attempts are exhausted.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed or unexpected frame. The offending message is dropped;
    /// the connection is only torn down when the handshake itself fails.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Node '{0}' is not connected")]
    NotConnected(String),

    #[error("No connected node available")]
    NoAvailableNode,

    /// Forwarding was attempted before both credential fragments were
    /// present. Unreachable by construction; seeing this is a logic defect.
    #[error("Incomplete voice credential for guild {0}")]
    IncompleteCredential(GuildId),

    #[error("Request timed out after {0}ms")]
    Timeout(u64),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Node '{0}' is already registered")]
    NodeAlreadyExists(String),

    #[error("No node named '{0}'")]
    NoSuchNode(String),

    #[error("A player already exists for guild {0}")]
    PlayerAlreadyExists(GuildId),

    #[error("No player exists for guild {0}")]
    NoSuchPlayer(GuildId),

    /// The event/gateway consumer went away; nothing can be delivered.
    #[error("Sink closed: {0}")]
    SinkClosed(&'static str),
}

pub type Result<T> = std::result::Result<T, ReverbError>;
