use serde::{Deserialize, Serialize};

use super::stats::StatsSnapshot;
use super::GuildId;

/// Frames a node pushes to the client over the message stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum InboundFrame {
    /// Handshake acknowledgment; terminates the `HandshakeWait` state.
    Ready(Ready),
    /// Periodic statistics. Replaces the cached snapshot wholesale.
    Stats(StatsSnapshot),
    /// Per-guild playback position sync.
    PlayerUpdate(PlayerState),
    /// Per-session lifecycle notification.
    Event(NodeEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Ready {
    pub session_id: String,
    /// Whether the node accepted the offered resume key. `false` after a
    /// reconnect means every session previously on this node is lost.
    #[serde(default)]
    pub resumed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlayerState {
    pub guild_id: GuildId,
    /// Node-side clock, unix millis.
    pub time: u64,
    pub position_ms: u64,
    /// Whether the node currently holds a live voice connection.
    pub connected: bool,
}

/// Track and socket lifecycle events, tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum NodeEvent {
    #[serde(rename_all = "camelCase")]
    TrackStart { guild_id: GuildId, track: String },
    #[serde(rename_all = "camelCase")]
    TrackEnd {
        guild_id: GuildId,
        track: String,
        reason: String,
    },
    #[serde(rename_all = "camelCase")]
    TrackException {
        guild_id: GuildId,
        track: String,
        error: String,
    },
    #[serde(rename_all = "camelCase")]
    TrackStuck {
        guild_id: GuildId,
        track: String,
        threshold_ms: u64,
    },
    /// The node's own voice websocket to the guild closed.
    #[serde(rename_all = "camelCase")]
    SocketClosed {
        guild_id: GuildId,
        code: u16,
        reason: String,
    },
}

impl NodeEvent {
    pub fn guild_id(&self) -> GuildId {
        match self {
            NodeEvent::TrackStart { guild_id, .. }
            | NodeEvent::TrackEnd { guild_id, .. }
            | NodeEvent::TrackException { guild_id, .. }
            | NodeEvent::TrackStuck { guild_id, .. }
            | NodeEvent::SocketClosed { guild_id, .. } => *guild_id,
        }
    }
}
