use serde::Serialize;

use reverb_common::protocol::{ChannelId, GuildId, StatsSnapshot};

/// Events emitted by the cluster core.
///
/// One typed stream, delivered over the receiver returned by
/// [`ClusterRegistry::new`](crate::registry::ClusterRegistry::new). For a
/// given guild, events arrive in the order the core processed the inputs
/// that caused them.
#[derive(Debug, Clone)]
pub enum ClusterEvent {
    /// A node completed its handshake. `resumed` tells whether the
    /// previous session survived the reconnect.
    NodeConnected { node: String, resumed: bool },
    /// A node's stream closed unexpectedly; reconnection is underway.
    NodeDisconnected { node: String },
    /// A reconnect attempt has been scheduled.
    NodeReconnecting { node: String, attempt: u32 },
    /// Reconnect attempts are exhausted. The node is gone for good.
    NodeLost { node: String },
    /// A fresh stats snapshot replaced the cached one.
    NodeStats { node: String, stats: StatsSnapshot },
    /// A player record was created and assigned to a node.
    PlayerCreated { guild_id: GuildId, node: String },
    PlayerDestroyed { guild_id: GuildId },
    /// The player moved between voice channels on the same node.
    PlayerChannelMoved {
        guild_id: GuildId,
        from: Option<ChannelId>,
        to: ChannelId,
    },
    /// The player was explicitly moved to a different node.
    PlayerReassigned {
        guild_id: GuildId,
        from: Option<String>,
        to: String,
    },
    /// The player's node died (or came back without its sessions) and the
    /// player has not been moved yet. Expected operational condition, not
    /// an error.
    ReassignmentRequired { guild_id: GuildId, node: String },
    /// A complete voice credential reached the player's node.
    CredentialForwarded { guild_id: GuildId, node: String },
    /// A complete credential could not be delivered; the session is not
    /// ready and the credential stays pending.
    ForwardFailed { guild_id: GuildId, node: String },
    TrackStart { guild_id: GuildId, track: String },
    TrackEnd {
        guild_id: GuildId,
        track: String,
        reason: String,
    },
    TrackException {
        guild_id: GuildId,
        track: String,
        error: String,
    },
    TrackStuck {
        guild_id: GuildId,
        track: String,
        threshold_ms: u64,
    },
    /// The node's own voice connection for the guild closed.
    PlayerSocketClosed {
        guild_id: GuildId,
        code: u16,
        reason: String,
    },
}

/// Outbound voice-gateway payload, handed to the caller-supplied sink.
/// The core builds these; it never owns the gateway transport.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VoiceGatewayRequest {
    pub guild_id: GuildId,
    /// `None` requests leaving the current channel.
    pub channel_id: Option<ChannelId>,
    pub self_deaf: bool,
    pub self_mute: bool,
}

impl VoiceGatewayRequest {
    pub fn join(guild_id: GuildId, channel_id: ChannelId) -> Self {
        Self {
            guild_id,
            channel_id: Some(channel_id),
            self_deaf: false,
            self_mute: false,
        }
    }

    pub fn leave(guild_id: GuildId) -> Self {
        Self {
            guild_id,
            channel_id: None,
            self_deaf: false,
            self_mute: false,
        }
    }
}
