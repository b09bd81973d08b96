use std::collections::VecDeque;

use reverb_common::protocol::{ChannelId, GuildId};

/// Per-guild playback state.
///
/// Created on first use, destroyed on explicit teardown or a definitive
/// "left voice channel" signal. The assigned node is stored by *name* and
/// resolved through the registry on every use, so removing a node can
/// never leave a player holding a dangling connection handle.
#[derive(Debug, Clone)]
pub struct Player {
    pub guild_id: GuildId,
    node: Option<String>,
    pub text_channel: Option<ChannelId>,
    pub voice_channel: Option<ChannelId>,
    /// Currently playing track, opaque to the core.
    pub track: Option<String>,
    /// Pending tracks, opaque to the core.
    pub queue: VecDeque<String>,
    pub paused: bool,
    /// Volume on a scale of 0 to 150.
    pub volume: u16,
    /// Last playback position reported by the node, in milliseconds.
    pub position_ms: u64,
    /// Node-side clock of the last position report, unix millis.
    pub time: u64,
}

impl Player {
    pub fn new(guild_id: GuildId) -> Self {
        Self {
            guild_id,
            node: None,
            text_channel: None,
            voice_channel: None,
            track: None,
            queue: VecDeque::new(),
            paused: false,
            volume: 100,
            position_ms: 0,
            time: 0,
        }
    }

    /// Name of the assigned node, if any.
    pub fn node(&self) -> Option<&str> {
        self.node.as_deref()
    }

    /// Assigns the player to a node. Reassignment goes through here too;
    /// there is no silent path that changes the assignment.
    pub fn assign_node(&mut self, node: impl Into<String>) -> Option<String> {
        self.node.replace(node.into())
    }

    /// Clears the assignment, returning the previous node name. Used when
    /// a node dies or is removed; the caller is responsible for emitting
    /// the reassignment notification.
    pub fn clear_node(&mut self) -> Option<String> {
        self.node.take()
    }
}
