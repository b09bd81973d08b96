//! Wire-level types for the backend node protocol.
//!
//! A node speaks two channels: a persistent message stream carrying the
//! frames in [`inbound`] and [`outbound`], and a request/response REST
//! surface whose bodies live in [`outbound`] as well. Everything is JSON;
//! stream frames are tagged by an `op` field, node-pushed events by a
//! `type` field.

pub mod inbound;
pub mod outbound;
pub mod stats;

pub use inbound::{InboundFrame, NodeEvent, PlayerState, Ready};
pub use outbound::{ConfigureResume, Identify, OutboundFrame, PlayerUpdate, VoicePayload};
pub use stats::{CpuStats, FrameStats, MemoryStats, StatsSnapshot};

/// Guild (tenant) identifier. One player per guild.
pub type GuildId = u64;

/// Voice/text channel identifier within a guild.
pub type ChannelId = u64;
