//! Multi-node orchestration for audio-processing backend nodes.
//!
//! The core pieces, leaves first:
//!
//! - [`backoff`]: reconnect delay computation.
//! - [`node`]: one backend node's message stream + REST channel, with
//!   reconnection, resumption and per-guild command ordering.
//! - [`registry`]: the node set, penalty-based selection, stats
//!   aggregation and health probing.
//! - [`forwarder`]: joins the two voice-gateway credential fragments per
//!   guild and pushes completed credentials to the assigned node.
//!
//! Everything observable happens on the [`events::ClusterEvent`] stream
//! returned by [`registry::ClusterRegistry::new`]; there is no ambient
//! listener registration and no global state.

pub mod backoff;
pub mod events;
pub mod forwarder;
pub mod node;
pub mod penalty;
pub mod player;
pub mod registry;
pub mod rest;

pub use backoff::{BackoffConfig, BackoffPolicy};
pub use events::{ClusterEvent, VoiceGatewayRequest};
pub use forwarder::{
    SessionForwarder, VoiceCredentialState, VoiceCredentials, VoiceServerUpdate, VoiceStateUpdate,
};
pub use node::{ConnectionStatus, NodeConnection, NodeDescriptor};
pub use penalty::PenaltyWeights;
pub use player::Player;
pub use registry::{ClusterConfig, ClusterRegistry, ClusterStats, NodeHealth};
pub use rest::RestClient;
