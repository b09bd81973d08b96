//! Cluster membership and node selection.
//!
//! The registry owns every [`NodeConnection`] plus the per-guild player
//! map, and is the only component that mutates either. Selection reads
//! cached state exclusively and never blocks on a node's I/O. A pump task
//! turns the internal signals emitted by node supervisors into the public
//! [`ClusterEvent`] stream, fanning out per-player reassignment
//! notifications when a node dies or comes back without its sessions.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use reverb_common::protocol::{GuildId, NodeEvent};
use reverb_common::{Result, ReverbError};

use crate::backoff::BackoffConfig;
use crate::events::ClusterEvent;
use crate::node::{ConnectionStatus, NodeConnection, NodeDescriptor, NodeSignal};
use crate::penalty::PenaltyWeights;
use crate::player::Player;
use crate::rest::DEFAULT_REST_TIMEOUT;

/// Cluster-wide configuration shared by every node connection.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Caller identity sent in every handshake.
    pub user_id: String,
    pub backoff: BackoffConfig,
    pub penalty: PenaltyWeights,
    pub rest_timeout: Duration,
    pub health_check_timeout: Duration,
}

impl ClusterConfig {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            backoff: BackoffConfig::default(),
            penalty: PenaltyWeights::default(),
            rest_timeout: DEFAULT_REST_TIMEOUT,
            health_check_timeout: Duration::from_secs(5),
        }
    }
}

/// Cluster totals summed from cached per-node snapshots.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ClusterStats {
    pub nodes: usize,
    pub connected_nodes: usize,
    pub players: u64,
    pub playing_players: u64,
    pub average_system_load: f64,
    pub memory_used: u64,
    pub memory_allocated: u64,
}

/// Result of one reachability probe. Independent of cached stats, so a
/// stale snapshot cannot mask a dead node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeHealth {
    pub node: String,
    pub healthy: bool,
}

#[derive(Clone)]
pub struct ClusterRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    config: ClusterConfig,
    /// Registration order doubles as the selection tie-break order.
    nodes: RwLock<Vec<Arc<NodeConnection>>>,
    players: RwLock<HashMap<GuildId, Player>>,
    event_tx: mpsc::UnboundedSender<ClusterEvent>,
    signal_tx: mpsc::UnboundedSender<NodeSignal>,
}

impl ClusterRegistry {
    /// Creates the registry and the event stream its consumers read.
    /// Spawns the node-signal pump.
    pub fn new(config: ClusterConfig) -> (Self, mpsc::UnboundedReceiver<ClusterEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(RegistryInner {
            config,
            nodes: RwLock::new(Vec::new()),
            players: RwLock::new(HashMap::new()),
            event_tx,
            signal_tx,
        });

        tokio::spawn(pump(Arc::downgrade(&inner), signal_rx));

        (Self { inner }, event_rx)
    }

    /// Registers a node and starts connecting it.
    pub async fn add_node(&self, descriptor: NodeDescriptor) -> Result<()> {
        let node = self.register(descriptor).await?;
        node.connect().await;
        Ok(())
    }

    async fn register(&self, descriptor: NodeDescriptor) -> Result<Arc<NodeConnection>> {
        let mut nodes = self.inner.nodes.write().await;
        if nodes.iter().any(|n| n.name() == descriptor.name) {
            return Err(ReverbError::NodeAlreadyExists(descriptor.name));
        }

        info!(node = %descriptor.name, addr = %descriptor.stream_addr(), "registering node");
        let node = NodeConnection::new(
            descriptor,
            self.inner.config.user_id.clone(),
            self.inner.config.backoff.clone(),
            self.inner.config.rest_timeout,
            self.inner.signal_tx.clone(),
        );
        nodes.push(Arc::clone(&node));
        Ok(node)
    }

    /// Disconnects and removes a node. Every player assigned to it gets a
    /// `ReassignmentRequired` event; none are dropped silently.
    pub async fn remove_node(&self, name: &str) -> Result<()> {
        let node = {
            let mut nodes = self.inner.nodes.write().await;
            let position = nodes
                .iter()
                .position(|n| n.name() == name)
                .ok_or_else(|| ReverbError::NoSuchNode(name.to_string()))?;
            nodes.remove(position)
        };

        node.disconnect("removed from registry").await;
        self.inner.orphan_players(name).await;
        info!(node = name, "node removed");
        Ok(())
    }

    pub async fn node(&self, name: &str) -> Option<Arc<NodeConnection>> {
        self.inner
            .nodes
            .read()
            .await
            .iter()
            .find(|n| n.name() == name)
            .cloned()
    }

    pub async fn node_count(&self) -> usize {
        self.inner.nodes.read().await.len()
    }

    /// The connected node with the lowest penalty score, skipping any
    /// names in `excluding`. Ties go to the earliest-registered node.
    /// Reads only cached status and stats.
    pub async fn select_node(&self, excluding: &[&str]) -> Result<Arc<NodeConnection>> {
        let nodes = self.inner.nodes.read().await;

        let mut best: Option<(u32, Arc<NodeConnection>)> = None;
        for node in nodes.iter() {
            if excluding.contains(&node.name()) {
                continue;
            }
            if node.status().await != ConnectionStatus::Connected {
                continue;
            }
            let penalty = match node.stats().await {
                Some(stats) => self.inner.config.penalty.score(&stats),
                // Connected but load unknown: selectable, ranked last.
                None => u32::MAX - 1,
            };
            // Strict less-than keeps the registration-order tie-break.
            if best.as_ref().map(|(b, _)| penalty < *b).unwrap_or(true) {
                best = Some((penalty, Arc::clone(node)));
            }
        }

        best.map(|(penalty, node)| {
            debug!(node = node.name(), penalty, "selected node");
            node
        })
        .ok_or(ReverbError::NoAvailableNode)
    }

    /// Cluster totals from cached snapshots.
    pub async fn get_stats(&self) -> ClusterStats {
        let nodes = self.inner.nodes.read().await;

        let mut totals = ClusterStats {
            nodes: nodes.len(),
            ..ClusterStats::default()
        };
        let mut load_total = 0.0;
        let mut load_samples = 0usize;

        for node in nodes.iter() {
            if node.status().await == ConnectionStatus::Connected {
                totals.connected_nodes += 1;
            }
            if let Some(snapshot) = node.stats().await {
                totals.players += snapshot.players;
                totals.playing_players += snapshot.playing_players;
                totals.memory_used += snapshot.memory.used;
                totals.memory_allocated += snapshot.memory.allocated;
                load_total += snapshot.cpu.system_load;
                load_samples += 1;
            }
        }

        if load_samples > 0 {
            totals.average_system_load = load_total / load_samples as f64;
        }
        totals
    }

    /// Probes every node's REST surface concurrently. A live probe, not a
    /// read of cached stats.
    pub async fn health_check(&self) -> Vec<NodeHealth> {
        let nodes: Vec<Arc<NodeConnection>> = self.inner.nodes.read().await.clone();
        let timeout = self.inner.config.health_check_timeout;

        let probes = nodes.into_iter().map(|node| async move {
            let healthy = tokio::time::timeout(timeout, node.rest().info())
                .await
                .map(|result| result.is_ok())
                .unwrap_or(false);
            NodeHealth {
                node: node.name().to_string(),
                healthy,
            }
        });

        futures::future::join_all(probes).await
    }

    /// Creates the guild's player on the best available node. Returns the
    /// chosen node's name.
    pub async fn create_player(&self, guild_id: GuildId) -> Result<String> {
        {
            let players = self.inner.players.read().await;
            if players.contains_key(&guild_id) {
                return Err(ReverbError::PlayerAlreadyExists(guild_id));
            }
        }

        let node = self.select_node(&[]).await?;

        {
            let mut players = self.inner.players.write().await;
            // Re-check: selection dropped the lock.
            if players.contains_key(&guild_id) {
                return Err(ReverbError::PlayerAlreadyExists(guild_id));
            }
            let mut player = Player::new(guild_id);
            player.assign_node(node.name());
            players.insert(guild_id, player);
        }

        self.inner.emit(ClusterEvent::PlayerCreated {
            guild_id,
            node: node.name().to_string(),
        });
        Ok(node.name().to_string())
    }

    /// Tears the guild's player down: destroys it on its node when
    /// reachable, removes the record, emits `PlayerDestroyed`.
    pub async fn destroy_player(&self, guild_id: GuildId) -> Result<()> {
        let player = self
            .inner
            .players
            .write()
            .await
            .remove(&guild_id)
            .ok_or(ReverbError::NoSuchPlayer(guild_id))?;

        if let Some(name) = player.node() {
            if let Some(node) = self.node(name).await {
                if let Err(err) = node.destroy_player(guild_id).await {
                    warn!(
                        guild = guild_id,
                        node = name,
                        error = %err,
                        "failed to destroy player on its node"
                    );
                }
            }
        }

        self.inner.emit(ClusterEvent::PlayerDestroyed { guild_id });
        Ok(())
    }

    /// Explicitly reassigns the guild's player to the best node outside
    /// `excluding`. Returns the new node's name.
    pub async fn move_player(&self, guild_id: GuildId, excluding: &[&str]) -> Result<String> {
        let target = self.select_node(excluding).await?;

        let previous = {
            let mut players = self.inner.players.write().await;
            let player = players
                .get_mut(&guild_id)
                .ok_or(ReverbError::NoSuchPlayer(guild_id))?;
            player.assign_node(target.name())
        };

        // Best-effort cleanup on the old node.
        if let Some(previous_name) = previous.as_deref() {
            if previous_name != target.name() {
                if let Some(old) = self.node(previous_name).await {
                    if let Err(err) = old.destroy_player(guild_id).await {
                        debug!(
                            guild = guild_id,
                            node = previous_name,
                            error = %err,
                            "old node did not confirm player teardown"
                        );
                    }
                }
            }
        }

        self.inner.emit(ClusterEvent::PlayerReassigned {
            guild_id,
            from: previous,
            to: target.name().to_string(),
        });
        Ok(target.name().to_string())
    }

    pub async fn player(&self, guild_id: GuildId) -> Option<Player> {
        self.inner.players.read().await.get(&guild_id).cloned()
    }

    pub async fn player_count(&self) -> usize {
        self.inner.players.read().await.len()
    }

    pub(crate) async fn player_node(&self, guild_id: GuildId) -> Option<String> {
        self.inner
            .players
            .read()
            .await
            .get(&guild_id)
            .and_then(|p| p.node().map(str::to_string))
    }

    pub(crate) async fn with_player_mut<F, R>(&self, guild_id: GuildId, f: F) -> Option<R>
    where
        F: FnOnce(&mut Player) -> R,
    {
        self.inner.players.write().await.get_mut(&guild_id).map(f)
    }

    pub(crate) fn event_sender(&self) -> mpsc::UnboundedSender<ClusterEvent> {
        self.inner.event_tx.clone()
    }

    #[cfg(test)]
    pub(crate) async fn register_for_test(
        &self,
        descriptor: NodeDescriptor,
    ) -> Arc<NodeConnection> {
        self.register(descriptor).await.unwrap()
    }

    #[cfg(test)]
    pub(crate) fn signal_sender_for_test(&self) -> mpsc::UnboundedSender<NodeSignal> {
        self.inner.signal_tx.clone()
    }
}

impl RegistryInner {
    fn emit(&self, event: ClusterEvent) {
        // A consumer that dropped the receiver forfeits events.
        let _ = self.event_tx.send(event);
    }

    /// Clears every player assigned to `node_name`, emitting exactly one
    /// `ReassignmentRequired` per player. Clearing the assignment is what
    /// makes a second pass for the same outage a no-op.
    async fn orphan_players(&self, node_name: &str) {
        let mut players = self.players.write().await;
        for player in players.values_mut() {
            if player.node() == Some(node_name) {
                player.clear_node();
                self.emit(ClusterEvent::ReassignmentRequired {
                    guild_id: player.guild_id,
                    node: node_name.to_string(),
                });
            }
        }
    }
}

/// Turns node supervisor signals into public events and keeps player
/// records in sync. Holds only a weak handle so a dropped registry shuts
/// the pump down.
async fn pump(inner: Weak<RegistryInner>, mut signal_rx: mpsc::UnboundedReceiver<NodeSignal>) {
    while let Some(signal) = signal_rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };

        match signal {
            NodeSignal::Connected { node, resumed } => {
                inner.emit(ClusterEvent::NodeConnected {
                    node: node.clone(),
                    resumed,
                });
                // A non-resumed handshake means the node forgot every
                // session it was carrying.
                if !resumed {
                    inner.orphan_players(&node).await;
                }
            }
            NodeSignal::Disconnected { node } => {
                inner.emit(ClusterEvent::NodeDisconnected { node });
            }
            NodeSignal::Reconnecting { node, attempt } => {
                inner.emit(ClusterEvent::NodeReconnecting { node, attempt });
            }
            NodeSignal::Lost { node } => {
                inner.emit(ClusterEvent::NodeLost { node: node.clone() });
                inner.orphan_players(&node).await;
            }
            NodeSignal::Stats { node, stats } => {
                inner.emit(ClusterEvent::NodeStats { node, stats });
            }
            NodeSignal::PlayerState { state, .. } => {
                let mut players = inner.players.write().await;
                if let Some(player) = players.get_mut(&state.guild_id) {
                    player.position_ms = state.position_ms;
                    player.time = state.time;
                }
            }
            NodeSignal::Event { event, .. } => {
                if let NodeEvent::TrackEnd { guild_id, .. } = &event {
                    let mut players = inner.players.write().await;
                    if let Some(player) = players.get_mut(guild_id) {
                        player.track = None;
                    }
                }
                inner.emit(map_node_event(event));
            }
        }
    }
}

fn map_node_event(event: NodeEvent) -> ClusterEvent {
    match event {
        NodeEvent::TrackStart { guild_id, track } => ClusterEvent::TrackStart { guild_id, track },
        NodeEvent::TrackEnd {
            guild_id,
            track,
            reason,
        } => ClusterEvent::TrackEnd {
            guild_id,
            track,
            reason,
        },
        NodeEvent::TrackException {
            guild_id,
            track,
            error,
        } => ClusterEvent::TrackException {
            guild_id,
            track,
            error,
        },
        NodeEvent::TrackStuck {
            guild_id,
            track,
            threshold_ms,
        } => ClusterEvent::TrackStuck {
            guild_id,
            track,
            threshold_ms,
        },
        NodeEvent::SocketClosed {
            guild_id,
            code,
            reason,
        } => ClusterEvent::PlayerSocketClosed {
            guild_id,
            code,
            reason,
        },
    }
}
