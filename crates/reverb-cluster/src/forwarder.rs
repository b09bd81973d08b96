//! Voice credential correlation and forwarding.
//!
//! Two gateway event streams arrive independently and in unspecified
//! relative order: the *server* fragment (token + endpoint) and the
//! *state* fragment (session id + occupied channel). A guild's session is
//! usable only once both are present, so the forwarder joins them here,
//! atomically per guild, and pushes the completed credential to the
//! player's assigned node at exactly that moment. Completeness decides
//! when forwarding happens, never arrival order.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use reverb_common::protocol::{ChannelId, GuildId, VoicePayload};
use reverb_common::{Result, ReverbError};

use crate::events::{ClusterEvent, VoiceGatewayRequest};
use crate::registry::ClusterRegistry;

/// "Server" gateway event: authentication for the guild's voice server.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VoiceServerUpdate {
    pub guild_id: GuildId,
    pub token: String,
    pub endpoint: String,
}

/// "State" gateway event: where the client sits in the guild. An absent
/// `channel_id` is a definitive departure.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VoiceStateUpdate {
    pub guild_id: GuildId,
    pub session_id: String,
    #[serde(default)]
    pub channel_id: Option<ChannelId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ServerFragment {
    token: String,
    endpoint: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct StateFragment {
    session_id: String,
    channel_id: ChannelId,
}

/// Per-guild credential assembly state.
///
/// Both fragments are independently settable and independently missing.
/// The `forwarded` flag gives exactly-once forwarding per distinct
/// complete pair: any fragment *change* clears it, a byte-identical
/// repeat does not.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VoiceCredentialState {
    server: Option<ServerFragment>,
    state: Option<StateFragment>,
    forwarded: bool,
    last_forwarded_node: Option<String>,
}

impl VoiceCredentialState {
    /// Returns whether the fragment actually changed.
    fn set_server(&mut self, token: String, endpoint: String) -> bool {
        let fragment = ServerFragment { token, endpoint };
        if self.server.as_ref() == Some(&fragment) {
            return false;
        }
        self.server = Some(fragment);
        self.forwarded = false;
        true
    }

    /// Returns whether the fragment actually changed.
    fn set_state(&mut self, session_id: String, channel_id: ChannelId) -> bool {
        let fragment = StateFragment {
            session_id,
            channel_id,
        };
        if self.state.as_ref() == Some(&fragment) {
            return false;
        }
        self.state = Some(fragment);
        self.forwarded = false;
        true
    }

    pub fn is_complete(&self) -> bool {
        self.server.is_some() && self.state.is_some()
    }

    /// The assembled credential, constructible only from a complete state.
    pub fn complete(&self) -> Option<VoiceCredentials> {
        let server = self.server.as_ref()?;
        let state = self.state.as_ref()?;
        Some(VoiceCredentials {
            token: server.token.clone(),
            endpoint: server.endpoint.clone(),
            session_id: state.session_id.clone(),
            channel_id: state.channel_id,
        })
    }
}

/// A complete, immutable voice credential. Existence of a value of this
/// type is the proof both fragments were present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceCredentials {
    pub token: String,
    pub endpoint: String,
    pub session_id: String,
    pub channel_id: ChannelId,
}

impl VoiceCredentials {
    pub fn payload(&self) -> VoicePayload {
        VoicePayload {
            token: self.token.clone(),
            endpoint: self.endpoint.clone(),
            session_id: self.session_id.clone(),
        }
    }
}

pub struct SessionForwarder {
    registry: ClusterRegistry,
    event_tx: mpsc::UnboundedSender<ClusterEvent>,
    /// Caller-supplied sink for outbound gateway payloads. The core only
    /// constructs them; it never owns the gateway transport.
    gateway_tx: mpsc::UnboundedSender<VoiceGatewayRequest>,
    credentials: Mutex<HashMap<GuildId, Arc<Mutex<VoiceCredentialState>>>>,
}

impl SessionForwarder {
    pub fn new(
        registry: ClusterRegistry,
        gateway_tx: mpsc::UnboundedSender<VoiceGatewayRequest>,
    ) -> Self {
        let event_tx = registry.event_sender();
        Self {
            registry,
            event_tx,
            gateway_tx,
            credentials: Mutex::new(HashMap::new()),
        }
    }

    /// Requests joining a voice channel, creating the guild's player on
    /// the best node first if this is the guild's first use. Returns the
    /// assigned node's name.
    pub async fn join(&self, guild_id: GuildId, channel_id: ChannelId) -> Result<String> {
        let node = if self.registry.player(guild_id).await.is_none() {
            self.registry.create_player(guild_id).await?
        } else if let Some(node) = self.registry.player_node(guild_id).await {
            node
        } else {
            // Player exists but was orphaned; pick it a new home.
            self.registry.move_player(guild_id, &[]).await?
        };

        self.gateway_tx
            .send(VoiceGatewayRequest::join(guild_id, channel_id))
            .map_err(|_| ReverbError::SinkClosed("voice gateway"))?;
        Ok(node)
    }

    /// Requests leaving the guild's voice channel. Teardown itself happens
    /// when the resulting empty-channel state event comes back.
    pub async fn leave(&self, guild_id: GuildId) -> Result<()> {
        self.gateway_tx
            .send(VoiceGatewayRequest::leave(guild_id))
            .map_err(|_| ReverbError::SinkClosed("voice gateway"))
    }

    /// Ingests a "server" gateway event.
    pub async fn voice_server_update(&self, update: VoiceServerUpdate) -> Result<()> {
        let guild_id = update.guild_id;
        let cell = self.cell(guild_id).await;
        let mut state = cell.lock().await;

        if state.set_server(update.token, update.endpoint) {
            debug!(guild = guild_id, "voice server fragment updated");
        }
        self.try_forward(guild_id, &mut state).await
    }

    /// Ingests a "state" gateway event. An empty channel is a definitive
    /// departure: credential state is cleared, the session torn down, and
    /// nothing forwarded.
    pub async fn voice_state_update(&self, update: VoiceStateUpdate) -> Result<()> {
        let guild_id = update.guild_id;

        let Some(channel_id) = update.channel_id else {
            info!(guild = guild_id, "left voice channel, tearing session down");
            self.credentials.lock().await.remove(&guild_id);
            return match self.registry.destroy_player(guild_id).await {
                Ok(()) | Err(ReverbError::NoSuchPlayer(_)) => Ok(()),
                Err(err) => Err(err),
            };
        };

        let cell = self.cell(guild_id).await;
        let mut state = cell.lock().await;

        if state.set_state(update.session_id, channel_id) {
            debug!(guild = guild_id, channel = channel_id, "voice state fragment updated");
        }

        // Channel-move detection against the player's recorded channel,
        // reported before any forwarding happens.
        let previous = self
            .registry
            .with_player_mut(guild_id, |player| {
                let previous = player.voice_channel;
                player.voice_channel = Some(channel_id);
                previous
            })
            .await
            .flatten();
        if let Some(previous) = previous {
            if previous != channel_id {
                self.emit(ClusterEvent::PlayerChannelMoved {
                    guild_id,
                    from: Some(previous),
                    to: channel_id,
                });
            }
        }

        self.try_forward(guild_id, &mut state).await
    }

    /// Snapshot of a guild's pending credential state.
    pub async fn credential_state(&self, guild_id: GuildId) -> Option<VoiceCredentialState> {
        let cell = {
            let map = self.credentials.lock().await;
            map.get(&guild_id).cloned()
        };
        match cell {
            Some(cell) => Some(cell.lock().await.clone()),
            None => None,
        }
    }

    async fn cell(&self, guild_id: GuildId) -> Arc<Mutex<VoiceCredentialState>> {
        self.credentials
            .lock()
            .await
            .entry(guild_id)
            .or_default()
            .clone()
    }

    /// Forwards iff both fragments are present and this exact pair has not
    /// been forwarded yet. Called with the guild's credential lock held,
    /// so fragments can never be read torn and per-guild event order
    /// matches processing order.
    async fn try_forward(
        &self,
        guild_id: GuildId,
        state: &mut VoiceCredentialState,
    ) -> Result<()> {
        if state.forwarded {
            return Ok(());
        }
        let Some(credentials) = state.complete() else {
            // Still waiting for the other fragment.
            return Ok(());
        };

        let Some(node_name) = self.registry.player_node(guild_id).await else {
            warn!(
                guild = guild_id,
                "complete credential but no assigned node; waiting for reassignment"
            );
            return Err(ReverbError::NoSuchPlayer(guild_id));
        };
        let Some(node) = self.registry.node(&node_name).await else {
            warn!(guild = guild_id, node = %node_name, "assigned node is gone");
            return Err(ReverbError::NoSuchNode(node_name));
        };

        if let Some(previous) = state.last_forwarded_node.as_deref() {
            if previous != node_name {
                self.emit(ClusterEvent::PlayerReassigned {
                    guild_id,
                    from: Some(previous.to_string()),
                    to: node_name.clone(),
                });
            }
        }

        match node
            .update_player_voice_state(guild_id, credentials.payload())
            .await
        {
            Ok(()) => {
                state.forwarded = true;
                state.last_forwarded_node = Some(node_name.clone());
                info!(guild = guild_id, node = %node_name, "voice credential forwarded");
                self.emit(ClusterEvent::CredentialForwarded {
                    guild_id,
                    node: node_name,
                });
                Ok(())
            }
            Err(err) => {
                // Recoverable: the credential stays pending and the next
                // fragment update retries. The session is not ready.
                warn!(
                    guild = guild_id,
                    node = %node_name,
                    error = %err,
                    "credential forwarding failed"
                );
                self.emit(ClusterEvent::ForwardFailed {
                    guild_id,
                    node: node_name,
                });
                Err(err)
            }
        }
    }

    fn emit(&self, event: ClusterEvent) {
        let _ = self.event_tx.send(event);
    }
}
