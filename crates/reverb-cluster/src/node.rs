//! Per-node connection ownership.
//!
//! A [`NodeConnection`] owns one backend node's message stream plus its
//! REST command channel. The stream is driven by a supervisor task:
//! connect, identify, then read until the connection drops, reconnecting
//! with backoff until told to stop or the attempt budget runs out.
//!
//! Status transitions:
//!
//! ```text
//! Disconnected → Connecting → HandshakeWait → Connected
//!                    ↑                            │ unexpected close
//!                    └──────── Reconnecting ←─────┘
//!                                   │ attempts exhausted
//!                                 Closed   (also: explicit disconnect)
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use reverb_common::protocol::{
    ConfigureResume, GuildId, Identify, InboundFrame, NodeEvent, OutboundFrame, PlayerState,
    PlayerUpdate, Ready, StatsSnapshot, VoicePayload,
};
use reverb_common::transport::{FrameCodec, NodeTransport};
use reverb_common::{Result, ReverbError};

use crate::backoff::{BackoffConfig, BackoffPolicy};
use crate::rest::RestClient;

/// Bound on the identify/ready exchange.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Identity and connection parameters for one backend node. Immutable
/// after construction; owned by exactly one [`NodeConnection`].
#[derive(Debug, Clone)]
pub struct NodeDescriptor {
    pub name: String,
    pub host: String,
    /// Message-stream port.
    pub port: u16,
    /// REST port, when the node serves its HTTP surface separately.
    /// Defaults to `port`.
    pub rest_port: Option<u16>,
    pub password: String,
    /// Whether the REST surface sits behind TLS. Selects the URL scheme;
    /// TLS for the message stream terminates in front of the node.
    pub secure: bool,
    /// Key offered to the node to resume the previous session after a
    /// short reconnect.
    pub resume_key: Option<String>,
    /// How long the node is asked to retain a dropped session, and how
    /// long this client considers its own key worth offering.
    pub resume_timeout: Duration,
}

impl NodeDescriptor {
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        password: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            rest_port: None,
            password: password.into(),
            secure: false,
            resume_key: None,
            resume_timeout: Duration::from_secs(60),
        }
    }

    pub fn stream_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn rest_base(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!(
            "{}://{}:{}",
            scheme,
            self.host,
            self.rest_port.unwrap_or(self.port)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    HandshakeWait,
    Connected,
    Reconnecting,
    Closed,
}

/// Internal lifecycle signals consumed by the registry's pump task.
#[derive(Debug)]
pub(crate) enum NodeSignal {
    Connected { node: String, resumed: bool },
    Disconnected { node: String },
    Reconnecting { node: String, attempt: u32 },
    Lost { node: String },
    Stats { node: String, stats: StatsSnapshot },
    PlayerState { node: String, state: PlayerState },
    Event { node: String, event: NodeEvent },
}

/// Mutable connection state, owned exclusively by the connection.
#[derive(Debug)]
struct NodeState {
    status: ConnectionStatus,
    /// Replaced wholesale on every stats frame.
    stats: Option<StatsSnapshot>,
    /// Backend-assigned session id; present only while connected or
    /// within the resume window.
    session_id: Option<String>,
    disconnected_at: Option<Instant>,
}

enum ReadOutcome {
    Shutdown,
    ConnectionLost(ReverbError),
}

#[derive(Debug)]
pub struct NodeConnection {
    descriptor: NodeDescriptor,
    user_id: String,
    backoff_config: BackoffConfig,
    state: RwLock<NodeState>,
    rest: RestClient,
    signal_tx: mpsc::UnboundedSender<NodeSignal>,
    shutdown_tx: watch::Sender<bool>,
    /// One lock per guild: commands for the same guild are serialized,
    /// different guilds dispatch concurrently.
    guild_locks: Mutex<HashMap<GuildId, Arc<Mutex<()>>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl NodeConnection {
    pub(crate) fn new(
        descriptor: NodeDescriptor,
        user_id: String,
        backoff_config: BackoffConfig,
        rest_timeout: Duration,
        signal_tx: mpsc::UnboundedSender<NodeSignal>,
    ) -> Arc<Self> {
        let rest = RestClient::new(descriptor.rest_base(), descriptor.password.clone())
            .with_timeout(rest_timeout);
        let (shutdown_tx, _) = watch::channel(false);

        Arc::new(Self {
            descriptor,
            user_id,
            backoff_config,
            state: RwLock::new(NodeState {
                status: ConnectionStatus::Disconnected,
                stats: None,
                session_id: None,
                disconnected_at: None,
            }),
            rest,
            signal_tx,
            shutdown_tx,
            guild_locks: Mutex::new(HashMap::new()),
            supervisor: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &NodeDescriptor {
        &self.descriptor
    }

    pub async fn status(&self) -> ConnectionStatus {
        self.state.read().await.status
    }

    /// Last stats snapshot, if the node has reported one this connection.
    pub async fn stats(&self) -> Option<StatsSnapshot> {
        self.state.read().await.stats.clone()
    }

    pub async fn session_id(&self) -> Option<String> {
        self.state.read().await.session_id.clone()
    }

    pub(crate) fn rest(&self) -> &RestClient {
        &self.rest
    }

    /// Starts the supervisor task. Idempotent: a no-op while a connection
    /// attempt is in flight or established, and refused once closed.
    /// Transport failures do not surface here; they feed the reconnection
    /// path.
    pub async fn connect(self: &Arc<Self>) {
        {
            let mut st = self.state.write().await;
            match st.status {
                ConnectionStatus::Connecting
                | ConnectionStatus::HandshakeWait
                | ConnectionStatus::Connected
                | ConnectionStatus::Reconnecting => {
                    debug!(node = %self.descriptor.name, "connect: already active");
                    return;
                }
                ConnectionStatus::Closed => {
                    warn!(node = %self.descriptor.name, "connect: node is closed");
                    return;
                }
                ConnectionStatus::Disconnected => {}
            }
            st.status = ConnectionStatus::Connecting;
        }

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.run().await });
        *self.supervisor.lock().await = Some(handle);
    }

    /// Moves to `Closed`, releases the session and resume window, and
    /// preempts any pending reconnect sleep or in-flight handshake.
    pub async fn disconnect(&self, reason: &str) {
        info!(node = %self.descriptor.name, reason, "disconnecting");
        {
            let mut st = self.state.write().await;
            st.status = ConnectionStatus::Closed;
            st.session_id = None;
            st.disconnected_at = None;
        }
        let _ = self.shutdown_tx.send(true);

        let handle = self.supervisor.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Dispatches a player command over the REST channel.
    ///
    /// Commands for the same guild are never reordered relative to each
    /// other; commands for different guilds may interleave.
    pub async fn send(&self, guild_id: GuildId, update: PlayerUpdate) -> Result<()> {
        let session_id = self.connected_session().await?;

        let lock = self.guild_lock(guild_id).await;
        let _guard = lock.lock().await;
        self.rest.update_player(&session_id, guild_id, &update).await
    }

    /// Pushes a complete voice credential to the node. The forwarder's
    /// entry point.
    pub async fn update_player_voice_state(
        &self,
        guild_id: GuildId,
        voice: VoicePayload,
    ) -> Result<()> {
        self.send(guild_id, PlayerUpdate::new().voice(voice)).await
    }

    /// Destroys the guild's player on the node.
    pub async fn destroy_player(&self, guild_id: GuildId) -> Result<()> {
        let session_id = self.connected_session().await?;

        let lock = self.guild_lock(guild_id).await;
        {
            let _guard = lock.lock().await;
            self.rest.destroy_player(&session_id, guild_id).await?;
        }
        self.guild_locks.lock().await.remove(&guild_id);
        Ok(())
    }

    /// Resolves a track identifier through the node.
    pub async fn load_tracks(&self, identifier: &str) -> Result<serde_json::Value> {
        // Requires a live session only in spirit; the REST surface answers
        // regardless, but refusing early keeps errors consistent.
        self.connected_session().await?;
        self.rest.load_tracks(identifier).await
    }

    async fn connected_session(&self) -> Result<String> {
        let st = self.state.read().await;
        if st.status != ConnectionStatus::Connected {
            return Err(ReverbError::NotConnected(self.descriptor.name.clone()));
        }
        st.session_id
            .clone()
            .ok_or_else(|| ReverbError::NotConnected(self.descriptor.name.clone()))
    }

    async fn guild_lock(&self, guild_id: GuildId) -> Arc<Mutex<()>> {
        self.guild_locks
            .lock()
            .await
            .entry(guild_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn signal(&self, signal: NodeSignal) {
        // The receiving registry may already be gone during teardown.
        let _ = self.signal_tx.send(signal);
    }

    async fn run(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut backoff = BackoffPolicy::new(self.backoff_config.clone());

        loop {
            if *shutdown_rx.borrow() {
                self.finalize_closed().await;
                return;
            }

            match self.establish(&mut shutdown_rx).await {
                Ok(Some((mut stream, ready))) => {
                    backoff.reset();
                    {
                        let mut st = self.state.write().await;
                        st.status = ConnectionStatus::Connected;
                        st.session_id = Some(ready.session_id.clone());
                        st.disconnected_at = None;
                    }
                    info!(
                        node = %self.descriptor.name,
                        session = %ready.session_id,
                        resumed = ready.resumed,
                        "node connected"
                    );
                    self.signal(NodeSignal::Connected {
                        node: self.descriptor.name.clone(),
                        resumed: ready.resumed,
                    });

                    self.arm_resumption(&mut stream).await;

                    match self.read_loop(&mut stream, &mut shutdown_rx).await {
                        ReadOutcome::Shutdown => {
                            self.finalize_closed().await;
                            return;
                        }
                        ReadOutcome::ConnectionLost(err) => {
                            warn!(
                                node = %self.descriptor.name,
                                error = %err,
                                "stream closed unexpectedly"
                            );
                            {
                                let mut st = self.state.write().await;
                                st.status = ConnectionStatus::Reconnecting;
                                st.disconnected_at = Some(Instant::now());
                                // session_id is retained while the resume
                                // window is open
                            }
                            self.signal(NodeSignal::Disconnected {
                                node: self.descriptor.name.clone(),
                            });
                        }
                    }
                }
                Ok(None) => {
                    self.finalize_closed().await;
                    return;
                }
                Err(err) => {
                    debug!(
                        node = %self.descriptor.name,
                        error = %err,
                        "connection attempt failed"
                    );
                    self.state.write().await.status = ConnectionStatus::Reconnecting;
                }
            }

            match backoff.next() {
                Some(delay) => {
                    self.signal(NodeSignal::Reconnecting {
                        node: self.descriptor.name.clone(),
                        attempt: backoff.attempts(),
                    });
                    debug!(
                        node = %self.descriptor.name,
                        delay_ms = delay.as_millis() as u64,
                        attempt = backoff.attempts(),
                        "reconnect scheduled"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {
                            self.state.write().await.status = ConnectionStatus::Connecting;
                        }
                        _ = shutdown_rx.changed() => {
                            self.finalize_closed().await;
                            return;
                        }
                    }
                }
                None => {
                    {
                        let mut st = self.state.write().await;
                        st.status = ConnectionStatus::Closed;
                        st.session_id = None;
                    }
                    warn!(node = %self.descriptor.name, "reconnect attempts exhausted, giving up");
                    self.signal(NodeSignal::Lost {
                        node: self.descriptor.name.clone(),
                    });
                    return;
                }
            }
        }
    }

    /// Transport connect plus the identify/ready handshake. `Ok(None)`
    /// means shutdown preempted the attempt. A handshake failure tears the
    /// connection down and feeds the reconnection path.
    async fn establish(
        &self,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<Option<(TcpStream, Ready)>> {
        let addr = self.descriptor.stream_addr();
        let mut stream = tokio::select! {
            result = NodeTransport::connect(&addr) => result?,
            _ = shutdown_rx.changed() => return Ok(None),
        };

        self.state.write().await.status = ConnectionStatus::HandshakeWait;

        let identify = self.identify_frame().await;
        let requesting_resume = identify.resume_key.is_some();
        NodeTransport::send_frame(&mut stream, &OutboundFrame::Identify(identify)).await?;
        trace!(
            node = %self.descriptor.name,
            resume = requesting_resume,
            "identify sent"
        );

        let frame = tokio::select! {
            result = tokio::time::timeout(
                HANDSHAKE_TIMEOUT,
                NodeTransport::read_frame(&mut stream),
            ) => {
                result.map_err(|_| {
                    ReverbError::Transport("handshake timed out".to_string())
                })??
            }
            _ = shutdown_rx.changed() => return Ok(None),
        };

        match frame {
            InboundFrame::Ready(ready) => Ok(Some((stream, ready))),
            other => Err(ReverbError::Protocol(format!(
                "expected ready during handshake, got {:?}",
                other
            ))),
        }
    }

    async fn identify_frame(&self) -> Identify {
        let st = self.state.read().await;
        let within_window = st
            .disconnected_at
            .map(|at| at.elapsed() <= self.descriptor.resume_timeout)
            .unwrap_or(false);
        let resuming =
            st.session_id.is_some() && within_window && self.descriptor.resume_key.is_some();

        Identify {
            authorization: self.descriptor.password.clone(),
            user_id: self.user_id.clone(),
            client_name: format!("reverb/{}", env!("CARGO_PKG_VERSION")),
            resume_key: if resuming {
                self.descriptor.resume_key.clone()
            } else {
                None
            },
            resume_timeout_ms: if resuming {
                Some(self.descriptor.resume_timeout.as_millis() as u64)
            } else {
                None
            },
        }
    }

    /// Arms the resumption key for the next disconnect. Best-effort: a
    /// failure here costs resumability, not the connection.
    async fn arm_resumption(&self, stream: &mut TcpStream) {
        let Some(key) = &self.descriptor.resume_key else {
            return;
        };
        let frame = OutboundFrame::ConfigureResume(ConfigureResume {
            key: key.clone(),
            timeout_ms: self.descriptor.resume_timeout.as_millis() as u64,
        });
        if let Err(err) = NodeTransport::send_frame(stream, &frame).await {
            warn!(node = %self.descriptor.name, error = %err, "failed to arm resumption");
        }
    }

    async fn read_loop(
        &self,
        stream: &mut TcpStream,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> ReadOutcome {
        loop {
            let raw = tokio::select! {
                result = NodeTransport::read_message(stream) => match result {
                    Ok(raw) => raw,
                    Err(err) => return ReadOutcome::ConnectionLost(err),
                },
                _ = shutdown_rx.changed() => return ReadOutcome::Shutdown,
            };

            // Malformed payloads are logged and dropped, never fatal.
            match FrameCodec::decode(&raw) {
                Ok(frame) => self.handle_frame(frame).await,
                Err(err) => {
                    warn!(
                        node = %self.descriptor.name,
                        error = %err,
                        "dropping malformed frame"
                    );
                }
            }
        }
    }

    async fn handle_frame(&self, frame: InboundFrame) {
        match frame {
            InboundFrame::Ready(_) => {
                debug!(node = %self.descriptor.name, "ignoring ready frame outside handshake");
            }
            InboundFrame::Stats(stats) => {
                trace!(
                    node = %self.descriptor.name,
                    players = stats.players,
                    "stats snapshot replaced"
                );
                self.state.write().await.stats = Some(stats.clone());
                self.signal(NodeSignal::Stats {
                    node: self.descriptor.name.clone(),
                    stats,
                });
            }
            InboundFrame::PlayerUpdate(state) => {
                trace!(
                    node = %self.descriptor.name,
                    guild = state.guild_id,
                    position = state.position_ms,
                    "player position sync"
                );
                self.signal(NodeSignal::PlayerState {
                    node: self.descriptor.name.clone(),
                    state,
                });
            }
            InboundFrame::Event(event) => {
                debug!(
                    node = %self.descriptor.name,
                    guild = event.guild_id(),
                    "node event"
                );
                self.signal(NodeSignal::Event {
                    node: self.descriptor.name.clone(),
                    event,
                });
            }
        }
    }

    async fn finalize_closed(&self) {
        let mut st = self.state.write().await;
        st.status = ConnectionStatus::Closed;
        st.session_id = None;
    }

    #[cfg(test)]
    pub(crate) async fn force_status(&self, status: ConnectionStatus) {
        self.state.write().await.status = status;
    }

    #[cfg(test)]
    pub(crate) async fn force_stats(&self, stats: Option<StatsSnapshot>) {
        self.state.write().await.stats = stats;
    }

    #[cfg(test)]
    pub(crate) async fn force_session(&self, session_id: Option<String>) {
        self.state.write().await.session_id = session_id;
    }
}
