use serde::{Deserialize, Serialize};

/// Frames the client writes to a node's message stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OutboundFrame {
    Identify(Identify),
    ConfigureResume(ConfigureResume),
}

/// First frame after transport establishment. The node answers with
/// `ready`; anything else fails the handshake.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Identify {
    pub authorization: String,
    pub user_id: String,
    pub client_name: String,
    /// Present only when requesting resumption of a previous session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_timeout_ms: Option<u64>,
}

/// Arms (or re-arms) the resumption key the node should honor on the next
/// disconnect. Sent after every successful handshake.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigureResume {
    pub key: String,
    pub timeout_ms: u64,
}

/// Partial player mutation, the body of a REST player update.
///
/// Only the fields that are set are serialized and applied; the builder
/// returns a new value per call and carries no state beyond the fields
/// themselves.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlayerUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<VoicePayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoded_track: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_ms: Option<u64>,
}

impl PlayerUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn voice(mut self, voice: VoicePayload) -> Self {
        self.voice = Some(voice);
        self
    }

    pub fn encoded_track(mut self, track: impl Into<String>) -> Self {
        self.encoded_track = Some(track.into());
        self
    }

    pub fn paused(mut self, paused: bool) -> Self {
        self.paused = Some(paused);
        self
    }

    pub fn volume(mut self, volume: u16) -> Self {
        self.volume = Some(volume);
        self
    }

    pub fn position_ms(mut self, position_ms: u64) -> Self {
        self.position_ms = Some(position_ms);
        self
    }

    /// Whether the update would apply anything at all.
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// The complete voice credential as the node consumes it. Assembled by the
/// session forwarder once both gateway fragments are present.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VoicePayload {
    pub token: String,
    pub endpoint: String,
    pub session_id: String,
}
