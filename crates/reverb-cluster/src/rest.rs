use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};

use reverb_common::protocol::{GuildId, PlayerUpdate};
use reverb_common::{Result, ReverbError};

/// Default bound on any single REST call.
pub const DEFAULT_REST_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP command channel for one node.
///
/// Session mutation is request/response: player updates are `PATCH`ed,
/// destruction is `DELETE`d, and `GET /v1/info` doubles as the liveness
/// probe. Every call is bounded by the configured timeout and surfaces
/// `Timeout` instead of hanging.
#[derive(Debug)]
pub struct RestClient {
    base_url: String,
    authorization: String,
    timeout: Duration,
    client: Client<HttpConnector, Full<Bytes>>,
}

impl RestClient {
    pub fn new(base_url: impl Into<String>, authorization: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            authorization: authorization.into(),
            timeout: DEFAULT_REST_TIMEOUT,
            client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Applies a partial player update on the node.
    pub async fn update_player(
        &self,
        session_id: &str,
        guild_id: GuildId,
        update: &PlayerUpdate,
    ) -> Result<()> {
        let path = format!("/v1/sessions/{}/players/{}", session_id, guild_id);
        let body = serde_json::to_vec(update)?;
        self.request(Method::PATCH, &path, Some(body)).await?;
        Ok(())
    }

    /// Destroys the player on the node.
    pub async fn destroy_player(&self, session_id: &str, guild_id: GuildId) -> Result<()> {
        let path = format!("/v1/sessions/{}/players/{}", session_id, guild_id);
        self.request(Method::DELETE, &path, None).await?;
        Ok(())
    }

    /// Resolves a track identifier into the node's load result. The raw
    /// protocol call only; what to do with the result is the caller's
    /// business.
    pub async fn load_tracks(&self, identifier: &str) -> Result<serde_json::Value> {
        let encoded = utf8_percent_encode(identifier, NON_ALPHANUMERIC);
        let path = format!("/v1/loadtracks?identifier={}", encoded);
        let body = self.request(Method::GET, &path, None).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Lightweight reachability probe, independent of cached stats.
    pub async fn info(&self) -> Result<serde_json::Value> {
        let body = self.request(Method::GET, "/v1/info", None).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn request(&self, method: Method, path: &str, body: Option<Vec<u8>>) -> Result<Bytes> {
        let url = format!("{}{}", self.base_url, path);

        let mut builder = Request::builder()
            .method(method.clone())
            .uri(&url)
            .header("Authorization", &self.authorization);
        if body.is_some() {
            builder = builder.header("Content-Type", "application/json");
        }
        let request = builder
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(|e| ReverbError::Http(format!("Failed to build request: {}", e)))?;

        let response = tokio::time::timeout(self.timeout, self.client.request(request))
            .await
            .map_err(|_| ReverbError::Timeout(self.timeout.as_millis() as u64))?
            .map_err(|e| ReverbError::Http(format!("{} {} failed: {}", method, url, e)))?;

        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| ReverbError::Http(format!("Failed to read response body: {}", e)))?
            .to_bytes();

        if !status.is_success() {
            return Err(ReverbError::Http(format!(
                "{} {} returned status {}",
                method, url, status
            )));
        }

        Ok(bytes)
    }
}
