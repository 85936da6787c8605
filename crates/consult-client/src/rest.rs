//! REST surface of the backend: chat history and TURN credentials.
//! Both are behind traits so the session managers can be driven by
//! in-memory doubles in tests.

use async_trait::async_trait;
use serde::Deserialize;
use url::Url;
use webrtc::ice_transport::ice_server::RTCIceServer;

use consult_proto::ChatMessage;

use crate::error::{SessionError, SessionResult};

/// One ICE server entry as the backend returns it.
#[derive(Debug, Clone, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn to_rtc(&self) -> RTCIceServer {
        RTCIceServer {
            urls: self.urls.clone(),
            username: self.username.clone().unwrap_or_default(),
            credential: self.credential.clone().unwrap_or_default(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Deserialize)]
struct IceServersResponse {
    #[serde(rename = "iceServers")]
    ice_servers: Vec<IceServerConfig>,
}

#[async_trait]
pub trait ChatHistory: Send + Sync {
    async fn chat_messages(&self, consultation_id: i64) -> SessionResult<Vec<ChatMessage>>;
}

#[async_trait]
pub trait IceServerSource: Send + Sync {
    async fn ice_servers(&self) -> SessionResult<Vec<IceServerConfig>>;
}

/// Thin client over the backend's consultation endpoints.
pub struct RestApi {
    http: reqwest::Client,
    base: Url,
}

impl RestApi {
    pub fn new(base: Url) -> Self {
        Self {
            http: reqwest::Client::new(),
            base,
        }
    }

    fn endpoint(&self, path: &str) -> Url {
        let mut url = self.base.clone();
        url.set_path(path);
        url
    }
}

#[async_trait]
impl ChatHistory for RestApi {
    async fn chat_messages(&self, consultation_id: i64) -> SessionResult<Vec<ChatMessage>> {
        let url = self.endpoint(&format!("consultations/get_chat_messages/{consultation_id}"));
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(to_http_error)?
            .error_for_status()
            .map_err(to_http_error)?;
        response.json().await.map_err(to_http_error)
    }
}

#[async_trait]
impl IceServerSource for RestApi {
    async fn ice_servers(&self) -> SessionResult<Vec<IceServerConfig>> {
        let url = self.endpoint("consultations/turn-credentials");
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(to_http_error)?
            .error_for_status()
            .map_err(to_http_error)?;
        let body: IceServersResponse = response.json().await.map_err(to_http_error)?;
        Ok(body.ice_servers)
    }
}

fn to_http_error(err: reqwest::Error) -> SessionError {
    SessionError::Http(err.to_string())
}

/// Fallback used when the TURN credential fetch fails; a call over
/// plain STUN still connects on most networks.
pub fn default_stun_servers() -> Vec<IceServerConfig> {
    vec![IceServerConfig {
        urls: vec![
            "stun:stun.l.google.com:19302".to_string(),
            "stun:stun1.l.google.com:19302".to_string(),
        ],
        username: None,
        credential: None,
    }]
}
