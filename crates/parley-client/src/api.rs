//! REST client for the gateway's call endpoints.

use std::collections::HashMap;
use std::sync::Mutex;

use parley_common::{
    CallConfigResponse, CallStatusResponse, ErrorResponse, StartCallRequest, StartCallResponse,
};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway returned {status}: {message}")]
    Status { status: StatusCode, message: String },

    #[error("gateway request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid gateway url: {0}")]
    Url(#[from] url::ParseError),
}

impl GatewayError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            GatewayError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Builds the signaling WebSocket URL for `message_id` under `base`.
///
/// `http` maps to `ws` and `https` to `wss`; the token travels in the query
/// because browsers cannot set headers on a WebSocket handshake.
pub fn signal_url(base: &Url, message_id: i64, token: &str) -> Result<Url, GatewayError> {
    let mut url = base.join("/api/calls/signal")?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    };
    // http(s) and ws(s) are all special schemes, so the switch cannot fail.
    let _ = url.set_scheme(scheme);
    url.query_pairs_mut()
        .append_pair("messageId", &message_id.to_string())
        .append_pair("token", token);
    Ok(url)
}

pub struct GatewayClient {
    http: reqwest::Client,
    base: Url,
    token: String,
    config_cache: Mutex<HashMap<String, CallConfigResponse>>,
}

impl GatewayClient {
    pub fn new(base: &str, token: impl Into<String>) -> Result<Self, GatewayError> {
        Ok(Self {
            http: reqwest::Client::new(),
            base: Url::parse(base)?,
            token: token.into(),
            config_cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn signal_url(&self, message_id: i64) -> Result<Url, GatewayError> {
        signal_url(&self.base, message_id, &self.token)
    }

    pub async fn start_call(&self, conversation_id: i64) -> Result<StartCallResponse, GatewayError> {
        let response = self
            .http
            .post(self.base.join("/api/calls/start")?)
            .bearer_auth(&self.token)
            .json(&StartCallRequest { conversation_id })
            .send()
            .await?;
        decode(response).await
    }

    pub async fn call_status(&self, message_id: i64) -> Result<bool, GatewayError> {
        let response = self
            .http
            .get(self.base.join("/api/calls/status")?)
            .bearer_auth(&self.token)
            .query(&[("messageId", message_id)])
            .send()
            .await?;
        let status: CallStatusResponse = decode(response).await?;
        Ok(status.active)
    }

    /// Relay configuration for this token. Fetched once, then served from cache.
    pub async fn call_config(&self) -> Result<CallConfigResponse, GatewayError> {
        if let Some(config) = self.cached_config() {
            return Ok(config);
        }

        let response = self
            .http
            .get(self.base.join("/api/calls/config")?)
            .bearer_auth(&self.token)
            .send()
            .await?;
        let config: CallConfigResponse = decode(response).await?;

        self.config_cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(self.token.clone(), config.clone());
        Ok(config)
    }

    fn cached_config(&self) -> Option<CallConfigResponse> {
        self.config_cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&self.token)
            .cloned()
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, GatewayError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }
    let message = match response.json::<ErrorResponse>().await {
        Ok(body) => body.error,
        Err(_) => status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string(),
    };
    Err(GatewayError::Status { status, message })
}
