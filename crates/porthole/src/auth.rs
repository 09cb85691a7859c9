//! Authentication and token lifecycle.
//!
//! Device-code login against the external token service, short-lived
//! tunnel-token minting, port-allowlist registration, and the retry-once
//! policy for expired agent tokens.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use crate::config::AgentConfig;

/// Client name reported when starting a device-code login.
const CLIENT_NAME: &str = "porthole-cli";

#[derive(Debug, Error)]
pub enum AuthError {
    /// The token service rejected the agent token (401/403).
    #[error("Not authorized: agent token rejected")]
    Unauthorized,

    /// The device code expired before the operator approved it.
    #[error("Device code expired before approval")]
    CodeExpired,

    /// Any non-pending, non-success answer from the token service.
    #[error("Token service error: HTTP {status}")]
    Api { status: u16 },

    /// The automatic re-login after a token rejection failed.
    #[error("Re-login failed: {0}")]
    Relogin(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// `POST /api/device/code` response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCodeGrant {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub interval_seconds: u64,
    pub expires_in_seconds: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenGrant {
    access_token: String,
}

/// `POST /api/agent/tunnel-token` response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelGrant {
    pub token: String,
    #[serde(default)]
    pub subdomain: Option<String>,
    /// WebSocket URL the edge wants this tunnel on, when it differs from the
    /// default derived from the server URL.
    #[serde(default)]
    pub connect: Option<String>,
}

/// HTTP client for the external token service.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    server_url: String,
}

impl ApiClient {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            server_url: server_url.into(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.server_url.trim_end_matches('/'), path)
    }

    pub async fn request_device_code(&self) -> Result<DeviceCodeGrant, AuthError> {
        let response = self
            .http
            .post(self.endpoint("/api/device/code"))
            .json(&json!({ "clientName": CLIENT_NAME }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AuthError::Api {
                status: response.status().as_u16(),
            });
        }
        Ok(response.json().await?)
    }

    /// One poll of the token endpoint. `Ok(None)` means the operator has not
    /// acted yet (HTTP 428) and polling should continue; any other non-200
    /// status is fatal.
    pub async fn poll_device_token(&self, device_code: &str) -> Result<Option<String>, AuthError> {
        let response = self
            .http
            .post(self.endpoint("/api/device/token"))
            .json(&json!({ "deviceCode": device_code }))
            .send()
            .await?;

        match response.status().as_u16() {
            200 => {
                let grant: TokenGrant = response.json().await?;
                Ok(Some(grant.access_token))
            }
            428 => Ok(None),
            status => Err(AuthError::Api { status }),
        }
    }

    /// Mint a short-lived tunnel token for one workspace.
    pub async fn mint_tunnel_token(
        &self,
        agent_token: &str,
        workspace_id: &str,
    ) -> Result<TunnelGrant, AuthError> {
        let response = self
            .http
            .post(self.endpoint("/api/agent/tunnel-token"))
            .bearer_auth(agent_token)
            .json(&json!({ "workspaceId": workspace_id }))
            .send()
            .await?;

        match response.status().as_u16() {
            401 | 403 => Err(AuthError::Unauthorized),
            status if !(200..300).contains(&status) => Err(AuthError::Api { status }),
            _ => Ok(response.json().await?),
        }
    }

    /// Update the workspace's exposed-port allowlist.
    pub async fn register_ports(
        &self,
        agent_token: &str,
        workspace_id: &str,
        local_port: u16,
        exposed_ports: &BTreeMap<String, u16>,
    ) -> Result<(), AuthError> {
        let response = self
            .http
            .post(self.endpoint("/api/agent/workspace-ports"))
            .bearer_auth(agent_token)
            .json(&json!({
                "workspaceId": workspace_id,
                "localPort": local_port,
                "exposedPorts": exposed_ports,
            }))
            .send()
            .await?;

        match response.status().as_u16() {
            401 | 403 => Err(AuthError::Unauthorized),
            status if !(200..300).contains(&status) => Err(AuthError::Api { status }),
            _ => Ok(()),
        }
    }
}

/// Run the full device-code flow: show the operator the verification URL and
/// user code, then poll at the server-specified interval until a token is
/// issued, the code expires, or a non-pending error occurs.
pub async fn device_code_login(api: &ApiClient) -> Result<String, AuthError> {
    let grant = api.request_device_code().await?;

    println!();
    println!("  To authorize this agent, open:");
    println!();
    println!("      {}", grant.verification_uri);
    println!();
    println!("  and enter the code: {}", grant.user_code);
    println!();

    let interval = Duration::from_secs(grant.interval_seconds);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(grant.expires_in_seconds);

    loop {
        tokio::time::sleep(interval).await;
        if tokio::time::Instant::now() >= deadline {
            return Err(AuthError::CodeExpired);
        }
        // A pending poll is not an error; anything else fatal propagates.
        if let Some(token) = api.poll_device_token(&grant.device_code).await? {
            return Ok(token);
        }
        tracing::debug!("Device code still pending approval");
    }
}

/// Log in via device code and persist the result as the sole durable config.
pub async fn login(server_url: &str) -> anyhow::Result<AgentConfig> {
    let api = ApiClient::new(server_url);
    let token = device_code_login(&api).await?;

    let config = AgentConfig::new(server_url, token);
    config.save_default()?;
    Ok(config)
}

/// Run an authenticated call with at most one automatic re-login.
///
/// The first `Unauthorized` result triggers `refresh` (expected to perform a
/// re-login and return the new token) and one retry of `call` with the
/// refreshed token. A second rejection, or any other error, propagates
/// unchanged. Bounded by construction: `refresh` is consumed on first use.
pub async fn with_auth_retry<T, C, Fut, R, RFut>(
    token: &mut String,
    mut call: C,
    refresh: R,
) -> Result<T, AuthError>
where
    C: FnMut(String) -> Fut,
    Fut: Future<Output = Result<T, AuthError>>,
    R: FnOnce() -> RFut,
    RFut: Future<Output = Result<String, AuthError>>,
{
    let mut refresh = Some(refresh);
    loop {
        match call(token.clone()).await {
            Err(AuthError::Unauthorized) => match refresh.take() {
                Some(refresh) => *token = refresh().await?,
                None => return Err(AuthError::Unauthorized),
            },
            other => return other,
        }
    }
}
