//! Authenticated HTTP client for the hosted backend
//!
//! Wraps reqwest::Client with the project `apikey` header and the session
//! bearer token, and refreshes an expired session on construction.

use anyhow::{bail, Context};
use url::Url;

use super::gateway::GatewayError;
use crate::auth::TokenStore;
use crate::config::Config;

const REST_PREFIX: &str = "/rest/v1";
const STORAGE_PREFIX: &str = "/storage/v1";
const REALTIME_PATH: &str = "/realtime/v1/websocket";

/// Authenticated client for the REST, RPC and storage endpoints.
#[derive(Clone)]
pub struct BaasClient {
    http: reqwest::Client,
    base_url: String,
    anon_key: String,
    access_token: String,
    user_id: String,
}

impl BaasClient {
    /// Load config and build client. Attempts a session refresh if the token is expired.
    pub async fn new() -> anyhow::Result<Self> {
        let mut config = Config::load()?;

        let needs_refresh = config.get_access_token().map_or(true, |t| t.is_expired());
        if needs_refresh {
            if config.get_refresh_token().is_some() {
                tracing::info!("Session missing or expired, refreshing...");
                match crate::auth::refresh().await {
                    Ok(true) => {
                        config = Config::load()?;
                        tracing::info!("Session refreshed");
                    }
                    Ok(false) => {
                        bail!("No refresh token available. Run 'daremex login'.");
                    }
                    Err(e) => {
                        bail!("Session refresh failed: {:#}. Run 'daremex login'.", e);
                    }
                }
            } else {
                bail!("Session expired and no refresh token. Run 'daremex login'.");
            }
        }

        let token = config
            .get_access_token()
            .context("No session token. Run 'daremex login' first.")?;

        Ok(Self::from_parts(
            reqwest::Client::new(),
            &config.project_url()?,
            &config.anon_key()?,
            &token.token,
            &config.user_id()?,
        ))
    }

    /// Build a client from explicit credentials.
    pub fn from_parts(
        http: reqwest::Client,
        base_url: &str,
        anon_key: &str,
        access_token: &str,
        user_id: &str,
    ) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            anon_key: anon_key.to_string(),
            access_token: access_token.to_string(),
            user_id: user_id.to_string(),
        }
    }

    /// Id of the signed-in user this client acts as.
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    /// URL of a relation (or `rpc/<fn>`) on the REST endpoint with query parameters.
    pub fn rest_url(&self, path: &str, params: &[(&str, String)]) -> Result<Url, GatewayError> {
        let mut url = Url::parse(&format!("{}{}/{}", self.base_url, REST_PREFIX, path))
            .map_err(|e| GatewayError::Decode(format!("invalid REST URL: {}", e)))?;
        if !params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in params {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    /// Public download URL of a stored object.
    pub fn public_object_url(&self, bucket: &str, object_path: &str) -> String {
        format!(
            "{}{}/object/public/{}/{}",
            self.base_url, STORAGE_PREFIX, bucket, object_path
        )
    }

    /// WebSocket URL of the realtime change-feed endpoint.
    pub fn realtime_url(&self) -> String {
        let ws_base = self
            .base_url
            .replace("https://", "wss://")
            .replace("http://", "ws://");
        format!(
            "{}{}?apikey={}&vsn=1.0.0",
            ws_base, REALTIME_PATH, self.anon_key
        )
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("apikey", &self.anon_key)
            .bearer_auth(&self.access_token)
    }

    /// GET request against the REST endpoint.
    pub async fn rest_get(&self, url: Url) -> Result<reqwest::Response, GatewayError> {
        tracing::debug!("REST GET {}", url);
        let resp = self.authorized(self.http.get(url.clone())).send().await?;
        check_response(resp, url.as_str()).await
    }

    /// POST a JSON body. `prefer` sets the `Prefer` header (e.g. `return=representation`).
    pub async fn rest_post(
        &self,
        url: Url,
        body: &serde_json::Value,
        prefer: Option<&str>,
    ) -> Result<reqwest::Response, GatewayError> {
        tracing::debug!("REST POST {}", url);
        let mut req = self.authorized(self.http.post(url.clone())).json(body);
        if let Some(prefer) = prefer {
            req = req.header("Prefer", prefer);
        }
        let resp = req.send().await?;
        check_response(resp, url.as_str()).await
    }

    /// PATCH rows matching the URL's filters with a JSON body.
    pub async fn rest_patch(
        &self,
        url: Url,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, GatewayError> {
        tracing::debug!("REST PATCH {}", url);
        let resp = self
            .authorized(self.http.patch(url.clone()))
            .header("Prefer", "return=minimal")
            .json(body)
            .send()
            .await?;
        check_response(resp, url.as_str()).await
    }

    /// Call a stored procedure.
    pub async fn rpc(
        &self,
        function: &str,
        args: &serde_json::Value,
    ) -> Result<reqwest::Response, GatewayError> {
        let url = self.rest_url(&format!("rpc/{}", function), &[])?;
        self.rest_post(url, args, None).await
    }

    /// Upload raw bytes to object storage.
    pub async fn storage_upload(
        &self,
        bucket: &str,
        object_path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<reqwest::Response, GatewayError> {
        let url = format!(
            "{}{}/object/{}/{}",
            self.base_url, STORAGE_PREFIX, bucket, object_path
        );
        tracing::debug!("Storage POST {} ({} bytes)", url, bytes.len());
        let resp = self
            .authorized(self.http.post(&url))
            .header("Content-Type", content_type)
            .header("x-upsert", "false")
            .body(bytes)
            .send()
            .await?;
        check_response(resp, &url).await
    }
}

/// Check HTTP response status code and return a clear error on failure.
async fn check_response(
    resp: reqwest::Response,
    url: &str,
) -> Result<reqwest::Response, GatewayError> {
    let status = resp.status();
    if status == reqwest::StatusCode::UNAUTHORIZED {
        return Err(GatewayError::Unauthorized(url.to_string()));
    }
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(GatewayError::Http {
            status: status.as_u16(),
            url: url.to_string(),
            body,
        });
    }
    Ok(resp)
}
