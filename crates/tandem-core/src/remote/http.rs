//! HTTP client for the remote store.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::{PullResponse, PushRequest, PushResult, RemoteError, RemoteStore};
use crate::error::{Error, Result};
use crate::models::Device;
use crate::util::{compact_text, is_http_url, normalize_text_option};

pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

#[derive(Clone)]
pub struct HttpRemoteStore {
    base_url: String,
    auth_token: Option<String>,
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpRemoteStore {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpRemoteStore")
            .field("base_url", &self.base_url)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "[REDACTED]"))
            .finish_non_exhaustive()
    }
}

impl HttpRemoteStore {
    pub fn new(
        base_url: impl Into<String>,
        auth_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let base_url = normalize_base_url(base_url.into())?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url,
            auth_token: normalize_text_option(auth_token),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}{path}", self.base_url))
            .header(header::ACCEPT, "application/json");
        match &self.auth_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn push(&self, request: PushRequest) -> std::result::Result<Vec<PushResult>, RemoteError> {
        let mut builder = self.request(reqwest::Method::POST, "/v1/sync/push");
        if let [single] = request.operations.as_slice() {
            builder = builder.header(IDEMPOTENCY_KEY_HEADER, &single.idempotency_key);
        }
        let response = builder.json(&request).send().await?;
        decode(response).await
    }

    async fn pull(&self, since: Option<&str>) -> std::result::Result<PullResponse, RemoteError> {
        let mut builder = self.request(reqwest::Method::GET, "/v1/sync/pull");
        if let Some(cursor) = since {
            builder = builder.query(&[("since", cursor)]);
        }
        let response = builder.send().await?;
        decode(response).await
    }

    async fn heartbeat(&self) -> std::result::Result<(), RemoteError> {
        let response = self.request(reqwest::Method::GET, "/healthz").send().await?;
        check(response).await.map(|_| ())
    }

    async fn register_device(&self, device: &Device) -> std::result::Result<Device, RemoteError> {
        let response = self
            .request(reqwest::Method::POST, "/v1/devices")
            .json(device)
            .send()
            .await?;
        decode(response).await
    }

    async fn list_devices(&self) -> std::result::Result<Vec<Device>, RemoteError> {
        let response = self.request(reqwest::Method::GET, "/v1/devices").send().await?;
        decode(response).await
    }

    async fn set_primary_device(&self, device_id: &str) -> std::result::Result<(), RemoteError> {
        if device_id.is_empty() || device_id.contains(['/', '?', '#', '%']) {
            return Err(RemoteError::Rejected {
                status: 400,
                message: format!("invalid device id '{device_id}'"),
            });
        }
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/v1/devices/{device_id}/primary"),
            )
            .send()
            .await?;
        check(response).await.map(|_| ())
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> std::result::Result<T, RemoteError> {
    let response = check(response).await?;
    response
        .json::<T>()
        .await
        .map_err(|e| RemoteError::InvalidResponse(e.to_string()))
}

async fn check(response: Response) -> std::result::Result<Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = response
        .headers()
        .get(header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = response.text().await.unwrap_or_default();
    Err(RemoteError::from_status(
        status.as_u16(),
        parse_api_error(status, &body),
        retry_after,
    ))
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return message.trim().to_string();
        }
    }

    let trimmed = compact_text(body);
    if trimmed.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    } else {
        trimmed
    }
}

fn normalize_base_url(raw: String) -> Result<String> {
    let url = normalize_text_option(Some(raw))
        .ok_or_else(|| Error::Config("remote url must not be empty".to_string()))?;
    if is_http_url(&url) {
        Ok(url.trim_end_matches('/').to_string())
    } else {
        Err(Error::Config(
            "remote url must include http:// or https://".to_string(),
        ))
    }
}
