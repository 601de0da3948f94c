//! HTTP object store client
//!
//! Talks to any object store exposing:
//! - `GET    {base}/{key}`            → 200 + `ETag`, 404 when absent
//! - `PUT    {base}/{key}`            with `If-None-Match: *` or `If-Match: <etag>`
//! - `DELETE {base}/{key}`            optionally with `If-Match`
//! - `GET    {base}?prefix=<prefix>`  → JSON array of `{key, size, etag}`
//!
//! `412 Precondition Failed` maps to `RemoteError::PreconditionFailed`.

use super::{validate_key, ObjectInfo, RemoteError, RemoteObject, RemoteStore};
use async_trait::async_trait;
use reqwest::header::{ETAG, IF_MATCH, IF_NONE_MATCH};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use std::time::Duration;

pub struct HttpStore {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpStore {
    /// Create new client; `timeout` bounds every request
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, RemoteError> {
        let parsed = url::Url::parse(base_url)
            .map_err(|e| RemoteError::InvalidKey(format!("invalid base url {}: {}", base_url, e)))?;

        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Network(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: parsed.as_str().trim_end_matches('/').to_string(),
            token: None,
        })
    }

    /// Attach a bearer token to every request
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key)
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send_put(
        &self,
        key: &str,
        data: Vec<u8>,
        precondition: Option<(reqwest::header::HeaderName, String)>,
    ) -> Result<String, RemoteError> {
        validate_key(key)?;

        let mut builder = self.authorize(self.client.put(self.object_url(key))).body(data);
        if let Some((name, value)) = precondition {
            builder = builder.header(name, value);
        }

        let response = builder.send().await?;
        match response.status() {
            s if s.is_success() => extract_etag(&response),
            StatusCode::PRECONDITION_FAILED | StatusCode::CONFLICT => {
                Err(RemoteError::PreconditionFailed(key.to_string()))
            }
            _ => Err(handle_error(key, response).await),
        }
    }

    async fn send_delete(&self, key: &str, etag: Option<&str>) -> Result<(), RemoteError> {
        validate_key(key)?;

        let mut builder = self.authorize(self.client.delete(self.object_url(key)));
        if let Some(etag) = etag {
            builder = builder.header(IF_MATCH, quote_etag(etag));
        }

        let response = builder.send().await?;
        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND if etag.is_none() => Ok(()),
            StatusCode::NOT_FOUND => Err(RemoteError::NotFound(key.to_string())),
            StatusCode::PRECONDITION_FAILED => Err(RemoteError::PreconditionFailed(key.to_string())),
            _ => Err(handle_error(key, response).await),
        }
    }
}

#[async_trait]
impl RemoteStore for HttpStore {
    async fn get(&self, key: &str) -> Result<Option<RemoteObject>, RemoteError> {
        validate_key(key)?;

        let response = self
            .authorize(self.client.get(self.object_url(key)))
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => {
                let etag = extract_etag(&response)?;
                let data = response.bytes().await?.to_vec();
                Ok(Some(RemoteObject { data, etag }))
            }
            _ => Err(handle_error(key, response).await),
        }
    }

    async fn create_if_absent(&self, key: &str, data: Vec<u8>) -> Result<String, RemoteError> {
        self.send_put(key, data, Some((IF_NONE_MATCH, "*".to_string())))
            .await
    }

    async fn overwrite_if_match(
        &self,
        key: &str,
        data: Vec<u8>,
        etag: &str,
    ) -> Result<String, RemoteError> {
        self.send_put(key, data, Some((IF_MATCH, quote_etag(etag))))
            .await
    }

    async fn put(&self, key: &str, data: Vec<u8>) -> Result<String, RemoteError> {
        self.send_put(key, data, None).await
    }

    async fn delete_if_match(&self, key: &str, etag: &str) -> Result<(), RemoteError> {
        self.send_delete(key, Some(etag)).await
    }

    async fn delete(&self, key: &str) -> Result<(), RemoteError> {
        self.send_delete(key, None).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, RemoteError> {
        let response = self
            .authorize(self.client.get(&self.base_url))
            .query(&[("prefix", prefix)])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(handle_error(prefix, response).await);
        }

        let mut listed: Vec<ObjectInfo> = response
            .json()
            .await
            .map_err(|e| RemoteError::InvalidResponse(e.to_string()))?;
        listed.retain(|o| o.key.starts_with(prefix));
        listed.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(listed)
    }
}

fn quote_etag(etag: &str) -> String {
    format!("\"{}\"", etag.trim_matches('"'))
}

fn extract_etag(response: &Response) -> Result<String, RemoteError> {
    response
        .headers()
        .get(ETAG)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim_start_matches("W/").trim_matches('"').to_string())
        .ok_or_else(|| RemoteError::InvalidResponse("missing ETag header".to_string()))
}

/// Convert error response to RemoteError
async fn handle_error(key: &str, response: Response) -> RemoteError {
    let status = response.status();
    let msg = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());

    match status {
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
            RemoteError::Network(format!("{}: {}", status, msg))
        }
        StatusCode::NOT_FOUND => RemoteError::NotFound(key.to_string()),
        _ => RemoteError::InvalidResponse(format!("{} for {}: {}", status, key, msg)),
    }
}
