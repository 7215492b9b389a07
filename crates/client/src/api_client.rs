//! HTTP API client for the CMS backend.
//!
//! Sessions live in HTTP-only cookies kept by a shared cookie jar. The same
//! jar is handed to the WebSocket connector so the upgrade request carries
//! the session. A `401` on an ordinary request triggers one silent
//! `POST /auth/refresh` followed by a single retry.

use std::sync::Arc;

use cms_admin_shared::ApiError;
use reqwest::cookie::Jar;
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::Serialize;
use url::Url;

const REFRESH_PATH: &str = "/auth/refresh";
const LOGIN_PATH: &str = "/auth/login";

/// HTTP client bound to one API base URL.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    base_url: Url,
    cookies: Arc<Jar>,
}

impl ApiClient {
    /// Create a client for `base_url` (for example `http://localhost:8080/api/v1`).
    pub fn new(base_url: Url) -> Result<Self, ApiError> {
        let cookies = Arc::new(Jar::default());
        let client = Client::builder()
            .cookie_provider(cookies.clone())
            .build()
            .map_err(|e| ApiError::Network(e.to_string()))?;
        Ok(Self {
            client,
            base_url,
            cookies,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// The cookie jar holding the session cookies.
    pub fn cookie_jar(&self) -> Arc<Jar> {
        self.cookies.clone()
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        let base = self.base_url.as_str().trim_end_matches('/');
        let path = path.trim_start_matches('/');
        format!("{base}/{path}")
    }

    pub async fn get_json<TRes: DeserializeOwned>(&self, path: &str) -> Result<TRes, ApiError> {
        let text = self.execute(Method::GET, path, None).await?;
        decode(&text)
    }

    pub async fn post_json<TReq: Serialize, TRes: DeserializeOwned>(
        &self,
        path: &str,
        body: &TReq,
    ) -> Result<TRes, ApiError> {
        let body = serde_json::to_vec(body).map_err(|e| ApiError::Deserialize(e.to_string()))?;
        let text = self.execute(Method::POST, path, Some(body)).await?;
        decode(&text)
    }

    pub async fn put_json<TReq: Serialize, TRes: DeserializeOwned>(
        &self,
        path: &str,
        body: &TReq,
    ) -> Result<TRes, ApiError> {
        let body = serde_json::to_vec(body).map_err(|e| ApiError::Deserialize(e.to_string()))?;
        let text = self.execute(Method::PUT, path, Some(body)).await?;
        decode(&text)
    }

    /// POST without a body, ignoring the response body.
    pub async fn post_empty(&self, path: &str) -> Result<(), ApiError> {
        self.execute(Method::POST, path, None).await.map(|_| ())
    }

    async fn execute(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<String, ApiError> {
        match self.send_once(method.clone(), path, body.clone()).await {
            Err(e) if e.is_unauthorized() && refreshable(path) => {
                tracing::debug!(%method, path, "401; attempting silent refresh");
                if let Err(refresh) = self.send_once(Method::POST, REFRESH_PATH, None).await {
                    tracing::debug!(error = %refresh, "session refresh rejected");
                    return Err(e);
                }
                self.send_once(method, path, body).await
            }
            other => other,
        }
    }

    async fn send_once(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<String, ApiError> {
        let url = self.url(path);
        let mut rb = self.client.request(method, &url);
        if let Some(body) = body {
            rb = rb.body(body).header("Content-Type", "application/json");
        }

        let resp = rb.send().await.map_err(|e| ApiError::Network(e.to_string()))?;

        let status = resp.status().as_u16();
        let is_success = resp.status().is_success();
        let text = resp
            .text()
            .await
            .map_err(|e| ApiError::Network(format!("failed to read body: {e}")))?;

        if !is_success {
            return Err(ApiError::Http { status, body: text });
        }
        Ok(text)
    }
}

/// Login and refresh answer 401 for bad credentials or an expired refresh
/// token; retrying those would loop.
fn refreshable(path: &str) -> bool {
    let path = path.split('?').next().unwrap_or(path);
    !(path.ends_with(LOGIN_PATH) || path.ends_with(REFRESH_PATH))
}

fn decode<TRes: DeserializeOwned>(text: &str) -> Result<TRes, ApiError> {
    let text = if text.trim().is_empty() { "null" } else { text };
    serde_json::from_str(text).map_err(|e| ApiError::Deserialize(e.to_string()))
}
