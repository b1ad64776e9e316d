//! The HTTP client used to fetch from the origin service.
//!
//! [`OriginClient::fetch`] only ever returns [`OriginError`] for a failure
//! to reach the origin at all (connect or timeout); any response the
//! origin actually sent, 2xx or not, comes back as an [`OriginResponse`]
//! for the caller to classify. Whether a non-2xx status also counts as a
//! circuit breaker failure is the caller's call, made in the pipeline.

use std::time::Duration;

use bytes::Bytes;
use reqwest::Client;

use crate::error::OriginError;

/// A response received from the origin, good or bad.
pub struct OriginResponse {
    /// The HTTP status code the origin returned.
    pub status: u16,
    /// The origin's `Content-Type` header, if any.
    pub content_type: Option<String>,
    /// The raw response body.
    pub body: Bytes,
}

/// Fetches responses from a single origin base URL.
pub struct OriginClient {
    client: Client,
    base_url: String,
}

impl OriginClient {
    /// Builds a client targeting `base_url`, applying `timeout` to every
    /// request.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, OriginError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| OriginError::Unexpected(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    /// Fetches `path` from the origin.
    ///
    /// Only a failure to reach the origin at all (a connection error or a
    /// request timeout) surfaces as an [`OriginError`]; any response the
    /// origin actually returns, regardless of status code, comes back as
    /// `Ok`.
    pub async fn fetch(&self, path: &str) -> Result<OriginResponse, OriginError> {
        let url = format!("{}{}", self.base_url, path);
        log::info!("fetching from origin: {url}");

        let response = self.client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                OriginError::Timeout(e.to_string())
            } else if e.is_connect() {
                OriginError::Connect(e.to_string())
            } else {
                OriginError::Unexpected(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes()
            .await
            .map_err(|e| OriginError::Unexpected(e.to_string()))?;

        log::info!("origin fetch for {url} returned status {status}");

        Ok(OriginResponse {
            status,
            content_type,
            body,
        })
    }

    /// Like [`Self::fetch`], but substitutes a deterministic synthetic
    /// response when the origin cannot be reached at all, rather than
    /// returning [`OriginError::Connect`]/[`OriginError::Timeout`].
    ///
    /// Development-only: gated behind the `dev-mock` feature and never
    /// called from the production request path. An unexpected error (a
    /// malformed response, a body read failure) still propagates, since
    /// only "origin is unreachable" is meant to be papered over here.
    #[cfg(feature = "dev-mock")]
    pub async fn fetch_with_mock(&self, path: &str) -> Result<OriginResponse, OriginError> {
        match self.fetch(path).await {
            Ok(resp) => Ok(resp),
            Err(OriginError::Connect(_)) | Err(OriginError::Timeout(_)) => {
                log::debug!("returning mock response for path: {path}");
                Ok(mock_response(path))
            }
            Err(other) => Err(other),
        }
    }
}

/// Builds the synthetic response `fetch_with_mock` substitutes for an
/// unreachable origin: a `/static/*` path gets a fake image payload,
/// anything else gets a small JSON envelope naming the path it stood in
/// for.
#[cfg(feature = "dev-mock")]
fn mock_response(path: &str) -> OriginResponse {
    if let Some(rest) = path.strip_prefix("/static/") {
        return OriginResponse {
            status: 200,
            content_type: Some("image/png".to_string()),
            body: Bytes::from(
                serde_json::json!({ "mock_image": true, "path": rest }).to_string(),
            ),
        };
    }
    let mut obj = serde_json::Map::new();
    obj.insert(
        format!("mock_response_for_{path}"),
        serde_json::Value::Bool(true),
    );
    obj.insert("path".to_string(), serde_json::Value::String(path.to_string()));
    OriginResponse {
        status: 200,
        content_type: Some("application/json".to_string()),
        body: Bytes::from(serde_json::Value::Object(obj).to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fetch_rejects_unreachable_origin() {
        let client = OriginClient::new("http://127.0.0.1:1", Duration::from_millis(200)).unwrap();
        let err = client.fetch("/x").await.unwrap_err();
        assert!(matches!(err, OriginError::Connect(_) | OriginError::Timeout(_)));
    }

    #[cfg(feature = "dev-mock")]
    #[tokio::test]
    async fn fetch_with_mock_substitutes_a_synthetic_response() {
        let client = OriginClient::new("http://127.0.0.1:1", Duration::from_millis(200)).unwrap();

        let resp = client.fetch_with_mock("/static/app.js").await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.content_type.as_deref(), Some("image/png"));

        let resp = client.fetch_with_mock("/api/thing").await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.content_type.as_deref(), Some("application/json"));
    }
}
