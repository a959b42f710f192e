//! HTTP JSON-RPC provider backed by `reqwest`.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use chainwatch_core::error::ProviderError;
use chainwatch_core::provider::{EventEmitter, Provider, ProviderEvent};
use chainwatch_core::request::{JsonRpcRequest, JsonRpcResponse};

/// Configuration for [`HttpProvider`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpProviderConfig {
    /// Per-request timeout (milliseconds).
    pub request_timeout_ms: u64,
}

impl Default for HttpProviderConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
        }
    }
}

impl HttpProviderConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Request/response-only JSON-RPC provider.
pub struct HttpProvider {
    url: String,
    http: reqwest::Client,
    request_timeout: Duration,
    events: EventEmitter,
}

impl HttpProvider {
    /// Create a provider for the given JSON-RPC endpoint URL.
    pub fn new(url: impl Into<String>, config: HttpProviderConfig) -> Result<Self, ProviderError> {
        let request_timeout = config.request_timeout();
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ProviderError::Http(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            url: url.into(),
            http,
            request_timeout,
            events: EventEmitter::new(),
        })
    }

    /// Create with default configuration.
    pub fn default_for(url: impl Into<String>) -> Result<Self, ProviderError> {
        Self::new(url, HttpProviderConfig::default())
    }

    async fn send_once(&self, req: &JsonRpcRequest) -> Result<JsonRpcResponse, ProviderError> {
        let resp = self
            .http
            .post(&self.url)
            .json(req)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout {
                        ms: self.request_timeout.as_millis() as u64,
                    }
                } else {
                    ProviderError::Http(e.to_string())
                }
            })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Http(format!("HTTP {status}: {body}")));
        }

        resp.json::<JsonRpcResponse>()
            .await
            .map_err(|e| ProviderError::Deserialization(e.to_string()))
    }
}

#[async_trait]
impl Provider for HttpProvider {
    async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, ProviderError> {
        tracing::trace!(url = %self.url, method = %req.method, id = %req.id, "HTTP request");
        match self.send_once(&req).await {
            Ok(resp) => Ok(resp),
            Err(e) => {
                tracing::debug!(url = %self.url, method = %req.method, error = %e, "HTTP request failed");
                self.events.emit(&ProviderEvent::Error(e.clone()));
                Err(e)
            }
        }
    }

    fn events(&self) -> &EventEmitter {
        &self.events
    }

    fn url(&self) -> &str {
        &self.url
    }
}

impl std::fmt::Debug for HttpProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpProvider").field("url", &self.url).finish()
    }
}
