//! Backend API
//!
//! Request/response endpoints fetched once at startup: the backend
//! configuration (opaque, passed through to display) and the knowledge-graph
//! catalog.

use reqwest::Client;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::endpoint::Endpoint;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("request failed ({status}): {body}")]
    Http { status: u16, body: String },
    #[error("request failed: {0}")]
    Network(String),
    #[error("invalid response: {0}")]
    Deserialize(String),
    #[error("backend reports no knowledge graphs")]
    EmptyCatalog,
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        ApiError::Network(e.to_string())
    }
}

/// Client for the startup endpoints.
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    endpoint: Endpoint,
}

impl ApiClient {
    pub fn new(http: Client, endpoint: Endpoint) -> Self {
        Self { http, endpoint }
    }

    /// Fetch the backend configuration object.
    pub async fn fetch_config(&self) -> Result<Value, ApiError> {
        let value = self.get_json(self.endpoint.url("config")).await?;
        debug!("Fetched backend config");
        Ok(value)
    }

    /// Fetch the knowledge-graph catalog. An empty catalog is an error; the
    /// session cannot run without at least one graph.
    pub async fn fetch_knowledge_graphs(&self) -> Result<Vec<String>, ApiError> {
        let value = self.get_json(self.endpoint.url("knowledge_graphs")).await?;
        let catalog: Vec<String> =
            serde_json::from_value(value).map_err(|e| ApiError::Deserialize(e.to_string()))?;
        if catalog.is_empty() {
            return Err(ApiError::EmptyCatalog);
        }
        debug!(count = catalog.len(), "Fetched knowledge graph catalog");
        Ok(catalog)
    }

    async fn get_json(&self, url: String) -> Result<Value, ApiError> {
        let resp = self.http.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ApiError::Http {
                status: status.as_u16(),
                body,
            });
        }
        resp.json()
            .await
            .map_err(|e| ApiError::Deserialize(e.to_string()))
    }
}

/// Shared HTTP client with the timeouts used for all backend requests.
pub fn http_client() -> Client {
    Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .connect_timeout(std::time::Duration::from_secs(5))
        .build()
        .unwrap_or_else(|_| Client::new())
}
