//! Share Coordinator
//!
//! Saves a session snapshot to the backend's share store and loads snapshots
//! by identifier. A 404 on load is classified separately so the caller can
//! report an expired or invalid link instead of a generic failure.

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::info;

use crate::endpoint::Endpoint;
use crate::protocol::{Continuation, Event, Task};

#[derive(Error, Debug)]
pub enum ShareError {
    #[error("share link not found")]
    NotFound,
    #[error("share request failed ({status}): {body}")]
    Http { status: u16, body: String },
    #[error("share request failed: {0}")]
    Network(String),
    #[error("invalid share payload: {0}")]
    Deserialize(String),
}

impl From<reqwest::Error> for ShareError {
    fn from(e: reqwest::Error) -> Self {
        ShareError::Network(e.to_string())
    }
}

/// Past turns and continuation state, as persisted and shared.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OutputSnapshot {
    pub past_messages: Vec<Value>,
    pub past_known: Vec<Value>,
    /// Ordered event sequences, one per turn.
    pub histories: Vec<Vec<Event>>,
}

impl OutputSnapshot {
    /// Continuation threaded into the next request, when the snapshot holds
    /// one. The backend rejects an empty `past.messages`, so none is better
    /// than an empty one.
    pub fn continuation(&self) -> Option<Continuation> {
        if self.past_messages.is_empty() {
            return None;
        }
        Some(Continuation {
            messages: self.past_messages.clone(),
            known: self.past_known.clone(),
        })
    }
}

/// Full session projection exchanged with the share endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub task: Task,
    pub selected_kgs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_output: Option<OutputSnapshot>,
}

/// Identifier returned by a successful save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShareHandle {
    pub id: String,
    #[serde(default)]
    pub url: Option<String>,
}

impl ShareHandle {
    /// Resolvable link for the snapshot. The backend returns a relative URL;
    /// absolute ones are passed through.
    pub fn link(&self, endpoint: &Endpoint) -> String {
        match self.url.as_deref() {
            Some(url) if url.starts_with("http://") || url.starts_with("https://") => {
                url.to_string()
            }
            Some(url) => endpoint.url(url),
            None => endpoint.url(&format!("load/{}", self.id)),
        }
    }
}

/// Client for the share save/load endpoints.
#[derive(Clone)]
pub struct ShareClient {
    http: Client,
    endpoint: Endpoint,
    token: Option<String>,
}

impl ShareClient {
    pub fn new(http: Client, endpoint: Endpoint, token: Option<String>) -> Self {
        Self {
            http,
            endpoint,
            token,
        }
    }

    /// Persist a snapshot and return its shareable identifier.
    pub async fn save(&self, snapshot: &SessionSnapshot) -> Result<ShareHandle, ShareError> {
        let mut req = self.http.post(self.endpoint.url("save")).json(snapshot);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ShareError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let handle: ShareHandle = resp
            .json()
            .await
            .map_err(|e| ShareError::Deserialize(e.to_string()))?;
        info!(id = %handle.id, "Saved shared snapshot");
        Ok(handle)
    }

    /// Fetch a previously saved snapshot by identifier.
    pub async fn load(&self, id: &str) -> Result<SessionSnapshot, ShareError> {
        let resp = self
            .http
            .get(self.endpoint.url(&format!("load/{id}")))
            .send()
            .await?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ShareError::NotFound);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ShareError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let snapshot: SessionSnapshot = resp
            .json()
            .await
            .map_err(|e| ShareError::Deserialize(e.to_string()))?;
        info!(id = %id, turns = snapshot
            .last_output
            .as_ref()
            .map(|o| o.histories.len())
            .unwrap_or(0), "Loaded shared snapshot");
        Ok(snapshot)
    }
}
