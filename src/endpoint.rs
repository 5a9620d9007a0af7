//! Backend Endpoint
//!
//! Owns the backend base address and derives the HTTP and live-stream URLs
//! from it.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EndpointError {
    #[error("unsupported endpoint scheme: {0} (expected http or https)")]
    UnsupportedScheme(String),
    #[error("empty endpoint address")]
    Empty,
}

/// Backend address, normalized without a trailing slash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    base: String,
}

impl Endpoint {
    pub fn parse(raw: &str) -> Result<Self, EndpointError> {
        let base = raw.trim().trim_end_matches('/');
        if base.is_empty() {
            return Err(EndpointError::Empty);
        }
        if !base.starts_with("http://") && !base.starts_with("https://") {
            return Err(EndpointError::UnsupportedScheme(base.to_string()));
        }
        Ok(Endpoint {
            base: base.to_string(),
        })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// HTTP URL for a path relative to the base.
    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path.trim_start_matches('/'))
    }

    /// WebSocket URL of the live event stream.
    pub fn live_url(&self) -> String {
        let ws_base = if let Some(rest) = self.base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else {
            let rest = self.base.strip_prefix("http://").unwrap_or(&self.base);
            format!("ws://{rest}")
        };
        format!("{ws_base}/live")
    }
}
