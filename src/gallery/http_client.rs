use anyhow::anyhow;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::debug;

use super::traits::{Gallery, GallerySource, MetaError};

/// Metadata client for the upstream gallery API.
pub struct HttpGallerySource {
    client: Client,
    endpoint: String,
}

impl HttpGallerySource {
    /// `api_url` is the API host base, e.g. `https://example.org`.
    pub fn new(api_url: &str) -> Self {
        Self {
            client: Client::new(),
            endpoint: format!("{}/api/gallery", api_url.trim_end_matches('/')),
        }
    }
}

#[async_trait]
impl GallerySource for HttpGallerySource {
    async fn fetch(&self, id: &str) -> Result<Gallery, MetaError> {
        let url = format!("{}/{}", self.endpoint, id);
        debug!("fetching gallery metadata: {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| MetaError::Transport(e.into()))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(MetaError::NotFound);
        }
        if !response.status().is_success() {
            return Err(MetaError::Transport(anyhow!(
                "metadata API returned {}",
                response.status()
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| MetaError::Transport(e.into()))?;

        // The API reports a missing gallery as 200 with an `error` field.
        if body.get("error").map(|e| !e.is_null()).unwrap_or(false) {
            return Err(MetaError::NotFound);
        }

        serde_json::from_value(body).map_err(|e| MetaError::Transport(e.into()))
    }
}
