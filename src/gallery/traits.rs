use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize)]
pub struct GalleryTitle {
    pub english: Option<String>,
    pub japanese: Option<String>,
    pub pretty: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GalleryPage {
    /// Page type code: `j` jpg, `g` gif, `w` webp, anything else png.
    pub t: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GalleryImages {
    pub pages: Vec<GalleryPage>,
}

/// Gallery metadata as returned by the upstream API.
#[derive(Debug, Clone, Deserialize)]
pub struct Gallery {
    pub id: u64,
    pub media_id: String,
    pub title: GalleryTitle,
    pub images: GalleryImages,
}

#[derive(Debug, Error)]
pub enum MetaError {
    #[error("gallery not found")]
    NotFound,
    #[error("metadata fetch failed: {0}")]
    Transport(#[from] anyhow::Error),
}

#[async_trait]
pub trait GallerySource: Send + Sync {
    /// Fetch metadata for a gallery id. Single attempt, no retry here.
    async fn fetch(&self, id: &str) -> Result<Gallery, MetaError>;
}
