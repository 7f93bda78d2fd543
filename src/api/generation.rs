//! Remote capabilities the pipeline consumes: media generation and raster fetching.

use crate::error::{Result, StoryboardError};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    /// URL or data URL of a conditioning image.
    pub reference_image: Option<String>,
}

impl GenerationRequest {
    pub fn text(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            reference_image: None,
        }
    }

    pub fn with_reference(prompt: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            reference_image: Some(reference.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GeneratedMedia {
    Url(String),
    Inline { mime_type: String, base64: String },
}

impl GeneratedMedia {
    /// Addressable form of the media; inline rasters become data URLs.
    pub fn into_url(self) -> String {
        match self {
            GeneratedMedia::Url(url) => url,
            GeneratedMedia::Inline { mime_type, base64 } => {
                format!("data:{};base64,{}", mime_type, base64)
            }
        }
    }
}

/// Keeps inline rasters as files under a run directory so only short
/// locations end up in the run manifest. Remote URLs pass through untouched.
#[derive(Debug, Clone)]
pub struct MediaStore {
    root: PathBuf,
}

impl MediaStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Writes inline media to `<root>/<stem>.<ext>` and returns `<stem>.<ext>`
    /// with forward slashes. URLs are returned as they are.
    pub async fn keep(&self, media: GeneratedMedia, stem: &str) -> Result<String> {
        let (mime_type, base64) = match media {
            GeneratedMedia::Url(url) => return Ok(url),
            GeneratedMedia::Inline { mime_type, base64 } => (mime_type, base64),
        };
        let ext = match mime_type.as_str() {
            "image/jpeg" | "image/jpg" => "jpg",
            "image/webp" => "webp",
            _ => "png",
        };
        let rel = format!("{}.{}", stem.trim_matches('/'), ext);
        let path = self.root.join(&rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, STANDARD.decode(base64.trim())?).await?;
        Ok(rel)
    }

    /// Location an `ImageSource` can fetch: paths recorded by [`MediaStore::keep`]
    /// are joined onto the root, everything else is returned unchanged.
    pub fn resolve(&self, location: &str) -> String {
        let is_remote = location.starts_with("data:")
            || location.starts_with("http://")
            || location.starts_with("https://")
            || location.starts_with("file://");
        if is_remote || Path::new(location).is_absolute() {
            location.to_string()
        } else {
            self.root.join(location).to_string_lossy().into_owned()
        }
    }
}

/// Submit a prompt (optionally with a reference image) and receive media or a failure.
#[async_trait]
pub trait GenerationService: Send + Sync {
    async fn submit(&self, request: &GenerationRequest) -> Result<GeneratedMedia>;

    fn name(&self) -> &'static str;
}

#[async_trait]
impl<T: GenerationService + ?Sized> GenerationService for Arc<T> {
    async fn submit(&self, request: &GenerationRequest) -> Result<GeneratedMedia> {
        (**self).submit(request).await
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}

/// Resolves an image location (http(s) URL, data URL, or local path) to bytes.
#[async_trait]
pub trait ImageSource: Send + Sync {
    async fn fetch(&self, location: &str) -> Result<Vec<u8>>;
}

#[async_trait]
impl<T: ImageSource + ?Sized> ImageSource for Arc<T> {
    async fn fetch(&self, location: &str) -> Result<Vec<u8>> {
        (**self).fetch(location).await
    }
}

pub struct HttpImageSource {
    pub client: reqwest::Client,
}

impl HttpImageSource {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ImageSource for HttpImageSource {
    async fn fetch(&self, location: &str) -> Result<Vec<u8>> {
        if let Some(decoded) = decode_data_url(location) {
            return decoded;
        }

        if location.starts_with("http://") || location.starts_with("https://") {
            let resp = self.client.get(location).send().await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(StoryboardError::Generation(format!(
                    "image fetch HTTP {} for {}",
                    status.as_u16(),
                    location
                )));
            }
            return Ok(resp.bytes().await?.to_vec());
        }

        let path = location.strip_prefix("file://").unwrap_or(location);
        Ok(fs::read(Path::new(path)).await?)
    }
}

/// `None` when `url` is not a data URL; otherwise the decoded payload.
pub fn decode_data_url(url: &str) -> Option<Result<Vec<u8>>> {
    let rest = url.strip_prefix("data:")?;
    let Some((meta, payload)) = rest.split_once(',') else {
        return Some(Err(StoryboardError::Generation(
            "data URL has no payload".to_string(),
        )));
    };
    if !meta.ends_with(";base64") {
        return Some(Ok(payload.as_bytes().to_vec()));
    }
    Some(STANDARD.decode(payload.trim()).map_err(StoryboardError::from))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_media_becomes_data_url() {
        let media = GeneratedMedia::Inline {
            mime_type: "image/png".into(),
            base64: "AAAA".into(),
        };
        assert_eq!(media.into_url(), "data:image/png;base64,AAAA");
        assert_eq!(
            GeneratedMedia::Url("https://x/y.png".into()).into_url(),
            "https://x/y.png"
        );
    }

    #[test]
    fn data_urls_decode_and_other_urls_pass_through() {
        let bytes = decode_data_url("data:image/png;base64,aGVsbG8=").unwrap().unwrap();
        assert_eq!(bytes, b"hello");
        assert!(decode_data_url("https://example.com/a.png").is_none());
        assert!(decode_data_url("data:image/png;base64").unwrap().is_err());
    }

    #[tokio::test]
    async fn http_source_reads_local_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page.bin");
        std::fs::write(&path, [1u8, 2, 3]).unwrap();

        let source = HttpImageSource::with_client(reqwest::Client::new());
        let bytes = source.fetch(path.to_str().unwrap()).await.unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn store_writes_inline_rasters_and_passes_urls_through() {
        let dir = tempfile::tempdir().unwrap();
        let store = MediaStore::new(dir.path());

        let rel = store
            .keep(
                GeneratedMedia::Inline {
                    mime_type: "image/webp".into(),
                    base64: "aGVsbG8=".into(),
                },
                "hifi/shot_0007",
            )
            .await
            .unwrap();
        assert_eq!(rel, "hifi/shot_0007.webp");
        assert_eq!(std::fs::read(dir.path().join(&rel)).unwrap(), b"hello");

        let url = store
            .keep(GeneratedMedia::Url("https://img/1.png".into()), "pages/page_001")
            .await
            .unwrap();
        assert_eq!(url, "https://img/1.png");

        let source = HttpImageSource::with_client(reqwest::Client::new());
        assert_eq!(source.fetch(&store.resolve(&rel)).await.unwrap(), b"hello");
        assert_eq!(store.resolve("https://img/1.png"), "https://img/1.png");
    }
}
