use std::io::Cursor;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use hearth_shared::constants::THUMBNAIL_MAX_DIMENSION;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("Media not found: {0}")]
    NotFound(String),

    #[error("Media too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("Empty media payload")]
    Empty,

    #[error("Invalid media name")]
    InvalidName,

    #[error("Media I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image processing failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("Media worker failed: {0}")]
    Worker(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMedia {
    pub url: String,
    pub size: u64,
}

/// A generated preview. `width`/`height` describe the source image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thumbnail {
    pub url: String,
    pub width: u32,
    pub height: u32,
}

#[async_trait]
pub trait MediaStorage: Send + Sync + 'static {
    async fn store(&self, data: Bytes, mime_type: &str, file_name: &str)
        -> Result<StoredMedia, MediaError>;

    /// Render a thumbnail for a previously stored image.
    async fn thumbnail(&self, url: &str) -> Result<Thumbnail, MediaError>;

    /// Read a stored object by name, with its content type.
    async fn open(&self, name: &str) -> Result<(Vec<u8>, &'static str), MediaError>;
}

/// Verify that a resolved path stays within the expected base directory.
fn ensure_within(base: &Path, target: &Path) -> Result<PathBuf, MediaError> {
    let canonical_base = base.canonicalize().unwrap_or_else(|_| base.to_path_buf());
    let mut resolved = canonical_base.clone();
    for component in target
        .strip_prefix(base)
        .unwrap_or(target)
        .components()
    {
        match component {
            Component::Normal(c) => resolved.push(c),
            Component::ParentDir => return Err(MediaError::InvalidName),
            _ => {}
        }
    }
    if !resolved.starts_with(&canonical_base) {
        return Err(MediaError::InvalidName);
    }
    Ok(resolved)
}

/// Stored names are `<uuid>.<ext>`; anything else is refused.
fn validate_name(name: &str) -> Result<(), MediaError> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
        && !name.contains("..");
    if valid {
        Ok(())
    } else {
        Err(MediaError::InvalidName)
    }
}

/// Extension for a stored object: the upload's own extension when it is
/// short and alphanumeric, else one derived from the mime type.
fn extension_for(mime_type: &str, file_name: &str) -> String {
    let from_name = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty() && e.len() <= 8 && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|e| e.to_ascii_lowercase());
    if let Some(ext) = from_name {
        return ext;
    }

    let essence = mime_type.split(';').next().unwrap_or("").trim();
    match essence {
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "video/mp4" => "mp4",
        "video/webm" => "webm",
        "video/quicktime" => "mov",
        "audio/mpeg" => "mp3",
        "audio/ogg" => "ogg",
        "audio/wav" => "wav",
        "audio/mp4" => "m4a",
        "audio/aac" => "aac",
        "application/pdf" => "pdf",
        "text/plain" => "txt",
        "text/csv" => "csv",
        _ => "bin",
    }
    .to_string()
}

fn content_type_for(name: &str) -> &'static str {
    let ext = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("");
    match ext {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mov" => "video/quicktime",
        "mp3" => "audio/mpeg",
        "ogg" => "audio/ogg",
        "wav" => "audio/wav",
        "m4a" => "audio/mp4",
        "aac" => "audio/aac",
        "pdf" => "application/pdf",
        "txt" => "text/plain; charset=utf-8",
        "csv" => "text/csv",
        _ => "application/octet-stream",
    }
}

/// Media on the local filesystem, served back under `base_url`.
#[derive(Debug, Clone)]
pub struct LocalMediaStore {
    base_path: PathBuf,
    base_url: String,
    max_size: usize,
}

impl LocalMediaStore {
    pub async fn new(base_path: PathBuf, base_url: &str, max_size: usize) -> Result<Self, MediaError> {
        fs::create_dir_all(&base_path).await?;

        info!(path = %base_path.display(), "Media store initialized");

        Ok(Self {
            base_path,
            base_url: base_url.trim_end_matches('/').to_string(),
            max_size,
        })
    }

    fn url_for(&self, name: &str) -> String {
        format!("{}/{}", self.base_url, name)
    }

    /// Stored name behind one of our URLs.
    fn name_from_url<'a>(&self, url: &'a str) -> Result<&'a str, MediaError> {
        let name = url
            .strip_prefix(&self.base_url)
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or(MediaError::InvalidName)?;
        validate_name(name)?;
        Ok(name)
    }

    fn safe_path(&self, name: &str) -> Result<PathBuf, MediaError> {
        validate_name(name)?;
        ensure_within(&self.base_path, &self.base_path.join(name))
    }
}

#[async_trait]
impl MediaStorage for LocalMediaStore {
    async fn store(
        &self,
        data: Bytes,
        mime_type: &str,
        file_name: &str,
    ) -> Result<StoredMedia, MediaError> {
        if data.is_empty() {
            return Err(MediaError::Empty);
        }
        if data.len() > self.max_size {
            return Err(MediaError::TooLarge {
                size: data.len(),
                max: self.max_size,
            });
        }

        let name = format!("{}.{}", Uuid::new_v4(), extension_for(mime_type, file_name));
        let path = self.safe_path(&name)?;
        fs::write(&path, &data).await?;

        debug!(name = %name, size = data.len(), "Stored media");
        Ok(StoredMedia {
            url: self.url_for(&name),
            size: data.len() as u64,
        })
    }

    async fn thumbnail(&self, url: &str) -> Result<Thumbnail, MediaError> {
        let name = self.name_from_url(url)?;
        let source = self.safe_path(name)?;
        let stem = name.split('.').next().unwrap_or(name);
        let thumb_name = format!("{stem}.thumb.png");
        let target = self.safe_path(&thumb_name)?;

        let data = fs::read(&source).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => MediaError::NotFound(name.to_string()),
            _ => MediaError::Io(e),
        })?;

        let (encoded, width, height) = tokio::task::spawn_blocking(move || {
            let img = image::load_from_memory(&data)?;
            let (width, height) = (img.width(), img.height());
            let thumb = img.thumbnail(THUMBNAIL_MAX_DIMENSION, THUMBNAIL_MAX_DIMENSION);
            let mut out = Cursor::new(Vec::new());
            thumb.write_to(&mut out, image::ImageFormat::Png)?;
            Ok::<_, MediaError>((out.into_inner(), width, height))
        })
        .await
        .map_err(|e| MediaError::Worker(e.to_string()))??;

        fs::write(&target, &encoded).await?;

        debug!(source = %name, width, height, "Generated thumbnail");
        Ok(Thumbnail {
            url: self.url_for(&thumb_name),
            width,
            height,
        })
    }

    async fn open(&self, name: &str) -> Result<(Vec<u8>, &'static str), MediaError> {
        let path = self.safe_path(name)?;
        let data = fs::read(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => MediaError::NotFound(name.to_string()),
            _ => MediaError::Io(e),
        })?;
        Ok((data, content_type_for(name)))
    }
}
