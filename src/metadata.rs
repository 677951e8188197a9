use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::error::Result;
use crate::object::{
    unix_seconds, CdsContainer, CdsItem, ContentHandlerType, MetadataField, Resource,
    ResourceAttribute, ResourcePurpose,
};

/// A filesystem entry with its cached stat data, as handed around by the
/// import pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntryInfo {
    pub path: PathBuf,
    pub is_dir: bool,
    pub is_symlink: bool,
    /// Seconds since epoch.
    pub mtime: i64,
    pub size: u64,
}

impl DirEntryInfo {
    pub async fn for_path(path: &Path) -> Result<Self> {
        let symlink_meta = tokio::fs::symlink_metadata(path).await?;
        let is_symlink = symlink_meta.file_type().is_symlink();
        let meta = if is_symlink {
            match tokio::fs::metadata(path).await {
                Ok(meta) => meta,
                // dangling symlink: fall back to the link itself
                Err(_) => symlink_meta,
            }
        } else {
            symlink_meta
        };
        Ok(Self {
            path: path.to_path_buf(),
            is_dir: meta.is_dir(),
            is_symlink,
            mtime: meta.modified().map(unix_seconds).unwrap_or(0),
            size: meta.len(),
        })
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

/// Format a duration in seconds as `H:MM:SS` for `res@duration`.
pub fn format_duration_hms(total_seconds: u64) -> String {
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    format!("{hours}:{minutes:02}:{seconds:02}")
}

/// Content-based enrichment of imported objects, behind pluggable handlers.
#[async_trait]
pub trait MetadataService: Send + Sync {
    /// Populate an item's metadata and resources from the file on disk.
    async fn extract_metadata(&self, item: &mut CdsItem, entry: &DirEntryInfo) -> Result<()>;

    /// Attach a thumbnail resource from a sidecar image (folder.jpg and
    /// friends) in the container's physical location, if one exists.
    async fn fill_container_art(&self, container: &mut CdsContainer) -> Result<()>;
}

/// Default handler set: a tag reader for audio files plus the sidecar
/// container-art prober.
pub struct DefaultMetadataService {
    container_art_names: Vec<String>,
}

impl DefaultMetadataService {
    pub fn new(container_art_names: Vec<String>) -> Self {
        Self {
            container_art_names,
        }
    }

    fn extract_audio_tags(item: &mut CdsItem) {
        let path = item.core.location.clone();
        let tag = match audiotags::Tag::new().read_from_path(&path) {
            Ok(tag) => tag,
            Err(e) => {
                debug!("no readable tags in {}: {}", path.display(), e);
                return;
            }
        };
        if let Some(title) = tag.title() {
            if !title.is_empty() {
                item.core.title = title.to_string();
                item.core.add_meta(MetadataField::Title, title);
            }
        }
        if let Some(artist) = tag.artist() {
            item.core.add_meta(MetadataField::Artist, artist);
        }
        if let Some(album) = tag.album_title() {
            item.core.add_meta(MetadataField::Album, album);
        }
        if let Some(album_artist) = tag.album_artist() {
            item.core.add_meta(MetadataField::AlbumArtist, album_artist);
        }
        if let Some(genre) = tag.genre() {
            // multi-genre tags arrive as one delimited string
            for value in genre.split(&[';', '/']) {
                let value = value.trim();
                if !value.is_empty() {
                    item.core.add_meta(MetadataField::Genre, value);
                }
            }
        }
        if let Some(year) = tag.year() {
            if item.core.meta(MetadataField::Date).is_none() {
                item.core
                    .add_meta(MetadataField::Date, format!("{year}-01-01"));
            }
        }
        if let Some(track) = tag.track_number() {
            item.track_number = track as i32;
            item.core
                .add_meta(MetadataField::TrackNumber, track.to_string());
        }
        if let Some(duration) = tag.duration() {
            if let Some(res) = item.core.resource_by_purpose_mut(ResourcePurpose::Content) {
                res.set_attribute(
                    ResourceAttribute::Duration,
                    format_duration_hms(duration as u64),
                );
            }
        }
    }
}

impl Default for DefaultMetadataService {
    fn default() -> Self {
        Self::new(vec![
            "folder.jpg".to_string(),
            "cover.jpg".to_string(),
            "poster.jpg".to_string(),
        ])
    }
}

#[async_trait]
impl MetadataService for DefaultMetadataService {
    async fn extract_metadata(&self, item: &mut CdsItem, entry: &DirEntryInfo) -> Result<()> {
        // every item gets its primary content resource first, so resId 0 is
        // the playable stream
        if item
            .core
            .resource_by_purpose(ResourcePurpose::Content)
            .is_none()
        {
            let mut res = Resource::new(ContentHandlerType::Default, ResourcePurpose::Content);
            res.set_attribute(ResourceAttribute::Size, entry.size.to_string());
            res.set_attribute(
                ResourceAttribute::ProtocolInfo,
                format!("http-get:*:{}:*", item.mime_type),
            );
            item.core.add_resource(res);
        }

        if item.mime_type.starts_with("audio/") {
            Self::extract_audio_tags(item);
        }
        Ok(())
    }

    async fn fill_container_art(&self, container: &mut CdsContainer) -> Result<()> {
        if container
            .core
            .resource_by_purpose(ResourcePurpose::Thumbnail)
            .is_some()
        {
            return Ok(());
        }
        let location = container.core.location.clone();
        if location.as_os_str().is_empty() {
            return Ok(());
        }
        for name in &self.container_art_names {
            let candidate = location.join(name);
            if tokio::fs::metadata(&candidate).await.is_ok() {
                let mut res =
                    Resource::new(ContentHandlerType::ContainerArt, ResourcePurpose::Thumbnail);
                res.set_attribute(
                    ResourceAttribute::ResourceFile,
                    candidate.to_string_lossy().to_string(),
                );
                res.set_attribute(ResourceAttribute::ProtocolInfo, "http-get:*:image/jpeg:*");
                container.core.add_resource(res);
                debug!(
                    "container art for {} from {}",
                    location.display(),
                    candidate.display()
                );
                break;
            }
        }
        Ok(())
    }
}
