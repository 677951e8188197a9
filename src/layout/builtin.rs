use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, warn};

use crate::config::ServerConfig;
use crate::error::Result;
use crate::import::ImportService;
use crate::layout::Layout;
use crate::mime::{CONTENT_TYPE_OGG, CONTENT_TYPE_PLAYLIST};
use crate::object::{
    CdsContainer, CdsObject, MetadataField, ObjectId, INVALID_OBJECT_ID,
    OBJECT_FLAG_OGG_THEORA, OBJECT_FLAG_USE_RESOURCE_REF, ROOT_OBJECT_ID,
    UPNP_CLASS_MUSIC_ALBUM, UPNP_CLASS_MUSIC_COMPOSER, UPNP_CLASS_MUSIC_GENRE,
};

/// The built-in virtual tree: Audio/Video/Photos axes driven by metadata,
/// configurable through the layout box table.
pub struct BuiltinLayout {
    config: Arc<ServerConfig>,
    genre_map: Vec<(Regex, String)>,
}

impl BuiltinLayout {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        let genre_map = config
            .import
            .layout
            .genre_map
            .iter()
            .filter_map(|(pattern, replacement)| {
                match Regex::new(&format!("(?i){pattern}")) {
                    Ok(re) => Some((re, replacement.clone())),
                    Err(e) => {
                        warn!("ignoring bad genre mapping '{pattern}': {e}");
                        None
                    }
                }
            })
            .collect();
        Self { config, genre_map }
    }

    /// Normalize a genre value through the configured regex table; the first
    /// full match wins.
    pub fn map_genre(&self, genre: &str) -> String {
        for (pattern, replacement) in &self.genre_map {
            if pattern
                .find(genre)
                .map(|m| m.start() == 0 && m.end() == genre.len())
                .unwrap_or(false)
            {
                return pattern
                    .replace_all(genre, replacement.as_str())
                    .to_string();
            }
        }
        genre.to_string()
    }

    fn box_title(&self, key: &str) -> Option<String> {
        self.config
            .import
            .layout
            .box_title(key)
            .map(str::to_string)
    }

    /// Build a chain of containers from path segments; the last segment may
    /// carry a class, and the leaf inherits the item's mtime so container
    /// freshness propagates.
    fn chain(segments: &[&str], leaf_class: Option<&str>, leaf_mtime: i64) -> Vec<CdsContainer> {
        let mut chain: Vec<CdsContainer> = segments
            .iter()
            .map(|title| CdsContainer::with_title(*title, crate::object::UPNP_CLASS_CONTAINER))
            .collect();
        if let Some(last) = chain.last_mut() {
            if let Some(class) = leaf_class {
                last.core.upnp_class = class.to_string();
            }
            last.core.mtime = leaf_mtime;
        }
        chain
    }

    /// Place the virtual copy under a chain rooted at the virtual root.
    /// The leaf container inherits the item's metadata so grouping keys and
    /// album properties resolve.
    async fn add_under(
        &self,
        svc: &ImportService,
        virt: &mut CdsObject,
        mut chain: Vec<CdsContainer>,
        ref_item: &CdsObject,
    ) -> Result<()> {
        if let Some(leaf) = chain.last_mut() {
            if leaf.core.upnp_class != crate::object::UPNP_CLASS_CONTAINER {
                leaf.core.set_metadata(virt.core().metadata().to_vec());
            }
        }
        let mut created_ids = Vec::new();
        let (parent_id, is_new) = svc
            .add_container_tree(ROOT_OBJECT_ID, chain, Some(ref_item), &mut created_ids)
            .await?;
        if !created_ids.is_empty() {
            svc.notify_containers_changed(&created_ids).await;
        }
        self.add(svc, virt, parent_id, is_new).await
    }

    async fn add(
        &self,
        svc: &ImportService,
        virt: &mut CdsObject,
        parent_id: ObjectId,
        first_child: bool,
    ) -> Result<()> {
        virt.core_mut().parent_id = parent_id;
        virt.core_mut().set_flag(OBJECT_FLAG_USE_RESOURCE_REF);
        virt.core_mut().id = INVALID_OBJECT_ID;
        svc.add_object(virt, first_child).await
    }

    /// Relative directory of the item under the autoscan root, used for the
    /// Directories axis.
    fn directories_of(&self, svc: &ImportService, obj: &CdsObject, root_path: &Path) -> Vec<String> {
        let parent = match obj.location().parent() {
            Some(parent) => parent.to_path_buf(),
            None => return Vec::new(),
        };
        let base: Option<PathBuf> = if root_path.as_os_str().is_empty() {
            None
        } else if svc.layout_parent_path() {
            root_path.parent().map(Path::to_path_buf)
        } else {
            Some(root_path.to_path_buf())
        };
        let relative = match &base {
            Some(base) => parent.strip_prefix(base).ok().map(Path::to_path_buf),
            None => parent
                .file_name()
                .map(|n| PathBuf::from(n.to_string_lossy().to_string())),
        };
        match relative {
            Some(relative) => relative
                .components()
                .filter_map(|c| match c {
                    std::path::Component::Normal(seg) => {
                        Some(seg.to_string_lossy().to_string())
                    }
                    _ => None,
                })
                .collect(),
            None => Vec::new(),
        }
    }

    async fn add_directories_axis(
        &self,
        svc: &ImportService,
        virt: &mut CdsObject,
        obj: &CdsObject,
        root_path: &Path,
        root_box: &str,
        dir_box_key: &str,
    ) -> Result<()> {
        let Some(dir_title) = self.box_title(dir_box_key) else {
            return Ok(());
        };
        let segments = self.directories_of(svc, obj, root_path);
        if segments.is_empty() {
            return Ok(());
        }
        let mut names: Vec<&str> = vec![root_box, &dir_title];
        for segment in &segments {
            names.push(segment.as_str());
        }
        let chain = Self::chain(&names, None, obj.mtime());
        self.add_under(svc, virt, chain, obj).await
    }

    fn year_and_month(date: &str) -> Option<(String, String)> {
        let (year, rest) = date.split_once('-')?;
        let month = rest.split('-').next()?;
        if year.is_empty() || month.is_empty() {
            return None;
        }
        Some((year.to_string(), month.to_string()))
    }

    async fn add_audio(
        &self,
        svc: &ImportService,
        virt: &mut CdsObject,
        obj: &CdsObject,
        root_path: &Path,
    ) -> Result<()> {
        let root = match self.box_title("Audio/audioRoot") {
            Some(root) => root,
            None => return Ok(()),
        };
        let core = virt.core();
        let title = core
            .meta(MetadataField::Title)
            .unwrap_or(&core.title)
            .to_string();

        let artist_full = core.meta(MetadataField::Artist).map(str::to_string);
        let artist = artist_full.clone().unwrap_or_else(|| "Unknown".to_string());
        let album_full = core.meta(MetadataField::Album).map(str::to_string);
        let album = album_full.clone().unwrap_or_else(|| "Unknown".to_string());

        let mut description = artist_full.clone().unwrap_or_default();
        if let Some(album) = &album_full {
            if description.is_empty() {
                description = album.clone();
            } else {
                description = format!("{description}, {album}");
            }
        }
        if description.is_empty() {
            description = title.clone();
        } else {
            description = format!("{description}, {title}");
        }

        let date_meta = virt.core().meta(MetadataField::Date).map(str::to_string);
        let year = match &date_meta {
            Some(date) => {
                let year = date.split('-').next().unwrap_or(date).to_string();
                description = format!("{description}, {year}");
                year
            }
            None => "Unknown".to_string(),
        };
        virt.core_mut().add_meta(MetadataField::UpnpDate, year.clone());

        let genres: Vec<String> = virt
            .core()
            .meta_group(MetadataField::Genre)
            .iter()
            .map(|genre| self.map_genre(genre))
            .collect();
        if let Some(first) = genres.first() {
            description = format!("{description}, {first}");
        }
        if virt.core().meta(MetadataField::Description).is_none() {
            virt.core_mut()
                .add_meta(MetadataField::Description, description);
        }
        let composer = virt
            .core()
            .meta(MetadataField::Composer)
            .unwrap_or("None")
            .to_string();

        let mtime = obj.mtime();

        if let Some(all_audio) = self.box_title("Audio/allAudio") {
            let chain = Self::chain(&[&root, &all_audio], None, mtime);
            self.add_under(svc, virt, chain, obj).await?;
        }

        if let Some(artists) = self.box_title("Audio/allArtists") {
            if let Some(all_songs) = self.box_title("Audio/allSongs") {
                let chain = Self::chain(&[&root, &artists, &artist, &all_songs], None, mtime);
                self.add_under(svc, virt, chain, obj).await?;
            }
            let chain = Self::chain(
                &[&root, &artists, &artist, &album],
                Some(UPNP_CLASS_MUSIC_ALBUM),
                mtime,
            );
            self.add_under(svc, virt, chain, obj).await?;
        }

        if let Some(albums) = self.box_title("Audio/allAlbums") {
            let chain = Self::chain(
                &[&root, &albums, &album],
                Some(UPNP_CLASS_MUSIC_ALBUM),
                mtime,
            );
            self.add_under(svc, virt, chain, obj).await?;
        }

        if let Some(genres_box) = self.box_title("Audio/allGenres") {
            for genre in &genres {
                let chain = Self::chain(
                    &[&root, &genres_box, genre],
                    Some(UPNP_CLASS_MUSIC_GENRE),
                    mtime,
                );
                self.add_under(svc, virt, chain, obj).await?;
            }
        }

        if let Some(composers) = self.box_title("Audio/allComposers") {
            let chain = Self::chain(
                &[&root, &composers, &composer],
                Some(UPNP_CLASS_MUSIC_COMPOSER),
                mtime,
            );
            self.add_under(svc, virt, chain, obj).await?;
        }

        if let Some(years) = self.box_title("Audio/allYears") {
            let chain = Self::chain(&[&root, &years, &year], None, mtime);
            self.add_under(svc, virt, chain, obj).await?;
        }

        // the full-name axis renders a synthetic "Artist - Album - Title"
        if let Some(full) = self.box_title("Audio/allTracks") {
            let mut full_name = String::new();
            if let Some(artist) = &artist_full {
                full_name.push_str(artist);
            }
            match &album_full {
                Some(album) => full_name.push_str(&format!(" - {album} - ")),
                None => full_name.push_str(" - "),
            }
            full_name.push_str(&title);
            virt.core_mut().title = full_name;
            let chain = Self::chain(&[&root, &full], None, mtime);
            self.add_under(svc, virt, chain, obj).await?;
            virt.core_mut().title = title.clone();
        }

        self.add_directories_axis(svc, virt, obj, root_path, &root, "Audio/allDirectories")
            .await
    }

    async fn add_video(
        &self,
        svc: &ImportService,
        virt: &mut CdsObject,
        obj: &CdsObject,
        root_path: &Path,
    ) -> Result<()> {
        let root = match self.box_title("Video/videoRoot") {
            Some(root) => root,
            None => return Ok(()),
        };
        let mtime = obj.mtime();

        if let Some(all_video) = self.box_title("Video/allVideo") {
            let chain = Self::chain(&[&root, &all_video], None, mtime);
            self.add_under(svc, virt, chain, obj).await?;
        }

        let date = virt
            .core()
            .meta(MetadataField::CreationDate)
            .or_else(|| virt.core().meta(MetadataField::Date))
            .map(str::to_string);
        if let Some(date) = date {
            if let Some(years) = self.box_title("Video/allYears") {
                if let Some((year, month)) = Self::year_and_month(&date) {
                    let chain = Self::chain(&[&root, &years, &year, &month], None, mtime);
                    self.add_under(svc, virt, chain, obj).await?;
                }
            }
            if let Some(dates) = self.box_title("Video/allDates") {
                let chain = Self::chain(&[&root, &dates, &date], None, mtime);
                self.add_under(svc, virt, chain, obj).await?;
            }
        }

        self.add_directories_axis(svc, virt, obj, root_path, &root, "Video/allDirectories")
            .await
    }

    async fn add_image(
        &self,
        svc: &ImportService,
        virt: &mut CdsObject,
        obj: &CdsObject,
        root_path: &Path,
    ) -> Result<()> {
        let root = match self.box_title("Photo/photoRoot") {
            Some(root) => root,
            None => return Ok(()),
        };
        let mtime = obj.mtime();

        if let Some(all_photos) = self.box_title("Photo/allPhotos") {
            let chain = Self::chain(&[&root, &all_photos], None, mtime);
            self.add_under(svc, virt, chain, obj).await?;
        }

        if let Some(date) = virt.core().meta(MetadataField::Date).map(str::to_string) {
            if let Some(years) = self.box_title("Photo/allYears") {
                if let Some((year, month)) = Self::year_and_month(&date) {
                    let chain = Self::chain(&[&root, &years, &year, &month], None, mtime);
                    self.add_under(svc, virt, chain, obj).await?;
                }
            }
            if let Some(dates) = self.box_title("Photo/allDates") {
                let chain = Self::chain(&[&root, &dates, &date], None, mtime);
                self.add_under(svc, virt, chain, obj).await?;
            }
        }

        self.add_directories_axis(svc, virt, obj, root_path, &root, "Photo/allDirectories")
            .await
    }
}

#[async_trait]
impl Layout for BuiltinLayout {
    async fn process_object(
        &self,
        svc: &ImportService,
        obj: &CdsObject,
        root_path: &Path,
        content_type: &str,
        _ref_objects: &[ObjectId],
    ) -> Result<()> {
        let Some(item) = obj.as_item() else {
            return Ok(());
        };
        debug!("layout for {}", obj.title());

        let mut virt = obj.clone();
        virt.core_mut().is_virtual = true;
        if obj.id() != INVALID_OBJECT_ID {
            virt.core_mut().ref_id = obj.id();
        }

        let mime_type = item.mime_type.clone();
        if mime_type.starts_with("video") {
            self.add_video(svc, &mut virt, obj, root_path).await?;
        } else if mime_type.starts_with("image") {
            self.add_image(svc, &mut virt, obj, root_path).await?;
        } else if mime_type.starts_with("audio") && content_type != CONTENT_TYPE_PLAYLIST {
            self.add_audio(svc, &mut virt, obj, root_path).await?;
        } else if content_type == CONTENT_TYPE_OGG {
            if obj.core().flag(OBJECT_FLAG_OGG_THEORA) {
                self.add_video(svc, &mut virt, obj, root_path).await?;
            } else {
                self.add_audio(svc, &mut virt, obj, root_path).await?;
            }
        }
        Ok(())
    }
}
