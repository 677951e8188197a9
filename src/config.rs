use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::didl::transcoding::TranscodingFilter;
use crate::error::{CatalogError, Result};

/// Which virtual-layout engine places items into browse trees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LayoutType {
    #[default]
    Builtin,
    Structured,
    Js,
    None,
}

/// Top-level configuration consumed by the content core.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    pub import: ImportConfig,
    pub upnp: UpnpConfig,
    pub transcoding: TranscodingConfig,
}

impl ServerConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| CatalogError::Config(e.to_string()))
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path).await?;
        Self::from_toml_str(&raw)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    pub follow_symlinks: bool,
    pub hidden_files: bool,
    /// Replace underscores in file stems with spaces when titling items.
    pub readable_names: bool,
    /// When false, virtual container paths fold to lowercase for lookup.
    pub case_sensitive_tags: bool,
    /// Add a dc:date derived from mtime when the item carries none.
    pub default_date: bool,
    /// Marker file name that hides the directory containing it.
    pub nomedia_file: String,
    pub mappings: MappingsConfig,
    pub resources: ResourcesConfig,
    pub layout: LayoutConfig,
    pub autoscan: AutoscanConfig,
    /// Disambiguation keys appended to virtual container paths.
    pub virtual_directory_keys: Vec<VirtualDirectoryKey>,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            follow_symlinks: false,
            hidden_files: false,
            readable_names: true,
            case_sensitive_tags: true,
            default_date: true,
            nomedia_file: ".nomedia".to_string(),
            mappings: MappingsConfig::default(),
            resources: ResourcesConfig::default(),
            layout: LayoutConfig::default(),
            autoscan: AutoscanConfig::default(),
            virtual_directory_keys: Vec::new(),
        }
    }
}

/// One disambiguation key: for items of `upnp_class`, append the value of
/// `field` to the virtual path. `field` is a metadata tag, a tag with `_1`
/// suffix (first value only), or the literal `LOCATION`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualDirectoryKey {
    pub upnp_class: String,
    pub field: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MappingsConfig {
    /// Extension overrides applied before the built-in table.
    pub extension_mimetype: BTreeMap<String, String>,
    pub ignored_extensions: Vec<String>,
    /// mime type -> internal content type; empty means built-in defaults.
    pub mimetype_contenttype: Vec<(String, String)>,
    /// Ordered `mime-prefix[;filter…] -> upnp class` patterns; first match
    /// wins.
    pub mimetype_upnpclass: Vec<(String, String)>,
    pub contenttype_dlnaprofile: Vec<DlnaProfileMapping>,
    pub contenttype_dlnatransfer: BTreeMap<String, String>,
}

/// One DLNA profile mapping: content type (or `ct-videoCodec-audioCodec`
/// legacy key) plus optional resource-attribute filters.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DlnaProfileMapping {
    pub from: String,
    pub to: String,
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourcesConfig {
    /// Handler names in rendering order; unlisted handlers come after.
    pub order: Vec<String>,
    /// Fan-art propagation: only containers this close to the donor item
    /// inherit its thumbnail.
    pub container_art_parent_count: i32,
    /// Fan-art propagation: minimum depth of the container location.
    pub container_art_min_depth: i32,
    /// Sidecar image names probed by the container-art handler.
    pub container_art_names: Vec<String>,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            order: Vec::new(),
            container_art_parent_count: 2,
            container_art_min_depth: 2,
            container_art_names: vec![
                "folder.jpg".to_string(),
                "cover.jpg".to_string(),
                "poster.jpg".to_string(),
            ],
        }
    }
}

/// Named layout box: localized title plus enablement, and the partition size
/// for structured (ABC) boxes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BoxSetting {
    pub title: String,
    pub enabled: bool,
    pub upnp_class: Option<String>,
    pub size: i32,
}

impl Default for BoxSetting {
    fn default() -> Self {
        Self {
            title: String::new(),
            enabled: true,
            upnp_class: None,
            size: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    pub layout_type: LayoutType,
    /// Regex substitutions applied to virtual container paths.
    pub mapping: Vec<(String, String)>,
    /// Regex genre normalization, case-insensitive.
    pub genre_map: Vec<(String, String)>,
    /// Make /…/Directories relative to the parent of the autoscan root.
    pub parent_path: bool,
    pub boxes: BTreeMap<String, BoxSetting>,
}

impl LayoutConfig {
    fn default_boxes() -> BTreeMap<String, BoxSetting> {
        let mut boxes = BTreeMap::new();
        let defaults: &[(&str, &str, bool, i32)] = &[
            ("Audio/audioRoot", "Audio", true, 1),
            ("Audio/allAudio", "All Audio", true, 1),
            ("Audio/allArtists", "Artists", true, 1),
            ("Audio/allAlbums", "Albums", true, 1),
            ("Audio/allGenres", "Genres", true, 1),
            ("Audio/allComposers", "Composers", true, 1),
            ("Audio/allYears", "Year", true, 1),
            ("Audio/allDirectories", "Directories", true, 1),
            ("Audio/allSongs", "All Songs", true, 1),
            ("Audio/allTracks", "All - full name", true, 1),
            ("AudioInitial/audioBook", "AudioBooks", false, 1),
            ("AudioInitial/abc", "ABC", true, 6),
            ("Video/videoRoot", "Video", true, 1),
            ("Video/allVideo", "All Video", true, 1),
            ("Video/allDates", "Date", true, 1),
            ("Video/allYears", "Year", true, 1),
            ("Video/allDirectories", "Directories", true, 1),
            ("Photo/photoRoot", "Photos", true, 1),
            ("Photo/allPhotos", "All Photos", true, 1),
            ("Photo/allDates", "Date", true, 1),
            ("Photo/allYears", "Year", true, 1),
            ("Photo/allDirectories", "Directories", true, 1),
        ];
        for (key, title, enabled, size) in defaults {
            boxes.insert(
                (*key).to_string(),
                BoxSetting {
                    title: (*title).to_string(),
                    enabled: *enabled,
                    upnp_class: None,
                    size: *size,
                },
            );
        }
        boxes
    }

    /// Title of an enabled box; None when the box is disabled or unknown.
    pub fn box_title(&self, key: &str) -> Option<&str> {
        self.boxes
            .get(key)
            .filter(|b| b.enabled)
            .map(|b| b.title.as_str())
    }

    pub fn box_size(&self, key: &str) -> i32 {
        self.boxes.get(key).map(|b| b.size).unwrap_or(1)
    }
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            layout_type: LayoutType::Builtin,
            mapping: Vec::new(),
            genre_map: Vec::new(),
            parent_path: false,
            boxes: Self::default_boxes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscanConfig {
    pub use_inotify: bool,
    pub timed_list: Vec<AutoscanEntryConfig>,
    pub inotify_list: Vec<AutoscanEntryConfig>,
}

impl Default for AutoscanConfig {
    fn default() -> Self {
        Self {
            use_inotify: true,
            timed_list: Vec::new(),
            inotify_list: Vec::new(),
        }
    }
}

/// A configured (persistent) autoscan location.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscanEntryConfig {
    pub location: PathBuf,
    pub recursive: bool,
    pub hidden: bool,
    pub follow_symlinks: bool,
    pub interval_secs: u64,
}

impl Default for AutoscanEntryConfig {
    fn default() -> Self {
        Self {
            location: PathBuf::new(),
            recursive: true,
            hidden: false,
            follow_symlinks: false,
            interval_secs: 1800,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpnpConfig {
    /// Emit one element per metadata value; false joins with the separator.
    pub multi_value: bool,
    pub entry_separator: String,
    /// Cap on rendered sec:CaptionInfoEx elements.
    pub caption_count: i32,
    /// Offset subtracted from restored Samsung bookmarks, seconds.
    pub bookmark_offset_secs: i64,
    pub title_properties: BTreeMap<String, String>,
    pub title_namespaces: BTreeMap<String, String>,
    pub album_properties: BTreeMap<String, String>,
    pub album_namespaces: BTreeMap<String, String>,
    pub artist_properties: BTreeMap<String, String>,
    pub artist_namespaces: BTreeMap<String, String>,
    pub genre_properties: BTreeMap<String, String>,
    pub genre_namespaces: BTreeMap<String, String>,
    pub playlist_properties: BTreeMap<String, String>,
    pub playlist_namespaces: BTreeMap<String, String>,
}

impl Default for UpnpConfig {
    fn default() -> Self {
        let mut album_properties = BTreeMap::new();
        album_properties.insert("dc:creator".to_string(), "upnp:artist".to_string());
        album_properties.insert("upnp:artist".to_string(), "upnp:artist".to_string());
        let mut genre_properties = BTreeMap::new();
        genre_properties.insert("upnp:genre".to_string(), "upnp:genre".to_string());
        Self {
            multi_value: true,
            entry_separator: "; ".to_string(),
            caption_count: 1,
            bookmark_offset_secs: 10,
            title_properties: BTreeMap::new(),
            title_namespaces: BTreeMap::new(),
            album_properties,
            album_namespaces: BTreeMap::new(),
            artist_properties: BTreeMap::new(),
            artist_namespaces: BTreeMap::new(),
            genre_properties,
            genre_namespaces: BTreeMap::new(),
            playlist_properties: BTreeMap::new(),
            playlist_namespaces: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TranscodingConfig {
    pub profiles: Vec<TranscodingFilter>,
}
