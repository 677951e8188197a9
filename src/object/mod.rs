pub mod resource;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub use resource::{ContentHandlerType, Resource, ResourceAttribute, ResourcePurpose};

use crate::error::{CatalogError, Result};

/// Object id inside the Content Directory. Signed 32-bit by UPnP convention.
pub type ObjectId = i32;

pub const INVALID_OBJECT_ID: ObjectId = -1;
pub const ROOT_OBJECT_ID: ObjectId = 0;
pub const FS_ROOT_OBJECT_ID: ObjectId = 1;

// object type bits used by `CdsObject::create`
pub const OBJECT_TYPE_CONTAINER: u32 = 0x0000_0001;
pub const OBJECT_TYPE_ITEM: u32 = 0x0000_0002;
pub const OBJECT_TYPE_ITEM_EXTERNAL_URL: u32 = 0x0000_0008;

// object flags; bit positions are stable for database interop
pub const OBJECT_FLAG_RESTRICTED: u32 = 0x01;
pub const OBJECT_FLAG_SEARCHABLE: u32 = 0x02;
pub const OBJECT_FLAG_USE_RESOURCE_REF: u32 = 0x04;
pub const OBJECT_FLAG_PERSISTENT_CONTAINER: u32 = 0x08;
pub const OBJECT_FLAG_PLAYLIST_REF: u32 = 0x10;
pub const OBJECT_FLAG_PROXY_URL: u32 = 0x20;
pub const OBJECT_FLAG_ONLINE_SERVICE: u32 = 0x40;
pub const OBJECT_FLAG_OGG_THEORA: u32 = 0x80;

// upnp:class values
pub const UPNP_CLASS_ITEM: &str = "object.item";
pub const UPNP_CLASS_AUDIO_ITEM: &str = "object.item.audioItem";
pub const UPNP_CLASS_MUSIC_TRACK: &str = "object.item.audioItem.musicTrack";
pub const UPNP_CLASS_VIDEO_ITEM: &str = "object.item.videoItem";
pub const UPNP_CLASS_IMAGE_ITEM: &str = "object.item.imageItem";
pub const UPNP_CLASS_PLAYLIST_ITEM: &str = "object.item.playlistItem";
pub const UPNP_CLASS_CONTAINER: &str = "object.container";
pub const UPNP_CLASS_CONTAINER_FOLDER: &str = "object.container.storageFolder";
pub const UPNP_CLASS_MUSIC_ALBUM: &str = "object.container.album.musicAlbum";
pub const UPNP_CLASS_PHOTO_ALBUM: &str = "object.container.album.photoAlbum";
pub const UPNP_CLASS_MUSIC_ARTIST: &str = "object.container.person.musicArtist";
pub const UPNP_CLASS_MUSIC_COMPOSER: &str = "object.container.person.musicComposer";
pub const UPNP_CLASS_MUSIC_GENRE: &str = "object.container.genre.musicGenre";
pub const UPNP_CLASS_PLAYLIST_CONTAINER: &str = "object.container.playlistContainer";

const FLAG_LABELS: &[(&str, u32)] = &[
    ("Restricted", OBJECT_FLAG_RESTRICTED),
    ("Searchable", OBJECT_FLAG_SEARCHABLE),
    ("UseResourceRef", OBJECT_FLAG_USE_RESOURCE_REF),
    ("PersistentContainer", OBJECT_FLAG_PERSISTENT_CONTAINER),
    ("PlaylistRef", OBJECT_FLAG_PLAYLIST_REF),
    ("ProxyUrl", OBJECT_FLAG_PROXY_URL),
    ("OnlineService", OBJECT_FLAG_ONLINE_SERVICE),
    ("OggTheora", OBJECT_FLAG_OGG_THEORA),
];

/// Render a flag word into its label form, e.g. `"Restricted | Searchable"`.
/// Bits without a label are kept as a hex literal so the round trip is exact.
pub fn map_flags(flags: u32) -> String {
    if flags == 0 {
        return "None".to_string();
    }
    let mut remaining = flags;
    let mut labels = Vec::new();
    for (label, bit) in FLAG_LABELS {
        if remaining & bit != 0 {
            labels.push((*label).to_string());
            remaining &= !bit;
        }
    }
    if remaining != 0 {
        labels.push(format!("{remaining:#04x}"));
    }
    labels.join(" | ")
}

/// Parse one flag token: a well-known label (case-insensitive) or an integer
/// literal (`0x..` hex or decimal). Unknown tokens map to 0.
pub fn remap_flags(token: &str) -> u32 {
    let token = token.trim();
    for (label, bit) in FLAG_LABELS {
        if label.eq_ignore_ascii_case(token) {
            return *bit;
        }
    }
    if token.eq_ignore_ascii_case("none") {
        return 0;
    }
    if let Some(hex) = token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
    {
        return u32::from_str_radix(hex, 16).unwrap_or(0);
    }
    token.parse().unwrap_or(0)
}

/// Accumulate a `|`-separated flag expression into a flag word.
pub fn make_flag(expression: &str) -> u32 {
    expression
        .split('|')
        .fold(0, |acc, token| acc | remap_flags(token))
}

/// Seconds since the UNIX epoch for a filesystem timestamp.
pub fn unix_seconds(time: std::time::SystemTime) -> i64 {
    time.duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Metadata fields with well-known DIDL tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetadataField {
    Title,
    Artist,
    AlbumArtist,
    Album,
    Date,
    UpnpDate,
    Genre,
    Description,
    TrackNumber,
    PartNumber,
    Composer,
    Conductor,
    Orchestra,
    AlbumArtUri,
    CreationDate,
}

impl MetadataField {
    pub fn tag(&self) -> &'static str {
        match self {
            MetadataField::Title => "dc:title",
            MetadataField::Artist => "upnp:artist",
            MetadataField::AlbumArtist => "upnp:artist@role[AlbumArtist]",
            MetadataField::Album => "upnp:album",
            MetadataField::Date => "dc:date",
            MetadataField::UpnpDate => "upnp:date",
            MetadataField::Genre => "upnp:genre",
            MetadataField::Description => "dc:description",
            MetadataField::TrackNumber => "upnp:originalTrackNumber",
            MetadataField::PartNumber => "upnp:episodeSeason",
            MetadataField::Composer => "upnp:composer",
            MetadataField::Conductor => "upnp:conductor",
            MetadataField::Orchestra => "upnp:orchestra",
            MetadataField::AlbumArtUri => "upnp:albumArtURI",
            MetadataField::CreationDate => "dc:created",
        }
    }

    /// Fields that may appear at most once per object.
    pub fn is_single_valued(&self) -> bool {
        matches!(
            self,
            MetadataField::Title
                | MetadataField::Date
                | MetadataField::UpnpDate
                | MetadataField::Album
                | MetadataField::Description
        )
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "dc:title" => Some(MetadataField::Title),
            "upnp:artist" => Some(MetadataField::Artist),
            "upnp:artist@role[AlbumArtist]" => Some(MetadataField::AlbumArtist),
            "upnp:album" => Some(MetadataField::Album),
            "dc:date" => Some(MetadataField::Date),
            "upnp:date" => Some(MetadataField::UpnpDate),
            "upnp:genre" => Some(MetadataField::Genre),
            "dc:description" => Some(MetadataField::Description),
            "upnp:originalTrackNumber" => Some(MetadataField::TrackNumber),
            "upnp:episodeSeason" => Some(MetadataField::PartNumber),
            "upnp:composer" => Some(MetadataField::Composer),
            "upnp:conductor" => Some(MetadataField::Conductor),
            "upnp:orchestra" => Some(MetadataField::Orchestra),
            "upnp:albumArtURI" => Some(MetadataField::AlbumArtUri),
            "dc:created" => Some(MetadataField::CreationDate),
            _ => None,
        }
    }
}

/// Coarse media category of an object, used to pick the dominant mode of a
/// physical directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectType {
    Audio,
    Video,
    Image,
    Playlist,
    Folder,
    Unknown,
}

/// Play statistics for an item, persisted per client group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlayStatus {
    pub group: String,
    pub item_id: ObjectId,
    pub play_count: u32,
    /// Seconds since epoch; 0 means never played.
    pub last_played: i64,
    /// Last playback position in seconds.
    pub last_played_position: i64,
    /// Client bookmark position in seconds (Samsung restore).
    pub bookmark_position: i64,
}

/// Fields shared by every Content Directory object.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ObjectCore {
    pub id: ObjectId,
    pub parent_id: ObjectId,
    pub ref_id: ObjectId,
    pub title: String,
    pub upnp_class: String,
    pub location: PathBuf,
    /// File modification time, seconds since epoch.
    pub mtime: i64,
    /// Database update time, seconds since epoch.
    pub utime: i64,
    pub size_on_disk: u64,
    pub is_virtual: bool,
    pub flags: u32,
    pub sort_priority: i32,
    metadata: Vec<(String, String)>,
    auxdata: BTreeMap<String, String>,
    resources: Vec<Resource>,
}

impl ObjectCore {
    fn new() -> Self {
        Self {
            id: INVALID_OBJECT_ID,
            parent_id: INVALID_OBJECT_ID,
            ref_id: INVALID_OBJECT_ID,
            flags: OBJECT_FLAG_RESTRICTED,
            ..Default::default()
        }
    }

    pub fn flag(&self, mask: u32) -> bool {
        self.flags & mask != 0
    }

    pub fn set_flag(&mut self, mask: u32) {
        self.flags |= mask;
    }

    pub fn clear_flag(&mut self, mask: u32) {
        self.flags &= !mask;
    }

    pub fn change_flag(&mut self, mask: u32, value: bool) {
        if value {
            self.set_flag(mask);
        } else {
            self.clear_flag(mask);
        }
    }

    pub fn is_restricted(&self) -> bool {
        self.flag(OBJECT_FLAG_RESTRICTED)
    }

    /// Literal prefix check; UPnP classes are dotted hierarchies and this is
    /// their intended subtype relation.
    pub fn is_sub_class(&self, prefix: &str) -> bool {
        self.upnp_class.starts_with(prefix)
    }

    // metadata -----------------------------------------------------------

    /// Add a well-known field; single-valued fields replace prior entries.
    pub fn add_meta(&mut self, field: MetadataField, value: impl Into<String>) {
        if field.is_single_valued() {
            self.remove_meta(field);
        }
        self.metadata.push((field.tag().to_string(), value.into()));
    }

    /// Add a raw key without single-value enforcement.
    pub fn add_meta_raw(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.push((key.into(), value.into()));
    }

    pub fn remove_meta(&mut self, field: MetadataField) {
        let tag = field.tag();
        self.metadata.retain(|(key, _)| key != tag);
    }

    pub fn meta(&self, field: MetadataField) -> Option<&str> {
        self.meta_raw(field.tag())
    }

    pub fn meta_raw(&self, tag: &str) -> Option<&str> {
        self.metadata
            .iter()
            .find(|(key, _)| key == tag)
            .map(|(_, value)| value.as_str())
    }

    pub fn meta_group(&self, field: MetadataField) -> Vec<&str> {
        let tag = field.tag();
        self.metadata
            .iter()
            .filter(|(key, _)| key == tag)
            .map(|(_, value)| value.as_str())
            .collect()
    }

    /// All metadata grouped by key, in key order; insertion order is kept
    /// within each group.
    pub fn meta_groups(&self) -> BTreeMap<String, Vec<String>> {
        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (key, value) in &self.metadata {
            groups.entry(key.clone()).or_default().push(value.clone());
        }
        groups
    }

    pub fn metadata(&self) -> &[(String, String)] {
        &self.metadata
    }

    pub fn set_metadata(&mut self, metadata: Vec<(String, String)>) {
        self.metadata = metadata;
    }

    pub fn clear_metadata(&mut self) {
        self.metadata.clear();
    }

    // auxdata ------------------------------------------------------------

    pub fn aux(&self, key: &str) -> Option<&str> {
        self.auxdata.get(key).map(String::as_str)
    }

    pub fn set_aux(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.auxdata.insert(key.into(), value.into());
    }

    pub fn auxdata(&self) -> &BTreeMap<String, String> {
        &self.auxdata
    }

    pub fn clear_auxdata(&mut self) {
        self.auxdata.clear();
    }

    // resources ----------------------------------------------------------

    /// Append a resource, assigning `res_id = current size`.
    pub fn add_resource(&mut self, mut resource: Resource) {
        resource.set_res_id(self.resources.len() as i32);
        self.resources.push(resource);
    }

    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    pub fn resources_mut(&mut self) -> &mut [Resource] {
        &mut self.resources
    }

    pub fn clear_resources(&mut self) {
        self.resources.clear();
    }

    /// Exact indexed lookup by res id.
    pub fn resource_by_id(&self, res_id: i32) -> Option<&Resource> {
        self.resources.iter().find(|r| r.res_id() == res_id)
    }

    /// First resource produced by the given handler.
    pub fn resource_by_handler(&self, handler: ContentHandlerType) -> Option<&Resource> {
        self.resources.iter().find(|r| r.handler_type() == handler)
    }

    /// First resource with the given purpose.
    pub fn resource_by_purpose(&self, purpose: ResourcePurpose) -> Option<&Resource> {
        self.resources.iter().find(|r| r.purpose() == purpose)
    }

    pub fn resource_by_purpose_mut(&mut self, purpose: ResourcePurpose) -> Option<&mut Resource> {
        self.resources.iter_mut().find(|r| r.purpose() == purpose)
    }

    pub fn has_resource(&self, handler: ContentHandlerType) -> bool {
        self.resources.iter().any(|r| r.handler_type() == handler)
    }

    pub fn remove_resource(&mut self, handler: ContentHandlerType) {
        if let Some(pos) = self.resources.iter().position(|r| r.handler_type() == handler) {
            self.resources.remove(pos);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    Pure,
    ExternalUrl,
}

/// A playable item. `location` is an absolute filesystem path, or a URL for
/// external items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdsItem {
    pub core: ObjectCore,
    pub kind: ItemKind,
    pub mime_type: String,
    pub part_number: i32,
    pub track_number: i32,
    pub service_id: String,
    pub play_status: Option<PlayStatus>,
}

impl CdsItem {
    pub fn new() -> Self {
        let mut core = ObjectCore::new();
        core.upnp_class = UPNP_CLASS_ITEM.to_string();
        Self {
            core,
            kind: ItemKind::Pure,
            mime_type: String::new(),
            part_number: 0,
            track_number: 0,
            service_id: String::new(),
            play_status: None,
        }
    }

    pub fn new_external() -> Self {
        let mut item = Self::new();
        item.kind = ItemKind::ExternalUrl;
        item
    }
}

impl Default for CdsItem {
    fn default() -> Self {
        Self::new()
    }
}

/// Which kind of automatic scan a container participates in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AutoscanType {
    #[default]
    None,
    Timed,
    INotify,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdsContainer {
    pub core: ObjectCore,
    pub update_id: i32,
    /// -1 means unknown; the renderer omits the attribute then.
    pub child_count: i32,
    pub autoscan_type: AutoscanType,
}

impl CdsContainer {
    pub fn new() -> Self {
        let mut core = ObjectCore::new();
        core.upnp_class = UPNP_CLASS_CONTAINER.to_string();
        Self {
            core,
            update_id: 0,
            child_count: -1,
            autoscan_type: AutoscanType::None,
        }
    }

    pub fn with_title(title: impl Into<String>, upnp_class: impl Into<String>) -> Self {
        let mut container = Self::new();
        container.core.title = title.into();
        container.core.upnp_class = upnp_class.into();
        container
    }
}

impl Default for CdsContainer {
    fn default() -> Self {
        Self::new()
    }
}

/// A Content Directory object: the unit browsed by a control point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CdsObject {
    Container(CdsContainer),
    Item(CdsItem),
}

impl CdsObject {
    /// Select the variant by type bits, like the database layer does when it
    /// materializes rows.
    pub fn create(object_type: u32) -> Result<CdsObject> {
        if object_type & OBJECT_TYPE_CONTAINER != 0 {
            Ok(CdsObject::Container(CdsContainer::new()))
        } else if object_type & OBJECT_TYPE_ITEM_EXTERNAL_URL != 0 {
            Ok(CdsObject::Item(CdsItem::new_external()))
        } else if object_type & OBJECT_TYPE_ITEM != 0 {
            Ok(CdsObject::Item(CdsItem::new()))
        } else {
            Err(CatalogError::InvalidObject(format!(
                "invalid object type: {object_type}"
            )))
        }
    }

    pub fn object_type(&self) -> u32 {
        match self {
            CdsObject::Container(_) => OBJECT_TYPE_CONTAINER,
            CdsObject::Item(item) => match item.kind {
                ItemKind::Pure => OBJECT_TYPE_ITEM,
                ItemKind::ExternalUrl => OBJECT_TYPE_ITEM | OBJECT_TYPE_ITEM_EXTERNAL_URL,
            },
        }
    }

    pub fn core(&self) -> &ObjectCore {
        match self {
            CdsObject::Container(c) => &c.core,
            CdsObject::Item(i) => &i.core,
        }
    }

    pub fn core_mut(&mut self) -> &mut ObjectCore {
        match self {
            CdsObject::Container(c) => &mut c.core,
            CdsObject::Item(i) => &mut i.core,
        }
    }

    pub fn id(&self) -> ObjectId {
        self.core().id
    }

    pub fn parent_id(&self) -> ObjectId {
        self.core().parent_id
    }

    pub fn ref_id(&self) -> ObjectId {
        self.core().ref_id
    }

    pub fn title(&self) -> &str {
        &self.core().title
    }

    pub fn upnp_class(&self) -> &str {
        &self.core().upnp_class
    }

    pub fn location(&self) -> &Path {
        &self.core().location
    }

    pub fn mtime(&self) -> i64 {
        self.core().mtime
    }

    pub fn is_container(&self) -> bool {
        matches!(self, CdsObject::Container(_))
    }

    pub fn is_item(&self) -> bool {
        matches!(self, CdsObject::Item(_))
    }

    pub fn is_pure_item(&self) -> bool {
        matches!(
            self,
            CdsObject::Item(item) if item.kind == ItemKind::Pure
        )
    }

    pub fn is_external_item(&self) -> bool {
        matches!(
            self,
            CdsObject::Item(item) if item.kind == ItemKind::ExternalUrl
        )
    }

    pub fn as_container(&self) -> Option<&CdsContainer> {
        match self {
            CdsObject::Container(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_container_mut(&mut self) -> Option<&mut CdsContainer> {
        match self {
            CdsObject::Container(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_item(&self) -> Option<&CdsItem> {
        match self {
            CdsObject::Item(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_item_mut(&mut self) -> Option<&mut CdsItem> {
        match self {
            CdsObject::Item(i) => Some(i),
            _ => None,
        }
    }

    /// Coarse media category; playlists are recognized by content type, not
    /// by class.
    pub fn media_type(&self, content_type: &str) -> ObjectType {
        let core = self.core();
        if self.is_container() {
            if core.is_sub_class(UPNP_CLASS_PLAYLIST_CONTAINER) {
                return ObjectType::Playlist;
            }
            return ObjectType::Folder;
        }
        if content_type == crate::mime::CONTENT_TYPE_PLAYLIST
            || core.is_sub_class(UPNP_CLASS_PLAYLIST_ITEM)
        {
            return ObjectType::Playlist;
        }
        if core.is_sub_class(UPNP_CLASS_AUDIO_ITEM) {
            return ObjectType::Audio;
        }
        if core.is_sub_class(UPNP_CLASS_VIDEO_ITEM) {
            return ObjectType::Video;
        }
        if core.is_sub_class(UPNP_CLASS_IMAGE_ITEM) {
            return ObjectType::Image;
        }
        ObjectType::Unknown
    }

    /// Minimum requirements for persisting an object.
    pub fn validate(&self) -> Result<()> {
        let core = self.core();
        if core.title.is_empty() {
            return Err(CatalogError::InvalidObject("missing title".to_string()));
        }
        if core.upnp_class.is_empty() {
            return Err(CatalogError::InvalidObject(
                "missing upnp class".to_string(),
            ));
        }
        Ok(())
    }

    /// Structural equality over the DIDL-visible surface; `exactly` extends
    /// the comparison to location, times, size, virtual flag, auxdata and the
    /// full flag word.
    pub fn equals(&self, other: &CdsObject, exactly: bool) -> bool {
        let a = self.core();
        let b = other.core();
        if a.id != b.id
            || a.parent_id != b.parent_id
            || a.is_restricted() != b.is_restricted()
            || a.title != b.title
            || a.upnp_class != b.upnp_class
            || a.sort_priority != b.sort_priority
            || a.resources() != b.resources()
            || a.metadata() != b.metadata()
        {
            return false;
        }
        if !exactly {
            return true;
        }
        a.location == b.location
            && a.mtime == b.mtime
            && a.size_on_disk == b.size_on_disk
            && a.is_virtual == b.is_virtual
            && a.auxdata() == b.auxdata()
            && a.flags == b.flags
    }
}
