use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{CatalogError, Result};
use crate::object::{
    CdsObject, ObjectId, INVALID_OBJECT_ID, UPNP_CLASS_AUDIO_ITEM, UPNP_CLASS_CONTAINER,
    UPNP_CLASS_IMAGE_ITEM, UPNP_CLASS_MUSIC_ALBUM, UPNP_CLASS_PHOTO_ALBUM, UPNP_CLASS_VIDEO_ITEM,
};
use crate::timer::{TimerKind, TimerParameter};

pub const INVALID_SCAN_ID: i32 = -1;

/// How an autoscan location is kept up to date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScanMode {
    Timed,
    INotify,
}

impl ScanMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanMode::Timed => "timed",
            ScanMode::INotify => "inotify",
        }
    }

    pub fn from_str(mode: &str) -> Option<Self> {
        match mode {
            "timed" => Some(ScanMode::Timed),
            "inotify" => Some(ScanMode::INotify),
            _ => None,
        }
    }
}

/// Dominant media kind of a physical directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MediaMode {
    Audio,
    Video,
    Image,
    Mixed,
}

/// Default container class per media mode, applied to physical directories
/// when directory typing is on. Mixed directories keep their class.
pub fn container_types_defaults() -> BTreeMap<MediaMode, String> {
    let mut map = BTreeMap::new();
    map.insert(MediaMode::Audio, UPNP_CLASS_MUSIC_ALBUM.to_string());
    map.insert(MediaMode::Image, UPNP_CLASS_PHOTO_ALBUM.to_string());
    map.insert(MediaMode::Video, UPNP_CLASS_CONTAINER.to_string());
    map
}

/// Bitmask of media kinds an autoscan imports. 0 means everything.
pub mod media_type {
    pub const ANY: u32 = 0;
    pub const AUDIO: u32 = 0x01;
    pub const VIDEO: u32 = 0x02;
    pub const IMAGE: u32 = 0x04;
}

#[derive(Debug, Default)]
struct LmtState {
    /// Committed at the end of the previous complete scan.
    previous: i64,
    /// Max mtime observed during the in-progress scan.
    current: i64,
    per_path: HashMap<PathBuf, i64>,
}

/// A filesystem location the server watches, with scan configuration and the
/// runtime state of in-progress scans.
///
/// Shared as `Arc` between the registry, the watcher and running tasks; the
/// mutable runtime state uses atomics and a short-lived mutex.
#[derive(Debug)]
pub struct AutoscanDirectory {
    location: PathBuf,
    mode: ScanMode,
    pub recursive: bool,
    pub hidden: bool,
    pub follow_symlinks: bool,
    interval: Duration,
    pub media_types: u32,
    persistent: AtomicBool,
    force_rescan: AtomicBool,
    /// Apply per-media-mode container classes to physical directories.
    pub dir_types: bool,
    container_types: BTreeMap<MediaMode, String>,

    scan_id: AtomicI32,
    object_id: AtomicI32,
    database_id: AtomicI32,

    task_count: AtomicI32,
    active_scan_count: AtomicU32,
    lmt: Mutex<LmtState>,
}

impl AutoscanDirectory {
    pub fn new(location: PathBuf, mode: ScanMode) -> Self {
        Self {
            location,
            mode,
            recursive: true,
            hidden: false,
            follow_symlinks: false,
            interval: Duration::from_secs(1800),
            media_types: media_type::ANY,
            persistent: AtomicBool::new(false),
            force_rescan: AtomicBool::new(false),
            dir_types: true,
            container_types: container_types_defaults(),
            scan_id: AtomicI32::new(INVALID_SCAN_ID),
            object_id: AtomicI32::new(INVALID_OBJECT_ID),
            database_id: AtomicI32::new(INVALID_OBJECT_ID),
            task_count: AtomicI32::new(0),
            active_scan_count: AtomicU32::new(0),
            lmt: Mutex::new(LmtState::default()),
        }
    }

    pub fn with_options(
        location: PathBuf,
        mode: ScanMode,
        recursive: bool,
        hidden: bool,
        interval: Duration,
    ) -> Self {
        let mut dir = Self::new(location, mode);
        dir.recursive = recursive;
        dir.hidden = hidden;
        dir.interval = interval;
        dir
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    pub fn set_location(&mut self, location: PathBuf) {
        self.location = location;
    }

    pub fn mode(&self) -> ScanMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: ScanMode) {
        self.mode = mode;
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent.load(Ordering::SeqCst)
    }

    pub fn set_persistent(&self, value: bool) {
        self.persistent.store(value, Ordering::SeqCst);
    }

    pub fn force_rescan(&self) -> bool {
        self.force_rescan.load(Ordering::SeqCst)
    }

    pub fn set_force_rescan(&self, value: bool) {
        self.force_rescan.store(value, Ordering::SeqCst);
    }

    pub fn scan_id(&self) -> i32 {
        self.scan_id.load(Ordering::SeqCst)
    }

    pub fn set_scan_id(&self, id: i32) {
        self.scan_id.store(id, Ordering::SeqCst);
    }

    pub fn object_id(&self) -> ObjectId {
        self.object_id.load(Ordering::SeqCst)
    }

    pub fn set_object_id(&self, id: ObjectId) {
        self.object_id.store(id, Ordering::SeqCst);
    }

    pub fn database_id(&self) -> ObjectId {
        self.database_id.load(Ordering::SeqCst)
    }

    pub fn set_database_id(&self, id: ObjectId) {
        self.database_id.store(id, Ordering::SeqCst);
    }

    pub fn timer_parameter(&self) -> TimerParameter {
        TimerParameter {
            kind: TimerKind::Autoscan,
            id: self.scan_id(),
        }
    }

    pub fn container_types(&self) -> &BTreeMap<MediaMode, String> {
        &self.container_types
    }

    /// Whether items of this class are imported under the configured media
    /// type mask.
    pub fn has_content(&self, upnp_class: &str) -> bool {
        if self.media_types == media_type::ANY {
            return true;
        }
        (self.media_types & media_type::AUDIO != 0 && upnp_class.starts_with(UPNP_CLASS_AUDIO_ITEM))
            || (self.media_types & media_type::VIDEO != 0
                && upnp_class.starts_with(UPNP_CLASS_VIDEO_ITEM))
            || (self.media_types & media_type::IMAGE != 0
                && upnp_class.starts_with(UPNP_CLASS_IMAGE_ITEM))
    }

    // task bookkeeping ---------------------------------------------------

    pub fn task_count(&self) -> i32 {
        self.task_count.load(Ordering::SeqCst)
    }

    pub fn increment_task_count(&self) {
        self.task_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn decrement_task_count(&self) {
        self.task_count.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn active_scan_count(&self) -> u32 {
        self.active_scan_count.load(Ordering::SeqCst)
    }

    // two-phase last-modified tracking -----------------------------------

    /// Record the observed mtime for a directory inside the running scan.
    /// Passing `lmt == 0` opens the directory's scan and bumps the active
    /// scan counter; the first non-zero value closes it again.
    pub fn set_current_lmt(&self, location: &Path, lmt: i64) {
        let mut first_scan = false;
        let mut active_scan = false;
        {
            let mut state = self.lmt.lock().unwrap();
            if !location.as_os_str().is_empty() {
                match state.per_path.get(location) {
                    None => {
                        first_scan = true;
                        active_scan = true;
                    }
                    Some(&prev) => {
                        if prev > 0 {
                            first_scan = true;
                        }
                        if prev == 0 {
                            active_scan = true;
                        }
                    }
                }
                state.per_path.insert(location.to_path_buf(), lmt);
            }
            if lmt != 0 && lmt > state.current {
                state.current = lmt;
            }
        }
        if lmt == 0 {
            if first_scan {
                self.active_scan_count.fetch_add(1, Ordering::SeqCst);
            }
        } else if active_scan {
            // close only scans we opened
            let _ = self
                .active_scan_count
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                    count.checked_sub(1)
                });
        }
    }

    /// Commit the current scan's max mtime once no directory scan is active.
    /// Returns true when the committed value changed and should be persisted.
    pub fn update_lmt(&self) -> bool {
        if self.active_scan_count() != 0 {
            return false;
        }
        let mut state = self.lmt.lock().unwrap();
        let changed = state.previous != state.current;
        state.previous = state.current;
        changed
    }

    /// Last committed mtime for a directory, falling back to the scan-wide
    /// previous value.
    pub fn previous_lmt(&self, location: &Path) -> i64 {
        let state = self.lmt.lock().unwrap();
        if !location.as_os_str().is_empty() {
            if let Some(&lmt) = state.per_path.get(location) {
                if lmt > 0 {
                    return lmt;
                }
            }
        }
        state.previous
    }

    pub fn previous_scan_lmt(&self) -> i64 {
        self.lmt.lock().unwrap().previous
    }

    /// Copy configuration (not runtime counters) from another directory,
    /// used when the UI edits an existing autoscan in place.
    pub fn copy_settings_from(&mut self, other: &AutoscanDirectory) {
        self.location = other.location.clone();
        self.mode = other.mode;
        self.recursive = other.recursive;
        self.hidden = other.hidden;
        self.follow_symlinks = other.follow_symlinks;
        self.interval = other.interval;
        self.media_types = other.media_types;
        self.dir_types = other.dir_types;
        self.container_types = other.container_types.clone();
        self.set_persistent(other.is_persistent());
    }
}

/// Per-import settings handed through the orchestrator into the import
/// service; `changed_object` carries a known-stale object for re-import.
#[derive(Clone, Default)]
pub struct ScanSetting {
    pub adir: Option<Arc<AutoscanDirectory>>,
    pub recursive: bool,
    pub hidden: bool,
    pub follow_symlinks: bool,
    pub rescan_resource: bool,
    pub changed_object: Option<CdsObject>,
}

impl ScanSetting {
    pub fn from_autoscan(adir: &Arc<AutoscanDirectory>) -> Self {
        Self {
            adir: Some(Arc::clone(adir)),
            recursive: adir.recursive,
            hidden: adir.hidden,
            follow_symlinks: adir.follow_symlinks,
            rescan_resource: false,
            changed_object: None,
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    list: Vec<Arc<AutoscanDirectory>>,
    by_scan_id: HashMap<i32, Arc<AutoscanDirectory>>,
}

/// Two indexes over the configured autoscans: a sequential list for UI
/// ordering and a scan-id map for event routing.
#[derive(Default)]
pub struct AutoscanRegistry {
    inner: Mutex<RegistryInner>,
}

impl AutoscanRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a directory. With `index == None` a fresh scan id is
    /// assigned; an explicit index installs at that id and marks the entry
    /// persistent. Duplicate locations are rejected.
    pub fn add(&self, dir: Arc<AutoscanDirectory>, index: Option<i32>) -> Result<i32> {
        let mut inner = self.inner.lock().unwrap();
        if inner
            .list
            .iter()
            .any(|existing| existing.location() == dir.location())
        {
            return Err(CatalogError::DuplicateAutoscan(
                dir.location().to_path_buf(),
            ));
        }
        let scan_id = match index {
            None => inner
                .by_scan_id
                .keys()
                .max()
                .map(|max| max + 1)
                .unwrap_or(0),
            Some(index) => {
                dir.set_persistent(true);
                index
            }
        };
        dir.set_scan_id(scan_id);
        inner.list.push(Arc::clone(&dir));
        inner.by_scan_id.insert(scan_id, dir);
        Ok(scan_id)
    }

    pub fn by_scan_id(&self, scan_id: i32) -> Option<Arc<AutoscanDirectory>> {
        self.inner.lock().unwrap().by_scan_id.get(&scan_id).cloned()
    }

    pub fn by_object_id(&self, object_id: ObjectId) -> Option<Arc<AutoscanDirectory>> {
        self.inner
            .lock()
            .unwrap()
            .list
            .iter()
            .find(|dir| dir.object_id() == object_id)
            .cloned()
    }

    pub fn by_location(&self, location: &Path) -> Option<Arc<AutoscanDirectory>> {
        self.inner
            .lock()
            .unwrap()
            .list
            .iter()
            .find(|dir| dir.location() == location)
            .cloned()
    }

    pub fn list(&self) -> Vec<Arc<AutoscanDirectory>> {
        self.inner.lock().unwrap().list.clone()
    }

    pub fn remove(&self, scan_id: i32) -> Option<Arc<AutoscanDirectory>> {
        let mut inner = self.inner.lock().unwrap();
        let removed = inner.by_scan_id.remove(&scan_id)?;
        inner.list.retain(|dir| dir.scan_id() != scan_id);
        removed.set_scan_id(INVALID_SCAN_ID);
        Some(removed)
    }

    /// Remove (and return) every entry whose location lies under `parent`.
    /// Persistent entries are skipped unless `include_persistent`; an entry
    /// whose location exactly equals `parent` follows the same rule.
    pub fn remove_if_subdir(
        &self,
        parent: &Path,
        include_persistent: bool,
    ) -> Vec<Arc<AutoscanDirectory>> {
        let mut inner = self.inner.lock().unwrap();
        let mut removed = Vec::new();
        let mut kept = Vec::with_capacity(inner.list.len());
        for dir in inner.list.drain(..) {
            if dir.location().starts_with(parent)
                && (include_persistent || !dir.is_persistent())
            {
                removed.push(dir);
            } else {
                kept.push(dir);
            }
        }
        inner.list = kept;
        for dir in &removed {
            inner.by_scan_id.remove(&dir.scan_id());
            dir.set_scan_id(INVALID_SCAN_ID);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adir(path: &str, mode: ScanMode) -> Arc<AutoscanDirectory> {
        Arc::new(AutoscanDirectory::new(PathBuf::from(path), mode))
    }

    #[test]
    fn add_assigns_sequential_scan_ids() {
        let registry = AutoscanRegistry::new();
        let a = adir("/media/a", ScanMode::Timed);
        let b = adir("/media/b", ScanMode::INotify);
        assert_eq!(registry.add(Arc::clone(&a), None).unwrap(), 0);
        assert_eq!(registry.add(Arc::clone(&b), None).unwrap(), 1);
        assert_eq!(registry.by_scan_id(1).unwrap().location(), Path::new("/media/b"));
    }

    #[test]
    fn duplicate_location_is_rejected() {
        let registry = AutoscanRegistry::new();
        registry.add(adir("/media/a", ScanMode::Timed), None).unwrap();
        let err = registry
            .add(adir("/media/a", ScanMode::Timed), None)
            .unwrap_err();
        assert!(matches!(err, CatalogError::DuplicateAutoscan(_)));
    }

    #[test]
    fn explicit_index_marks_persistent() {
        let registry = AutoscanRegistry::new();
        let dir = adir("/media/a", ScanMode::INotify);
        registry.add(Arc::clone(&dir), Some(7)).unwrap();
        assert!(dir.is_persistent());
        assert_eq!(dir.scan_id(), 7);
    }

    #[test]
    fn remove_if_subdir_skips_persistent_unless_told() {
        let registry = AutoscanRegistry::new();
        let plain = adir("/media/music/rock", ScanMode::Timed);
        let persistent = adir("/media/music/jazz", ScanMode::INotify);
        persistent.set_persistent(true);
        registry.add(Arc::clone(&plain), None).unwrap();
        registry.add(Arc::clone(&persistent), None).unwrap();

        let removed = registry.remove_if_subdir(Path::new("/media/music"), false);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].location(), Path::new("/media/music/rock"));
        assert!(registry.by_location(Path::new("/media/music/jazz")).is_some());

        let removed = registry.remove_if_subdir(Path::new("/media/music"), true);
        assert_eq!(removed.len(), 1);
        assert!(registry.list().is_empty());
    }

    #[test]
    fn lmt_two_phase_commit() {
        let dir = AutoscanDirectory::new(PathBuf::from("/media"), ScanMode::Timed);

        // open two directory scans
        dir.set_current_lmt(Path::new("/media"), 0);
        dir.set_current_lmt(Path::new("/media/sub"), 0);
        assert_eq!(dir.active_scan_count(), 2);

        dir.set_current_lmt(Path::new("/media/sub"), 500);
        assert_eq!(dir.active_scan_count(), 1);
        // commit attempt while a scan is active leaves previous untouched
        assert!(!dir.update_lmt());
        assert_eq!(dir.previous_scan_lmt(), 0);

        dir.set_current_lmt(Path::new("/media"), 300);
        assert_eq!(dir.active_scan_count(), 0);
        assert!(dir.update_lmt());
        assert_eq!(dir.previous_scan_lmt(), 500);

        // second commit with no new observations reports unchanged
        assert!(!dir.update_lmt());
    }

    #[test]
    fn previous_lmt_prefers_per_path_value() {
        let dir = AutoscanDirectory::new(PathBuf::from("/media"), ScanMode::Timed);
        dir.set_current_lmt(Path::new("/media/sub"), 0);
        dir.set_current_lmt(Path::new("/media/sub"), 700);
        assert!(dir.update_lmt());
        assert_eq!(dir.previous_lmt(Path::new("/media/sub")), 700);
        assert_eq!(dir.previous_lmt(Path::new("/media/other")), 700);
    }

    #[test]
    fn media_type_mask_filters_classes() {
        let mut dir = AutoscanDirectory::new(PathBuf::from("/media"), ScanMode::Timed);
        assert!(dir.has_content("object.item.videoItem"));
        dir.media_types = media_type::AUDIO;
        assert!(dir.has_content("object.item.audioItem.musicTrack"));
        assert!(!dir.has_content("object.item.videoItem"));
    }
}
