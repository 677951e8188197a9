pub mod upnp_map;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use regex::Regex;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::autoscan::{AutoscanDirectory, MediaMode, ScanSetting};
use crate::config::ServerConfig;
use crate::database::{Database, DbFileType, DEFAULT_CLIENT_GROUP};
use crate::error::{CatalogError, Result};
use crate::layout::{escape_segment, Layout};
use crate::metadata::{DirEntryInfo, MetadataService};
use crate::mime::{MimeResolver, CONTENT_TYPE_OGG, CONTENT_TYPE_PLAYLIST, MIMETYPE_DEFAULT};
use crate::object::{
    CdsContainer, CdsItem, CdsObject, MetadataField, ObjectId, ObjectType, ResourceAttribute,
    ResourcePurpose, ContentHandlerType, FS_ROOT_OBJECT_ID, INVALID_OBJECT_ID, ROOT_OBJECT_ID,
    UPNP_CLASS_CONTAINER_FOLDER, UPNP_CLASS_ITEM, UPNP_CLASS_MUSIC_TRACK, UPNP_CLASS_VIDEO_ITEM,
};
use crate::tasks::TaskInfo;
use crate::update::UpdateAggregator;

/// Per-entry import progression. Later states never fall back to earlier
/// ones; `Broken` wins over everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ImportState {
    New,
    Loaded,
    Created,
    Existing,
    WithLayout,
    ToDelete,
    LayoutDeleted,
    Broken,
}

/// State carried for one filesystem entry during an import run.
#[derive(Debug, Clone)]
pub struct ContentState {
    pub state: ImportState,
    pub dir_entry: DirEntryInfo,
    pub mtime: i64,
    pub object: Option<CdsObject>,
    /// First non-container child, used as fan-art donor.
    pub first_object: Option<CdsObject>,
    item_counter: BTreeMap<ObjectType, usize>,
}

impl ContentState {
    fn new(dir_entry: DirEntryInfo, state: ImportState, mtime: i64) -> Self {
        Self {
            state,
            dir_entry,
            mtime,
            object: None,
            first_object: None,
            item_counter: BTreeMap::new(),
        }
    }

    fn set_object(&mut self, state: ImportState, object: CdsObject) {
        self.state = state;
        self.object = Some(object);
    }

    fn increase_counter(&mut self, object_type: ObjectType) {
        *self.item_counter.entry(object_type).or_insert(0) += 1;
    }

    /// Dominant media kind: at least 4 items of one kind override Mixed.
    pub fn media_mode(&self) -> MediaMode {
        let mut mode = MediaMode::Mixed;
        let mut max = 3usize;
        for (object_type, media) in [
            (ObjectType::Audio, MediaMode::Audio),
            (ObjectType::Image, MediaMode::Image),
            (ObjectType::Video, MediaMode::Video),
        ] {
            let count = self.item_counter.get(&object_type).copied().unwrap_or(0);
            if count > max {
                mode = media;
                max = count;
            }
        }
        mode
    }
}

#[derive(Default)]
struct ImportCaches {
    content_state: BTreeMap<PathBuf, ContentState>,
    /// Read-through cache over virtual container paths; None records a
    /// confirmed database miss.
    container_map: HashMap<String, Option<CdsContainer>>,
    containers_with_fanart: HashSet<ObjectId>,
    active_scan: Option<PathBuf>,
}

/// Discovers media below a root path and keeps the physical tree, the item
/// metadata and the virtual layout coherent with the database.
pub struct ImportService {
    config: Arc<ServerConfig>,
    database: Arc<dyn Database>,
    metadata: Arc<dyn MetadataService>,
    update: Arc<UpdateAggregator>,
    mime: MimeResolver,
    upnp_map: Vec<upnp_map::UpnpMap>,
    layout_mapping: Vec<(Regex, String)>,
    layout: StdMutex<Option<Arc<dyn Layout>>>,
    adir: Option<Arc<AutoscanDirectory>>,
    root_path: PathBuf,
    container_types: BTreeMap<MediaMode, String>,
    caches: Mutex<ImportCaches>,
}

impl ImportService {
    pub fn new(
        config: Arc<ServerConfig>,
        database: Arc<dyn Database>,
        metadata: Arc<dyn MetadataService>,
        update: Arc<UpdateAggregator>,
        adir: Option<Arc<AutoscanDirectory>>,
        root_path: PathBuf,
    ) -> Self {
        let mime = MimeResolver::new(
            config.import.mappings.extension_mimetype.clone(),
            config.import.mappings.ignored_extensions.clone(),
            config.import.mappings.mimetype_contenttype.clone(),
        );
        let upnp_map = upnp_map::UpnpMap::init_map(&config.import.mappings.mimetype_upnpclass);
        let layout_mapping = config
            .import
            .layout
            .mapping
            .iter()
            .filter_map(|(pattern, replacement)| {
                match Regex::new(pattern) {
                    Ok(re) => Some((re, replacement.clone())),
                    Err(e) => {
                        warn!("ignoring bad layout mapping '{pattern}': {e}");
                        None
                    }
                }
            })
            .collect();
        let container_types = adir
            .as_ref()
            .map(|a| a.container_types().clone())
            .unwrap_or_else(crate::autoscan::container_types_defaults);
        Self {
            config,
            database,
            metadata,
            update,
            mime,
            upnp_map,
            layout_mapping,
            layout: StdMutex::new(None),
            adir,
            root_path,
            container_types,
            caches: Mutex::new(ImportCaches::default()),
        }
    }

    pub fn init_layout(&self, layout: Arc<dyn Layout>) {
        let mut slot = self.layout.lock().unwrap();
        if slot.is_none() {
            *slot = Some(layout);
        }
    }

    pub fn destroy_layout(&self) {
        *self.layout.lock().unwrap() = None;
    }

    fn layout_handle(&self) -> Option<Arc<dyn Layout>> {
        self.layout.lock().unwrap().clone()
    }

    pub fn database(&self) -> &Arc<dyn Database> {
        &self.database
    }

    pub fn mime(&self) -> &MimeResolver {
        &self.mime
    }

    pub fn autoscan(&self) -> Option<&Arc<AutoscanDirectory>> {
        self.adir.as_ref()
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    pub fn layout_parent_path(&self) -> bool {
        self.config.import.layout.parent_path
    }

    pub async fn clear_cache(&self) {
        let mut caches = self.caches.lock().await;
        caches.container_map.clear();
        caches.containers_with_fanart.clear();
    }

    /// Run a full import pass for `location`. `current_content` arrives as
    /// the set of object ids previously under the scanned container; ids
    /// still present on disk are removed, so the caller is left with the set
    /// to delete.
    pub async fn do_import(
        &self,
        location: &Path,
        settings: &ScanSetting,
        current_content: &mut HashSet<ObjectId>,
        task: Option<&TaskInfo>,
    ) -> Result<()> {
        debug!("import start {} root {}", location.display(), self.root_path.display());
        {
            let mut caches = self.caches.lock().await;
            match &caches.active_scan {
                None => {
                    caches.content_state.clear();
                    if settings.changed_object.is_some() {
                        caches.container_map.clear();
                        caches.containers_with_fanart.clear();
                    }
                    caches.active_scan = Some(location.to_path_buf());
                }
                Some(active) => {
                    debug!(
                        "additional scan {} while {} active",
                        location.display(),
                        active.display()
                    );
                }
            }
        }

        if !self.root_path.as_os_str().is_empty() {
            if let Ok(root_entry) = DirEntryInfo::for_path(&self.root_path).await {
                let mtime = root_entry.mtime;
                self.cache_state(&self.root_path, root_entry, ImportState::New, mtime, None)
                    .await;
            }
        }

        let root_entry = match DirEntryInfo::for_path(location).await {
            Ok(entry) => entry,
            Err(e) => {
                error!("failed to start import of {}: {}", location.display(), e);
                return Ok(());
            }
        };
        let is_dir = root_entry.is_dir;
        let mtime = root_entry.mtime;
        self.cache_state(
            location,
            root_entry,
            ImportState::New,
            mtime,
            settings.changed_object.clone(),
        )
        .await;

        if is_dir {
            self.read_dir(location, settings, task).await;
        } else {
            self.read_file(location).await;
        }
        self.remove_hidden(settings).await;
        self.create_containers(FS_ROOT_OBJECT_ID).await;
        self.create_items(settings, task).await;
        self.update_fan_art(is_dir).await;
        self.fill_layout(task).await;

        // reconcile: whatever is still referenced stays, the rest is doomed
        {
            let caches = self.caches.lock().await;
            for state in caches.content_state.values() {
                if state.state == ImportState::Existing {
                    if let Some(object) = &state.object {
                        current_content.remove(&object.id());
                    }
                }
            }
        }
        debug!(
            "import of {} left {} object(s) to delete",
            location.display(),
            current_content.len()
        );

        if task.is_none() {
            if let Some(adir) = &self.adir {
                if adir.update_lmt() {
                    self.database.update_autoscan_directory(adir).await?;
                }
            }
        }

        let mut caches = self.caches.lock().await;
        if caches.active_scan.as_deref() == Some(location) {
            caches.active_scan = None;
        }
        Ok(())
    }

    async fn cache_state(
        &self,
        path: &Path,
        dir_entry: DirEntryInfo,
        state: ImportState,
        mtime: i64,
        object: Option<CdsObject>,
    ) -> bool {
        if path.as_os_str().is_empty() {
            return false;
        }
        let mut caches = self.caches.lock().await;
        match caches.content_state.get_mut(path) {
            None => {
                let mut entry = ContentState::new(dir_entry, state, mtime);
                entry.object = object;
                caches.content_state.insert(path.to_path_buf(), entry);
            }
            Some(existing) => {
                // state only ever advances
                let state = existing.state.max(state);
                match object {
                    Some(object) => existing.set_object(state, object),
                    None => existing.state = state,
                }
                if mtime > 0 {
                    existing.mtime = mtime;
                }
            }
        }
        true
    }

    async fn read_dir(&self, location: &Path, settings: &ScanSetting, task: Option<&TaskInfo>) {
        let mut pending = vec![location.to_path_buf()];
        while let Some(dir) = pending.pop() {
            if let Some(task) = task {
                if !task.is_valid() {
                    debug!("import of {} cancelled", dir.display());
                    return;
                }
            }
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) => {
                    error!("failed to iterate {}: {}", dir.display(), e);
                    continue;
                }
            };
            loop {
                let entry = match entries.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(e) => {
                        error!("failed to read entry in {}: {}", dir.display(), e);
                        break;
                    }
                };
                let entry_path = entry.path();
                let info = match DirEntryInfo::for_path(&entry_path).await {
                    Ok(info) => info,
                    Err(e) => {
                        error!("failed to stat {}: {}", entry_path.display(), e);
                        let broken = DirEntryInfo {
                            path: entry_path.clone(),
                            is_dir: false,
                            is_symlink: false,
                            mtime: 0,
                            size: 0,
                        };
                        self.cache_state(&entry_path, broken, ImportState::Broken, 0, None)
                            .await;
                        continue;
                    }
                };
                if self.is_hidden(&entry_path, info.is_dir, &info, settings).await {
                    continue;
                }
                let mtime = info.mtime;
                let is_dir = info.is_dir;
                self.cache_state(&entry_path, info, ImportState::New, mtime, None)
                    .await;
                if is_dir && settings.recursive {
                    pending.push(entry_path);
                }
            }
        }
    }

    /// Cache the target file's ancestors up to the root so their containers
    /// resolve during item creation.
    async fn read_file(&self, location: &Path) {
        let mut current = location.parent().map(Path::to_path_buf);
        while let Some(path) = current {
            if path.as_os_str().is_empty() || path == Path::new("/") {
                break;
            }
            match DirEntryInfo::for_path(&path).await {
                Ok(info) => {
                    let mtime = info.mtime;
                    self.cache_state(&path, info, ImportState::New, mtime, None)
                        .await;
                }
                Err(e) => {
                    error!("failed to navigate up to {}: {}", path.display(), e);
                    break;
                }
            }
            if path == self.root_path {
                break;
            }
            current = path.parent().map(Path::to_path_buf);
        }
    }

    pub async fn is_hidden(
        &self,
        path: &Path,
        is_directory: bool,
        entry: &DirEntryInfo,
        settings: &ScanSetting,
    ) -> bool {
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => return true,
        };
        if name.starts_with('.') && !settings.hidden {
            return true;
        }
        if entry.is_symlink && !settings.follow_symlinks {
            return true;
        }
        let no_media = &self.config.import.nomedia_file;
        if !no_media.is_empty() {
            let marker = if is_directory {
                path.join(no_media)
            } else {
                path.parent().map(|p| p.join(no_media))
                    .unwrap_or_else(|| path.join(no_media))
            };
            if tokio::fs::try_exists(&marker).await.unwrap_or(false) {
                return true;
            }
        }
        false
    }

    async fn remove_hidden(&self, settings: &ScanSetting) {
        let snapshot: Vec<(PathBuf, DirEntryInfo)> = {
            let caches = self.caches.lock().await;
            caches
                .content_state
                .iter()
                .map(|(path, state)| (path.clone(), state.dir_entry.clone()))
                .collect()
        };
        let mut hidden_roots = Vec::new();
        for (path, entry) in snapshot {
            if self.is_hidden(&path, entry.is_dir, &entry, settings).await {
                hidden_roots.push(path);
            }
        }
        if hidden_roots.is_empty() {
            return;
        }
        let mut caches = self.caches.lock().await;
        caches
            .content_state
            .retain(|path, _| !hidden_roots.iter().any(|root| path.starts_with(root)));
    }

    // container handling -------------------------------------------------

    async fn create_containers(&self, parent_container_id: ObjectId) {
        let new_dirs: Vec<PathBuf> = {
            let caches = self.caches.lock().await;
            caches
                .content_state
                .iter()
                .filter(|(_, state)| state.state == ImportState::New && state.dir_entry.is_dir)
                .map(|(path, _)| path.clone())
                .collect()
        };

        for path in new_dirs {
            if let Err(e) = self.create_container_for(parent_container_id, &path).await {
                error!("failed to create container for {}: {}", path.display(), e);
                let mut caches = self.caches.lock().await;
                if let Some(state) = caches.content_state.get_mut(&path) {
                    state.state = ImportState::Broken;
                }
            }
        }
    }

    async fn create_container_for(
        &self,
        parent_container_id: ObjectId,
        path: &Path,
    ) -> Result<()> {
        let (entry, mut known_object) = {
            let caches = self.caches.lock().await;
            match caches.content_state.get(path) {
                Some(state) => (state.dir_entry.clone(), state.object.clone()),
                None => return Ok(()),
            }
        };
        let mut do_update = false;

        // a pre-resolved object means the directory moved: retitle it and
        // re-link cached children to their database rows at the old location
        if let Some(object) = &mut known_object {
            let old_location = object.location().to_path_buf();
            object.core_mut().location = path.to_path_buf();
            object.core_mut().title = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            do_update = true;
            debug!(
                "container moved {} -> {}",
                old_location.display(),
                path.display()
            );
            let children: Vec<PathBuf> = {
                let caches = self.caches.lock().await;
                caches
                    .content_state
                    .keys()
                    .filter(|child| child.parent() == Some(path))
                    .cloned()
                    .collect()
            };
            for child in children {
                let old_child = old_location.join(child.file_name().unwrap_or_default());
                if let Some(child_object) = self
                    .database
                    .find_object_by_path(&old_child, DEFAULT_CLIENT_GROUP, DbFileType::Any)
                    .await?
                {
                    let mut caches = self.caches.lock().await;
                    if let Some(state) = caches.content_state.get_mut(&child) {
                        state.set_object(ImportState::New, child_object);
                    }
                }
            }
        }

        let object = match known_object {
            Some(object) => Some(object),
            None => {
                self.database
                    .find_object_by_path(path, DEFAULT_CLIENT_GROUP, DbFileType::Directory)
                    .await?
            }
        };

        match object {
            Some(CdsObject::Container(mut container)) => {
                if entry.mtime > container.core.mtime {
                    container.core.mtime = entry.mtime;
                    do_update = true;
                }
                let object = CdsObject::Container(container);
                let state = if do_update {
                    self.database.update_object(&object).await?;
                    debug!("container updated {} {}", path.display(), object.id());
                    ImportState::Created
                } else {
                    debug!("container found {} {}", path.display(), object.id());
                    ImportState::Existing
                };
                let mut caches = self.caches.lock().await;
                if let Some(entry) = caches.content_state.get_mut(path) {
                    entry.set_object(state, object);
                }
            }
            Some(other) => {
                let mut caches = self.caches.lock().await;
                if let Some(entry) = caches.content_state.get_mut(path) {
                    entry.set_object(ImportState::Broken, other);
                }
                error!("object at {} is not a container", path.display());
            }
            None => {
                let container = self
                    .create_single_container(parent_container_id, &entry, UPNP_CLASS_CONTAINER_FOLDER)
                    .await?;
                if let Some(container) = container {
                    let mut caches = self.caches.lock().await;
                    if let Some(entry) = caches.content_state.get_mut(path) {
                        entry.set_object(ImportState::Created, CdsObject::Container(container));
                    }
                }
            }
        }
        Ok(())
    }

    /// Create (or find) the physical container chain for a directory entry.
    pub async fn create_single_container(
        &self,
        parent_container_id: ObjectId,
        dir_entry: &DirEntryInfo,
        upnp_class: &str,
    ) -> Result<Option<CdsContainer>> {
        let mut chain = Vec::new();
        for component in dir_entry.path.components() {
            use std::path::Component;
            if let Component::Normal(segment) = component {
                chain.push(CdsContainer::with_title(
                    segment.to_string_lossy().to_string(),
                    upnp_class,
                ));
            }
        }
        let mut created_ids = Vec::new();
        self.add_container_tree(parent_container_id, chain, None, &mut created_ids)
            .await?;

        let tree_key = self.physical_tree_key(&dir_entry.path);
        let mut caches = self.caches.lock().await;
        if let Some(Some(container)) = caches.container_map.get_mut(&tree_key) {
            container.core.mtime = dir_entry.mtime;
            return Ok(Some(container.clone()));
        }
        Ok(None)
    }

    fn physical_tree_key(&self, path: &Path) -> String {
        let mut tree = String::new();
        for component in path.components() {
            use std::path::Component;
            if let Component::Normal(segment) = component {
                tree.push('/');
                tree.push_str(&escape_segment(&segment.to_string_lossy()));
            }
        }
        tree
    }

    // item handling ------------------------------------------------------

    async fn create_items(&self, settings: &ScanSetting, task: Option<&TaskInfo>) {
        let paths: Vec<PathBuf> = {
            let caches = self.caches.lock().await;
            caches.content_state.keys().cloned().collect()
        };

        let mut parent_container: Option<CdsContainer> = None;
        let mut container_path = PathBuf::new();
        let mut last_modified_new_max = 0i64;

        for path in paths {
            if let Some(task) = task {
                if !task.is_valid() {
                    return;
                }
            }
            let (state_val, entry, object) = {
                let caches = self.caches.lock().await;
                match caches.content_state.get(&path) {
                    Some(state) => (
                        state.state,
                        state.dir_entry.clone(),
                        state.object.clone(),
                    ),
                    None => continue,
                }
            };

            // track the current container for items that follow it
            if let Some(CdsObject::Container(container)) = &object {
                if !container_path.as_os_str().is_empty() {
                    let mut caches = self.caches.lock().await;
                    if let Some(state) = caches.content_state.get_mut(&container_path) {
                        state.mtime = last_modified_new_max;
                    }
                    if let Some(adir) = &self.adir {
                        adir.set_current_lmt(
                            &container_path,
                            if last_modified_new_max > 0 {
                                last_modified_new_max
                            } else {
                                1
                            },
                        );
                    }
                }
                parent_container = Some(container.clone());
                container_path = path.clone();
                if let Some(adir) = &self.adir {
                    last_modified_new_max = adir.previous_lmt(&container_path);
                    adir.set_current_lmt(&container_path, 0);
                }
            }

            if state_val != ImportState::New || entry.is_dir {
                continue;
            }

            // items resolve their parent through the cached directory entry
            let cached_parent = {
                let caches = self.caches.lock().await;
                path.parent().and_then(|parent| {
                    caches.content_state.get(parent).and_then(|state| {
                        state.object.as_ref().and_then(|o| o.as_container().cloned())
                    })
                })
            };
            if let Some(parent) = cached_parent {
                parent_container = Some(parent);
            }

            let result = self
                .create_or_update_item(
                    &path,
                    &entry,
                    object,
                    settings,
                    parent_container.as_ref(),
                    &mut last_modified_new_max,
                )
                .await;
            match result {
                Ok(Some(item_object)) => {
                    let media_type = item_object
                        .media_type(self.content_type_of(&item_object).as_deref().unwrap_or(""));
                    let mut caches = self.caches.lock().await;
                    if let Some(parent) = path.parent() {
                        if let Some(parent_state) = caches.content_state.get_mut(parent) {
                            parent_state.increase_counter(media_type);
                            if parent_state.first_object.is_none() {
                                parent_state.first_object = Some(item_object.clone());
                            }
                            if parent_state.mtime < item_object.mtime() {
                                parent_state.mtime = item_object.mtime();
                            }
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error!("failed to import {}: {}", path.display(), e);
                    let mut caches = self.caches.lock().await;
                    if let Some(state) = caches.content_state.get_mut(&path) {
                        state.state = ImportState::Broken;
                    }
                }
            }
        }

        if let Some(adir) = &self.adir {
            if !container_path.as_os_str().is_empty() {
                adir.set_current_lmt(
                    &container_path,
                    if last_modified_new_max > 0 {
                        last_modified_new_max
                    } else {
                        1
                    },
                );
            }
        }
    }

    fn content_type_of(&self, object: &CdsObject) -> Option<String> {
        object
            .as_item()
            .and_then(|item| self.mime.content_type(&item.mime_type))
            .map(str::to_string)
    }

    async fn create_or_update_item(
        &self,
        path: &Path,
        entry: &DirEntryInfo,
        known_object: Option<CdsObject>,
        settings: &ScanSetting,
        parent_container: Option<&CdsContainer>,
        last_modified_new_max: &mut i64,
    ) -> Result<Option<CdsObject>> {
        let object = match known_object {
            Some(object) => Some(object),
            None => {
                self.database
                    .find_object_by_path(path, DEFAULT_CLIENT_GROUP, DbFileType::File)
                    .await?
            }
        };

        if let Some(CdsObject::Item(mut item)) = object {
            let mut is_changed =
                entry.mtime != item.core.mtime || item.core.location != path;
            let force = settings
                .adir
                .as_ref()
                .map(|a| a.force_rescan())
                .unwrap_or(false)
                || settings.rescan_resource;
            if force {
                is_changed = is_changed
                    || item.core.upnp_class.is_empty()
                    || item.core.upnp_class == UPNP_CLASS_ITEM;
            }
            if is_changed {
                if item.mime_type.is_empty()
                    || item.core.upnp_class.is_empty()
                    || item.core.upnp_class == UPNP_CLASS_ITEM
                {
                    let (_, mime_type, upnp_class) = self.mime_for_file(path).await;
                    if !mime_type.is_empty() {
                        item.mime_type = mime_type;
                    }
                    if !upnp_class.is_empty() {
                        item.core.upnp_class = upnp_class;
                    }
                }
                item.core.clear_metadata();
                item.core.clear_auxdata();
                item.core.clear_resources();
                item.core.location = path.to_path_buf();
                item.core.title = self.make_title(path, &item.core.upnp_class);
                self.update_single_item(entry, &mut item).await;
                if *last_modified_new_max < item.core.mtime {
                    *last_modified_new_max = item.core.mtime;
                }
                let object = CdsObject::Item(item);
                self.database.update_object(&object).await?;
                debug!("item changed {} {}", path.display(), object.id());
                let mut caches = self.caches.lock().await;
                if let Some(state) = caches.content_state.get_mut(path) {
                    state.set_object(ImportState::Created, object.clone());
                }
                Ok(Some(object))
            } else {
                if *last_modified_new_max < item.core.mtime {
                    *last_modified_new_max = item.core.mtime;
                }
                let object = CdsObject::Item(item);
                debug!("item found {} {}", path.display(), object.id());
                let mut caches = self.caches.lock().await;
                if let Some(state) = caches.content_state.get_mut(path) {
                    state.set_object(ImportState::Existing, object.clone());
                }
                Ok(Some(object))
            }
        } else {
            // create from scratch
            let (skip, item) = self.create_single_item(entry).await?;
            match item {
                Some(item) => {
                    if *last_modified_new_max < item.core.mtime {
                        *last_modified_new_max = item.core.mtime;
                    }
                    let mut object = CdsObject::Item(item);
                    object.core_mut().parent_id = parent_container
                        .map(|c| c.core.id)
                        .unwrap_or(INVALID_OBJECT_ID);
                    let changed = self.database.add_object(&mut object).await?;
                    if let Some(parent) = changed {
                        self.update.container_changed(parent);
                    }
                    let mut caches = self.caches.lock().await;
                    if let Some(state) = caches.content_state.get_mut(path) {
                        state.set_object(ImportState::Created, object.clone());
                    }
                    Ok(Some(object))
                }
                None => {
                    let mut caches = self.caches.lock().await;
                    if let Some(state) = caches.content_state.get_mut(path) {
                        state.state = ImportState::Broken;
                    }
                    if !skip {
                        error!("no object created for {}", entry.path.display());
                    }
                    Ok(None)
                }
            }
        }
    }

    /// Resolve mime type and initial upnp class for a file.
    async fn mime_for_file(&self, path: &Path) -> (bool, String, String) {
        let (skip, mime_type) = self.mime.mime_for_path(path, MIMETYPE_DEFAULT);
        if mime_type.is_empty() {
            return (skip, String::new(), String::new());
        }
        let mut upnp_class = self.mime_to_upnp_class(&mime_type);
        if upnp_class.is_empty() {
            if self.mime.content_type(&mime_type) == Some(CONTENT_TYPE_OGG) {
                upnp_class = if is_theora(path).await {
                    UPNP_CLASS_VIDEO_ITEM.to_string()
                } else {
                    UPNP_CLASS_MUSIC_TRACK.to_string()
                };
            }
        }
        (skip, mime_type, upnp_class)
    }

    /// First-pass class resolution: pattern prefixes, then the direct map,
    /// then the `type/*` wildcard.
    fn mime_to_upnp_class(&self, mime_type: &str) -> String {
        if let Some(rule) = self
            .upnp_map
            .iter()
            .find(|rule| mime_type.starts_with(&rule.mime_type))
        {
            return rule.upnp_class.clone();
        }
        let direct = &self.config.import.mappings.mimetype_upnpclass;
        if let Some((_, class)) = direct.iter().find(|(mime, _)| mime == mime_type) {
            return class.clone();
        }
        if let Some((primary, _)) = mime_type.split_once('/') {
            let wildcard = format!("{primary}/*");
            if let Some((_, class)) = direct.iter().find(|(mime, _)| *mime == wildcard) {
                return class.clone();
            }
        }
        default_upnp_class_for_mime(mime_type)
    }

    pub async fn create_single_item(
        &self,
        entry: &DirEntryInfo,
    ) -> Result<(bool, Option<CdsItem>)> {
        let (skip, mime_type, upnp_class) = self.mime_for_file(&entry.path).await;
        if mime_type.is_empty() && upnp_class.is_empty() {
            return Ok((skip, None));
        }
        let mut item = CdsItem::new();
        item.core.location = entry.path.clone();
        if !mime_type.is_empty() {
            item.mime_type = mime_type;
        }
        if !upnp_class.is_empty() {
            item.core.upnp_class = upnp_class;
        }
        item.core.title = self.make_title(&entry.path, &item.core.upnp_class);
        self.update_single_item(entry, &mut item).await;
        Ok((skip, Some(item)))
    }

    /// Titles come from the file name; readable-names mode uses the stem
    /// with inner underscores turned into spaces.
    fn make_title(&self, path: &Path, upnp_class: &str) -> String {
        if self.config.import.readable_names && upnp_class != UPNP_CLASS_ITEM {
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            let chars: Vec<char> = stem.chars().collect();
            if chars.len() > 2 {
                let mut title = String::with_capacity(stem.len());
                for (index, c) in chars.iter().enumerate() {
                    if *c == '_' && index > 0 && index < chars.len() - 1 {
                        title.push(' ');
                    } else {
                        title.push(*c);
                    }
                }
                return title;
            }
            return stem;
        }
        path.file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    async fn update_single_item(&self, entry: &DirEntryInfo, item: &mut CdsItem) {
        item.core.mtime = entry.mtime;
        item.core.utime = entry.mtime;
        item.core.size_on_disk = entry.size;

        if let Err(e) = self.metadata.extract_metadata(item, entry).await {
            error!("metadata extraction for {} failed: {}", entry.path.display(), e);
        }
        self.update_item_data(item);
    }

    /// Second pattern pass: some rules filter on metadata that only exists
    /// after extraction (e.g. track numbers).
    pub fn update_item_data(&self, item: &mut CdsItem) {
        if self.config.import.default_date && item.core.meta(MetadataField::Date).is_none() {
            if let Some(date) = chrono::DateTime::from_timestamp(item.core.mtime, 0) {
                item.core
                    .add_meta(MetadataField::Date, date.format("%Y-%m-%dT%H:%M:%S").to_string());
            }
        }
        let mime_type = item.mime_type.clone();
        for rule in &self.upnp_map {
            if rule.is_match(item, &mime_type) {
                item.core.upnp_class = rule.upnp_class.clone();
            }
        }
    }

    // layout -------------------------------------------------------------

    async fn fill_layout(&self, task: Option<&TaskInfo>) {
        let created: Vec<PathBuf> = {
            let mut caches = self.caches.lock().await;
            let paths: Vec<PathBuf> = caches
                .content_state
                .iter()
                .filter(|(_, state)| state.state == ImportState::Created)
                .map(|(path, _)| path.clone())
                .collect();
            for path in &paths {
                if let Some(state) = caches.content_state.get_mut(path) {
                    state.state = ImportState::Loaded;
                }
            }
            paths
        };
        for path in created {
            if let Some(task) = task {
                if !task.is_valid() {
                    return;
                }
            }
            let object = {
                let caches = self.caches.lock().await;
                caches
                    .content_state
                    .get(&path)
                    .and_then(|state| state.object.clone())
            };
            if let Some(object) = object {
                self.fill_single_layout(&object).await;
            }
        }
    }

    /// Run the virtual layout for one object; failures only skip this
    /// object, never the whole run.
    pub async fn fill_single_layout(&self, object: &CdsObject) {
        let Some(layout) = self.layout_handle() else {
            return;
        };
        let Some(item) = object.as_item() else {
            return;
        };
        let content_type = self
            .mime
            .content_type(&item.mime_type)
            .unwrap_or_default()
            .to_string();

        if content_type == CONTENT_TYPE_PLAYLIST {
            // playlist expansion is delegated to an external parser
            warn!(
                "playlist {} not expanded: no playlist parser configured",
                object.location().display()
            );
            return;
        }
        let wanted = self
            .adir
            .as_ref()
            .map(|adir| adir.has_content(&item.core.upnp_class))
            .unwrap_or(true);
        if !wanted {
            debug!(
                "file ignored by media type mask: {}",
                object.location().display()
            );
            return;
        }
        let ref_objects = match self.database.get_ref_objects(object.id()).await {
            Ok(ids) => ids,
            Err(_) => Vec::new(),
        };
        if let Err(e) = layout
            .process_object(self, object, &self.root_path, &content_type, &ref_objects)
            .await
        {
            error!(
                "layout failed for {}: {}",
                object.location().display(),
                e
            );
        }
    }

    // fan-art ------------------------------------------------------------

    async fn update_fan_art(&self, is_dir: bool) {
        let containers: Vec<(PathBuf, CdsContainer, Option<CdsObject>, MediaMode)> = {
            let caches = self.caches.lock().await;
            caches
                .content_state
                .iter()
                .filter_map(|(path, state)| {
                    state.object.as_ref().and_then(|o| o.as_container()).map(
                        |container| {
                            (
                                path.clone(),
                                container.clone(),
                                state.first_object.clone(),
                                state.media_mode(),
                            )
                        },
                    )
                })
                .collect()
        };
        for (path, mut container, first_object, media_mode) in containers {
            if let Err(e) = self
                .assign_fan_art(&mut container, first_object.as_ref(), media_mode, is_dir, 1, false)
                .await
            {
                error!("fan-art for {} failed: {}", path.display(), e);
                continue;
            }
            let mut caches = self.caches.lock().await;
            if let Some(state) = caches.content_state.get_mut(&path) {
                if let Some(CdsObject::Container(stored)) = &mut state.object {
                    *stored = container;
                }
            }
        }
    }

    /// Attach (or repair) the thumbnail resource of a container, preferring
    /// a sidecar image, then the reference object's own thumbnail.
    pub async fn assign_fan_art(
        &self,
        container: &mut CdsContainer,
        ref_obj: Option<&CdsObject>,
        media_mode: MediaMode,
        is_dir: bool,
        count: i32,
        is_new: bool,
    ) -> Result<()> {
        let mut do_update = false;
        let dir_types = self.adir.as_ref().map(|a| a.dir_types).unwrap_or(true);

        if let Some(ref_obj) = ref_obj {
            if is_dir && dir_types && ref_obj.is_item() {
                if let Some(wanted_class) = self.container_types.get(&media_mode) {
                    if &container.core.upnp_class != wanted_class {
                        container.core.upnp_class = wanted_class.clone();
                        do_update = true;
                    }
                }
            }
            if ref_obj.mtime() > container.core.mtime {
                container.core.mtime = ref_obj.mtime();
                do_update = true;
            }
        }

        {
            let caches = self.caches.lock().await;
            if caches.containers_with_fanart.contains(&container.core.id) {
                drop(caches);
                if do_update {
                    self.database
                        .update_object(&CdsObject::Container(container.clone()))
                        .await?;
                }
                return Ok(());
            }
        }

        let mut fanart = container
            .core
            .resource_by_purpose(ResourcePurpose::Thumbnail)
            .cloned();

        // drop stale references before anything else
        let mut stale = false;
        if let Some(res) = &fanart {
            if res.handler_type() != ContentHandlerType::ContainerArt {
                let fanart_obj_id: ObjectId = res
                    .attribute(ResourceAttribute::FanArtObjId)
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(INVALID_OBJECT_ID);
                if fanart_obj_id > ROOT_OBJECT_ID {
                    if let Err(CatalogError::NotFound(_)) =
                        self.database.load_object(fanart_obj_id).await
                    {
                        warn!(
                            "fan-art reference {} of {} is stale",
                            fanart_obj_id,
                            container.core.location.display()
                        );
                        container.core.remove_resource(res.handler_type());
                        do_update = true;
                        stale = true;
                    }
                }
            }
        }
        if stale {
            fanart = None;
        }

        let needs_probe = fanart
            .as_ref()
            .map(|res| is_new || res.handler_type() != ContentHandlerType::ContainerArt)
            .unwrap_or(true);
        if needs_probe {
            let restore = fanart.take();
            if restore.is_some() {
                container.core.clear_resources();
                do_update = true;
            }
            self.metadata.fill_container_art(container).await?;
            match container
                .core
                .resource_by_purpose(ResourcePurpose::Thumbnail)
                .cloned()
            {
                Some(sidecar) => fanart = Some(sidecar),
                None => {
                    if let Some(restore) = restore {
                        container.core.add_resource(restore.clone());
                        fanart = Some(restore);
                    }
                }
            }
        }

        if fanart.is_none() {
            if let Some(ref_obj) = ref_obj {
                let depth = container.core.location.components().count() as i32;
                let parent_count = self.config.import.resources.container_art_parent_count;
                let min_depth = self.config.import.resources.container_art_min_depth;
                let eligible = ref_obj.is_container()
                    || (count < parent_count
                        && container.core.parent_id != ROOT_OBJECT_ID
                        && depth > min_depth);
                if eligible {
                    if let Some(ref_res) = ref_obj
                        .core()
                        .resource_by_purpose(ResourcePurpose::Thumbnail)
                    {
                        let mut donor = ref_res.clone();
                        let donor_id = ref_obj.id();
                        if donor.attribute(ResourceAttribute::ResourceFile).is_none() {
                            if donor_id > ROOT_OBJECT_ID {
                                donor.set_attribute(
                                    ResourceAttribute::FanArtObjId,
                                    donor_id.to_string(),
                                );
                                donor.set_attribute(
                                    ResourceAttribute::FanArtResId,
                                    ref_res.res_id().to_string(),
                                );
                                fanart = Some(donor);
                            }
                        } else {
                            fanart = Some(donor);
                        }
                    }
                }
            }
        }

        if let Some(fanart) = fanart {
            // the thumbnail supersedes all other container resources
            container.core.clear_resources();
            container.core.add_resource(fanart);
            do_update = true;
            let mut caches = self.caches.lock().await;
            caches.containers_with_fanart.insert(container.core.id);
        }
        if do_update {
            self.database
                .update_object(&CdsObject::Container(container.clone()))
                .await?;
        }
        Ok(())
    }

    // virtual container chains -------------------------------------------

    /// Walk a chain of in-memory containers describing a virtual path,
    /// creating missing levels. Ids of created or freshened containers are
    /// appended to `created_ids`; returns the last container id and whether
    /// any level was newly created.
    pub async fn add_container_tree(
        &self,
        parent_container_id: ObjectId,
        chain: Vec<CdsContainer>,
        ref_item: Option<&CdsObject>,
        created_ids: &mut Vec<ObjectId>,
    ) -> Result<(ObjectId, bool)> {
        let mut tree = String::new();
        let mut result = parent_container_id;
        let mut is_new = false;
        let is_virtual = parent_container_id != FS_ROOT_OBJECT_ID;
        let chain_len = chain.len() as i32;
        let min_depth = self.config.import.resources.container_art_min_depth;
        let mut count = 0i32;

        for mut level in chain {
            if level.core.title.is_empty() {
                error!("container chain level without title");
                return Err(CatalogError::InvalidObject(
                    "container chain level without title".to_string(),
                ));
            }
            tree = format!("{tree}/{}", escape_segment(&level.core.title));
            let mut sub_tree = tree.clone();

            if is_virtual {
                for (pattern, replacement) in &self.layout_mapping {
                    tree = pattern.replace_all(&tree, replacement.as_str()).to_string();
                }
                let mut dir_key_values = Vec::new();
                for key in &self.config.import.virtual_directory_keys {
                    if !level.core.is_sub_class(&key.upnp_class) {
                        continue;
                    }
                    if key.field == "LOCATION" {
                        let location = level.core.location.to_string_lossy().to_string();
                        if !location.is_empty() {
                            dir_key_values.push(location);
                            level.core.location = PathBuf::new();
                        }
                    } else if let Some(field) = key.field.strip_suffix("_1") {
                        if let Some(meta) = MetadataField::from_tag(field)
                            .and_then(|f| level.core.meta(f))
                        {
                            dir_key_values.push(meta.to_string());
                        }
                    } else if let Some(field) = MetadataField::from_tag(&key.field) {
                        for value in level.core.meta_group(field) {
                            dir_key_values.push(value.to_string());
                        }
                    }
                }
                sub_tree = if dir_key_values.is_empty() {
                    tree.clone()
                } else {
                    format!("{tree}@{}", dir_key_values.join("@"))
                };
                if !self.config.import.case_sensitive_tags {
                    sub_tree = sub_tree.to_lowercase();
                }
                let cached = {
                    let caches = self.caches.lock().await;
                    caches.container_map.contains_key(&sub_tree)
                        && caches.container_map[&sub_tree].is_some()
                };
                if !cached {
                    let found = self
                        .database
                        .find_object_by_path(
                            Path::new(&sub_tree),
                            DEFAULT_CLIENT_GROUP,
                            DbFileType::Virtual,
                        )
                        .await?;
                    let mut caches = self.caches.lock().await;
                    caches.container_map.insert(
                        sub_tree.clone(),
                        found.and_then(|o| o.as_container().cloned()),
                    );
                }
            }

            let cached_container = {
                let caches = self.caches.lock().await;
                caches.container_map.get(&sub_tree).cloned().flatten()
            };

            match cached_container {
                None => {
                    let title = level.core.title.clone();
                    level.core.remove_meta(MetadataField::Title);
                    level.core.add_meta(MetadataField::Title, title);
                    level.core.parent_id = result;
                    level.core.is_virtual = is_virtual;
                    debug!("creating container chain level {sub_tree} virtual {is_virtual}");
                    let (id, created) = self
                        .database
                        .add_container(result, &sub_tree, &level)
                        .await?;
                    result = id;
                    if created {
                        created_ids.push(id);
                    }
                    let stored = self.database.load_object(result).await?;
                    let stored = stored
                        .as_container()
                        .cloned()
                        .ok_or_else(|| CatalogError::Database(format!(
                            "container {result} resolved to a non-container"
                        )))?;
                    if level.core.mtime > stored.core.mtime {
                        created_ids.push(result);
                    }
                    {
                        let mut caches = self.caches.lock().await;
                        caches
                            .container_map
                            .insert(sub_tree.clone(), Some(stored));
                    }
                    is_new = true;
                }
                Some(existing) => {
                    result = existing.core.id;
                    if level.core.mtime > existing.core.mtime {
                        created_ids.push(result);
                    }
                }
            }

            count += 1;
            if is_virtual {
                let mut target = {
                    let caches = self.caches.lock().await;
                    caches.container_map.get(&sub_tree).cloned().flatten()
                };
                if let Some(target) = &mut target {
                    let level_obj = CdsObject::Container(level.clone());
                    let donor = if ref_item.is_some() && count > min_depth {
                        ref_item
                    } else {
                        Some(&level_obj)
                    };
                    self.assign_fan_art(
                        target,
                        donor,
                        MediaMode::Mixed,
                        false,
                        chain_len - count,
                        is_new,
                    )
                    .await?;
                    let mut caches = self.caches.lock().await;
                    caches
                        .container_map
                        .insert(sub_tree.clone(), Some(target.clone()));
                }
            }
        }
        Ok((result, is_new))
    }

    /// Insert an object into the database and notify eventing about its
    /// parent. Layout engines route their placements through here.
    pub async fn add_object(&self, object: &mut CdsObject, first_child: bool) -> Result<()> {
        object.validate()?;
        let changed = self.database.add_object(object).await?;
        if let Some(parent) = changed {
            self.update.container_changed(parent);
        }
        if first_child {
            self.update.container_changed(object.parent_id());
        }
        Ok(())
    }

    /// Forward freshly created or updated container ids into eventing.
    pub async fn notify_containers_changed(&self, ids: &[ObjectId]) {
        self.update
            .containers_changed(ids, crate::update::FlushPolicy::Spec)
            .await;
    }

    /// Close out a rescan of a single location: commit the LMT and refresh
    /// the parent container's fan-art.
    pub async fn finish_scan(
        &self,
        location: &Path,
        parent: Option<&CdsContainer>,
        lmt: i64,
        first_object: Option<&CdsObject>,
    ) -> Result<()> {
        if let Some(adir) = &self.adir {
            adir.set_current_lmt(location, if lmt > 0 { lmt } else { 1 });
            if let Some(parent) = parent {
                if lmt > 0 {
                    let mut parent = parent.clone();
                    parent.core.mtime = lmt;
                    let count = first_object
                        .map(|obj| {
                            obj.location().components().count() as i32
                                - location.components().count() as i32
                        })
                        .unwrap_or(0);
                    self.database
                        .update_object(&CdsObject::Container(parent.clone()))
                        .await?;
                    self.assign_fan_art(
                        &mut parent,
                        first_object,
                        MediaMode::Mixed,
                        false,
                        count,
                        false,
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }

    /// Object cached for a path during the current run.
    pub async fn object_at(&self, location: &Path) -> Option<CdsObject> {
        let caches = self.caches.lock().await;
        caches
            .content_state
            .get(location)
            .and_then(|state| state.object.clone())
    }
}

fn default_upnp_class_for_mime(mime_type: &str) -> String {
    if mime_type.starts_with("audio/") {
        UPNP_CLASS_MUSIC_TRACK.to_string()
    } else if mime_type.starts_with("video/") {
        UPNP_CLASS_VIDEO_ITEM.to_string()
    } else if mime_type.starts_with("image/") {
        crate::object::UPNP_CLASS_IMAGE_ITEM.to_string()
    } else {
        String::new()
    }
}

/// Sniff an Ogg container for a Theora stream; Theora-in-Ogg renders as
/// video, everything else as audio.
async fn is_theora(path: &Path) -> bool {
    use tokio::io::AsyncReadExt;
    let Ok(mut file) = tokio::fs::File::open(path).await else {
        return false;
    };
    let mut header = [0u8; 512];
    let Ok(read) = file.read(&mut header).await else {
        return false;
    };
    let needle: &[u8] = b"theora";
    header[..read].windows(needle.len()).any(|window| window == needle)
}
