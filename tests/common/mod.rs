#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use mediatheca::autoscan::{AutoscanDirectory, ScanMode};
use mediatheca::database::{ChangedContainers, Database, DbFileType};
use mediatheca::error::{CatalogError, Result};
use mediatheca::metadata::{DefaultMetadataService, DirEntryInfo, MetadataService};
use mediatheca::object::{
    CdsContainer, CdsItem, CdsObject, MetadataField, ObjectId, PlayStatus, FS_ROOT_OBJECT_ID,
    INVALID_OBJECT_ID, ROOT_OBJECT_ID, UPNP_CLASS_CONTAINER,
};
use mediatheca::update::SubscriptionSink;

#[derive(Debug, Clone)]
struct StoredAutoscan {
    database_id: ObjectId,
    object_id: ObjectId,
    location: PathBuf,
    mode: ScanMode,
    recursive: bool,
    hidden: bool,
    interval_secs: u64,
    persistent: bool,
}

#[derive(Default)]
struct DbState {
    objects: BTreeMap<ObjectId, CdsObject>,
    virtual_paths: HashMap<String, ObjectId>,
    update_ids: HashMap<ObjectId, u32>,
    autoscans: Vec<StoredAutoscan>,
    play_status: HashMap<(String, ObjectId), PlayStatus>,
}

/// In-memory Database implementation for integration tests.
pub struct MemoryDatabase {
    state: Mutex<DbState>,
    next_id: AtomicI32,
    next_autoscan_id: AtomicI32,
}

impl MemoryDatabase {
    pub fn new() -> Arc<Self> {
        let mut state = DbState::default();

        let mut root = CdsContainer::with_title("Root", UPNP_CLASS_CONTAINER);
        root.core.id = ROOT_OBJECT_ID;
        root.core.parent_id = INVALID_OBJECT_ID;
        state.objects.insert(ROOT_OBJECT_ID, CdsObject::Container(root));

        let mut fs_root = CdsContainer::with_title("PC Directory", UPNP_CLASS_CONTAINER);
        fs_root.core.id = FS_ROOT_OBJECT_ID;
        fs_root.core.parent_id = ROOT_OBJECT_ID;
        state
            .objects
            .insert(FS_ROOT_OBJECT_ID, CdsObject::Container(fs_root));

        Arc::new(Self {
            state: Mutex::new(state),
            next_id: AtomicI32::new(FS_ROOT_OBJECT_ID + 1),
            next_autoscan_id: AtomicI32::new(1),
        })
    }

    fn alloc_id(&self) -> ObjectId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// All objects whose parent is `id`, including indirect descendants.
    fn subtree_of(state: &DbState, id: ObjectId) -> Vec<ObjectId> {
        let mut result = Vec::new();
        let mut frontier = vec![id];
        while let Some(current) = frontier.pop() {
            for (child_id, object) in &state.objects {
                if object.parent_id() == current {
                    frontier.push(*child_id);
                    result.push(*child_id);
                }
            }
        }
        result
    }

    fn remove_single(state: &mut DbState, id: ObjectId, changed: &mut ChangedContainers) {
        if let Some(object) = state.objects.remove(&id) {
            let parent = object.parent_id();
            if parent != INVALID_OBJECT_ID && !changed.ui.contains(&parent) {
                changed.ui.push(parent);
            }
            state.virtual_paths.retain(|_, mapped| *mapped != id);
        }
    }

    pub fn object_count(&self) -> usize {
        self.state.lock().unwrap().objects.len()
    }

    pub fn virtual_container_id(&self, virtual_path: &str) -> Option<ObjectId> {
        self.state
            .lock()
            .unwrap()
            .virtual_paths
            .get(virtual_path)
            .copied()
    }

    pub fn children_of(&self, parent: ObjectId) -> Vec<CdsObject> {
        let state = self.state.lock().unwrap();
        state
            .objects
            .values()
            .filter(|object| object.parent_id() == parent)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn add_object(&self, object: &mut CdsObject) -> Result<Option<ObjectId>> {
        let id = self.alloc_id();
        object.core_mut().id = id;
        let mut state = self.state.lock().unwrap();
        let parent = object.parent_id();
        state.objects.insert(id, object.clone());
        Ok(if parent == INVALID_OBJECT_ID {
            None
        } else {
            Some(parent)
        })
    }

    async fn add_container(
        &self,
        parent_id: ObjectId,
        virtual_path: &str,
        container: &CdsContainer,
    ) -> Result<(ObjectId, bool)> {
        let mut state = self.state.lock().unwrap();
        if let Some(existing) = state.virtual_paths.get(virtual_path) {
            return Ok((*existing, false));
        }
        let id = self.alloc_id();
        let mut stored = container.clone();
        stored.core.id = id;
        stored.core.parent_id = parent_id;
        if stored.core.location.as_os_str().is_empty() {
            stored.core.location = PathBuf::from(virtual_path);
        }
        state.objects.insert(id, CdsObject::Container(stored));
        state.virtual_paths.insert(virtual_path.to_string(), id);
        Ok((id, true))
    }

    async fn update_object(&self, object: &CdsObject) -> Result<Option<ObjectId>> {
        let mut state = self.state.lock().unwrap();
        if !state.objects.contains_key(&object.id()) {
            return Err(CatalogError::NotFound(object.id()));
        }
        state.objects.insert(object.id(), object.clone());
        Ok(if object.parent_id() == INVALID_OBJECT_ID {
            None
        } else {
            Some(object.parent_id())
        })
    }

    async fn remove_object(&self, object_id: ObjectId, all: bool) -> Result<ChangedContainers> {
        let mut state = self.state.lock().unwrap();
        let mut changed = ChangedContainers::default();
        let object = state
            .objects
            .get(&object_id)
            .cloned()
            .ok_or(CatalogError::NotFound(object_id))?;

        let mut doomed = vec![object_id];
        if object.is_container() {
            doomed.extend(Self::subtree_of(&state, object_id));
        }
        if all {
            let refs: Vec<ObjectId> = state
                .objects
                .iter()
                .filter(|(_, candidate)| candidate.ref_id() == object_id)
                .map(|(id, _)| *id)
                .collect();
            doomed.extend(refs);
        }
        // virtual copies must never dangle
        let dangling: Vec<ObjectId> = state
            .objects
            .iter()
            .filter(|(_, candidate)| doomed.contains(&candidate.ref_id()))
            .map(|(id, _)| *id)
            .collect();
        doomed.extend(dangling);
        for id in doomed {
            Self::remove_single(&mut state, id, &mut changed);
        }
        changed.upnp = changed
            .ui
            .iter()
            .copied()
            .filter(|parent| state.objects.contains_key(parent))
            .collect();
        Ok(changed)
    }

    async fn remove_objects(
        &self,
        ids: &HashSet<ObjectId>,
        all: bool,
    ) -> Result<ChangedContainers> {
        let mut combined = ChangedContainers::default();
        let mut sorted: Vec<ObjectId> = ids.iter().copied().collect();
        sorted.sort_unstable();
        for id in sorted {
            match self.remove_object(id, all).await {
                Ok(changed) => combined.extend(changed),
                Err(CatalogError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(combined)
    }

    async fn load_object(&self, object_id: ObjectId) -> Result<CdsObject> {
        self.state
            .lock()
            .unwrap()
            .objects
            .get(&object_id)
            .cloned()
            .ok_or(CatalogError::NotFound(object_id))
    }

    async fn load_object_by_service_id(
        &self,
        service_id: &str,
        _group: &str,
    ) -> Result<Option<CdsObject>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .objects
            .values()
            .find(|object| {
                object
                    .as_item()
                    .map(|item| item.service_id == service_id)
                    .unwrap_or(false)
            })
            .cloned())
    }

    async fn find_object_by_path(
        &self,
        path: &Path,
        _group: &str,
        file_type: DbFileType,
    ) -> Result<Option<CdsObject>> {
        let state = self.state.lock().unwrap();
        if file_type == DbFileType::Virtual {
            let key = path.to_string_lossy().to_string();
            return Ok(state
                .virtual_paths
                .get(&key)
                .and_then(|id| state.objects.get(id))
                .filter(|object| object.core().is_virtual)
                .cloned());
        }
        Ok(state
            .objects
            .values()
            .find(|object| {
                if object.location() != path {
                    return false;
                }
                match file_type {
                    DbFileType::File => object.is_item(),
                    DbFileType::Directory => {
                        object.is_container() && !object.core().is_virtual
                    }
                    DbFileType::Any => true,
                    DbFileType::Virtual => unreachable!(),
                }
            })
            .cloned())
    }

    async fn find_object_id_by_path(
        &self,
        path: &Path,
        file_type: DbFileType,
    ) -> Result<Option<ObjectId>> {
        Ok(self
            .find_object_by_path(path, mediatheca::database::DEFAULT_CLIENT_GROUP, file_type)
            .await?
            .map(|object| object.id()))
    }

    async fn get_child_count(
        &self,
        container_id: ObjectId,
        include_containers: bool,
        include_items: bool,
        hide_fs_root: bool,
    ) -> Result<i32> {
        let state = self.state.lock().unwrap();
        let count = state
            .objects
            .values()
            .filter(|object| object.parent_id() == container_id)
            .filter(|object| {
                (object.is_container() && include_containers)
                    || (object.is_item() && include_items)
            })
            .filter(|object| !(hide_fs_root && object.id() == FS_ROOT_OBJECT_ID))
            .count();
        Ok(count as i32)
    }

    async fn get_objects(
        &self,
        parent_id: ObjectId,
        without_container: bool,
    ) -> Result<HashSet<ObjectId>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .objects
            .values()
            .filter(|object| object.parent_id() == parent_id)
            .filter(|object| !(without_container && object.is_container()))
            .map(|object| object.id())
            .collect())
    }

    async fn get_ref_objects(&self, object_id: ObjectId) -> Result<Vec<ObjectId>> {
        let state = self.state.lock().unwrap();
        let mut ids: Vec<ObjectId> = state
            .objects
            .values()
            .filter(|object| object.ref_id() == object_id)
            .map(|object| object.id())
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn increment_update_ids(&self, ids: &HashSet<ObjectId>) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        let mut sorted: Vec<ObjectId> = ids.iter().copied().collect();
        sorted.sort_unstable();
        let mut parts = Vec::with_capacity(sorted.len() * 2);
        for id in sorted {
            let counter = state.update_ids.entry(id).or_insert(0);
            *counter += 1;
            parts.push(id.to_string());
            parts.push(counter.to_string());
        }
        Ok(parts.join(","))
    }

    async fn get_autoscan_list(&self, mode: ScanMode) -> Result<Vec<AutoscanDirectory>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .autoscans
            .iter()
            .filter(|stored| stored.mode == mode)
            .map(|stored| {
                let adir = AutoscanDirectory::with_options(
                    stored.location.clone(),
                    stored.mode,
                    stored.recursive,
                    stored.hidden,
                    Duration::from_secs(stored.interval_secs),
                );
                adir.set_persistent(stored.persistent);
                adir.set_object_id(stored.object_id);
                adir.set_database_id(stored.database_id);
                adir
            })
            .collect())
    }

    async fn add_autoscan_directory(&self, adir: &AutoscanDirectory) -> Result<()> {
        let database_id = self.next_autoscan_id.fetch_add(1, Ordering::SeqCst);
        adir.set_database_id(database_id);
        let mut state = self.state.lock().unwrap();
        state.autoscans.push(StoredAutoscan {
            database_id,
            object_id: adir.object_id(),
            location: adir.location().to_path_buf(),
            mode: adir.mode(),
            recursive: adir.recursive,
            hidden: adir.hidden,
            interval_secs: adir.interval().as_secs(),
            persistent: adir.is_persistent(),
        });
        Ok(())
    }

    async fn update_autoscan_directory(&self, adir: &AutoscanDirectory) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        for stored in &mut state.autoscans {
            if stored.database_id == adir.database_id() {
                stored.object_id = adir.object_id();
                stored.location = adir.location().to_path_buf();
                stored.recursive = adir.recursive;
                stored.hidden = adir.hidden;
                stored.interval_secs = adir.interval().as_secs();
                stored.persistent = adir.is_persistent();
                return Ok(());
            }
        }
        Ok(())
    }

    async fn remove_autoscan_directory(&self, adir: &AutoscanDirectory) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .autoscans
            .retain(|stored| stored.database_id != adir.database_id());
        Ok(())
    }

    async fn get_autoscan_directory(
        &self,
        object_id: ObjectId,
    ) -> Result<Option<AutoscanDirectory>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .autoscans
            .iter()
            .find(|stored| stored.object_id == object_id)
            .map(|stored| {
                let adir = AutoscanDirectory::with_options(
                    stored.location.clone(),
                    stored.mode,
                    stored.recursive,
                    stored.hidden,
                    Duration::from_secs(stored.interval_secs),
                );
                adir.set_persistent(stored.persistent);
                adir.set_object_id(stored.object_id);
                adir.set_database_id(stored.database_id);
                adir
            }))
    }

    async fn check_overlapping_autoscans(&self, adir: &AutoscanDirectory) -> Result<()> {
        let state = self.state.lock().unwrap();
        for stored in &state.autoscans {
            if stored.database_id == adir.database_id() {
                continue;
            }
            if adir.location().starts_with(&stored.location)
                || stored.location.starts_with(adir.location())
            {
                return Err(CatalogError::OverlappingAutoscan(
                    adir.location().to_path_buf(),
                ));
            }
        }
        Ok(())
    }

    async fn ensure_path_existence(&self, path: &Path) -> Result<(ObjectId, Option<ObjectId>)> {
        let mut state = self.state.lock().unwrap();
        let mut parent = FS_ROOT_OBJECT_ID;
        let mut tree = String::new();
        let mut changed = None;
        for component in path.components() {
            if let std::path::Component::Normal(segment) = component {
                tree.push('/');
                tree.push_str(&segment.to_string_lossy());
                if let Some(existing) = state.virtual_paths.get(&tree) {
                    parent = *existing;
                    continue;
                }
                let id = self.alloc_id();
                let mut container = CdsContainer::with_title(
                    segment.to_string_lossy().to_string(),
                    UPNP_CLASS_CONTAINER,
                );
                container.core.id = id;
                container.core.parent_id = parent;
                container.core.location = PathBuf::from(&tree);
                state.objects.insert(id, CdsObject::Container(container));
                state.virtual_paths.insert(tree.clone(), id);
                changed = Some(parent);
                parent = id;
            }
        }
        Ok((parent, changed))
    }

    async fn save_play_status(&self, status: &PlayStatus) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .play_status
            .insert((status.group.clone(), status.item_id), status.clone());
        Ok(())
    }

    async fn get_play_status(
        &self,
        group: &str,
        object_id: ObjectId,
    ) -> Result<Option<PlayStatus>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .play_status
            .get(&(group.to_string(), object_id))
            .cloned())
    }
}

/// Subscription sink recording emitted CSV strings.
#[derive(Default)]
pub struct RecordingSink {
    pub emitted: Mutex<Vec<String>>,
}

impl SubscriptionSink for RecordingSink {
    fn send_cds_subscription_update(&self, csv: &str) {
        self.emitted.lock().unwrap().push(csv.to_string());
    }
}

/// Metadata service stub mapping file names to canned tag sets; falls back
/// to the default handlers for everything else.
pub struct StubMetadataService {
    inner: DefaultMetadataService,
    tags: Mutex<HashMap<String, Vec<(MetadataField, String)>>>,
}

impl StubMetadataService {
    pub fn new() -> Self {
        Self {
            inner: DefaultMetadataService::default(),
            tags: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_tags(&self, file_name: &str, tags: Vec<(MetadataField, String)>) {
        self.tags
            .lock()
            .unwrap()
            .insert(file_name.to_string(), tags);
    }
}

#[async_trait]
impl MetadataService for StubMetadataService {
    async fn extract_metadata(&self, item: &mut CdsItem, entry: &DirEntryInfo) -> Result<()> {
        self.inner.extract_metadata(item, entry).await?;
        let tags = self.tags.lock().unwrap();
        if let Some(fields) = tags.get(&entry.file_name()) {
            for (field, value) in fields {
                if *field == MetadataField::Title {
                    item.core.title = value.clone();
                }
                item.core.add_meta(*field, value.clone());
            }
        }
        Ok(())
    }

    async fn fill_container_art(&self, container: &mut CdsContainer) -> Result<()> {
        self.inner.fill_container_art(container).await
    }
}
