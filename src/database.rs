use std::collections::HashSet;
use std::path::Path;

use async_trait::async_trait;

use crate::autoscan::{AutoscanDirectory, ScanMode};
use crate::error::Result;
use crate::object::{CdsContainer, CdsObject, ObjectId, PlayStatus};

/// Client group used when a request carries no quirks.
pub const DEFAULT_CLIENT_GROUP: &str = "default";

/// Narrows path lookups to the physical or virtual tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbFileType {
    File,
    Directory,
    Virtual,
    Any,
}

/// Container ids whose update counters were bumped by a removal.
///
/// The `ui` set is finer-grained than `upnp` because the web UI wants to
/// refresh every touched container while UPnP eventing only needs the
/// surviving parents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangedContainers {
    pub ui: Vec<ObjectId>,
    pub upnp: Vec<ObjectId>,
}

impl ChangedContainers {
    pub fn is_empty(&self) -> bool {
        self.ui.is_empty() && self.upnp.is_empty()
    }

    pub fn extend(&mut self, other: ChangedContainers) {
        self.ui.extend(other.ui);
        self.upnp.extend(other.upnp);
    }
}

/// Persistence contract the content core consumes. Implementations decide
/// atomically which parents' update ids bump; the core only routes the
/// returned ids into eventing.
#[async_trait]
pub trait Database: Send + Sync {
    /// Insert an object; assigns its id in place and returns the affected
    /// parent container, if any.
    async fn add_object(&self, object: &mut CdsObject) -> Result<Option<ObjectId>>;

    /// Ensure a container exists at `virtual_path` under `parent_id`.
    /// Returns `(id, created)`.
    async fn add_container(
        &self,
        parent_id: ObjectId,
        virtual_path: &str,
        container: &CdsContainer,
    ) -> Result<(ObjectId, bool)>;

    /// Update an object in place; returns the affected parent container.
    async fn update_object(&self, object: &CdsObject) -> Result<Option<ObjectId>>;

    /// Remove an object, cascading to descendants when `all`. Returns the
    /// containers whose update ids were bumped.
    async fn remove_object(&self, object_id: ObjectId, all: bool) -> Result<ChangedContainers>;

    /// Remove a set of objects atomically.
    async fn remove_objects(
        &self,
        ids: &HashSet<ObjectId>,
        all: bool,
    ) -> Result<ChangedContainers>;

    async fn load_object(&self, object_id: ObjectId) -> Result<CdsObject>;

    async fn load_object_by_service_id(
        &self,
        service_id: &str,
        group: &str,
    ) -> Result<Option<CdsObject>>;

    async fn find_object_by_path(
        &self,
        path: &Path,
        group: &str,
        file_type: DbFileType,
    ) -> Result<Option<CdsObject>>;

    async fn find_object_id_by_path(
        &self,
        path: &Path,
        file_type: DbFileType,
    ) -> Result<Option<ObjectId>>;

    async fn get_child_count(
        &self,
        container_id: ObjectId,
        include_containers: bool,
        include_items: bool,
        hide_fs_root: bool,
    ) -> Result<i32>;

    /// Child object ids of a container, optionally excluding containers.
    async fn get_objects(
        &self,
        parent_id: ObjectId,
        without_container: bool,
    ) -> Result<HashSet<ObjectId>>;

    /// Ids of virtual objects referencing the given object.
    async fn get_ref_objects(&self, object_id: ObjectId) -> Result<Vec<ObjectId>>;

    /// Bump update counters for the given containers and return the CSV
    /// eventing string `"id1,updId1,id2,updId2,…"`.
    async fn increment_update_ids(&self, ids: &HashSet<ObjectId>) -> Result<String>;

    // autoscan persistence ----------------------------------------------

    async fn get_autoscan_list(&self, mode: ScanMode) -> Result<Vec<AutoscanDirectory>>;

    async fn add_autoscan_directory(&self, adir: &AutoscanDirectory) -> Result<()>;

    async fn update_autoscan_directory(&self, adir: &AutoscanDirectory) -> Result<()>;

    async fn remove_autoscan_directory(&self, adir: &AutoscanDirectory) -> Result<()>;

    async fn get_autoscan_directory(
        &self,
        object_id: ObjectId,
    ) -> Result<Option<AutoscanDirectory>>;

    /// Err(OverlappingAutoscan) when two autoscans would cover overlapping
    /// subtrees.
    async fn check_overlapping_autoscans(&self, adir: &AutoscanDirectory) -> Result<()>;

    /// Create the physical container chain for a path; returns the leaf
    /// container id and the affected parent, if any.
    async fn ensure_path_existence(&self, path: &Path) -> Result<(ObjectId, Option<ObjectId>)>;

    // play status --------------------------------------------------------

    async fn save_play_status(&self, status: &PlayStatus) -> Result<()>;

    async fn get_play_status(&self, group: &str, object_id: ObjectId)
        -> Result<Option<PlayStatus>>;
}
