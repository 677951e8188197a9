use std::path::PathBuf;

use crate::object::ObjectId;

pub type Result<T> = std::result::Result<T, CatalogError>;

/// Error kinds surfaced by the content core.
///
/// `ShutdownRequested` is the only variant used as a control signal: tasks
/// return it when they observe the shutdown flag and the worker stops cleanly.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("object validation failed: {0}")]
    InvalidObject(String),

    #[error("object {0} not found")]
    NotFound(ObjectId),

    #[error("no object for path {0}")]
    NotFoundPath(PathBuf),

    #[error("autoscan path already registered: {0}")]
    DuplicateAutoscan(PathBuf),

    #[error("autoscan overlaps an existing autoscan subtree: {0}")]
    OverlappingAutoscan(PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Watch(#[from] notify::Error),

    #[error("xml rendering failed: {0}")]
    Xml(String),

    #[error("server shutdown requested")]
    ShutdownRequested,

    #[error("database fatal: {0}")]
    DatabaseFatal(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<quick_xml::Error> for CatalogError {
    fn from(e: quick_xml::Error) -> Self {
        CatalogError::Xml(e.to_string())
    }
}

impl CatalogError {
    /// True when the enclosing task should stop and let the worker exit.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, CatalogError::ShutdownRequested)
    }
}
