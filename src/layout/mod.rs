pub mod builtin;
pub mod structured;

use std::path::Path;

use async_trait::async_trait;

use crate::error::Result;
use crate::import::ImportService;
use crate::object::{CdsObject, ObjectId};

/// Separator between levels of a virtual container path.
pub const VIRTUAL_CONTAINER_SEPARATOR: char = '/';
/// Escape character applied to separators occurring inside titles.
pub const VIRTUAL_CONTAINER_ESCAPE: char = '\\';

/// Escape a title for use as one level of a virtual container path.
pub fn escape_segment(title: &str) -> String {
    let mut escaped = String::with_capacity(title.len());
    for c in title.chars() {
        if c == VIRTUAL_CONTAINER_ESCAPE || c == VIRTUAL_CONTAINER_SEPARATOR {
            escaped.push(VIRTUAL_CONTAINER_ESCAPE);
        }
        escaped.push(c);
    }
    escaped
}

/// Places imported objects into zero or more virtual containers.
///
/// Implementations call back into `ImportService::{add_container_tree,
/// add_object}`; a scripted engine is just another implementation with the
/// same side effects.
#[async_trait]
pub trait Layout: Send + Sync {
    async fn process_object(
        &self,
        svc: &ImportService,
        obj: &CdsObject,
        root_path: &Path,
        content_type: &str,
        ref_objects: &[ObjectId],
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn separator_and_escape_are_escaped() {
        assert_eq!(escape_segment("AC/DC"), "AC\\/DC");
        assert_eq!(escape_segment("back\\slash"), "back\\\\slash");
        assert_eq!(escape_segment("plain"), "plain");
    }
}
