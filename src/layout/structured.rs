use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::ServerConfig;
use crate::error::Result;
use crate::import::ImportService;
use crate::layout::builtin::BuiltinLayout;
use crate::layout::Layout;
use crate::mime::CONTENT_TYPE_PLAYLIST;
use crate::object::{
    CdsContainer, CdsObject, MetadataField, ObjectId, INVALID_OBJECT_ID, UPNP_CLASS_MUSIC_ALBUM,
    UPNP_CLASS_MUSIC_GENRE,
};

/// Normalize the leading character of a sort key: fold common diacritics and
/// uppercase.
pub fn map_initial(c: char) -> char {
    let folded = match c.to_lowercase().next().unwrap_or(c) {
        'ä' | 'á' | 'à' | 'â' | 'ã' | 'å' | 'æ' => 'a',
        'ç' => 'c',
        'é' | 'è' | 'ê' | 'ë' => 'e',
        'í' | 'ì' | 'î' | 'ï' => 'i',
        'ñ' => 'n',
        'ö' | 'ó' | 'ò' | 'ô' | 'õ' | 'ø' => 'o',
        'š' => 's',
        'ü' | 'ú' | 'ù' | 'û' => 'u',
        'ý' | 'ÿ' => 'y',
        'ž' => 'z',
        other => other,
    };
    folded.to_ascii_uppercase()
}

/// Bucket label for a string under an alphabetical partition of A–Z into
/// `box_type` boxes, wrapped in the division character. Digits land in the
/// `0-9` bucket, anything else non-latin in `#`.
pub fn abc_box(input: &str, box_type: i32, division: char) -> String {
    let initial = input.chars().next().map(map_initial).unwrap_or('#');
    if initial.is_ascii_digit() {
        return format!("{division}0-9{division}");
    }
    if !initial.is_ascii_uppercase() {
        return format!("{division}#{division}");
    }

    let boxes = box_type.clamp(1, 26) as usize;
    // spread 26 letters as evenly as possible, wider boxes first
    let base = 26 / boxes;
    let remainder = 26 % boxes;
    let position = (initial as u8 - b'A') as usize;

    let mut start = 0usize;
    for index in 0..boxes {
        let width = base + usize::from(index < remainder);
        if position < start + width {
            let letters: String = (start..start + width)
                .map(|offset| (b'A' + offset as u8) as char)
                .collect();
            return format!("{division}{letters}{division}");
        }
        start += width;
    }
    format!("{division}#{division}")
}

/// Structured layout: alphabetical ABC-box partitions for the audio axes,
/// everything else handled like the builtin tree.
pub struct StructuredLayout {
    config: Arc<ServerConfig>,
    fallback: BuiltinLayout,
}

impl StructuredLayout {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self {
            fallback: BuiltinLayout::new(Arc::clone(&config)),
            config,
        }
    }

    fn abc_size(&self) -> i32 {
        self.config.import.layout.box_size("AudioInitial/abc")
    }

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
            .add_container_tree(
                crate::object::ROOT_OBJECT_ID,
                chain,
                Some(ref_item),
                &mut created_ids,
            )
            .await?;
        if !created_ids.is_empty() {
            svc.notify_containers_changed(&created_ids).await;
        }
        virt.core_mut().parent_id = parent_id;
        virt.core_mut()
            .set_flag(crate::object::OBJECT_FLAG_USE_RESOURCE_REF);
        virt.core_mut().id = INVALID_OBJECT_ID;
        svc.add_object(virt, is_new).await
    }

    async fn add_audio(
        &self,
        svc: &ImportService,
        virt: &mut CdsObject,
        obj: &CdsObject,
    ) -> Result<()> {
        let size = self.abc_size();
        let mtime = obj.mtime();
        let core = virt.core();
        let artist = core
            .meta(MetadataField::Artist)
            .unwrap_or("Unknown")
            .to_string();
        let album = core
            .meta(MetadataField::Album)
            .unwrap_or("Unknown")
            .to_string();
        let title = core
            .meta(MetadataField::Title)
            .unwrap_or(&core.title)
            .to_string();
        let year = core
            .meta(MetadataField::Date)
            .map(|date| date.split('-').next().unwrap_or(date).to_string())
            .unwrap_or_else(|| "Unknown".to_string());
        let genres: Vec<String> = core
            .meta_group(MetadataField::Genre)
            .iter()
            .map(|genre| self.fallback.map_genre(genre))
            .collect();

        let artist_bucket = abc_box(&artist, size, '-');
        let chain = Self::chain(
            &["-Artist-", &artist_bucket, &artist, &album],
            Some(UPNP_CLASS_MUSIC_ALBUM),
            mtime,
        );
        self.add_under(svc, virt, chain, obj).await?;

        let album_bucket = abc_box(&album, size, '-');
        let chain = Self::chain(
            &["-Album-", &album_bucket, &album],
            Some(UPNP_CLASS_MUSIC_ALBUM),
            mtime,
        );
        self.add_under(svc, virt, chain, obj).await?;

        let track_bucket = abc_box(&title, size, '-');
        let chain = Self::chain(&["-Track-", &track_bucket], None, mtime);
        self.add_under(svc, virt, chain, obj).await?;

        for genre in &genres {
            let chain = Self::chain(
                &["-Genre-", genre],
                Some(UPNP_CLASS_MUSIC_GENRE),
                mtime,
            );
            self.add_under(svc, virt, chain, obj).await?;
        }

        let chain = Self::chain(&["-Year-", &year], None, mtime);
        self.add_under(svc, virt, chain, obj).await
    }
}

#[async_trait]
impl Layout for StructuredLayout {
    async fn process_object(
        &self,
        svc: &ImportService,
        obj: &CdsObject,
        root_path: &Path,
        content_type: &str,
        ref_objects: &[ObjectId],
    ) -> Result<()> {
        let Some(item) = obj.as_item() else {
            return Ok(());
        };
        if item.mime_type.starts_with("audio") && content_type != CONTENT_TYPE_PLAYLIST {
            let mut virt = obj.clone();
            virt.core_mut().is_virtual = true;
            if obj.id() != INVALID_OBJECT_ID {
                virt.core_mut().ref_id = obj.id();
            }
            self.add_audio(svc, &mut virt, obj).await
        } else {
            self.fallback
                .process_object(svc, obj, root_path, content_type, ref_objects)
                .await
        }
    }
}
