pub mod quirks;
pub mod transcoding;

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use tracing::{debug, error};

use crate::config::ServerConfig;
use crate::database::Database;
use crate::error::{CatalogError, Result};
use crate::mime::{CONTENT_TYPE_JPG, CONTENT_TYPE_PLAYLIST, MimeResolver};
use crate::object::{
    CdsContainer, CdsItem, CdsObject, ContentHandlerType, MetadataField, ObjectCore, ObjectId,
    Resource, ResourceAttribute, ResourcePurpose, INVALID_OBJECT_ID, OBJECT_FLAG_ONLINE_SERVICE,
    OBJECT_FLAG_PROXY_URL, ROOT_OBJECT_ID, UPNP_CLASS_CONTAINER, UPNP_CLASS_MUSIC_ALBUM,
    UPNP_CLASS_MUSIC_ARTIST, UPNP_CLASS_MUSIC_GENRE, UPNP_CLASS_MUSIC_TRACK,
    UPNP_CLASS_PLAYLIST_CONTAINER,
};

pub use quirks::{quirk_flags, ClientQuirks};
pub use transcoding::{TranscodingFilter, TranscodingProfile, PARAM_OFF, PARAM_SOURCE};

// URL building blocks understood by the media request handlers
pub const CONTENT_MEDIA_HANDLER: &str = "content/media";
pub const CONTENT_ONLINE_HANDLER: &str = "content/online";
pub const URL_OBJECT_ID: &str = "object_id";
pub const URL_RESOURCE_ID: &str = "res_id";
pub const URL_VALUE_TRANSCODE_NO_RES_ID: &str = "tr";
pub const URL_PARAM_TRANSCODE_PROFILE_NAME: &str = "pr_name";
pub const URL_PARAM_TRANSCODE: &str = "transcode";
pub const URL_VALUE_TRANSCODE: &str = "1";
pub const CLIENT_GROUP_TAG: &str = "grp";
pub const URL_FILE_EXTENSION: &str = "ext";

// DLNA hint labels and well-known values
pub const UPNP_DLNA_PROFILE: &str = "DLNA.ORG_PN";
pub const UPNP_DLNA_OP: &str = "DLNA.ORG_OP";
pub const UPNP_DLNA_CONVERSION_INDICATOR: &str = "DLNA.ORG_CI";
pub const UPNP_DLNA_FLAGS: &str = "DLNA.ORG_FLAGS";
pub const UPNP_DLNA_OP_SEEK_RANGE: &str = "01";
pub const UPNP_DLNA_OP_SEEK_DISABLED: &str = "00";
pub const UPNP_DLNA_CONVERSION: &str = "1";
pub const UPNP_DLNA_NO_CONVERSION: &str = "0";
pub const UPNP_DLNA_ORG_FLAGS_AV: &str = "01700000000000000000000000000000";
pub const UPNP_DLNA_ORG_FLAGS_IMAGE: &str = "00f00000000000000000000000000000";
pub const UPNP_DLNA_ORG_FLAGS_SUB: &str = "00d00000000000000000000000000000";
pub const UPNP_DLNA_PROFILE_JPEG_TN: &str = "JPEG_TN";
pub const UPNP_DLNA_PROFILE_JPEG_SM: &str = "JPEG_SM";
pub const UPNP_DLNA_PROFILE_JPEG_MED: &str = "JPEG_MED";
pub const UPNP_DLNA_PROFILE_JPEG_LRG: &str = "JPEG_LRG";

const DLNA_XML_NAMESPACE_ATTR: &str = "xmlns:dlna";
const DLNA_XML_NAMESPACE: &str = "urn:schemas-dlna-org:metadata-1-0/";

/// One rendered child element: name, attributes and optional text.
#[derive(Debug, Clone)]
struct XmlNode {
    name: String,
    attrs: Vec<(String, String)>,
    text: Option<String>,
}

impl XmlNode {
    fn text(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attrs: Vec::new(),
            text: Some(text.into()),
        }
    }

    fn with_attrs(
        name: impl Into<String>,
        attrs: Vec<(String, String)>,
        text: Option<String>,
    ) -> Self {
        Self {
            name: name.into(),
            attrs,
            text,
        }
    }
}

fn encode_escapes(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('\'', "&apos;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Truncate at a valid UTF-8 boundary and terminate with an ellipsis.
fn limit_string(limit: usize, s: &str) -> String {
    const ELLIPSIS: &str = "...";
    if s.chars().count() <= limit {
        return s.to_string();
    }
    let keep = limit.saturating_sub(ELLIPSIS.len());
    let truncated: String = s.chars().take(keep).collect();
    format!("{truncated}{ELLIPSIS}")
}

fn format_xml_string(strict_xml: bool, string_limit: Option<usize>, input: &str) -> String {
    let mut s = input.to_string();
    if strict_xml {
        s = encode_escapes(&s);
    }
    if let Some(limit) = string_limit {
        s = limit_string(limit, &s);
    }
    s
}

fn url_encode(s: &str) -> String {
    let mut encoded = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                encoded.push(byte as char)
            }
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}

/// Place a metadata field into the child list, honoring the
/// `name@attr[value]` and `name@attr` tag forms.
fn add_field(children: &mut Vec<XmlNode>, key: &str, value: &str) {
    if let Some(at) = key.find('@') {
        let name = &key[..at];
        let attr_spec = &key[at + 1..];
        if let Some(bracket) = attr_spec.find('[') {
            if attr_spec.ends_with(']') {
                // name@attr[val] => <name attr="val">value</name>
                let attr_name = &attr_spec[..bracket];
                let attr_value = &attr_spec[bracket + 1..attr_spec.len() - 1];
                children.push(XmlNode::with_attrs(
                    name,
                    vec![(attr_name.to_string(), attr_value.to_string())],
                    Some(value.to_string()),
                ));
                return;
            }
        }
        // name@attr => attribute on the (existing or new) <name> element
        if let Some(existing) = children.iter_mut().find(|node| node.name == name) {
            existing
                .attrs
                .push((attr_spec.to_string(), value.to_string()));
        } else {
            children.push(XmlNode::with_attrs(
                name,
                vec![(attr_spec.to_string(), value.to_string())],
                None,
            ));
        }
        return;
    }
    children.push(XmlNode::text(key, value));
}

fn join_url(parts: &[&str]) -> String {
    let mut url = String::new();
    for part in parts {
        url.push('/');
        url.push_str(part);
    }
    url
}

/// Renders catalog objects as DIDL-Lite elements and synthesizes the
/// resource URLs the HTTP layer serves.
///
/// The renderer is stateless with respect to objects; it is parameterized by
/// the server's virtual URL, the configured resource ordering and the mime /
/// DLNA tables, and per call by the client quirks.
pub struct DidlRenderer {
    config: Arc<ServerConfig>,
    database: Arc<dyn Database>,
    virtual_url: String,
    ordered_handlers: Vec<ContentHandlerType>,
    mime: MimeResolver,
}

impl DidlRenderer {
    pub fn new(
        config: Arc<ServerConfig>,
        database: Arc<dyn Database>,
        virtual_url: impl Into<String>,
    ) -> Self {
        let ordered_handlers = config
            .import
            .resources
            .order
            .iter()
            .filter_map(|name| ContentHandlerType::from_str(name))
            .collect();
        let mime = MimeResolver::new(
            config.import.mappings.extension_mimetype.clone(),
            config.import.mappings.ignored_extensions.clone(),
            config.import.mappings.mimetype_contenttype.clone(),
        );
        Self {
            config,
            database,
            virtual_url: virtual_url.into(),
            ordered_handlers,
            mime,
        }
    }

    /// Render a single object as a `<container>` or `<item>` element.
    pub async fn render_object(
        &self,
        obj: &CdsObject,
        quirks: Option<&ClientQuirks>,
    ) -> Result<String> {
        let core = obj.core();
        let strict_xml = quirks.map(ClientQuirks::needs_strict_xml).unwrap_or(false);
        let string_limit = quirks.and_then(|q| q.string_limit);

        let mut attrs: Vec<(String, String)> = vec![
            ("id".to_string(), core.id.to_string()),
            ("parentID".to_string(), core.parent_id.to_string()),
            (
                "restricted".to_string(),
                if core.is_restricted() { "1" } else { "0" }.to_string(),
            ),
        ];
        let mut children = vec![
            XmlNode::text(
                "dc:title",
                format_xml_string(strict_xml, string_limit, &core.title),
            ),
            XmlNode::text("upnp:class", core.upnp_class.clone()),
        ];

        let name = match obj {
            CdsObject::Item(item) => {
                self.render_item(item, quirks, strict_xml, string_limit, &mut attrs, &mut children)
                    .await?;
                "item"
            }
            CdsObject::Container(container) => {
                self.render_container(container, strict_xml, string_limit, &mut attrs, &mut children)
                    .await?;
                "container"
            }
        };

        // make sure a date is set
        if !children.iter().any(|node| node.name == "dc:date") {
            if let Some(date) = chrono::DateTime::from_timestamp(core.mtime, 0) {
                children.push(XmlNode::text(
                    "dc:date",
                    date.format("%Y-%m-%dT%H:%M:%S").to_string(),
                ));
            }
        }

        let xml = write_element(name, &attrs, &children)?;
        debug!("rendered DIDL: {xml}");
        Ok(xml)
    }

    async fn render_item(
        &self,
        item: &CdsItem,
        quirks: Option<&ClientQuirks>,
        strict_xml: bool,
        string_limit: Option<usize>,
        attrs: &mut Vec<(String, String)>,
        children: &mut Vec<XmlNode>,
    ) -> Result<()> {
        let core = &item.core;
        let multi_value = quirks
            .map(|q| q.multi_value_or(self.config.upnp.multi_value))
            .unwrap_or(self.config.upnp.multi_value);
        let simple_date = quirks.map(ClientQuirks::needs_simple_date).unwrap_or(false);

        // Samsung bookmark restore
        if let Some(quirks) = quirks {
            if quirks.check_flags(quirk_flags::SAMSUNG_BOOKMARK) != 0 {
                if let Some(status) = &item.play_status {
                    if status.last_played_position > 0 {
                        let position = (status.last_played_position
                            - self.config.upnp.bookmark_offset_secs)
                            .max(0);
                        children.push(XmlNode::text(
                            "sec:dcmInfo",
                            format!("CREATIONDATE=0,FOLDER={},BM={}", core.title, position),
                        ));
                    }
                }
            }
        }

        let title_tag = MetadataField::Title.tag();
        let description_tag = MetadataField::Description.tag();
        let track_tag = MetadataField::TrackNumber.tag();
        let date_tag = MetadataField::Date.tag();
        for (key, group) in core.meta_groups() {
            if key == title_tag {
                continue;
            }
            let values: Vec<String> = if multi_value {
                group
            } else {
                vec![group.join(&self.config.upnp.entry_separator)]
            };
            for value in values {
                if value.is_empty() {
                    continue;
                }
                let value = format_xml_string(strict_xml, string_limit, &value);
                if key == description_tag
                    || (core.is_sub_class(UPNP_CLASS_MUSIC_TRACK) && key == track_tag)
                {
                    children.push(XmlNode::text(key.clone(), value));
                } else if simple_date && key == date_tag {
                    let simple = value.split('T').next().unwrap_or(&value).to_string();
                    add_field(children, &key, &simple);
                } else {
                    add_field(children, &key, &value);
                }
            }
        }

        // playback statistics
        let mut auxdata = core.auxdata().clone();
        if let Some(status) = &item.play_status {
            let count = status.play_count.to_string();
            children.push(XmlNode::text("upnp:playbackCount", count.clone()));
            auxdata.insert("upnp:playbackCount".to_string(), count);
            if status.last_played > 0 {
                if let Some(played) = chrono::DateTime::from_timestamp(status.last_played, 0) {
                    let played = played.format("%Y-%m-%d %H:%M:%S").to_string();
                    children.push(XmlNode::text("upnp:lastPlaybackTime", played.clone()));
                    auxdata.insert("upnp:lastPlaybackTime".to_string(), played);
                }
            }
            if status.last_played_position > 0 {
                let position =
                    crate::metadata::format_duration_hms(status.last_played_position as u64);
                children.push(XmlNode::text("upnp:lastPlaybackPosition", position.clone()));
                auxdata.insert("upnp:lastPlaybackPosition".to_string(), position);
            }
        }

        self.add_property_list(
            strict_xml,
            string_limit,
            children,
            core,
            &auxdata,
            &self.config.upnp.title_properties,
            &self.config.upnp.title_namespaces,
            attrs,
        );

        self.add_resources(item, quirks, children).await?;
        Ok(())
    }

    async fn render_container(
        &self,
        container: &CdsContainer,
        strict_xml: bool,
        string_limit: Option<usize>,
        attrs: &mut Vec<(String, String)>,
        children: &mut Vec<XmlNode>,
    ) -> Result<()> {
        let core = &container.core;
        // unknown child counts are omitted entirely
        if container.child_count >= 0 {
            attrs.push(("childCount".to_string(), container.child_count.to_string()));
        }

        let upnp = &self.config.upnp;
        let auxdata = core.auxdata().clone();
        if core.is_sub_class(UPNP_CLASS_MUSIC_ALBUM) {
            self.add_property_list(
                strict_xml,
                string_limit,
                children,
                core,
                &auxdata,
                &upnp.album_properties,
                &upnp.album_namespaces,
                attrs,
            );
        } else if core.is_sub_class(UPNP_CLASS_MUSIC_ARTIST) {
            self.add_property_list(
                strict_xml,
                string_limit,
                children,
                core,
                &auxdata,
                &upnp.artist_properties,
                &upnp.artist_namespaces,
                attrs,
            );
        } else if core.is_sub_class(UPNP_CLASS_MUSIC_GENRE) {
            self.add_property_list(
                strict_xml,
                string_limit,
                children,
                core,
                &auxdata,
                &upnp.genre_properties,
                &upnp.genre_namespaces,
                attrs,
            );
        } else if core.is_sub_class(UPNP_CLASS_PLAYLIST_CONTAINER) {
            self.add_property_list(
                strict_xml,
                string_limit,
                children,
                core,
                &auxdata,
                &upnp.playlist_properties,
                &upnp.playlist_namespaces,
                attrs,
            );
        }

        if core.is_sub_class(UPNP_CLASS_MUSIC_ALBUM)
            || core.is_sub_class(UPNP_CLASS_MUSIC_ARTIST)
            || core.is_sub_class(UPNP_CLASS_CONTAINER)
            || core.is_sub_class(UPNP_CLASS_PLAYLIST_CONTAINER)
        {
            if let Some(url) = self.render_container_image_url(container).await? {
                children.push(XmlNode::text(MetadataField::AlbumArtUri.tag(), url));
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn add_property_list(
        &self,
        strict_xml: bool,
        string_limit: Option<usize>,
        children: &mut Vec<XmlNode>,
        core: &ObjectCore,
        auxdata: &BTreeMap<String, String>,
        properties: &BTreeMap<String, String>,
        namespaces: &BTreeMap<String, String>,
        attrs: &mut Vec<(String, String)>,
    ) {
        for (ns, uri) in namespaces {
            let attr = format!("xmlns:{ns}");
            if !attrs.iter().any(|(name, _)| name == &attr) {
                attrs.push((attr, uri.clone()));
            }
        }
        for (tag, field) in properties {
            let mut was_meta = false;
            for (key, value) in core.metadata() {
                if key == field {
                    add_field(
                        children,
                        tag,
                        &format_xml_string(strict_xml, string_limit, value),
                    );
                    was_meta = true;
                }
            }
            if !was_meta {
                if let Some(value) = auxdata.get(field) {
                    if !value.is_empty() {
                        add_field(
                            children,
                            tag,
                            &format_xml_string(strict_xml, string_limit, value),
                        );
                    }
                }
            }
        }
    }

    /// Order resources according to the configured handler order, appending
    /// any handler not mentioned.
    fn ordered_resources(&self, core: &ObjectCore) -> VecDeque<Resource> {
        let mut ordered = VecDeque::new();
        for handler in &self.ordered_handlers {
            for res in core.resources() {
                if res.handler_type() == *handler {
                    ordered.push_back(res.clone());
                }
            }
        }
        for res in core.resources() {
            if !self.ordered_handlers.contains(&res.handler_type()) {
                ordered.push_back(res.clone());
            }
        }
        ordered
    }

    async fn add_resources(
        &self,
        item: &CdsItem,
        quirks: Option<&ClientQuirks>,
        children: &mut Vec<XmlNode>,
    ) -> Result<()> {
        let object = CdsObject::Item(item.clone());
        let is_external_url = item.core.flag(OBJECT_FLAG_PROXY_URL) == false
            && object.is_external_item();
        let mime_mappings = quirks
            .map(|q| q.mime_mappings.clone())
            .unwrap_or_default();
        let mut ordered = self.ordered_resources(&item.core);

        // thumbnails feed albumArtURI, subtitles feed CaptionInfoEx; real
        // res tags are rendered further down
        let mut caption_info: Vec<(String, Vec<(String, String)>)> = Vec::new();
        for res in ordered.iter() {
            match res.purpose() {
                ResourcePurpose::Content | ResourcePurpose::Transcode => continue,
                ResourcePurpose::Thumbnail => {
                    let url = self
                        .render_resource_url(&object, res, &mime_mappings, None)
                        .await?;
                    children.push(XmlNode::with_attrs(
                        MetadataField::AlbumArtUri.tag(),
                        vec![
                            (DLNA_XML_NAMESPACE_ATTR.to_string(), DLNA_XML_NAMESPACE.to_string()),
                            (
                                "dlna:profileID".to_string(),
                                UPNP_DLNA_PROFILE_JPEG_TN.to_string(),
                            ),
                        ],
                        Some(url),
                    ));
                }
                ResourcePurpose::Subtitle => {
                    let url = self
                        .render_resource_url(&object, res, &mime_mappings, None)
                        .await?;
                    let mut attrs = Vec::new();
                    let sub_type = res
                        .attribute(ResourceAttribute::Type)
                        .map(str::to_string)
                        .or_else(|| res.parameter("type").map(str::to_string))
                        .unwrap_or_default();
                    attrs.push(("sec:type".to_string(), sub_type));
                    if let Some(language) = res.attribute(ResourceAttribute::Language) {
                        attrs.push((
                            ResourceAttribute::Language.name().to_string(),
                            language.to_string(),
                        ));
                    }
                    let mut protocol_info = res
                        .attribute(ResourceAttribute::ProtocolInfo)
                        .unwrap_or_default()
                        .to_string();
                    for (from, to) in &mime_mappings {
                        protocol_info = protocol_info.replace(from, to);
                    }
                    attrs.push((
                        ResourceAttribute::ProtocolInfo.name().to_string(),
                        protocol_info,
                    ));
                    caption_info.push((url, attrs));
                }
            }
        }

        if !caption_info.is_empty() {
            let mut count = quirks
                .map(|q| q.caption_info_count)
                .filter(|count| *count > -1)
                .unwrap_or(self.config.upnp.caption_count);
            for (url, attrs) in &caption_info {
                count -= 1;
                if count < 0 {
                    break;
                }
                children.push(XmlNode::with_attrs(
                    "sec:CaptionInfoEx",
                    attrs.clone(),
                    Some(url.clone()),
                ));
            }
        }

        let (hide_original, original_res_id) =
            self.insert_temp_transcoding_resource(item, quirks, &mut ordered, is_external_url);

        let client_group = quirks.map(|q| q.group.clone()).unwrap_or_else(|| {
            crate::database::DEFAULT_CLIENT_GROUP.to_string()
        });

        for res in ordered {
            let purpose = res.purpose();
            if purpose == ResourcePurpose::Thumbnail {
                continue;
            }
            if let Some(quirks) = quirks {
                if !quirks.supports_resource(purpose) {
                    continue;
                }
            }
            let transcoded = purpose == ResourcePurpose::Transcode;
            if hide_original && !transcoded && Some(res.res_id()) == original_res_id {
                continue;
            }

            let mut res_attrs = Vec::new();
            let protocol_info = self.build_protocol_info(&res, &mime_mappings);
            res_attrs.push((
                ResourceAttribute::ProtocolInfo.name().to_string(),
                protocol_info,
            ));
            for (attr, value) in res.attributes() {
                if attr.is_private() || *attr == ResourceAttribute::ProtocolInfo {
                    continue;
                }
                res_attrs.push((attr.name().to_string(), value.clone()));
            }
            // pv subtitle hints on the primary content resource
            if res.handler_type() == ContentHandlerType::Default && !caption_info.is_empty() {
                if let Some(quirks) = quirks {
                    if quirks.check_flags(quirk_flags::PV_SUBTITLES) != 0 {
                        let (url, attrs) = &caption_info[0];
                        let sub_type = attrs
                            .iter()
                            .find(|(name, _)| name == "sec:type")
                            .map(|(_, value)| value.to_uppercase())
                            .unwrap_or_default();
                        res_attrs.push(("pv:subtitleFileType".to_string(), sub_type));
                        res_attrs.push(("pv:subtitleFileUri".to_string(), url.clone()));
                    }
                }
            }

            let url = self
                .render_resource_url(&object, &res, &mime_mappings, Some(&client_group))
                .await?;
            children.push(XmlNode::with_attrs("res", res_attrs, Some(url)));
        }
        Ok(())
    }

    /// Walk the configured transcoding filters and inject a transient
    /// resource for every profile matching this item and client. Returns
    /// whether the original resource should be hidden and its res id.
    fn insert_temp_transcoding_resource(
        &self,
        item: &CdsItem,
        quirks: Option<&ClientQuirks>,
        ordered: &mut VecDeque<Resource>,
        skip_url: bool,
    ) -> (bool, Option<i32>) {
        let mut hide_original = false;
        let mut original_res_id = None;
        if self.config.transcoding.profiles.is_empty() || skip_url {
            return (hide_original, original_res_id);
        }
        let Some(main_resource) = item.core.resource_by_purpose(ResourcePurpose::Content) else {
            return (hide_original, original_res_id);
        };
        let item_mime = &item.mime_type;
        let content_type = self
            .mime
            .content_type(item_mime)
            .unwrap_or_default()
            .to_string();
        let source_profile = self.dlna_profile_string(main_resource, &content_type);

        for filter in &self.config.transcoding.profiles {
            if !filter.matches_mime(item_mime) {
                continue;
            }
            if !filter.source_profile.is_empty() && filter.source_profile != source_profile {
                continue;
            }
            if filter.client_flags > 0 {
                match quirks {
                    Some(quirks) if quirks.check_flags(filter.client_flags) != 0 => {}
                    _ => continue,
                }
            }
            let profile = &filter.profile;
            if !profile.enabled {
                continue;
            }
            if profile.client_flags > 0 {
                match quirks {
                    Some(quirks) if quirks.check_flags(profile.client_flags) != 0 => {}
                    _ => continue,
                }
            }
            if content_type == crate::mime::CONTENT_TYPE_OGG {
                let theora = item.core.flag(crate::object::OBJECT_FLAG_OGG_THEORA);
                if theora != profile.accepts_theora {
                    continue;
                }
            } else if content_type == crate::mime::CONTENT_TYPE_AVI {
                use transcoding::AviFourccListMode;
                if profile.avi_fourcc_mode != AviFourccListMode::None {
                    let current = main_resource
                        .option(crate::object::resource::RESOURCE_OPTION_FOURCC)
                        .unwrap_or_default();
                    let listed = profile
                        .avi_fourcc_list
                        .iter()
                        .any(|fourcc| fourcc.as_str() == current);
                    match profile.avi_fourcc_mode {
                        AviFourccListMode::Process if current.is_empty() || !listed => continue,
                        AviFourccListMode::Ignore if !current.is_empty() && listed => continue,
                        _ => {}
                    }
                }
            }

            let mut target_mime = profile.target_mime.clone();
            let mut transcoded =
                Resource::new(ContentHandlerType::Transcode, ResourcePurpose::Transcode);
            // transient resources never collide with a real res id
            transcoded.set_res_id(i32::MAX);
            transcoded.set_parameter(URL_PARAM_TRANSCODE_PROFILE_NAME, profile.name.clone());
            transcoded.set_parameter(URL_PARAM_TRANSCODE, URL_VALUE_TRANSCODE);

            if profile.thumbnail {
                transcoded.set_purpose(ResourcePurpose::Thumbnail);
            } else {
                if profile.preserves_timeline {
                    if let Some(duration) = main_resource.attribute(ResourceAttribute::Duration) {
                        transcoded.set_attribute(ResourceAttribute::Duration, duration.to_string());
                    }
                }
                match profile.sample_frequency {
                    PARAM_SOURCE => {
                        if let Some(freq) =
                            main_resource.attribute(ResourceAttribute::SampleFrequency)
                        {
                            transcoded
                                .set_attribute(ResourceAttribute::SampleFrequency, freq.to_string());
                            target_mime.push_str(&format!(";rate={freq}"));
                        }
                    }
                    PARAM_OFF => {}
                    freq => {
                        transcoded
                            .set_attribute(ResourceAttribute::SampleFrequency, freq.to_string());
                        target_mime.push_str(&format!(";rate={freq}"));
                    }
                }
                match profile.num_channels {
                    PARAM_SOURCE => {
                        if let Some(channels) =
                            main_resource.attribute(ResourceAttribute::NrAudioChannels)
                        {
                            transcoded.set_attribute(
                                ResourceAttribute::NrAudioChannels,
                                channels.to_string(),
                            );
                            target_mime.push_str(&format!(";channels={channels}"));
                        }
                    }
                    PARAM_OFF => {}
                    channels => {
                        transcoded.set_attribute(
                            ResourceAttribute::NrAudioChannels,
                            channels.to_string(),
                        );
                        target_mime.push_str(&format!(";channels={channels}"));
                    }
                }
            }

            transcoded.set_attribute(
                ResourceAttribute::ProtocolInfo,
                format!("http-get:*:{target_mime}:*"),
            );
            if !profile.dlna_profile.is_empty() {
                transcoded.set_option(
                    crate::object::resource::RESOURCE_OPTION_DLNA_PROFILE,
                    profile.dlna_profile.clone(),
                );
            }
            if profile.hide_original {
                hide_original = true;
                original_res_id = Some(main_resource.res_id());
            }
            if profile.first_resource {
                ordered.push_front(transcoded);
                original_res_id = original_res_id.or(Some(main_resource.res_id()));
            } else {
                ordered.push_back(transcoded);
            }
        }
        (hide_original, original_res_id)
    }

    /// URL of the first thumbnail resource of a container, if any.
    pub async fn render_container_image_url(
        &self,
        container: &CdsContainer,
    ) -> Result<Option<String>> {
        let object = CdsObject::Container(container.clone());
        let ordered = self.ordered_resources(&container.core);
        for res in ordered {
            if res.purpose() == ResourcePurpose::Thumbnail {
                let url = self
                    .render_resource_url(&object, &res, &BTreeMap::new(), None)
                    .await?;
                return Ok(Some(url));
            }
        }
        Ok(None)
    }

    fn media_url(&self, object_id: ObjectId, res_id: &str) -> String {
        format!(
            "{}{}",
            self.virtual_url,
            join_url(&[
                CONTENT_MEDIA_HANDLER,
                URL_OBJECT_ID,
                &object_id.to_string(),
                URL_RESOURCE_ID,
                res_id,
            ])
        )
    }

    fn online_url(&self, object_id: ObjectId, res_id: &str) -> String {
        format!(
            "{}{}",
            self.virtual_url,
            join_url(&[
                CONTENT_ONLINE_HANDLER,
                URL_OBJECT_ID,
                &object_id.to_string(),
                URL_RESOURCE_ID,
                res_id,
            ])
        )
    }

    /// Synthesize the URL a client uses to fetch a resource.
    pub async fn render_resource_url(
        &self,
        obj: &CdsObject,
        res: &Resource,
        mime_mappings: &BTreeMap<String, String>,
        client_group: Option<&str>,
    ) -> Result<String> {
        let mut url = String::new();

        if obj.is_container() {
            if res.attribute(ResourceAttribute::ResourceFile).is_some() {
                url = self.media_url(obj.id(), &res.res_id().to_string());
            }
            if let Some(fanart_obj) = res.attribute(ResourceAttribute::FanArtObjId) {
                let mut target_id: ObjectId =
                    fanart_obj.parse().unwrap_or(INVALID_OBJECT_ID);
                let mut target_res: i32 = res
                    .attribute(ResourceAttribute::FanArtResId)
                    .and_then(|value| value.parse().ok())
                    .unwrap_or(0);
                // resolve through referenced containers until a real file or
                // an item is found; a visited set bounds cyclic references
                let mut visited: HashSet<ObjectId> = HashSet::new();
                visited.insert(obj.id());
                if target_id > ROOT_OBJECT_ID && target_id != obj.id() {
                    loop {
                        let current = match self.database.load_object(target_id).await {
                            Ok(current) => current,
                            Err(e) => {
                                error!("fan-art chain lookup failed: {e}");
                                break;
                            }
                        };
                        if !current.is_container() || !visited.insert(current.id()) {
                            break;
                        }
                        let Some(next_res) = current.core().resource_by_id(target_res) else {
                            break;
                        };
                        let sub_id: ObjectId = next_res
                            .attribute(ResourceAttribute::FanArtObjId)
                            .and_then(|value| value.parse().ok())
                            .unwrap_or(INVALID_OBJECT_ID);
                        if sub_id > ROOT_OBJECT_ID
                            && sub_id != current.id()
                            && next_res.attribute(ResourceAttribute::ResourceFile).is_none()
                        {
                            target_id = sub_id;
                            target_res = next_res
                                .attribute(ResourceAttribute::FanArtResId)
                                .and_then(|value| value.parse().ok())
                                .unwrap_or(0);
                        } else {
                            break;
                        }
                    }
                }
                if target_id <= ROOT_OBJECT_ID {
                    target_id = obj.id();
                }
                url = self.media_url(target_id, &target_res.to_string());
            }
        } else if obj.is_external_item() {
            match res.purpose() {
                ResourcePurpose::Content => {
                    if !obj.core().flag(OBJECT_FLAG_PROXY_URL) {
                        // remote URL goes straight out
                        return Ok(obj.location().to_string_lossy().to_string());
                    }
                    if obj.core().flag(OBJECT_FLAG_ONLINE_SERVICE) {
                        url = self.online_url(obj.id(), &res.res_id().to_string());
                    }
                }
                ResourcePurpose::Transcode => {
                    url = self.online_url(obj.id(), URL_VALUE_TRANSCODE_NO_RES_ID);
                }
                _ => {}
            }
        }

        // externally hosted thumbnails carry their own URL
        if res.purpose() == ResourcePurpose::Thumbnail
            && res.handler_type() == ContentHandlerType::ExtUrl
        {
            url = res
                .option(crate::object::resource::RESOURCE_OPTION_URL)
                .ok_or_else(|| CatalogError::Xml("missing thumbnail URL".to_string()))?
                .to_string();
        }

        if url.is_empty() {
            url = if res.purpose() == ResourcePurpose::Transcode {
                self.media_url(obj.id(), URL_VALUE_TRANSCODE_NO_RES_ID)
            } else {
                self.media_url(obj.id(), &res.res_id().to_string())
            };
        }

        let parameters = res.parameters();
        if !parameters.is_empty() {
            url.push('?');
            let encoded: Vec<String> = parameters
                .iter()
                .map(|(key, value)| format!("{}={}", url_encode(key), url_encode(value)))
                .collect();
            url.push_str(&encoded.join("&"));
        }

        if let Some(group) = client_group {
            if matches!(
                res.purpose(),
                ResourcePurpose::Content | ResourcePurpose::Transcode
            ) {
                url.push_str(&join_url(&[CLIENT_GROUP_TAG, group]));
            }
        }

        // trailing file extension; semantically meaningless but clients key
        // their caches on it
        let language = res
            .attribute(ResourceAttribute::Language)
            .unwrap_or_default();
        let mut extension = render_extension(
            "",
            res.attribute(ResourceAttribute::ResourceFile).map(Path::new),
            language,
        );
        if extension.is_empty() {
            let mime_type = self.mime_of_resource(res, mime_mappings);
            let content_type = self.mime.content_type(&mime_type).unwrap_or_default();
            let location = if res.purpose() == ResourcePurpose::Transcode {
                None
            } else {
                Some(obj.location())
            };
            extension = render_extension(content_type, location, language);
        }
        url.push_str(&extension);
        Ok(url)
    }

    fn mime_of_resource(&self, res: &Resource, mime_mappings: &BTreeMap<String, String>) -> String {
        let protocol_info = res
            .attribute(ResourceAttribute::ProtocolInfo)
            .unwrap_or_default();
        let mut mime_type = protocol_info
            .split(':')
            .nth(2)
            .unwrap_or_default()
            .to_string();
        if let Some(end) = mime_type.find(';') {
            mime_type.truncate(end);
        }
        for (from, to) in mime_mappings {
            mime_type = mime_type.replace(from, to);
        }
        mime_type
    }

    /// Resolve the DLNA profile for a resource.
    pub fn dlna_profile_string(&self, res: &Resource, content_type: &str) -> String {
        let mut profile = res
            .option(crate::object::resource::RESOURCE_OPTION_DLNA_PROFILE)
            .unwrap_or_default()
            .to_string();
        if content_type == CONTENT_TYPE_JPG {
            if res.purpose() == ResourcePurpose::Thumbnail {
                profile = UPNP_DLNA_PROFILE_JPEG_TN.to_string();
            }
            if res.purpose() == ResourcePurpose::Content {
                if let Some(resolution) = res.attribute(ResourceAttribute::Resolution) {
                    profile = match resolution {
                        "SD" => UPNP_DLNA_PROFILE_JPEG_SM.to_string(),
                        "HD" => UPNP_DLNA_PROFILE_JPEG_MED.to_string(),
                        "UHD" => UPNP_DLNA_PROFILE_JPEG_LRG.to_string(),
                        _ => profile,
                    };
                }
            }
        }
        if profile.is_empty() {
            profile = self.find_dlna_profile(res, content_type);
        }
        profile
    }

    fn find_dlna_profile(&self, res: &Resource, content_type: &str) -> String {
        let mappings = &self.config.import.mappings.contenttype_dlnaprofile;
        if mappings.is_empty() {
            return default_dlna_profile(content_type).to_string();
        }
        let legacy_key = format!(
            "{}-{}-{}",
            content_type,
            res.attribute(ResourceAttribute::VideoCodec).unwrap_or_default(),
            res.attribute(ResourceAttribute::AudioCodec).unwrap_or_default()
        );
        let mut best = String::new();
        let mut best_specificity = 0usize;
        for mapping in mappings {
            if mapping.from.is_empty()
                || (mapping.from != content_type && mapping.from != legacy_key)
            {
                continue;
            }
            if mapping.to.is_empty() {
                continue;
            }
            let attrs_match = mapping.attributes.iter().all(|(name, value)| {
                ResourceAttribute::all()
                    .iter()
                    .find(|attr| attr.name() == name)
                    .map(|attr| res.attribute(*attr) == Some(value.as_str()))
                    .unwrap_or(false)
            });
            let specificity = mapping.attributes.len() + 1;
            if attrs_match && specificity > best_specificity {
                best_specificity = specificity;
                best = mapping.to.clone();
            }
        }
        best
    }

    /// Assemble `res@protocolInfo`, finishing with the DLNA hints in wire
    /// order: OP, CI, FLAGS, then PN when a profile resolved.
    pub fn build_protocol_info(
        &self,
        res: &Resource,
        mime_mappings: &BTreeMap<String, String>,
    ) -> String {
        let mime_type = self.mime_of_resource(res, mime_mappings);
        let content_type = self
            .mime
            .content_type(&mime_type)
            .unwrap_or_default()
            .to_string();
        let profile = self.dlna_profile_string(res, &content_type);

        let mut extend = if res.purpose() == ResourcePurpose::Transcode {
            // no seeking into a live transcode, and the media is converted
            format!(
                "{UPNP_DLNA_OP}={UPNP_DLNA_OP_SEEK_DISABLED};{UPNP_DLNA_CONVERSION_INDICATOR}={UPNP_DLNA_CONVERSION}"
            )
        } else {
            format!(
                "{UPNP_DLNA_OP}={UPNP_DLNA_OP_SEEK_RANGE};{UPNP_DLNA_CONVERSION_INDICATOR}={UPNP_DLNA_NO_CONVERSION}"
            )
        };
        let dlna_flags = if res.purpose() == ResourcePurpose::Subtitle {
            UPNP_DLNA_ORG_FLAGS_SUB
        } else if mime_type.starts_with("audio") || mime_type.starts_with("video") {
            UPNP_DLNA_ORG_FLAGS_AV
        } else if mime_type.starts_with("image") {
            UPNP_DLNA_ORG_FLAGS_IMAGE
        } else {
            ""
        };
        if !dlna_flags.is_empty() {
            extend.push_str(&format!(";{UPNP_DLNA_FLAGS}={dlna_flags}"));
        }
        if !profile.is_empty() {
            extend.push_str(&format!(";{UPNP_DLNA_PROFILE}={profile}"));
        }

        let mut protocol_info = res
            .attribute(ResourceAttribute::ProtocolInfo)
            .unwrap_or("http-get:*::*")
            .to_string();
        for (from, to) in mime_mappings {
            protocol_info = protocol_info.replace(from, to);
        }
        let prefix_end = protocol_info.rfind(':').map(|i| i + 1).unwrap_or(0);
        format!("{}{}", &protocol_info[..prefix_end], extend)
    }

    /// DLNA transferMode header value for a mime type, from configuration.
    pub fn dlna_transfer_header(&self, mime_type: &str) -> Option<&str> {
        self.config
            .import
            .mappings
            .contenttype_dlnatransfer
            .get(mime_type)
            .map(String::as_str)
    }
}

fn default_dlna_profile(content_type: &str) -> &'static str {
    match content_type {
        "mp3" => "MP3",
        "flac" => "FLAC",
        "mkv" => "MKV",
        "avi" => "AVI",
        "png" => "PNG_LRG",
        _ => "",
    }
}

fn render_extension(content_type: &str, location: Option<&Path>, language: &str) -> String {
    let base = join_url(&[URL_FILE_EXTENSION, "file"]);
    if !content_type.is_empty() && content_type != CONTENT_TYPE_PLAYLIST {
        return format!("{base}.{content_type}");
    }
    if let Some(location) = location {
        if let Some(extension) = location.extension().and_then(|ext| ext.to_str()) {
            let extension = url_encode(extension);
            if !language.is_empty() {
                return format!("{base}.{}.{extension}", url_encode(language));
            }
            return format!("{base}.{extension}");
        }
    }
    String::new()
}

fn write_element(name: &str, attrs: &[(String, String)], children: &[XmlNode]) -> Result<String> {
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    let mut start = BytesStart::new(name);
    for (attr, value) in attrs {
        start.push_attribute((attr.as_str(), value.as_str()));
    }
    writer.write_event(Event::Start(start))?;
    for child in children {
        let mut elem = BytesStart::new(child.name.as_str());
        for (attr, value) in &child.attrs {
            elem.push_attribute((attr.as_str(), value.as_str()));
        }
        writer.write_event(Event::Start(elem))?;
        if let Some(text) = &child.text {
            writer.write_event(Event::Text(BytesText::new(text)))?;
        }
        writer.write_event(Event::End(BytesEnd::new(child.name.as_str())))?;
    }
    writer.write_event(Event::End(BytesEnd::new(name)))?;
    String::from_utf8(writer.into_inner().into_inner())
        .map_err(|e| CatalogError::Xml(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_tag_forms() {
        let mut children = Vec::new();
        add_field(&mut children, "upnp:artist@role[AlbumArtist]", "The Band");
        assert_eq!(children[0].name, "upnp:artist");
        assert_eq!(
            children[0].attrs,
            vec![("role".to_string(), "AlbumArtist".to_string())]
        );
        assert_eq!(children[0].text.as_deref(), Some("The Band"));

        add_field(&mut children, "upnp:artist@extra", "X");
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].attrs.len(), 2);

        add_field(&mut children, "upnp:genre", "Rock");
        assert_eq!(children[1].name, "upnp:genre");
        assert_eq!(children[1].text.as_deref(), Some("Rock"));
    }

    #[test]
    fn string_limit_keeps_utf8_boundaries() {
        assert_eq!(limit_string(10, "short"), "short");
        let limited = limit_string(8, "averylongtitle");
        assert_eq!(limited, "avery...");
        let unicode = limit_string(6, "äöüäöüäöü");
        assert!(unicode.ends_with("..."));
        assert_eq!(unicode.chars().count(), 6);
    }

    #[test]
    fn url_encoding_is_conservative() {
        assert_eq!(url_encode("plain-1.2_ok~/x"), "plain-1.2_ok~/x");
        assert_eq!(url_encode("a b&c"), "a%20b%26c");
    }

    #[test]
    fn extension_prefers_content_type() {
        assert_eq!(render_extension("mp3", None, ""), "/ext/file.mp3");
        assert_eq!(
            render_extension("", Some(Path::new("/m/a.flac")), ""),
            "/ext/file.flac"
        );
        assert_eq!(
            render_extension("", Some(Path::new("/m/sub.srt")), "en"),
            "/ext/file.en.srt"
        );
        assert_eq!(render_extension("playlist", Some(Path::new("/m/l.m3u")), ""), "/ext/file.m3u");
        assert_eq!(render_extension("", Some(Path::new("/m/none")), ""), "");
    }
}
