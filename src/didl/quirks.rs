use std::collections::BTreeMap;

use crate::database::DEFAULT_CLIENT_GROUP;
use crate::object::ResourcePurpose;

/// Per-client behavior flags, selected by user-agent or subnet matching in
/// the UPnP stack.
pub mod quirk_flags {
    /// Emit pv:subtitleFileType / pv:subtitleFileUri on the content res.
    pub const PV_SUBTITLES: u32 = 0x01;
    /// Restore Samsung bookmarked positions via sec:dcmInfo.
    pub const SAMSUNG_BOOKMARK: u32 = 0x02;
    /// Render dc:date as plain YYYY-MM-DD.
    pub const SIMPLE_DATE: u32 = 0x04;
    /// Escape XML entities a second time for clients that decode twice.
    pub const STRICT_XML: u32 = 0x08;
    /// Client chokes on multi-valued elements.
    pub const SINGLE_VALUE: u32 = 0x10;
}

/// Rendering policy bundle for one client. Quirks never mutate catalog
/// objects; they only alter how a response is rendered.
#[derive(Debug, Clone)]
pub struct ClientQuirks {
    pub flags: u32,
    /// Cache-scoping group appended to content URLs.
    pub group: String,
    /// Mime rewrites applied to protocolInfo and URLs for this client.
    pub mime_mappings: BTreeMap<String, String>,
    /// Cap on sec:CaptionInfoEx elements; negative means use the server
    /// config.
    pub caption_info_count: i32,
    /// Overrides the server-wide multi-value setting when set.
    pub multi_value: Option<bool>,
    /// Title length cap; rendering truncates at a UTF-8 boundary.
    pub string_limit: Option<usize>,
    /// Resource purposes the client accepts; None accepts everything.
    pub accepted_purposes: Option<Vec<ResourcePurpose>>,
}

impl Default for ClientQuirks {
    fn default() -> Self {
        Self {
            flags: 0,
            group: DEFAULT_CLIENT_GROUP.to_string(),
            mime_mappings: BTreeMap::new(),
            caption_info_count: -1,
            multi_value: None,
            string_limit: None,
            accepted_purposes: None,
        }
    }
}

impl ClientQuirks {
    pub fn check_flags(&self, mask: u32) -> u32 {
        self.flags & mask
    }

    pub fn needs_strict_xml(&self) -> bool {
        self.check_flags(quirk_flags::STRICT_XML) != 0
    }

    pub fn needs_simple_date(&self) -> bool {
        self.check_flags(quirk_flags::SIMPLE_DATE) != 0
    }

    /// Effective multi-value setting given the server default.
    pub fn multi_value_or(&self, server_default: bool) -> bool {
        if self.check_flags(quirk_flags::SINGLE_VALUE) != 0 {
            return false;
        }
        self.multi_value.unwrap_or(server_default)
    }

    pub fn supports_resource(&self, purpose: ResourcePurpose) -> bool {
        match &self.accepted_purposes {
            None => true,
            Some(accepted) => accepted.contains(&purpose),
        }
    }
}
