use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Keep the source stream's value for a numeric transcoding parameter.
pub const PARAM_SOURCE: i32 = -1;
/// Drop the parameter entirely.
pub const PARAM_OFF: i32 = 0;

/// How the AVI FourCC list is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AviFourccListMode {
    #[default]
    None,
    /// Transcode only when the FourCC is on the list.
    Process,
    /// Skip transcoding when the FourCC is on the list.
    Ignore,
}

/// A transcoding target description. The actual transcoder process is spawned
/// elsewhere; the renderer only advertises the synthetic resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodingProfile {
    pub name: String,
    pub enabled: bool,
    pub target_mime: String,
    pub client_flags: u32,
    /// Prepend the transcoded resource instead of appending it.
    pub first_resource: bool,
    /// Suppress the original content resource in rendered output.
    pub hide_original: bool,
    /// The profile produces a thumbnail, not a content stream.
    pub thumbnail: bool,
    /// The output timeline matches the source, so duration carries over.
    pub preserves_timeline: bool,
    /// Target sample frequency; `PARAM_SOURCE` keeps, `PARAM_OFF` drops.
    pub sample_frequency: i32,
    pub num_channels: i32,
    pub dlna_profile: String,
    pub accepts_theora: bool,
    pub avi_fourcc_mode: AviFourccListMode,
    pub avi_fourcc_list: Vec<String>,
    /// Raw attribute overrides stamped onto the synthetic resource.
    pub attribute_overrides: BTreeMap<String, String>,
}

impl Default for TranscodingProfile {
    fn default() -> Self {
        Self {
            name: String::new(),
            enabled: true,
            target_mime: String::new(),
            client_flags: 0,
            first_resource: false,
            hide_original: false,
            thumbnail: false,
            preserves_timeline: true,
            sample_frequency: PARAM_SOURCE,
            num_channels: PARAM_SOURCE,
            dlna_profile: String::new(),
            accepts_theora: false,
            avi_fourcc_mode: AviFourccListMode::None,
            avi_fourcc_list: Vec::new(),
            attribute_overrides: BTreeMap::new(),
        }
    }
}

/// Source-side filter deciding whether a profile applies to an item.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TranscodingFilter {
    /// Exact mime type or `type/*` wildcard.
    pub mime_type: String,
    /// Only items whose resolved DLNA source profile equals this.
    pub source_profile: String,
    pub client_flags: u32,
    /// Mime types excluded from a wildcard match.
    pub no_transcoding_mime_types: Vec<String>,
    pub profile: TranscodingProfile,
}

impl TranscodingFilter {
    /// Mime filter: `type/*` matches the primary type, otherwise exact.
    pub fn matches_mime(&self, item_mime: &str) -> bool {
        if self.mime_type.is_empty() {
            return true;
        }
        if let Some((primary, sub)) = self.mime_type.split_once('/') {
            if sub == "*" {
                return item_mime.starts_with(&format!("{primary}/"))
                    && !self
                        .no_transcoding_mime_types
                        .iter()
                        .any(|skip| skip == item_mime);
            }
        }
        self.mime_type == item_mime
    }
}
