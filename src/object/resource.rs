use std::collections::BTreeMap;

/// What a resource is for, from the point of view of a control point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourcePurpose {
    Content,
    Thumbnail,
    Subtitle,
    Transcode,
}

/// Which handler produced (and can serve) a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ContentHandlerType {
    Default,
    TagMeta,
    FanArt,
    ContainerArt,
    Thumbnailer,
    Subtitle,
    Transcode,
    ExtUrl,
    Metafile,
    ResourceFile,
}

impl ContentHandlerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentHandlerType::Default => "Default",
            ContentHandlerType::TagMeta => "TagMeta",
            ContentHandlerType::FanArt => "FanArt",
            ContentHandlerType::ContainerArt => "ContainerArt",
            ContentHandlerType::Thumbnailer => "Thumbnailer",
            ContentHandlerType::Subtitle => "Subtitle",
            ContentHandlerType::Transcode => "Transcode",
            ContentHandlerType::ExtUrl => "ExtUrl",
            ContentHandlerType::Metafile => "Metafile",
            ContentHandlerType::ResourceFile => "ResourceFile",
        }
    }

    pub fn from_str(name: &str) -> Option<Self> {
        match name {
            "Default" => Some(ContentHandlerType::Default),
            "TagMeta" => Some(ContentHandlerType::TagMeta),
            "FanArt" => Some(ContentHandlerType::FanArt),
            "ContainerArt" => Some(ContentHandlerType::ContainerArt),
            "Thumbnailer" => Some(ContentHandlerType::Thumbnailer),
            "Subtitle" => Some(ContentHandlerType::Subtitle),
            "Transcode" => Some(ContentHandlerType::Transcode),
            "ExtUrl" => Some(ContentHandlerType::ExtUrl),
            "Metafile" => Some(ContentHandlerType::Metafile),
            "ResourceFile" => Some(ContentHandlerType::ResourceFile),
            _ => None,
        }
    }
}

/// Well-known resource attributes rendered into `res@` attributes, except the
/// private ones which only steer URL synthesis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceAttribute {
    ProtocolInfo,
    Duration,
    Size,
    Resolution,
    SampleFrequency,
    NrAudioChannels,
    Bitrate,
    BitsPerSample,
    Language,
    Type,
    VideoCodec,
    AudioCodec,
    // private: never rendered as res@ attributes
    ResourceFile,
    FanArtObjId,
    FanArtResId,
}

impl ResourceAttribute {
    pub fn name(&self) -> &'static str {
        match self {
            ResourceAttribute::ProtocolInfo => "protocolInfo",
            ResourceAttribute::Duration => "duration",
            ResourceAttribute::Size => "size",
            ResourceAttribute::Resolution => "resolution",
            ResourceAttribute::SampleFrequency => "sampleFrequency",
            ResourceAttribute::NrAudioChannels => "nrAudioChannels",
            ResourceAttribute::Bitrate => "bitrate",
            ResourceAttribute::BitsPerSample => "bitsPerSample",
            ResourceAttribute::Language => "dc:language",
            ResourceAttribute::Type => "type",
            ResourceAttribute::VideoCodec => "videoCodec",
            ResourceAttribute::AudioCodec => "audioCodec",
            ResourceAttribute::ResourceFile => "resFile",
            ResourceAttribute::FanArtObjId => "fanArtObject",
            ResourceAttribute::FanArtResId => "fanArtResource",
        }
    }

    /// Private attributes carry bookkeeping for URL synthesis and must not
    /// leak into DIDL output.
    pub fn is_private(&self) -> bool {
        matches!(
            self,
            ResourceAttribute::ResourceFile
                | ResourceAttribute::FanArtObjId
                | ResourceAttribute::FanArtResId
        )
    }

    pub fn all() -> &'static [ResourceAttribute] {
        &[
            ResourceAttribute::ProtocolInfo,
            ResourceAttribute::Duration,
            ResourceAttribute::Size,
            ResourceAttribute::Resolution,
            ResourceAttribute::SampleFrequency,
            ResourceAttribute::NrAudioChannels,
            ResourceAttribute::Bitrate,
            ResourceAttribute::BitsPerSample,
            ResourceAttribute::Language,
            ResourceAttribute::Type,
            ResourceAttribute::VideoCodec,
            ResourceAttribute::AudioCodec,
            ResourceAttribute::ResourceFile,
            ResourceAttribute::FanArtObjId,
            ResourceAttribute::FanArtResId,
        ]
    }
}

/// URL option key for externally hosted thumbnails.
pub const RESOURCE_OPTION_URL: &str = "url";
/// Option key carrying a resolved DLNA profile on a resource.
pub const RESOURCE_OPTION_DLNA_PROFILE: &str = "dlnaProfile";
/// Option key for the AVI FourCC of the primary content resource.
pub const RESOURCE_OPTION_FOURCC: &str = "fourcc";

/// A single `res` entry of a CdsObject.
///
/// `res_id` equals the resource's position in the owning object's list; it is
/// assigned by `ObjectCore::add_resource` and stable for the object lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    res_id: i32,
    handler: ContentHandlerType,
    purpose: ResourcePurpose,
    attributes: BTreeMap<ResourceAttribute, String>,
    parameters: BTreeMap<String, String>,
    options: BTreeMap<String, String>,
}

impl Resource {
    pub fn new(handler: ContentHandlerType, purpose: ResourcePurpose) -> Self {
        Self {
            res_id: -1,
            handler,
            purpose,
            attributes: BTreeMap::new(),
            parameters: BTreeMap::new(),
            options: BTreeMap::new(),
        }
    }

    pub fn res_id(&self) -> i32 {
        self.res_id
    }

    pub fn set_res_id(&mut self, res_id: i32) {
        self.res_id = res_id;
    }

    pub fn handler_type(&self) -> ContentHandlerType {
        self.handler
    }

    pub fn purpose(&self) -> ResourcePurpose {
        self.purpose
    }

    pub fn set_purpose(&mut self, purpose: ResourcePurpose) {
        self.purpose = purpose;
    }

    pub fn attribute(&self, attr: ResourceAttribute) -> Option<&str> {
        self.attributes.get(&attr).map(String::as_str)
    }

    pub fn set_attribute(&mut self, attr: ResourceAttribute, value: impl Into<String>) {
        self.attributes.insert(attr, value.into());
    }

    pub fn remove_attribute(&mut self, attr: ResourceAttribute) {
        self.attributes.remove(&attr);
    }

    pub fn attributes(&self) -> &BTreeMap<ResourceAttribute, String> {
        &self.attributes
    }

    pub fn merge_attributes(&mut self, overrides: &BTreeMap<ResourceAttribute, String>) {
        for (attr, value) in overrides {
            self.attributes.insert(*attr, value.clone());
        }
    }

    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }

    pub fn set_parameter(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.parameters.insert(key.into(), value.into());
    }

    pub fn parameters(&self) -> &BTreeMap<String, String> {
        &self.parameters
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    pub fn set_option(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.options.insert(key.into(), value.into());
    }
}
