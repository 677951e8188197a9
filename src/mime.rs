use std::collections::BTreeMap;
use std::path::Path;

pub const MIMETYPE_DEFAULT: &str = "application/octet-stream";

pub const CONTENT_TYPE_MP3: &str = "mp3";
pub const CONTENT_TYPE_OGG: &str = "ogg";
pub const CONTENT_TYPE_FLAC: &str = "flac";
pub const CONTENT_TYPE_JPG: &str = "jpg";
pub const CONTENT_TYPE_AVI: &str = "avi";
pub const CONTENT_TYPE_MP4: &str = "mp4";
pub const CONTENT_TYPE_MKV: &str = "mkv";
pub const CONTENT_TYPE_PNG: &str = "png";
pub const CONTENT_TYPE_PLAYLIST: &str = "playlist";

/// Map a file extension to its mime type.
pub fn mime_from_extension(path: &Path) -> Option<&'static str> {
    let extension = path.extension()?.to_str()?.to_lowercase();

    let mime = match extension.as_str() {
        // video
        "mp4" => "video/mp4",
        "mkv" => "video/x-matroska",
        "avi" => "video/x-msvideo",
        "mov" => "video/quicktime",
        "wmv" => "video/x-ms-wmv",
        "flv" => "video/x-flv",
        "webm" => "video/webm",
        "m4v" => "video/x-m4v",
        "3gp" => "video/3gpp",
        "mpg" | "mpeg" => "video/mpeg",
        "ts" => "video/mp2t",

        // audio
        "mp3" => "audio/mpeg",
        "flac" => "audio/flac",
        "wav" => "audio/wav",
        "aac" => "audio/aac",
        "ogg" | "oga" => "audio/ogg",
        "wma" => "audio/x-ms-wma",
        "m4a" => "audio/mp4",
        "opus" => "audio/opus",
        "aiff" => "audio/aiff",

        // images
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "tiff" => "image/tiff",
        "webp" => "image/webp",

        // playlists
        "m3u" | "m3u8" => "audio/x-mpegurl",
        "pls" => "audio/x-scpls",

        // subtitles
        "srt" => "text/srt",
        "vtt" => "text/vtt",

        _ => return None,
    };
    Some(mime)
}

/// Resolves mime types for paths and maps them to internal content types,
/// honoring user-configured overrides.
#[derive(Debug, Clone)]
pub struct MimeResolver {
    extension_overrides: BTreeMap<String, String>,
    ignored_extensions: Vec<String>,
    mimetype_contenttype: Vec<(String, String)>,
}

impl MimeResolver {
    pub fn new(
        extension_overrides: BTreeMap<String, String>,
        ignored_extensions: Vec<String>,
        mut mimetype_contenttype: Vec<(String, String)>,
    ) -> Self {
        if mimetype_contenttype.is_empty() {
            mimetype_contenttype = Self::default_content_type_map();
        }
        Self {
            extension_overrides,
            ignored_extensions: ignored_extensions
                .into_iter()
                .map(|ext| ext.to_lowercase())
                .collect(),
            mimetype_contenttype,
        }
    }

    pub fn default_content_type_map() -> Vec<(String, String)> {
        [
            ("audio/mpeg", CONTENT_TYPE_MP3),
            ("audio/mp4", "mp4"),
            ("audio/ogg", CONTENT_TYPE_OGG),
            ("application/ogg", CONTENT_TYPE_OGG),
            ("audio/x-flac", CONTENT_TYPE_FLAC),
            ("audio/flac", CONTENT_TYPE_FLAC),
            ("image/jpeg", CONTENT_TYPE_JPG),
            ("image/png", CONTENT_TYPE_PNG),
            ("audio/x-mpegurl", CONTENT_TYPE_PLAYLIST),
            ("audio/x-scpls", CONTENT_TYPE_PLAYLIST),
            ("video/x-msvideo", CONTENT_TYPE_AVI),
            ("video/mp4", CONTENT_TYPE_MP4),
            ("video/x-matroska", CONTENT_TYPE_MKV),
        ]
        .into_iter()
        .map(|(mime, ct)| (mime.to_string(), ct.to_string()))
        .collect()
    }

    /// Resolve the mime type of a path. The first element of the returned
    /// pair is true when the file should be skipped outright (ignored
    /// extension).
    pub fn mime_for_path(&self, path: &Path, default_mime: &str) -> (bool, String) {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_lowercase)
            .unwrap_or_default();

        if self.ignored_extensions.contains(&extension) {
            return (true, String::new());
        }
        if let Some(mime) = self.extension_overrides.get(&extension) {
            return (false, mime.clone());
        }
        match mime_from_extension(path) {
            Some(mime) => (false, mime.to_string()),
            None => (false, default_mime.to_string()),
        }
    }

    /// Internal content type for a mime type, e.g. `audio/mpeg -> mp3`.
    pub fn content_type(&self, mime_type: &str) -> Option<&str> {
        self.mimetype_contenttype
            .iter()
            .find(|(mime, _)| mime == mime_type)
            .map(|(_, ct)| ct.as_str())
    }
}

impl Default for MimeResolver {
    fn default() -> Self {
        Self::new(BTreeMap::new(), Vec::new(), Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn known_extensions_resolve() {
        assert_eq!(
            mime_from_extension(Path::new("/m/a.mp3")),
            Some("audio/mpeg")
        );
        assert_eq!(
            mime_from_extension(Path::new("/m/a.JPG")),
            Some("image/jpeg")
        );
        assert_eq!(mime_from_extension(Path::new("/m/a.xyz")), None);
    }

    #[test]
    fn resolver_honors_overrides_and_skips() {
        let mut overrides = BTreeMap::new();
        overrides.insert("mts".to_string(), "video/mp2t".to_string());
        let resolver = MimeResolver::new(overrides, vec!["part".to_string()], Vec::new());

        let (skip, mime) = resolver.mime_for_path(&PathBuf::from("/m/x.mts"), MIMETYPE_DEFAULT);
        assert!(!skip);
        assert_eq!(mime, "video/mp2t");

        let (skip, mime) = resolver.mime_for_path(&PathBuf::from("/m/x.part"), MIMETYPE_DEFAULT);
        assert!(skip);
        assert!(mime.is_empty());

        let (skip, mime) = resolver.mime_for_path(&PathBuf::from("/m/x.unknown"), MIMETYPE_DEFAULT);
        assert!(!skip);
        assert_eq!(mime, MIMETYPE_DEFAULT);
    }

    #[test]
    fn content_types_map_from_mime() {
        let resolver = MimeResolver::default();
        assert_eq!(resolver.content_type("audio/mpeg"), Some(CONTENT_TYPE_MP3));
        assert_eq!(
            resolver.content_type("audio/x-mpegurl"),
            Some(CONTENT_TYPE_PLAYLIST)
        );
        assert_eq!(resolver.content_type("text/plain"), None);
    }
}
