use std::fmt;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::PipelineError;

/// Semantic role of a finished artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preset {
    HighResVideo,
    LowResVideo,
    VideoSubtitle,
    Audio,
    Document,
    Epub,
    Html5Zip,
    H5pZip,
    Bloompub,
}

impl Preset {
    pub fn as_str(&self) -> &'static str {
        match self {
            Preset::HighResVideo => "high_res_video",
            Preset::LowResVideo => "low_res_video",
            Preset::VideoSubtitle => "video_subtitle",
            Preset::Audio => "audio",
            Preset::Document => "document",
            Preset::Epub => "epub",
            Preset::Html5Zip => "html5_zip",
            Preset::H5pZip => "h5p_zip",
            Preset::Bloompub => "bloompub",
        }
    }

    /// Static format to preset table for formats whose role does not depend
    /// on probing the file.
    pub fn for_extension(ext: &str) -> Option<Preset> {
        match ext {
            "vtt" => Some(Preset::VideoSubtitle),
            "mp3" => Some(Preset::Audio),
            "pdf" => Some(Preset::Document),
            "epub" => Some(Preset::Epub),
            "zip" => Some(Preset::Html5Zip),
            "h5p" => Some(Preset::H5pZip),
            "bloompub" | "bloomd" => Some(Preset::Bloompub),
            _ => None,
        }
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of content node a file is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Video,
    Audio,
    Document,
    Html5,
    H5p,
    Slideshow,
}

impl ContentKind {
    pub fn allowed_presets(&self) -> &'static [Preset] {
        match self {
            ContentKind::Video => &[
                Preset::HighResVideo,
                Preset::LowResVideo,
                Preset::VideoSubtitle,
            ],
            ContentKind::Audio => &[Preset::Audio, Preset::VideoSubtitle],
            ContentKind::Document => &[Preset::Document, Preset::Epub, Preset::Bloompub],
            ContentKind::Html5 => &[Preset::Html5Zip],
            ContentKind::H5p => &[Preset::H5pZip],
            ContentKind::Slideshow => &[],
        }
    }

    pub fn allows(&self, preset: Preset) -> bool {
        self.allowed_presets().contains(&preset)
    }
}

/// What a raw locator string refers to, as far as can be told without
/// touching the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    Local(Utf8PathBuf),
    Web(Url),
    Inline(String),
}

impl Locator {
    pub fn as_local(&self) -> Option<&Utf8Path> {
        match self {
            Locator::Local(path) => Some(path.as_path()),
            _ => None,
        }
    }
}

impl FromStr for Locator {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(PipelineError::InvalidLocator(value.to_string()));
        }
        if trimmed.contains("data:") && trimmed.contains(";base64,") {
            return Ok(Locator::Inline(trimmed.to_string()));
        }
        if let Some(path) = local_path(trimmed) {
            return Ok(Locator::Local(path));
        }
        match Url::parse(trimmed) {
            Ok(url) if matches!(url.scheme(), "http" | "https") && url.host_str().is_some() => {
                Ok(Locator::Web(url))
            }
            Ok(url) => Err(PipelineError::InvalidLocator(format!(
                "unsupported scheme {}: {value}",
                url.scheme()
            ))),
            Err(_) => Ok(Locator::Local(normalize_path(trimmed))),
        }
    }
}

/// Resolves `file://` URLs and plain paths to a normalized filesystem path.
pub fn local_path(value: &str) -> Option<Utf8PathBuf> {
    if value.starts_with("file://") {
        let url = Url::parse(value).ok()?;
        let path = url.to_file_path().ok()?;
        return Utf8PathBuf::from_path_buf(path).ok();
    }
    if value.starts_with("http://") || value.starts_with("https://") {
        return None;
    }
    let path = normalize_path(value);
    path.as_std_path().exists().then_some(path)
}

pub fn normalize_path(value: &str) -> Utf8PathBuf {
    if std::path::MAIN_SEPARATOR == '/' && value.contains('\\') && !Utf8Path::new(value).exists()
    {
        return Utf8PathBuf::from(value.replace('\\', "/"));
    }
    Utf8PathBuf::from(value)
}

/// Lower-cased extension of the last path segment, ignoring query strings.
pub fn extension_of(locator: &str) -> Option<String> {
    let without_query = locator.split(['?', '#']).next().unwrap_or(locator);
    let name = without_query.rsplit(['/', '\\']).next()?;
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() || !ext.chars().all(|ch| ch.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

pub fn has_extension(locator: &str, extensions: &[&str]) -> bool {
    extension_of(locator)
        .map(|ext| extensions.contains(&ext.as_str()))
        .unwrap_or(false)
}

/// Maps a MIME type to the extension stored files use for it.
pub fn extension_for_mime(mime: &str) -> Option<&'static str> {
    let essence = mime.split(';').next().unwrap_or(mime).trim().to_ascii_lowercase();
    let ext = match essence.as_str() {
        "image/jpeg" | "image/jpg" | "image/pjpeg" => "jpg",
        "image/png" => "png",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/bmp" => "bmp",
        "image/tiff" => "tiff",
        "image/svg+xml" => "svg",
        "video/mp4" => "mp4",
        "video/webm" => "webm",
        "video/quicktime" => "mov",
        "video/x-msvideo" => "avi",
        "video/x-matroska" => "mkv",
        "audio/mpeg" | "audio/mp3" => "mp3",
        "audio/wav" | "audio/x-wav" | "audio/wave" => "wav",
        "audio/ogg" => "ogg",
        "audio/mp4" | "audio/x-m4a" => "m4a",
        "application/pdf" => "pdf",
        "application/epub+zip" => "epub",
        "application/zip" => "zip",
        "text/vtt" => "vtt",
        "application/x-subrip" => "srt",
        "application/ttml+xml" => "ttml",
        _ => return None,
    };
    Some(ext)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_web_locator() {
        let locator: Locator = "https://example.org/files/a.pdf".parse().unwrap();
        assert_matches!(locator, Locator::Web(_));
    }

    #[test]
    fn parse_inline_locator() {
        let locator: Locator = "data:image/png;base64,iVBORw0KGgo=".parse().unwrap();
        assert_matches!(locator, Locator::Inline(_));
    }

    #[test]
    fn reject_unsupported_scheme() {
        let err = "ftp://example.org/a.pdf".parse::<Locator>().unwrap_err();
        assert_matches!(err, PipelineError::InvalidLocator(_));
    }

    #[test]
    fn extension_ignores_query() {
        assert_eq!(
            extension_of("https://x.org/a/Video.MP4?token=1").as_deref(),
            Some("mp4")
        );
        assert_eq!(extension_of("https://x.org/a/"), None);
        assert_eq!(extension_of(".hidden"), None);
    }

    #[test]
    fn jpeg_spellings_share_extension() {
        assert_eq!(extension_for_mime("image/jpeg"), Some("jpg"));
        assert_eq!(extension_for_mime("image/jpg; charset=binary"), Some("jpg"));
    }

    #[test]
    fn kind_limits_presets() {
        assert!(ContentKind::Video.allows(Preset::LowResVideo));
        assert!(!ContentKind::Html5.allows(Preset::Document));
    }
}
