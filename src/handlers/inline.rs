use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use regex::Regex;

use crate::error::{ErrorKind, PipelineError};
use crate::metadata::FileMetadata;
use crate::pipeline::{FileHandler, Workspace};
use crate::settings::Settings;

const DATA_URI: &str =
    r"data:([A-Za-z0-9.+-]+)/([A-Za-z0-9.+-]+)(?:;[^;,]*)*?;base64,([A-Za-z0-9+/=\s]+)";

/// Decodes `data:{type}/{subtype};base64,...` payloads straight into storage.
pub struct InlineHandler;

#[derive(Debug, PartialEq, Eq)]
struct DataUri {
    ext: String,
    payload: String,
}

fn parse_data_uri(value: &str) -> Option<DataUri> {
    let pattern = Regex::new(DATA_URI).ok()?;
    let caps = pattern.captures(value)?;
    let media_type = caps[1].to_ascii_lowercase();
    let subtype = caps[2].to_ascii_lowercase();
    let ext = match (media_type.as_str(), subtype.as_str()) {
        (_, "jpeg" | "jpg" | "pjpeg") => "jpg".to_string(),
        (_, "svg+xml") => "svg".to_string(),
        ("audio", "mpeg" | "mp3") => "mp3".to_string(),
        (_, "x-subrip") => "srt".to_string(),
        (_, other) => other.to_string(),
    };
    let payload = caps[3].split_whitespace().collect::<String>();
    Some(DataUri { ext, payload })
}

impl FileHandler for InlineHandler {
    fn name(&self) -> &'static str {
        "inline"
    }

    fn should_handle(&self, path: &str) -> bool {
        path.contains("data:") && path.contains(";base64,")
    }

    fn handled_errors(&self) -> &'static [ErrorKind] {
        &[
            ErrorKind::InvalidFile,
            ErrorKind::UnsupportedFormat,
            ErrorKind::EmptyOutput,
        ]
    }

    fn handle_file(
        &self,
        path: &str,
        _settings: &Settings,
        _skip_cache: bool,
        ws: &Workspace,
    ) -> Result<Vec<FileMetadata>, PipelineError> {
        let uri = parse_data_uri(path).ok_or_else(|| {
            PipelineError::UnsupportedFormat("malformed data uri".to_string())
        })?;
        let content = STANDARD
            .decode(uri.payload.as_bytes())
            .map_err(|err| PipelineError::invalid_file("data uri", err.to_string()))?;
        let filename = ws.storage.write_bytes(&content, &uri.ext)?;
        Ok(vec![ws.stored(filename)])
    }
}
