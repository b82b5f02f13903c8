use tracing::debug;

use crate::captions::{self, UNKNOWN_LANGUAGE, write_webvtt};
use crate::error::{ErrorKind, PipelineError};
use crate::handlers::{current_ext, read_source};
use crate::metadata::FileMetadata;
use crate::pipeline::{FileHandler, Workspace};
use crate::settings::{Settings, SubtitleContext};

pub const EXTENSIONS: &[&str] = &["srt", "sbv", "vtt", "ttml", "dfxp"];

/// Reads any supported subtitle dialect and writes the requested language
/// back out as WebVTT.
pub struct SubtitleHandler;

impl FileHandler for SubtitleHandler {
    fn name(&self) -> &'static str {
        "subtitles"
    }

    fn should_handle(&self, path: &str) -> bool {
        EXTENSIONS.contains(&current_ext(path).as_str())
    }

    fn handled_errors(&self) -> &'static [ErrorKind] {
        &[
            ErrorKind::InvalidFile,
            ErrorKind::UnsupportedFormat,
            ErrorKind::MissingLanguage,
            ErrorKind::EmptyOutput,
            ErrorKind::SourceRead,
        ]
    }

    fn handle_file(
        &self,
        path: &str,
        settings: &Settings,
        _skip_cache: bool,
        ws: &Workspace,
    ) -> Result<Vec<FileMetadata>, PipelineError> {
        let ctx: SubtitleContext = settings.context()?;
        let content = read_source(path)?;
        let content = String::from_utf8_lossy(&content);
        let (dialect, mut tracks) = captions::read(&content).map_err(|err| match err {
            captions::CaptionError::UnknownDialect => {
                PipelineError::UnsupportedFormat(format!("{path}: unrecognized subtitle format"))
            }
            other => PipelineError::invalid_file(path, other.to_string()),
        })?;

        let language = match ctx.language {
            Some(language) => {
                tracks.resolve_unknown(&language);
                language
            }
            None => {
                let known = tracks
                    .languages()
                    .into_iter()
                    .filter(|language| *language != UNKNOWN_LANGUAGE)
                    .collect::<Vec<_>>();
                match known.as_slice() {
                    [only] => only.to_string(),
                    _ => {
                        return Err(PipelineError::MissingLanguage {
                            path: path.to_string(),
                            language: "unspecified".to_string(),
                        });
                    }
                }
            }
        };
        let cues = tracks
            .track(&language)
            .ok_or_else(|| PipelineError::MissingLanguage {
                path: path.to_string(),
                language: language.clone(),
            })?;
        debug!(%path, dialect = dialect.name(), %language, cues = cues.len(), "converting subtitles");
        let filename = ws.storage.write_bytes(write_webvtt(cues).as_bytes(), "vtt")?;
        Ok(vec![ws.stored(filename).with_language(Some(language))])
    }
}
