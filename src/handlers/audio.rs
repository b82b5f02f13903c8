use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::cache::{CacheOp, cache_key};
use crate::error::{ErrorKind, PipelineError};
use crate::fs_util::utf8_path;
use crate::handlers::current_ext;
use crate::media::{MediaTool, audio_args};
use crate::metadata::FileMetadata;
use crate::pipeline::{FileHandler, Workspace};
use crate::settings::{AudioContext, Settings};

pub const CANONICAL: &str = "mp3";
pub const CONVERTIBLE: &[&str] = &["wav", "ogg", "m4a", "aac", "flac", "wma", "opus"];

pub struct AudioHandler {
    media: Arc<dyn MediaTool>,
}

impl AudioHandler {
    pub fn new(media: Arc<dyn MediaTool>) -> Self {
        Self { media }
    }
}

impl FileHandler for AudioHandler {
    fn name(&self) -> &'static str {
        "audio"
    }

    fn should_handle(&self, path: &str) -> bool {
        let ext = current_ext(path);
        ext == CANONICAL || CONVERTIBLE.contains(&ext.as_str())
    }

    fn handled_errors(&self) -> &'static [ErrorKind] {
        &[
            ErrorKind::InvalidFile,
            ErrorKind::ToolFailure,
            ErrorKind::EmptyOutput,
            ErrorKind::SourceRead,
        ]
    }

    fn handle_file(
        &self,
        path: &str,
        settings: &Settings,
        skip_cache: bool,
        ws: &Workspace,
    ) -> Result<Vec<FileMetadata>, PipelineError> {
        let ctx: AudioContext = settings.context()?;
        if current_ext(path) == CANONICAL && !ctx.compression_requested() {
            let probe = self.media.probe(Path::new(path))?;
            if !probe.has_audio {
                return Err(PipelineError::invalid_file(path, "no decodable audio stream"));
            }
            return Ok(Vec::new());
        }

        let op = if ctx.compression_requested() {
            CacheOp::Compressed
        } else {
            CacheOp::Converted
        };
        let key = cache_key(op, &ws.normalize(path), Some(&ctx))?;
        let filename = ws.cached_or_else(&key, skip_cache, || {
            info!(%path, "transcoding audio");
            let output = ws.storage.temp_file(CANONICAL)?;
            self.media
                .transcode(Path::new(path), output.path(), &audio_args(&ctx))?;
            ws.storage.import_file(utf8_path(output.path())?, CANONICAL)
        })?;
        Ok(vec![ws.stored(filename)])
    }
}
