use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::cache::{CacheOp, cache_key};
use crate::error::{ErrorKind, PipelineError};
use crate::fs_util::utf8_path;
use crate::handlers::current_ext;
use crate::media::{MediaTool, video_args};
use crate::metadata::FileMetadata;
use crate::pipeline::{FileHandler, Workspace};
use crate::settings::{Settings, VideoContext};

pub const ACCEPTED: &[&str] = &["mp4", "webm"];
pub const CONVERTIBLE: &[&str] = &[
    "mov", "avi", "mkv", "flv", "m4v", "mpg", "mpeg", "ogv", "wmv", "3gp",
];

pub struct VideoHandler {
    media: Arc<dyn MediaTool>,
}

impl VideoHandler {
    pub fn new(media: Arc<dyn MediaTool>) -> Self {
        Self { media }
    }
}

impl FileHandler for VideoHandler {
    fn name(&self) -> &'static str {
        "video"
    }

    fn should_handle(&self, path: &str) -> bool {
        let ext = current_ext(path);
        ACCEPTED.contains(&ext.as_str()) || CONVERTIBLE.contains(&ext.as_str())
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
        let ctx: VideoContext = settings.context()?;
        let ext = current_ext(path);
        if ACCEPTED.contains(&ext.as_str()) && !ctx.compression_requested() {
            let probe = self.media.probe(Path::new(path))?;
            if !probe.has_video {
                return Err(PipelineError::invalid_file(path, "no decodable video stream"));
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
            info!(%path, max_height = ctx.effective_max_height(), crf = ctx.effective_crf(), "transcoding video");
            let output = ws.storage.temp_file("mp4")?;
            self.media
                .transcode(Path::new(path), output.path(), &video_args(&ctx))?;
            ws.storage.import_file(utf8_path(output.path())?, "mp4")
        })?;
        Ok(vec![ws.stored(filename)])
    }
}
