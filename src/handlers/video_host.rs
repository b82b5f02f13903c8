use std::sync::Arc;

use serde_json::json;

use crate::cache::{CacheOp, cache_key};
use crate::domain::extension_of;
use crate::error::{ErrorKind, PipelineError};
use crate::fs_util::utf8_path;
use crate::metadata::FileMetadata;
use crate::pipeline::{FileHandler, Workspace};
use crate::settings::{DownloadContext, Settings};
use crate::video_host::{VideoHostClient, VideoRequest, is_hosting_url};

/// Fetches videos, and optionally their subtitle tracks, from video-hosting
/// sites. Yields the video first, then one record per requested language.
pub struct VideoHostHandler {
    client: Arc<dyn VideoHostClient>,
}

impl VideoHostHandler {
    pub fn new(client: Arc<dyn VideoHostClient>) -> Self {
        Self { client }
    }

    fn fetch_video(
        &self,
        url: &str,
        request: &VideoRequest,
        skip_cache: bool,
        ws: &Workspace,
    ) -> Result<String, PipelineError> {
        let key = cache_key(
            CacheOp::Downloaded,
            url,
            Some(&json!({ "max_height": request.max_height })),
        )?;
        ws.cached_or_else(&key, skip_cache, || {
            let dir = ws.storage.temp_dir()?;
            let output = self.client.download_video(url, request, dir.path())?;
            let output = utf8_path(&output)?;
            let ext = extension_of(output.as_str()).unwrap_or_else(|| "mp4".to_string());
            ws.storage.import_file(output, &ext)
        })
    }

    fn fetch_subtitle(
        &self,
        url: &str,
        language: &str,
        use_proxy: bool,
        skip_cache: bool,
        ws: &Workspace,
    ) -> Result<String, PipelineError> {
        let key = cache_key(
            CacheOp::Downloaded,
            url,
            Some(&json!({ "subtitle_language": language })),
        )?;
        ws.cached_or_else(&key, skip_cache, || {
            let dir = ws.storage.temp_dir()?;
            let output = self
                .client
                .download_subtitle(url, language, use_proxy, dir.path())?;
            ws.storage.import_file(utf8_path(&output)?, "vtt")
        })
    }
}

impl FileHandler for VideoHostHandler {
    fn name(&self) -> &'static str {
        "video_host"
    }

    fn should_handle(&self, path: &str) -> bool {
        is_hosting_url(path)
    }

    fn handled_errors(&self) -> &'static [ErrorKind] {
        &[
            ErrorKind::Network,
            ErrorKind::InvalidLocator,
            ErrorKind::ToolFailure,
            ErrorKind::MissingLanguage,
            ErrorKind::SourceRead,
            ErrorKind::EmptyOutput,
        ]
    }

    fn handle_file(
        &self,
        path: &str,
        settings: &Settings,
        skip_cache: bool,
        ws: &Workspace,
    ) -> Result<Vec<FileMetadata>, PipelineError> {
        let ctx: DownloadContext = settings.context()?;
        let mut records = Vec::new();
        if !ctx.subtitles_only {
            let request = VideoRequest {
                max_height: ctx.effective_max_height(),
                use_proxy: ctx.use_proxy,
            };
            let filename = self.fetch_video(path, &request, skip_cache, ws)?;
            records.push(ws.stored(filename));
        }
        for language in &ctx.subtitle_languages {
            let filename = self.fetch_subtitle(path, language, ctx.use_proxy, skip_cache, ws)?;
            records.push(ws.stored(filename).with_language(Some(language.clone())));
        }
        Ok(records)
    }
}
