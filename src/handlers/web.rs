use std::sync::Arc;

use tracing::info;

use crate::cache::{CacheOp, cache_key};
use crate::domain::{Locator, extension_for_mime, extension_of};
use crate::error::{ErrorKind, PipelineError};
use crate::fs_util::utf8_path;
use crate::handlers::DOWNLOAD_ERRORS;
use crate::http::{ResponseInfo, WebClient, filename_from_url};
use crate::metadata::FileMetadata;
use crate::pipeline::{FileHandler, Workspace};
use crate::settings::{DownloadContext, Settings};

/// Catch-all HTTP(S) downloader.
pub struct WebHandler {
    client: Arc<dyn WebClient>,
}

impl WebHandler {
    pub fn new(client: Arc<dyn WebClient>) -> Self {
        Self { client }
    }
}

/// Picks the extension from the suggested filename, then the content type,
/// then the caller's fallback.
fn resolve_extension(
    info: &ResponseInfo,
    name: Option<&str>,
    default_ext: Option<&str>,
) -> Option<String> {
    name.and_then(extension_of)
        .or_else(|| {
            info.content_type
                .as_deref()
                .and_then(extension_for_mime)
                .map(|ext| ext.to_string())
        })
        .or_else(|| default_ext.map(|ext| ext.trim_start_matches('.').to_ascii_lowercase()))
}

impl FileHandler for WebHandler {
    fn name(&self) -> &'static str {
        "web"
    }

    fn should_handle(&self, path: &str) -> bool {
        matches!(path.parse::<Locator>(), Ok(Locator::Web(_)))
    }

    fn handled_errors(&self) -> &'static [ErrorKind] {
        DOWNLOAD_ERRORS
    }

    fn handle_file(
        &self,
        path: &str,
        settings: &Settings,
        skip_cache: bool,
        ws: &Workspace,
    ) -> Result<Vec<FileMetadata>, PipelineError> {
        let ctx: DownloadContext = settings.context()?;
        let key = cache_key(CacheOp::Downloaded, &ws.normalize(path), None::<&Settings>)?;
        let mut original = filename_from_url(path);
        let filename = ws.cached_or_else(&key, skip_cache, || {
            info!(url = %path, "downloading");
            let mut temp = ws.storage.temp_file("part")?;
            let response = self.client.fetch(path, temp.as_file_mut())?;
            let name = response
                .suggested_filename()
                .or_else(|| filename_from_url(&response.final_url))
                .or_else(|| original.clone());
            let ext = resolve_extension(&response, name.as_deref(), ctx.default_ext.as_deref())
                .ok_or_else(|| {
                    PipelineError::UnsupportedFormat(format!("cannot tell file type of {path}"))
                })?;
            if name.is_some() {
                original = name;
            }
            ws.storage.import_file(utf8_path(temp.path())?, &ext)
        })?;
        Ok(vec![ws.stored(filename).with_original_filename(original)])
    }
}
