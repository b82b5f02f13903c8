use std::sync::Arc;

use tracing::info;

use crate::cache::{CacheOp, cache_key};
use crate::drive::{DriveClient, extract_file_id, is_drive_url};
use crate::error::{ErrorKind, PipelineError};
use crate::handlers::DOWNLOAD_ERRORS;
use crate::metadata::FileMetadata;
use crate::pipeline::{FileHandler, Workspace};
use crate::settings::{DownloadContext, Settings};

/// Downloads files behind cloud-drive share links.
pub struct DriveHandler {
    client: Arc<dyn DriveClient>,
}

impl DriveHandler {
    pub fn new(client: Arc<dyn DriveClient>) -> Self {
        Self { client }
    }
}

impl FileHandler for DriveHandler {
    fn name(&self) -> &'static str {
        "drive"
    }

    fn should_handle(&self, path: &str) -> bool {
        is_drive_url(path)
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
        let id = extract_file_id(path)
            .ok_or_else(|| PipelineError::InvalidLocator(format!("no file id in {path}")))?;
        let normalized = ws.normalize(path);
        let key = cache_key(CacheOp::Downloaded, &normalized, Some(&ctx))?;
        let name_key = cache_key(CacheOp::OriginalName, &normalized, None::<&Settings>)?;
        let mut original = None;
        let filename = ws.cached_or_else(&key, skip_cache, || {
            let file = self.client.file_info(&id)?;
            let ext = file
                .extension()
                .or_else(|| ctx.default_ext.clone())
                .ok_or_else(|| {
                    PipelineError::UnsupportedFormat(format!(
                        "drive file {id} has type {}",
                        file.mime_type
                    ))
                })?;
            info!(%id, %ext, native = file.is_native(), "fetching drive file");
            let mut staged = ws.storage.stage(&ext)?;
            self.client.download(&file, &mut staged)?;
            original = file.name.clone();
            staged.commit()
        })?;
        let original = match original {
            Some(name) => {
                ws.cache.set(&name_key, &name)?;
                Some(name)
            }
            None => ws.cache.get(&name_key)?,
        };
        Ok(vec![ws.stored(filename).with_original_filename(original)])
    }
}
