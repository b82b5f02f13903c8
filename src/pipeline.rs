use std::fmt;
use std::sync::Arc;

use camino::Utf8Path;
use tracing::{debug, info, warn};

use crate::cache::FileCache;
use crate::config::PipelineConfig;
use crate::drive::{DriveClient, DriveHttpClient};
use crate::error::{ErrorKind, PipelineError};
use crate::failed::FailedFiles;
use crate::handlers::archive::{ArchiveFormat, ArchiveHandler};
use crate::handlers::audio::AudioHandler;
use crate::handlers::disk::DiskHandler;
use crate::handlers::drive::DriveHandler;
use crate::handlers::extract::ExtractHandler;
use crate::handlers::image::ImageHandler;
use crate::handlers::inline::InlineHandler;
use crate::handlers::pdf::PdfHandler;
use crate::handlers::subtitles::SubtitleHandler;
use crate::handlers::svg::SvgHandler;
use crate::handlers::video::VideoHandler;
use crate::handlers::video_host::VideoHostHandler;
use crate::handlers::web::WebHandler;
use crate::http::{HttpWebClient, WebClient};
use crate::media::{FfmpegTool, MediaTool};
use crate::metadata::FileMetadata;
use crate::settings::{SOURCE_LOCATOR_KEY, Settings};
use crate::store::Storage;
use crate::video_host::{VideoHostClient, YtDlpClient};

/// Shared resources every handler works against.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub storage: Storage,
    pub cache: FileCache,
    pub failed: FailedFiles,
}

impl Workspace {
    pub fn new(storage: Storage, cache: FileCache) -> Self {
        Self {
            storage,
            cache,
            failed: FailedFiles::new(),
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Result<Self, PipelineError> {
        let storage = config.storage()?;
        storage.ensure_root()?;
        Ok(Self::new(storage, config.cache()?))
    }

    /// Returns the cached filename for `key` when it still verifies against
    /// storage, otherwise runs `work` and records its result.
    pub fn cached_or_else<F>(
        &self,
        key: &str,
        skip_cache: bool,
        work: F,
    ) -> Result<String, PipelineError>
    where
        F: FnOnce() -> Result<String, PipelineError>,
    {
        if !skip_cache {
            if let Some(filename) = self.cache.get(key)? {
                if self.storage.verify(&filename)? {
                    debug!(%key, %filename, "cache hit");
                    return Ok(filename);
                }
                warn!(%key, %filename, "cached file is missing or corrupt, recomputing");
            } else {
                debug!(%key, "cache miss");
            }
        }
        let filename = work()?;
        self.cache.set(key, &filename)?;
        Ok(filename)
    }

    /// Record pointing at a finished storage artifact.
    pub fn stored(&self, filename: String) -> FileMetadata {
        let path = self.storage.path_for(&filename).to_string();
        FileMetadata::stored(filename, path)
    }

    pub fn normalize(&self, path: &str) -> String {
        self.storage.normalize_locator(path)
    }
}

pub trait FileHandler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Pure predicate over the current locator.
    fn should_handle(&self, path: &str) -> bool;

    /// Error kinds this handler treats as expected per-file failures.
    fn handled_errors(&self) -> &'static [ErrorKind];

    fn handle_file(
        &self,
        path: &str,
        settings: &Settings,
        skip_cache: bool,
        ws: &Workspace,
    ) -> Result<Vec<FileMetadata>, PipelineError>;

    fn execute(
        &self,
        path: &str,
        settings: &Settings,
        skip_cache: bool,
        ws: &Workspace,
    ) -> Result<Vec<FileMetadata>, PipelineError> {
        debug!(handler = self.name(), %path, "handling file");
        self.handle_file(path, settings, skip_cache, ws)
            .inspect_err(|err| {
                if self.handled_errors().contains(&err.kind()) {
                    ws.failed.record(path, settings.source_locator(), self.name(), err);
                }
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageRole {
    Download,
    Convert,
    ExtractMetadata,
}

impl fmt::Display for StageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StageRole::Download => "DOWNLOAD",
            StageRole::Convert => "CONVERT",
            StageRole::ExtractMetadata => "EXTRACT_METADATA",
        };
        f.write_str(name)
    }
}

/// Ordered handlers of which the first to claim a locator runs.
pub struct Stage {
    role: StageRole,
    handlers: Vec<Box<dyn FileHandler>>,
}

impl Stage {
    pub fn new(role: StageRole, handlers: Vec<Box<dyn FileHandler>>) -> Self {
        Self { role, handlers }
    }

    pub fn role(&self) -> StageRole {
        self.role
    }

    pub fn handler_names(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|handler| handler.name()).collect()
    }

    pub fn should_handle(&self, path: &str) -> bool {
        self.handlers.iter().any(|handler| handler.should_handle(path))
    }

    pub fn execute(
        &self,
        path: &str,
        settings: &Settings,
        skip_cache: bool,
        ws: &Workspace,
    ) -> Result<Vec<FileMetadata>, PipelineError> {
        let Some(handler) = self
            .handlers
            .iter()
            .find(|handler| handler.should_handle(path))
        else {
            if self.role == StageRole::Download {
                let err = PipelineError::NoHandler(path.to_string());
                let stage = self.role.to_string();
                ws.failed.record(path, settings.source_locator(), &stage, &err);
                return Err(err);
            }
            return Ok(Vec::new());
        };
        info!(stage = %self.role, handler = handler.name(), %path, "dispatching");
        let produced = handler.execute(path, settings, skip_cache, ws)?;
        if produced.is_empty() && self.role == StageRole::Download {
            let err = PipelineError::NoDownloadResult(path.to_string());
            ws.failed.record(path, settings.source_locator(), handler.name(), &err);
            return Err(err);
        }
        Ok(produced)
    }
}

/// External clients the standard handlers talk to.
#[derive(Clone)]
pub struct Tools {
    pub web: Arc<dyn WebClient>,
    pub drive: Arc<dyn DriveClient>,
    pub video_host: Arc<dyn VideoHostClient>,
    pub media: Arc<dyn MediaTool>,
}

impl Tools {
    pub fn from_config(config: &PipelineConfig) -> Result<Self, PipelineError> {
        Ok(Self {
            web: Arc::new(HttpWebClient::new(&config.network)?),
            drive: Arc::new(DriveHttpClient::new(
                &config.network,
                config.drive_api_key(),
            )?),
            video_host: Arc::new(YtDlpClient::new(
                &config.tools.yt_dlp,
                config.network.proxies.clone(),
            )),
            media: Arc::new(FfmpegTool::new(&config.tools)),
        })
    }
}

pub struct Pipeline {
    workspace: Workspace,
    stages: Vec<Stage>,
    defaults: Settings,
}

impl Pipeline {
    pub fn new(workspace: Workspace, stages: Vec<Stage>) -> Self {
        Self {
            workspace,
            stages,
            defaults: Settings::new(),
        }
    }

    pub fn with_defaults(mut self, defaults: Settings) -> Self {
        self.defaults = defaults;
        self
    }

    /// Download, convert and extract stages in their canonical order.
    /// Specific download sources come before the generic web fetcher.
    pub fn standard(workspace: Workspace, tools: Tools) -> Self {
        let download = Stage::new(
            StageRole::Download,
            vec![
                Box::new(DiskHandler),
                Box::new(InlineHandler),
                Box::new(DriveHandler::new(tools.drive.clone())),
                Box::new(VideoHostHandler::new(tools.video_host.clone())),
                Box::new(WebHandler::new(tools.web.clone())),
            ],
        );
        let convert = Stage::new(
            StageRole::Convert,
            vec![
                Box::new(VideoHandler::new(tools.media.clone())),
                Box::new(AudioHandler::new(tools.media.clone())),
                Box::new(SubtitleHandler),
                Box::new(ImageHandler),
                Box::new(SvgHandler),
                Box::new(PdfHandler),
                Box::new(ArchiveHandler::new(ArchiveFormat::Epub, tools.media.clone())),
                Box::new(ArchiveHandler::new(ArchiveFormat::Html5, tools.media.clone())),
                Box::new(ArchiveHandler::new(ArchiveFormat::H5p, tools.media.clone())),
                Box::new(ArchiveHandler::new(ArchiveFormat::Bloom, tools.media.clone())),
            ],
        );
        let extract = Stage::new(
            StageRole::ExtractMetadata,
            vec![Box::new(ExtractHandler::new(tools.media))],
        );
        Self::new(workspace, vec![download, convert, extract])
    }

    pub fn from_config(config: &PipelineConfig) -> Result<Self, PipelineError> {
        let workspace = Workspace::from_config(config)?;
        let tools = Tools::from_config(config)?;
        Ok(Self::standard(workspace, tools).with_defaults(config.defaults.clone()))
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn failed(&self) -> &FailedFiles {
        &self.workspace.failed
    }

    /// Runs `locator` through every stage. Each record is handled with the
    /// pipeline defaults, the call settings and its own accumulated fields,
    /// and is replaced by its merge with every record the stage produced.
    pub fn execute(
        &self,
        locator: &str,
        settings: &Settings,
        skip_cache: bool,
    ) -> Result<Vec<FileMetadata>, PipelineError> {
        let base = self
            .defaults
            .overlay(settings)
            .with(SOURCE_LOCATOR_KEY, locator);
        let mut records = vec![FileMetadata::from_path(locator)];
        for stage in &self.stages {
            let mut next = Vec::with_capacity(records.len());
            for record in records {
                let path = record.path.clone().unwrap_or_default();
                // the download stage must run to report unclaimed locators
                if stage.role() != StageRole::Download && !stage.should_handle(&path) {
                    next.push(record);
                    continue;
                }
                let scoped = base.overlay_metadata(&record);
                let produced = stage.execute(&path, &scoped, skip_cache, &self.workspace)?;
                if produced.is_empty() {
                    next.push(record);
                } else {
                    next.extend(produced.iter().map(|update| record.merge(update)));
                }
            }
            records = next;
        }
        info!(%locator, files = records.len(), "pipeline finished");
        Ok(records)
    }

    /// Checks that a stored file still hashes to its name.
    pub fn verify(&self, filename: &str) -> Result<bool, PipelineError> {
        let filename = Utf8Path::new(filename)
            .file_name()
            .unwrap_or(filename)
            .to_string();
        self.workspace.storage.verify(&filename)
    }
}
