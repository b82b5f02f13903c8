use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::domain::Preset;
use crate::error::{ErrorKind, PipelineError};
use crate::handlers::current_ext;
use crate::media::{MediaTool, round_duration};
use crate::metadata::FileMetadata;
use crate::pipeline::{FileHandler, Workspace};
use crate::settings::{ExtractContext, Settings};

const VIDEO: &[&str] = &["mp4", "webm"];
const AUDIO: &[&str] = &["mp3"];
const STATIC: &[&str] = &["vtt", "pdf", "epub", "zip", "h5p", "bloompub", "bloomd"];

/// Assigns presets to finished files and probes durations of timed media.
pub struct ExtractHandler {
    media: Arc<dyn MediaTool>,
}

impl ExtractHandler {
    pub fn new(media: Arc<dyn MediaTool>) -> Self {
        Self { media }
    }

    /// Fast probe first, full decode when the container reports no duration.
    fn duration(&self, path: &str, probed: Option<f64>) -> Result<Option<u64>, PipelineError> {
        let seconds = match probed {
            Some(seconds) => Some(seconds),
            None => {
                debug!(%path, "no duration in container, decoding");
                self.media.decode_duration(Path::new(path))?
            }
        };
        Ok(seconds.map(round_duration))
    }
}

impl FileHandler for ExtractHandler {
    fn name(&self) -> &'static str {
        "extract"
    }

    fn should_handle(&self, path: &str) -> bool {
        let ext = current_ext(path);
        [VIDEO, AUDIO, STATIC]
            .iter()
            .any(|group| group.contains(&ext.as_str()))
    }

    fn handled_errors(&self) -> &'static [ErrorKind] {
        &[ErrorKind::InvalidFile, ErrorKind::ToolFailure]
    }

    fn handle_file(
        &self,
        path: &str,
        settings: &Settings,
        _skip_cache: bool,
        _ws: &Workspace,
    ) -> Result<Vec<FileMetadata>, PipelineError> {
        let ctx: ExtractContext = settings.context()?;
        let ext = current_ext(path);
        let mut duration = None;
        let mut preset = Preset::for_extension(&ext);

        if VIDEO.contains(&ext.as_str()) {
            let probe = self.media.probe(Path::new(path))?;
            let height = probe.height.unwrap_or(0);
            preset = Some(if height >= ctx.effective_high_res_min_height() {
                Preset::HighResVideo
            } else {
                Preset::LowResVideo
            });
            duration = self.duration(path, probe.duration)?;
        } else if AUDIO.contains(&ext.as_str()) {
            let probe = self.media.probe(Path::new(path))?;
            duration = self.duration(path, probe.duration)?;
        }

        if let Some(explicit) = ctx.preset {
            preset = Some(explicit);
        } else if let (Some(kind), Some(inferred)) = (ctx.kind, preset) {
            if !kind.allows(inferred) {
                warn!(%path, preset = %inferred, ?kind, "preset not allowed for content kind");
                preset = None;
            }
        }

        Ok(vec![
            FileMetadata::default()
                .with_preset(preset)
                .with_duration(duration),
        ])
    }
}
