use lopdf::Document;
use tracing::debug;

use crate::error::{ErrorKind, PipelineError};
use crate::handlers::current_ext;
use crate::metadata::FileMetadata;
use crate::pipeline::{FileHandler, Workspace};
use crate::settings::Settings;

/// Structural check: the document parses and has at least one page.
pub struct PdfHandler;

impl FileHandler for PdfHandler {
    fn name(&self) -> &'static str {
        "pdf"
    }

    fn should_handle(&self, path: &str) -> bool {
        current_ext(path) == "pdf"
    }

    fn handled_errors(&self) -> &'static [ErrorKind] {
        &[ErrorKind::InvalidFile, ErrorKind::SourceRead]
    }

    fn handle_file(
        &self,
        path: &str,
        _settings: &Settings,
        _skip_cache: bool,
        _ws: &Workspace,
    ) -> Result<Vec<FileMetadata>, PipelineError> {
        let document = Document::load(path)
            .map_err(|err| PipelineError::invalid_file(path, format!("unreadable pdf: {err}")))?;
        let pages = document.get_pages().len();
        if pages == 0 {
            return Err(PipelineError::invalid_file(path, "pdf has no pages"));
        }
        debug!(%path, pages, "pdf validated");
        Ok(Vec::new())
    }
}
