pub mod archive;
pub mod audio;
pub mod disk;
pub mod drive;
pub mod extract;
pub mod image;
pub mod inline;
pub mod pdf;
pub mod subtitles;
pub mod svg;
pub mod video;
pub mod video_host;
pub mod web;

use std::fs;

use crate::domain::extension_of;
use crate::error::{ErrorKind, PipelineError};

/// Per-file failures any download source can produce.
pub(crate) const DOWNLOAD_ERRORS: &[ErrorKind] = &[
    ErrorKind::Network,
    ErrorKind::HttpStatus,
    ErrorKind::InvalidLocator,
    ErrorKind::SourceRead,
    ErrorKind::UnsupportedFormat,
    ErrorKind::EmptyOutput,
];

pub(crate) fn current_ext(path: &str) -> String {
    extension_of(path).unwrap_or_default()
}

pub(crate) fn read_source(path: &str) -> Result<Vec<u8>, PipelineError> {
    fs::read(path).map_err(|err| PipelineError::SourceRead {
        path: path.to_string(),
        message: err.to_string(),
    })
}
