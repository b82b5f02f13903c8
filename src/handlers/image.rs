use std::io::Cursor;

use image::ImageFormat;
use tracing::debug;

use crate::error::{ErrorKind, PipelineError};
use crate::handlers::{current_ext, read_source};
use crate::metadata::FileMetadata;
use crate::pipeline::{FileHandler, Workspace};
use crate::settings::Settings;

pub const EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "bmp", "webp", "tif", "tiff", "ico",
];

/// Raster formats kept as they are.
fn canonical_ext(format: ImageFormat) -> Option<&'static str> {
    match format {
        ImageFormat::Png => Some("png"),
        ImageFormat::Jpeg => Some("jpg"),
        ImageFormat::Gif => Some("gif"),
        _ => None,
    }
}

/// Trusts the file signature over the extension. Every image is decoded;
/// anything outside png/jpg/gif is re-encoded as png.
pub struct ImageHandler;

impl FileHandler for ImageHandler {
    fn name(&self) -> &'static str {
        "image"
    }

    fn should_handle(&self, path: &str) -> bool {
        EXTENSIONS.contains(&current_ext(path).as_str())
    }

    fn handled_errors(&self) -> &'static [ErrorKind] {
        &[
            ErrorKind::InvalidFile,
            ErrorKind::UnsupportedFormat,
            ErrorKind::EmptyOutput,
            ErrorKind::SourceRead,
        ]
    }

    fn handle_file(
        &self,
        path: &str,
        _settings: &Settings,
        _skip_cache: bool,
        ws: &Workspace,
    ) -> Result<Vec<FileMetadata>, PipelineError> {
        let content = read_source(path)?;
        let format = image::guess_format(&content)
            .map_err(|err| PipelineError::invalid_file(path, format!("unknown image type: {err}")))?;
        let decoded = image::load_from_memory_with_format(&content, format)
            .map_err(|err| PipelineError::invalid_file(path, format!("image does not decode: {err}")))?;

        let current = current_ext(path);
        match canonical_ext(format) {
            Some(ext) if ext == current => Ok(Vec::new()),
            Some(ext) => {
                debug!(%path, %ext, "restoring image under its real extension");
                let filename = ws.storage.write_bytes(&content, ext)?;
                Ok(vec![ws.stored(filename)])
            }
            None => {
                debug!(%path, ?format, "re-encoding image as png");
                let mut encoded = Cursor::new(Vec::new());
                decoded
                    .write_to(&mut encoded, ImageFormat::Png)
                    .map_err(|err| PipelineError::invalid_file(path, format!("png encode: {err}")))?;
                let filename = ws.storage.write_bytes(encoded.get_ref(), "png")?;
                Ok(vec![ws.stored(filename)])
            }
        }
    }
}
