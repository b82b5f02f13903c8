use quick_xml::Reader;
use quick_xml::events::Event;

use crate::error::{ErrorKind, PipelineError};
use crate::handlers::{current_ext, read_source};
use crate::metadata::FileMetadata;
use crate::pipeline::{FileHandler, Workspace};
use crate::settings::Settings;

/// Checks that an SVG is well-formed markup with an `svg` root.
pub struct SvgHandler;

fn validate_svg(content: &[u8]) -> Result<(), String> {
    let mut reader = Reader::from_reader(content);
    reader.config_mut().check_end_names = true;
    let mut buf = Vec::new();
    let mut root = None;
    let mut depth = 0usize;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref element)) => {
                if depth == 0 && root.is_none() {
                    root = Some(element.local_name().as_ref().to_vec());
                }
                depth += 1;
            }
            Ok(Event::Empty(ref element)) => {
                if depth == 0 && root.is_none() {
                    root = Some(element.local_name().as_ref().to_vec());
                }
            }
            Ok(Event::End(_)) => depth = depth.saturating_sub(1),
            Ok(Event::Eof) => break,
            Err(err) => return Err(format!("malformed markup: {err}")),
            _ => {}
        }
        buf.clear();
    }
    if depth != 0 {
        return Err("unclosed elements".to_string());
    }
    match root.as_deref() {
        Some(b"svg") => Ok(()),
        Some(other) => Err(format!(
            "root element is {}, not svg",
            String::from_utf8_lossy(other)
        )),
        None => Err("no root element".to_string()),
    }
}

impl FileHandler for SvgHandler {
    fn name(&self) -> &'static str {
        "svg"
    }

    fn should_handle(&self, path: &str) -> bool {
        current_ext(path) == "svg"
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
        let content = read_source(path)?;
        validate_svg(&content).map_err(|reason| PipelineError::invalid_file(path, reason))?;
        Ok(Vec::new())
    }
}
