use std::fs;
use std::io::{Read, Seek};
use std::path::Path;
use std::sync::Arc;

use quick_xml::Reader;
use quick_xml::events::Event;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, info};
use zip::ZipArchive;

use crate::cache::{CacheOp, cache_key};
use crate::domain::extension_of;
use crate::error::{ErrorKind, PipelineError};
use crate::fs_util::{entry_names, open_zip, read_entry, rewrite_archive, utf8_path, validate_zip};
use crate::handlers::current_ext;
use crate::media::{MediaTool, audio_args, video_args};
use crate::metadata::FileMetadata;
use crate::pipeline::{FileHandler, Workspace};
use crate::settings::{ArchiveContext, Settings};
use crate::store::Storage;

/// Zip-based container formats, each with its own required entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Epub,
    Html5,
    H5p,
    Bloom,
}

impl ArchiveFormat {
    pub fn name(&self) -> &'static str {
        match self {
            ArchiveFormat::Epub => "epub",
            ArchiveFormat::Html5 => "html5",
            ArchiveFormat::H5p => "h5p",
            ArchiveFormat::Bloom => "bloom",
        }
    }

    pub fn extensions(&self) -> &'static [&'static str] {
        match self {
            ArchiveFormat::Epub => &["epub"],
            ArchiveFormat::Html5 => &["zip"],
            ArchiveFormat::H5p => &["h5p"],
            ArchiveFormat::Bloom => &["bloompub", "bloomd"],
        }
    }

    pub fn validate<R: Read + Seek>(
        &self,
        archive: &mut ZipArchive<R>,
        path: &str,
    ) -> Result<(), PipelineError> {
        match self {
            ArchiveFormat::Epub => validate_epub(archive, path),
            ArchiveFormat::Html5 => validate_html5(archive, path),
            ArchiveFormat::H5p => validate_h5p(archive, path),
            ArchiveFormat::Bloom => validate_bloom(archive, path),
        }
    }
}

fn xml_attribute(content: &[u8], element: &[u8], attribute: &[u8]) -> Option<String> {
    let mut reader = Reader::from_reader(content);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e))
                if e.local_name().as_ref() == element =>
            {
                return e
                    .attributes()
                    .flatten()
                    .find(|attr| attr.key.local_name().as_ref() == attribute)
                    .and_then(|attr| attr.unescape_value().ok().map(|v| v.into_owned()));
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
        buf.clear();
    }
}

fn has_xml_element(content: &[u8], element: &[u8]) -> Result<bool, String> {
    let mut reader = Reader::from_reader(content);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e))
                if e.local_name().as_ref() == element =>
            {
                return Ok(true);
            }
            Ok(Event::Eof) => return Ok(false),
            Err(err) => return Err(err.to_string()),
            _ => {}
        }
        buf.clear();
    }
}

fn validate_epub<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    path: &str,
) -> Result<(), PipelineError> {
    let container = read_entry(archive, path, "META-INF/container.xml")?;
    let rootfile = xml_attribute(&container, b"rootfile", b"full-path")
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| {
            PipelineError::invalid_file(path, "META-INF/container.xml names no rootfile")
        })?;
    let package = read_entry(archive, path, rootfile.trim())?;
    match has_xml_element(&package, b"manifest") {
        Ok(true) => Ok(()),
        Ok(false) => Err(PipelineError::invalid_file(
            path,
            format!("{rootfile} has no manifest"),
        )),
        Err(err) => Err(PipelineError::invalid_file(
            path,
            format!("{rootfile} is not valid xml: {err}"),
        )),
    }
}

fn validate_html5<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    path: &str,
) -> Result<(), PipelineError> {
    let index = read_entry(archive, path, "index.html")?;
    let index = String::from_utf8_lossy(&index);
    let body = Regex::new(r"(?is)<body[^>]*>(.*?)</body>")
        .ok()
        .and_then(|pattern| pattern.captures(&index).map(|caps| caps[1].to_string()));
    let content = body.unwrap_or_else(|| index.to_string());
    if content.trim().is_empty() {
        return Err(PipelineError::invalid_file(path, "index.html has an empty body"));
    }
    Ok(())
}

fn parse_json_entry<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    path: &str,
    name: &str,
) -> Result<Value, PipelineError> {
    let content = read_entry(archive, path, name)?;
    serde_json::from_slice(&content)
        .map_err(|err| PipelineError::invalid_file(path, format!("{name} is not valid json: {err}")))
}

fn validate_h5p<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    path: &str,
) -> Result<(), PipelineError> {
    let manifest = parse_json_entry(archive, path, "h5p.json")?;
    let manifest = manifest
        .as_object()
        .ok_or_else(|| PipelineError::invalid_file(path, "h5p.json is not an object"))?;
    for field in ["title", "mainLibrary"] {
        if !manifest.get(field).is_some_and(Value::is_string) {
            return Err(PipelineError::invalid_file(
                path,
                format!("h5p.json is missing {field}"),
            ));
        }
    }
    if !manifest
        .get("preloadedDependencies")
        .is_some_and(Value::is_array)
    {
        return Err(PipelineError::invalid_file(
            path,
            "h5p.json is missing preloadedDependencies",
        ));
    }
    parse_json_entry(archive, path, "content/content.json")?;
    Ok(())
}

fn validate_bloom<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    path: &str,
) -> Result<(), PipelineError> {
    let meta = parse_json_entry(archive, path, "meta.json")?;
    if !meta.is_object() {
        return Err(PipelineError::invalid_file(path, "meta.json is not an object"));
    }
    let pages = entry_names(archive)
        .into_iter()
        .filter(|name| name.to_ascii_lowercase().ends_with(".htm"))
        .collect::<Vec<_>>();
    for page in &pages {
        if !read_entry(archive, path, page)?.iter().all(u8::is_ascii_whitespace) {
            return Ok(());
        }
    }
    Err(PipelineError::MissingEntry {
        path: path.to_string(),
        entry: "*.htm".to_string(),
    })
}

/// Validates one zip-based format and, when asked, recompresses the audio
/// and video members it carries.
pub struct ArchiveHandler {
    format: ArchiveFormat,
    media: Arc<dyn MediaTool>,
}

impl ArchiveHandler {
    pub fn new(format: ArchiveFormat, media: Arc<dyn MediaTool>) -> Self {
        Self { format, media }
    }

    fn compress_member(
        &self,
        storage: &Storage,
        name: &str,
        content: Vec<u8>,
        ctx: &ArchiveContext,
    ) -> Result<Vec<u8>, PipelineError> {
        let args = match extension_of(name).as_deref() {
            Some("mp4") => video_args(&ctx.video()),
            Some("mp3") => audio_args(&ctx.audio()),
            _ => return Ok(content),
        };
        let ext = extension_of(name).unwrap_or_default();
        debug!(member = %name, "compressing archive member");
        let mut input = storage.temp_file(&ext)?;
        std::io::Write::write_all(&mut input, &content)
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        let output = storage.temp_file(&ext)?;
        self.media.transcode(input.path(), output.path(), &args)?;
        let compressed =
            fs::read(output.path()).map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        if compressed.is_empty() {
            return Err(PipelineError::EmptyOutput(name.to_string()));
        }
        Ok(compressed)
    }
}

impl FileHandler for ArchiveHandler {
    fn name(&self) -> &'static str {
        self.format.name()
    }

    fn should_handle(&self, path: &str) -> bool {
        self.format
            .extensions()
            .contains(&current_ext(path).as_str())
    }

    fn handled_errors(&self) -> &'static [ErrorKind] {
        &[
            ErrorKind::InvalidFile,
            ErrorKind::ToolFailure,
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
        let ctx: ArchiveContext = settings.context()?;
        let source = utf8_path(Path::new(path))?;
        let mut archive = open_zip(source)?;
        validate_zip(&mut archive, path)?;
        self.format.validate(&mut archive, path)?;
        if !ctx.compress {
            return Ok(Vec::new());
        }

        let ext = current_ext(path);
        let key = cache_key(CacheOp::Compressed, &ws.normalize(path), Some(&ctx))?;
        let filename = ws.cached_or_else(&key, skip_cache, || {
            info!(%path, format = self.format.name(), "rewriting archive");
            let output = ws.storage.temp_file(&ext)?;
            let file = output
                .reopen()
                .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
            rewrite_archive(&mut archive, file, |name, content| {
                self.compress_member(&ws.storage, name, content, &ctx)
            })?;
            ws.storage.import_file(utf8_path(output.path())?, &ext)
        })?;
        Ok(vec![ws.stored(filename)])
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Write};

    use assert_matches::assert_matches;
    use zip::ZipWriter;
    use zip::write::SimpleFileOptions;

    use super::*;

    fn build_zip(entries: &[(&str, &[u8])]) -> ZipArchive<Cursor<Vec<u8>>> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, content) in entries {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(content).unwrap();
        }
        ZipArchive::new(Cursor::new(writer.finish().unwrap().into_inner())).unwrap()
    }

    const CONTAINER: &[u8] = br#"<?xml version="1.0"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles><rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/></rootfiles>
</container>"#;

    #[test]
    fn epub_requires_manifest_in_package() {
        let mut ok = build_zip(&[
            ("META-INF/container.xml", CONTAINER),
            ("OEBPS/content.opf", b"<package><manifest><item id=\"a\"/></manifest></package>"),
        ]);
        assert!(ArchiveFormat::Epub.validate(&mut ok, "book.epub").is_ok());

        let mut bare = build_zip(&[
            ("META-INF/container.xml", CONTAINER),
            ("OEBPS/content.opf", b"<package><metadata/></package>"),
        ]);
        let err = ArchiveFormat::Epub.validate(&mut bare, "book.epub").unwrap_err();
        assert!(err.to_string().contains("manifest"));

        let mut dangling = build_zip(&[("META-INF/container.xml", CONTAINER)]);
        let err = ArchiveFormat::Epub.validate(&mut dangling, "book.epub").unwrap_err();
        assert_matches!(err, PipelineError::MissingEntry { ref entry, .. } if entry == "OEBPS/content.opf");
    }

    #[test]
    fn html5_body_must_have_content() {
        let mut empty = build_zip(&[("index.html", b"<html><body>  \n</body></html>")]);
        assert!(ArchiveFormat::Html5.validate(&mut empty, "app.zip").is_err());
        let mut full = build_zip(&[("index.html", b"<html><BODY class=x><p>hi</p></BODY></html>")]);
        assert!(ArchiveFormat::Html5.validate(&mut full, "app.zip").is_ok());
    }

    #[test]
    fn h5p_manifest_fields() {
        let manifest = br#"{"title":"Quiz","mainLibrary":"H5P.MultiChoice","preloadedDependencies":[]}"#;
        let mut ok = build_zip(&[("h5p.json", manifest), ("content/content.json", b"{}")]);
        assert!(ArchiveFormat::H5p.validate(&mut ok, "quiz.h5p").is_ok());

        let mut no_content = build_zip(&[("h5p.json", manifest)]);
        assert_matches!(
            ArchiveFormat::H5p.validate(&mut no_content, "quiz.h5p"),
            Err(PipelineError::MissingEntry { .. })
        );

        let mut no_title = build_zip(&[
            ("h5p.json", br#"{"mainLibrary":"X","preloadedDependencies":[]}"#),
            ("content/content.json", b"{}"),
        ]);
        let err = ArchiveFormat::H5p.validate(&mut no_title, "quiz.h5p").unwrap_err();
        assert!(err.to_string().contains("title"));
    }

    #[test]
    fn bloom_needs_a_page() {
        let mut ok = build_zip(&[("meta.json", b"{}"), ("book.htm", b"<html>page</html>")]);
        assert!(ArchiveFormat::Bloom.validate(&mut ok, "b.bloompub").is_ok());
        let mut none = build_zip(&[("meta.json", b"{}"), ("book.htm", b"  ")]);
        assert!(ArchiveFormat::Bloom.validate(&mut none, "b.bloompub").is_err());
    }
}
