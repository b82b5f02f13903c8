use std::fs;
use std::io::{self, Read, Seek, Write};
use std::path::Path;

use camino::Utf8Path;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipArchive, ZipWriter};

use crate::error::PipelineError;

pub type Archive = ZipArchive<fs::File>;

pub fn utf8_path(path: &Path) -> Result<&Utf8Path, PipelineError> {
    Utf8Path::from_path(path)
        .ok_or_else(|| PipelineError::Filesystem(format!("non utf-8 path: {}", path.display())))
}

pub fn open_zip(zip_path: &Utf8Path) -> Result<Archive, PipelineError> {
    let file = fs::File::open(zip_path.as_std_path())
        .map_err(|err| PipelineError::Filesystem(format!("open zip {zip_path}: {err}")))?;
    ZipArchive::new(file).map_err(|err| {
        PipelineError::invalid_file(zip_path.as_str(), format!("not a zip archive: {err}"))
    })
}

pub fn entry_names<R: Read + Seek>(archive: &ZipArchive<R>) -> Vec<String> {
    archive.file_names().map(|name| name.to_string()).collect()
}

/// Reads a required entry, failing with the entry name when absent.
pub fn read_entry<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    zip_path: &str,
    name: &str,
) -> Result<Vec<u8>, PipelineError> {
    let mut entry = archive.by_name(name).map_err(|_| PipelineError::MissingEntry {
        path: zip_path.to_string(),
        entry: name.to_string(),
    })?;
    let mut content = Vec::new();
    entry
        .read_to_end(&mut content)
        .map_err(|err| PipelineError::invalid_file(zip_path, format!("read {name}: {err}")))?;
    Ok(content)
}

/// Decompresses every entry, failing on the first corrupt one.
pub fn validate_zip<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    zip_path: &str,
) -> Result<(), PipelineError> {
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| PipelineError::invalid_file(zip_path, err.to_string()))?;
        if entry.is_dir() {
            continue;
        }
        io::copy(&mut entry, &mut io::sink())
            .map_err(|err| PipelineError::invalid_file(zip_path, err.to_string()))?;
    }
    Ok(())
}

fn entry_options() -> SimpleFileOptions {
    SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(DateTime::default())
        .unix_permissions(0o644)
}

/// Re-creates an archive entry by entry, passing each file entry through
/// `transform`. Entry order is kept and timestamps are fixed, so the same
/// input always yields the same output bytes.
pub fn rewrite_archive<R, W, F>(
    archive: &mut ZipArchive<R>,
    output: W,
    mut transform: F,
) -> Result<W, PipelineError>
where
    R: Read + Seek,
    W: Write + Seek,
    F: FnMut(&str, Vec<u8>) -> Result<Vec<u8>, PipelineError>,
{
    let mut writer = ZipWriter::new(output);
    for i in 0..archive.len() {
        let (name, is_dir, content) = {
            let mut entry = archive
                .by_index(i)
                .map_err(|err| PipelineError::invalid_file("archive", err.to_string()))?;
            let name = entry.name().to_string();
            let mut content = Vec::new();
            if !entry.is_dir() {
                entry
                    .read_to_end(&mut content)
                    .map_err(|err| PipelineError::invalid_file(name.as_str(), err.to_string()))?;
            }
            (name, entry.is_dir(), content)
        };
        if is_dir {
            writer
                .add_directory(name.as_str(), entry_options())
                .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
            continue;
        }
        let content = transform(&name, content)?;
        writer
            .start_file(name.as_str(), entry_options())
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        writer
            .write_all(&content)
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
    }
    writer
        .finish()
        .map_err(|err| PipelineError::Filesystem(err.to_string()))
}
