use crate::domain::{extension_of, local_path};
use crate::error::{ErrorKind, PipelineError};
use crate::handlers::DOWNLOAD_ERRORS;
use crate::metadata::FileMetadata;
use crate::pipeline::{FileHandler, Workspace};
use crate::settings::{DownloadContext, Settings};

/// Copies a file that already exists on the local filesystem into storage.
pub struct DiskHandler;

impl FileHandler for DiskHandler {
    fn name(&self) -> &'static str {
        "disk"
    }

    fn should_handle(&self, path: &str) -> bool {
        local_path(path)
            .map(|path| path.as_std_path().is_file())
            .unwrap_or(false)
    }

    fn handled_errors(&self) -> &'static [ErrorKind] {
        DOWNLOAD_ERRORS
    }

    fn handle_file(
        &self,
        path: &str,
        settings: &Settings,
        _skip_cache: bool,
        ws: &Workspace,
    ) -> Result<Vec<FileMetadata>, PipelineError> {
        let ctx: DownloadContext = settings.context()?;
        let source = local_path(path).ok_or_else(|| PipelineError::SourceRead {
            path: path.to_string(),
            message: "file does not exist".to_string(),
        })?;
        let ext = extension_of(source.as_str())
            .or(ctx.default_ext)
            .ok_or_else(|| PipelineError::UnsupportedFormat(format!("no extension: {path}")))?;
        let filename = ws.storage.import_file(&source, &ext)?;
        let original = source.file_name().map(|name| name.to_string());
        Ok(vec![ws.stored(filename).with_original_filename(original)])
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use camino::Utf8PathBuf;

    use super::*;
    use crate::cache::FileCache;
    use crate::store::{Storage, hash_bytes};

    fn workspace(temp: &tempfile::TempDir) -> Workspace {
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        Workspace::new(Storage::new(root.join("storage")), FileCache::new(root.join("cache")))
    }

    #[test]
    fn imports_local_file() {
        let temp = tempfile::tempdir().unwrap();
        let ws = workspace(&temp);
        let source = temp.path().join("Lesson One.PDF");
        std::fs::write(&source, b"%PDF-1.4 body").unwrap();
        let source = source.to_str().unwrap();

        assert!(DiskHandler.should_handle(source));
        let records = DiskHandler
            .handle_file(source, &Settings::new(), false, &ws)
            .unwrap();
        let expected = format!("{}.pdf", hash_bytes(b"%PDF-1.4 body"));
        assert_eq!(records[0].filename.as_deref(), Some(expected.as_str()));
        assert_eq!(records[0].original_filename.as_deref(), Some("Lesson One.PDF"));
    }

    #[test]
    fn missing_extension_uses_default() {
        let temp = tempfile::tempdir().unwrap();
        let ws = workspace(&temp);
        let source = temp.path().join("README");
        std::fs::write(&source, b"text").unwrap();
        let source = source.to_str().unwrap();

        let err = DiskHandler
            .handle_file(source, &Settings::new(), false, &ws)
            .unwrap_err();
        assert_matches!(err, PipelineError::UnsupportedFormat(_));

        let settings = Settings::new().with("default_ext", "txt");
        let records = DiskHandler.handle_file(source, &settings, false, &ws).unwrap();
        assert!(records[0].filename.as_deref().unwrap().ends_with(".txt"));
    }

    #[test]
    fn does_not_claim_missing_paths_or_urls() {
        assert!(!DiskHandler.should_handle("/definitely/not/here.pdf"));
        assert!(!DiskHandler.should_handle("https://x.org/a.pdf"));
    }
}
