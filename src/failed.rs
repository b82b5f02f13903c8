use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tracing::warn;

use crate::error::{ErrorKind, PipelineError};

#[derive(Debug, Clone, Serialize)]
pub struct FailedFile {
    /// Locator the run started from.
    pub locator: String,
    /// Path the failing handler was given.
    pub path: String,
    pub handler: String,
    pub kind: ErrorKind,
    pub error: String,
    pub recorded_at: String,
}

/// Shared record of files that could not be processed. Clones share the
/// same underlying list.
#[derive(Debug, Clone, Default)]
pub struct FailedFiles {
    inner: Arc<Mutex<Vec<FailedFile>>>,
}

impl FailedFiles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a failure of `handler` on `path`. Without a `locator` the
    /// path itself is taken as the starting locator.
    pub fn record(
        &self,
        path: &str,
        locator: Option<&str>,
        handler: &str,
        error: &PipelineError,
    ) {
        let locator = locator.unwrap_or(path);
        warn!(%locator, %path, %handler, kind = %error.kind(), error = %error, "file failed");
        self.lock().push(FailedFile {
            locator: locator.to_string(),
            path: path.to_string(),
            handler: handler.to_string(),
            kind: error.kind(),
            error: error.to_string(),
            recorded_at: chrono::Utc::now().to_rfc3339(),
        });
    }

    pub fn snapshot(&self) -> Vec<FailedFile> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// True when a failure was recorded for `locator` or at `locator`.
    pub fn contains(&self, locator: &str) -> bool {
        self.lock()
            .iter()
            .any(|failed| failed.locator == locator || failed.path == locator)
    }

    fn lock(&self) -> MutexGuard<'_, Vec<FailedFile>> {
        // A panic while holding the lock cannot leave the list half-written.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_records() {
        let failed = FailedFiles::new();
        let other = failed.clone();
        other.record(
            "https://x.org/gone.mp4",
            None,
            "web",
            &PipelineError::HttpStatus {
                status: 404,
                url: "https://x.org/gone.mp4".to_string(),
            },
        );
        assert_eq!(failed.len(), 1);
        let snapshot = failed.snapshot();
        assert_eq!(snapshot[0].kind, ErrorKind::HttpStatus);
        assert!(snapshot[0].error.contains("404"));
        assert_eq!(snapshot[0].locator, "https://x.org/gone.mp4");
        assert!(failed.contains("https://x.org/gone.mp4"));
    }

    #[test]
    fn derived_path_keeps_starting_locator() {
        let failed = FailedFiles::new();
        failed.record(
            "/storage/a/b/ab12.epub",
            Some("https://x.org/book.epub"),
            "epub",
            &PipelineError::MissingEntry {
                path: "/storage/a/b/ab12.epub".to_string(),
                entry: "META-INF/container.xml".to_string(),
            },
        );
        let snapshot = failed.snapshot();
        assert_eq!(snapshot[0].locator, "https://x.org/book.epub");
        assert_eq!(snapshot[0].path, "/storage/a/b/ab12.epub");
        assert!(failed.contains("https://x.org/book.epub"));
        assert!(failed.contains("/storage/a/b/ab12.epub"));
    }
}
