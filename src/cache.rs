use std::fmt;
use std::fs;
use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::PipelineError;
use crate::store::{app_cache_dir, hash_bytes};

/// Symbolic tag naming the unit of work a cache entry stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOp {
    Downloaded,
    Compressed,
    Converted,
    Encoded,
    OriginalName,
}

impl fmt::Display for CacheOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            CacheOp::Downloaded => "DOWNLOADED",
            CacheOp::Compressed => "COMPRESSED",
            CacheOp::Converted => "CONVERTED",
            CacheOp::Encoded => "ENCODED",
            CacheOp::OriginalName => "ORIGINAL_NAME",
        };
        f.write_str(tag)
    }
}

/// Builds `{OP}: {locator}[ settings={json}]`.
pub fn cache_key<S: Serialize>(
    op: CacheOp,
    normalized_locator: &str,
    settings: Option<&S>,
) -> Result<String, PipelineError> {
    let mut key = format!("{op}: {normalized_locator}");
    if let Some(settings) = settings {
        let canonical = serde_json::to_string(settings)
            .map_err(|err| PipelineError::Cache(err.to_string()))?;
        key.push_str(" settings=");
        key.push_str(&canonical);
    }
    Ok(key)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    key: String,
    value: String,
    updated_at: String,
}

/// Persistent key to filename map, one JSON file per key.
#[derive(Debug, Clone)]
pub struct FileCache {
    root: Utf8PathBuf,
}

impl FileCache {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn default_root() -> Result<Utf8PathBuf, PipelineError> {
        app_cache_dir()
            .map(|dir| dir.join("cache"))
            .ok_or_else(|| PipelineError::Cache("unable to resolve cache directory".to_string()))
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn entry_path(&self, key: &str) -> Utf8PathBuf {
        self.root.join(format!("{}.json", hash_bytes(key.as_bytes())))
    }

    pub fn get(&self, key: &str) -> Result<Option<String>, PipelineError> {
        let path = self.entry_path(key);
        if !path.as_std_path().exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|err| PipelineError::Cache(err.to_string()))?;
        let entry: CacheEntry = match serde_json::from_str(&content) {
            Ok(entry) => entry,
            Err(err) => {
                debug!(%path, error = %err, "ignoring unreadable cache entry");
                return Ok(None);
            }
        };
        Ok((entry.key == key).then_some(entry.value))
    }

    pub fn set(&self, key: &str, value: &str) -> Result<(), PipelineError> {
        fs::create_dir_all(self.root.as_std_path())
            .map_err(|err| PipelineError::Cache(err.to_string()))?;
        let entry = CacheEntry {
            key: key.to_string(),
            value: value.to_string(),
            updated_at: chrono::Utc::now().to_rfc3339(),
        };
        let content = serde_json::to_vec_pretty(&entry)
            .map_err(|err| PipelineError::Cache(err.to_string()))?;
        let mut temp = tempfile::Builder::new()
            .prefix("cpack-cache")
            .tempfile_in(self.root.as_std_path())
            .map_err(|err| PipelineError::Cache(err.to_string()))?;
        temp.write_all(&content)
            .map_err(|err| PipelineError::Cache(err.to_string()))?;
        temp.persist(self.entry_path(key).as_std_path())
            .map_err(|err| PipelineError::Cache(err.to_string()))?;
        debug!(%key, %value, "cache write");
        Ok(())
    }
}
