use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use md5::{Digest, Md5};
use tempfile::{Builder, NamedTempFile, TempDir};
use tracing::{debug, warn};

use crate::error::PipelineError;

const CHUNK_SIZE: usize = 64 * 1024;

/// Content-addressed file store. Every artifact is named
/// `{md5-of-bytes}.{ext}` and lives under a two-level shard directory.
#[derive(Debug, Clone)]
pub struct Storage {
    root: Utf8PathBuf,
}

impl Storage {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn default_root() -> Result<Utf8PathBuf, PipelineError> {
        app_cache_dir()
            .map(|dir| dir.join("storage"))
            .ok_or_else(|| {
                PipelineError::Filesystem("unable to resolve storage directory".to_string())
            })
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn ensure_root(&self) -> Result<(), PipelineError> {
        fs::create_dir_all(self.root.as_std_path())
            .map_err(|err| PipelineError::Filesystem(err.to_string()))
    }

    /// Pure mapping from a stored filename to its location.
    pub fn path_for(&self, filename: &str) -> Utf8PathBuf {
        let mut chars = filename.chars();
        match (chars.next(), chars.next()) {
            (Some(first), Some(second)) => self
                .root
                .join(first.to_string())
                .join(second.to_string())
                .join(filename),
            _ => self.root.join(filename),
        }
    }

    pub fn exists(&self, filename: &str) -> bool {
        self.path_for(filename).as_std_path().is_file()
    }

    /// Strips the storage root from a locator so cache keys do not depend on
    /// where storage happens to live.
    pub fn normalize_locator(&self, locator: &str) -> String {
        let root = self.root.as_str().trim_end_matches('/');
        match locator.strip_prefix(root) {
            Some(rest) if rest.starts_with('/') => Utf8Path::new(rest)
                .file_name()
                .map(|name| name.to_string())
                .unwrap_or_else(|| rest.trim_start_matches('/').to_string()),
            _ => locator.to_string(),
        }
    }

    pub fn stage(&self, ext: &str) -> Result<StagedFile<'_>, PipelineError> {
        let temp = self.temp_file(ext)?;
        Ok(StagedFile {
            storage: self,
            ext: normalize_ext(ext),
            temp,
            hasher: Md5::new(),
            written: 0,
        })
    }

    /// Empty temp file inside the storage volume, for tools that write to a
    /// path of their own choosing.
    pub fn temp_file(&self, ext: &str) -> Result<NamedTempFile, PipelineError> {
        let temp_dir = self.root.join(".tmp");
        fs::create_dir_all(temp_dir.as_std_path())
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        Builder::new()
            .prefix("cpack-")
            .suffix(&format!(".{}", normalize_ext(ext)))
            .tempfile_in(temp_dir.as_std_path())
            .map_err(|err| PipelineError::Filesystem(err.to_string()))
    }

    /// Scratch directory inside the storage volume, removed on drop.
    pub fn temp_dir(&self) -> Result<TempDir, PipelineError> {
        let temp_dir = self.root.join(".tmp");
        fs::create_dir_all(temp_dir.as_std_path())
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        Builder::new()
            .prefix("cpack-")
            .tempdir_in(temp_dir.as_std_path())
            .map_err(|err| PipelineError::Filesystem(err.to_string()))
    }

    pub fn write_bytes(&self, content: &[u8], ext: &str) -> Result<String, PipelineError> {
        let mut staged = self.stage(ext)?;
        staged
            .write_all(content)
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        staged.commit()
    }

    /// Copies a file that already exists on disk into storage. Read failures
    /// belong to the source, not to storage.
    pub fn import_file(&self, source: &Utf8Path, ext: &str) -> Result<String, PipelineError> {
        let file = File::open(source.as_std_path()).map_err(|err| PipelineError::SourceRead {
            path: source.to_string(),
            message: err.to_string(),
        })?;
        let mut reader = BufReader::new(file);
        let mut staged = self.stage(ext)?;
        let mut buffer = vec![0u8; CHUNK_SIZE];
        loop {
            let read = reader
                .read(&mut buffer)
                .map_err(|err| PipelineError::SourceRead {
                    path: source.to_string(),
                    message: err.to_string(),
                })?;
            if read == 0 {
                break;
            }
            staged
                .write_all(&buffer[..read])
                .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        }
        staged.commit()
    }

    pub fn read(&self, filename: &str) -> Result<Vec<u8>, PipelineError> {
        fs::read(self.path_for(filename).as_std_path())
            .map_err(|err| PipelineError::Filesystem(format!("read {filename}: {err}")))
    }

    /// True when the file exists and the hash part of its name matches the
    /// hash of its bytes.
    pub fn verify(&self, filename: &str) -> Result<bool, PipelineError> {
        let path = self.path_for(filename);
        if !path.as_std_path().is_file() {
            return Ok(false);
        }
        let Some((expected, _)) = filename.split_once('.') else {
            return Ok(false);
        };
        let actual = hash_file(&path)?;
        Ok(actual == expected)
    }
}

/// In-progress storage write. Bytes are hashed as they are written; the
/// temp file is removed on drop unless committed.
pub struct StagedFile<'a> {
    storage: &'a Storage,
    ext: String,
    temp: NamedTempFile,
    hasher: Md5,
    written: u64,
}

impl StagedFile<'_> {
    pub fn commit(mut self) -> Result<String, PipelineError> {
        self.temp
            .flush()
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        if self.written == 0 {
            return Err(PipelineError::EmptyOutput(format!("*.{}", self.ext)));
        }
        let digest = hex::encode(self.hasher.finalize());
        let filename = format!("{digest}.{}", self.ext);
        let dest = self.storage.path_for(&filename);
        if dest.as_std_path().is_file() {
            if hash_file(&dest)? == digest {
                debug!(%filename, "storage already holds file");
                return Ok(filename);
            }
            warn!(%filename, "replacing corrupt stored file");
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        }
        self.temp
            .persist(dest.as_std_path())
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        debug!(%filename, bytes = self.written, "stored file");
        Ok(filename)
    }
}

impl Write for StagedFile<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.temp.write(buf)?;
        self.hasher.update(&buf[..written]);
        self.written += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.temp.flush()
    }
}

pub fn hash_file(path: &Utf8Path) -> Result<String, PipelineError> {
    let file =
        File::open(path.as_std_path()).map_err(|err| PipelineError::Filesystem(err.to_string()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Md5::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        let read = reader
            .read(&mut buffer)
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Per-user cache directory of the platform, e.g. `$XDG_CACHE_HOME` on
/// Linux or `~/Library/Caches` on macOS, joined with the application name.
pub(crate) fn app_cache_dir() -> Option<Utf8PathBuf> {
    let dirs = BaseDirs::new()?;
    Utf8PathBuf::from_path_buf(dirs.cache_dir().join("content-packager")).ok()
}

pub fn hash_bytes(content: &[u8]) -> String {
    hex::encode(Md5::digest(content))
}

fn normalize_ext(ext: &str) -> String {
    ext.trim_start_matches('.').to_ascii_lowercase()
}
