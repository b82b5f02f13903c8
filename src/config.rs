use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::cache::FileCache;
use crate::error::PipelineError;
use crate::settings::Settings;
use crate::store::Storage;

pub const DEFAULT_CONFIG_FILE: &str = "cpack.json";
pub const DRIVE_API_KEY_ENV: &str = "GOOGLE_DRIVE_API_KEY";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub storage_dir: Option<Utf8PathBuf>,
    #[serde(default)]
    pub cache_dir: Option<Utf8PathBuf>,
    #[serde(default)]
    pub tools: ToolPaths,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub drive_api_key: Option<String>,
    #[serde(default)]
    pub defaults: Settings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolPaths {
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: String,
    #[serde(default = "default_ffprobe")]
    pub ffprobe: String,
    #[serde(default = "default_yt_dlp")]
    pub yt_dlp: String,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            ffmpeg: default_ffmpeg(),
            ffprobe: default_ffprobe(),
            yt_dlp: default_yt_dlp(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NetworkConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default)]
    pub proxies: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
            max_retries: default_max_retries(),
            proxies: Vec::new(),
        }
    }
}

impl NetworkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

impl PipelineConfig {
    pub fn storage(&self) -> Result<Storage, PipelineError> {
        let root = match &self.storage_dir {
            Some(dir) => dir.clone(),
            None => Storage::default_root()?,
        };
        Ok(Storage::new(root))
    }

    pub fn cache(&self) -> Result<FileCache, PipelineError> {
        let root = match &self.cache_dir {
            Some(dir) => dir.clone(),
            None => FileCache::default_root()?,
        };
        Ok(FileCache::new(root))
    }

    pub fn drive_api_key(&self) -> Option<String> {
        self.drive_api_key
            .clone()
            .or_else(|| std::env::var(DRIVE_API_KEY_ENV).ok())
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<PipelineConfig, PipelineError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Ok(PipelineConfig::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| PipelineError::ConfigRead(config_path.clone()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<PipelineConfig, PipelineError> {
        serde_json::from_str(content).map_err(|err| PipelineError::ConfigParse(err.to_string()))
    }
}

fn default_ffmpeg() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe() -> String {
    "ffprobe".to_string()
}

fn default_yt_dlp() -> String {
    "yt-dlp".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_read_timeout() -> u64 {
    60
}

fn default_max_retries() -> usize {
    3
}
