use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{ContentKind, Preset};
use crate::error::PipelineError;
use crate::metadata::FileMetadata;

pub const DEFAULT_MAX_HEIGHT: u32 = 480;
pub const DEFAULT_CRF: u32 = 32;
pub const DEFAULT_AUDIO_BITRATE: &str = "32k";
pub const DEFAULT_HIGH_RES_MIN_HEIGHT: u32 = 720;

/// Key under which the pipeline passes the locator a run started from.
pub const SOURCE_LOCATOR_KEY: &str = "source_locator";

/// Generic settings map accepted at the public API boundary. Keys are kept
/// sorted so the canonical form is stable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Settings(BTreeMap<String, Value>);

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn source_locator(&self) -> Option<&str> {
        self.get(SOURCE_LOCATOR_KEY).and_then(Value::as_str)
    }

    /// Returns a copy of `self` with every key of `other` written over it.
    pub fn overlay(&self, other: &Settings) -> Settings {
        let mut merged = self.0.clone();
        for (key, value) in &other.0 {
            merged.insert(key.clone(), value.clone());
        }
        Settings(merged)
    }

    /// Overlays the set fields of an in-flight record.
    pub fn overlay_metadata(&self, metadata: &FileMetadata) -> Settings {
        let mut merged = self.0.clone();
        for (key, value) in metadata.to_dict() {
            merged.insert(key, value);
        }
        Settings(merged)
    }

    /// Parses a `key=value` pair; values that parse as JSON keep their type,
    /// anything else is taken as a string.
    pub fn parse_assignment(input: &str) -> Result<(String, Value), PipelineError> {
        let (key, raw) = input
            .split_once('=')
            .ok_or_else(|| PipelineError::InvalidSettings(format!("expected key=value: {input}")))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(PipelineError::InvalidSettings(format!(
                "empty key in {input}"
            )));
        }
        let value = serde_json::from_str(raw.trim())
            .unwrap_or_else(|_| Value::String(raw.trim().to_string()));
        Ok((key.to_string(), value))
    }

    /// Deserializes the typed view a handler needs, ignoring unrelated keys.
    pub fn context<T: DeserializeOwned>(&self) -> Result<T, PipelineError> {
        let object = self
            .0
            .iter()
            .filter(|(_, value)| !value.is_null())
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect::<serde_json::Map<_, _>>();
        serde_json::from_value(Value::Object(object))
            .map_err(|err| PipelineError::InvalidSettings(err.to_string()))
    }
}

impl From<BTreeMap<String, Value>> for Settings {
    fn from(value: BTreeMap<String, Value>) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DownloadContext {
    #[serde(default)]
    pub default_ext: Option<String>,
    #[serde(default)]
    pub max_height: Option<u32>,
    #[serde(default)]
    pub subtitle_languages: Vec<String>,
    #[serde(default)]
    pub subtitles_only: bool,
    #[serde(default)]
    pub use_proxy: bool,
}

impl DownloadContext {
    pub fn effective_max_height(&self) -> u32 {
        self.max_height.unwrap_or(DEFAULT_MAX_HEIGHT)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VideoContext {
    #[serde(default)]
    pub compress: bool,
    #[serde(default)]
    pub max_height: Option<u32>,
    #[serde(default)]
    pub max_width: Option<u32>,
    #[serde(default)]
    pub crf: Option<u32>,
}

impl VideoContext {
    pub fn compression_requested(&self) -> bool {
        self.compress || self.max_height.is_some() || self.max_width.is_some() || self.crf.is_some()
    }

    pub fn effective_max_height(&self) -> u32 {
        self.max_height.unwrap_or(DEFAULT_MAX_HEIGHT)
    }

    pub fn effective_crf(&self) -> u32 {
        self.crf.unwrap_or(DEFAULT_CRF)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioContext {
    #[serde(default)]
    pub compress: bool,
    #[serde(default)]
    pub audio_bitrate: Option<String>,
    #[serde(default)]
    pub audio_quality: Option<u32>,
}

impl AudioContext {
    pub fn compression_requested(&self) -> bool {
        self.compress || self.audio_bitrate.is_some() || self.audio_quality.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubtitleContext {
    #[serde(default)]
    pub language: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArchiveContext {
    #[serde(default)]
    pub compress: bool,
    #[serde(default)]
    pub max_height: Option<u32>,
    #[serde(default)]
    pub crf: Option<u32>,
    #[serde(default)]
    pub audio_bitrate: Option<String>,
}

impl ArchiveContext {
    pub fn video(&self) -> VideoContext {
        VideoContext {
            compress: true,
            max_height: self.max_height,
            max_width: None,
            crf: self.crf,
        }
    }

    pub fn audio(&self) -> AudioContext {
        AudioContext {
            compress: true,
            audio_bitrate: self.audio_bitrate.clone(),
            audio_quality: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractContext {
    #[serde(default)]
    pub high_res_min_height: Option<u32>,
    #[serde(default)]
    pub preset: Option<Preset>,
    #[serde(default)]
    pub kind: Option<ContentKind>,
}

impl ExtractContext {
    pub fn effective_high_res_min_height(&self) -> u32 {
        self.high_res_min_height
            .unwrap_or(DEFAULT_HIGH_RES_MIN_HEIGHT)
    }
}
