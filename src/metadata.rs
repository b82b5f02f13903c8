use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::Preset;

/// Descriptive record of a file moving through the pipeline. Unset fields
/// are omitted from the serialized form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preset: Option<Preset>,
}

impl FileMetadata {
    pub fn from_path(path: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn stored(filename: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            filename: Some(filename.into()),
            path: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn with_original_filename(mut self, name: Option<String>) -> Self {
        self.original_filename = name;
        self
    }

    pub fn with_language(mut self, language: Option<String>) -> Self {
        self.language = language;
        self
    }

    pub fn with_preset(mut self, preset: Option<Preset>) -> Self {
        self.preset = preset;
        self
    }

    pub fn with_duration(mut self, duration: Option<u64>) -> Self {
        self.duration = duration;
        self
    }

    /// Fields set in `other` win; unset fields keep this record's values.
    pub fn merge(&self, other: &FileMetadata) -> FileMetadata {
        FileMetadata {
            filename: other.filename.clone().or_else(|| self.filename.clone()),
            path: other.path.clone().or_else(|| self.path.clone()),
            original_filename: other
                .original_filename
                .clone()
                .or_else(|| self.original_filename.clone()),
            language: other.language.clone().or_else(|| self.language.clone()),
            duration: other.duration.or(self.duration),
            license: other.license.clone().or_else(|| self.license.clone()),
            license_description: other
                .license_description
                .clone()
                .or_else(|| self.license_description.clone()),
            preset: other.preset.or(self.preset),
        }
    }

    pub fn to_dict(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}
