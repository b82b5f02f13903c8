use std::fmt;
use std::path::PathBuf;

use miette::Diagnostic;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum PipelineError {
    #[error("invalid locator: {0}")]
    InvalidLocator(String),

    #[error("no download handler claims locator: {0}")]
    NoHandler(String),

    #[error("no file could be obtained from this locator: {0}")]
    NoDownloadResult(String),

    #[error("failed to read source {path}: {message}")]
    SourceRead { path: String, message: String },

    #[error("request failed: {0}")]
    Http(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("server returned status {status} for {url}")]
    HttpStatus { status: u16, url: String },

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("invalid file {path}: {reason}")]
    InvalidFile { path: String, reason: String },

    #[error("missing required archive entry {entry} in {path}")]
    MissingEntry { path: String, entry: String },

    #[error("subtitle language {language} not found in {path}")]
    MissingLanguage { path: String, language: String },

    #[error("handler produced an empty file for {0}")]
    EmptyOutput(String),

    #[error("{tool} failed: {message}")]
    ToolFailure { tool: String, message: String },

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("missing config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse config: {0}")]
    ConfigParse(String),

    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

/// Coarse classification used by handlers to decide which failures are
/// their own recoverable per-file errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    HttpStatus,
    InvalidLocator,
    NoHandler,
    SourceRead,
    UnsupportedFormat,
    InvalidFile,
    MissingLanguage,
    EmptyOutput,
    ToolFailure,
    MissingTool,
    Config,
    InvalidSettings,
    Cache,
    Filesystem,
}

impl ErrorKind {
    pub fn is_per_file(self) -> bool {
        !matches!(
            self,
            ErrorKind::MissingTool
                | ErrorKind::Config
                | ErrorKind::InvalidSettings
                | ErrorKind::Cache
                | ErrorKind::Filesystem
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Network => "network",
            ErrorKind::HttpStatus => "http_status",
            ErrorKind::InvalidLocator => "invalid_locator",
            ErrorKind::NoHandler => "no_handler",
            ErrorKind::SourceRead => "source_read",
            ErrorKind::UnsupportedFormat => "unsupported_format",
            ErrorKind::InvalidFile => "invalid_file",
            ErrorKind::MissingLanguage => "missing_language",
            ErrorKind::EmptyOutput => "empty_output",
            ErrorKind::ToolFailure => "tool_failure",
            ErrorKind::MissingTool => "missing_tool",
            ErrorKind::Config => "config",
            ErrorKind::InvalidSettings => "invalid_settings",
            ErrorKind::Cache => "cache",
            ErrorKind::Filesystem => "filesystem",
        };
        f.write_str(name)
    }
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::InvalidLocator(_) => ErrorKind::InvalidLocator,
            PipelineError::NoHandler(_) | PipelineError::NoDownloadResult(_) => {
                ErrorKind::NoHandler
            }
            PipelineError::SourceRead { .. } => ErrorKind::SourceRead,
            PipelineError::Http(_) | PipelineError::Timeout(_) => ErrorKind::Network,
            PipelineError::HttpStatus { .. } => ErrorKind::HttpStatus,
            PipelineError::UnsupportedFormat(_) => ErrorKind::UnsupportedFormat,
            PipelineError::InvalidFile { .. } | PipelineError::MissingEntry { .. } => {
                ErrorKind::InvalidFile
            }
            PipelineError::MissingLanguage { .. } => ErrorKind::MissingLanguage,
            PipelineError::EmptyOutput(_) => ErrorKind::EmptyOutput,
            PipelineError::ToolFailure { .. } => ErrorKind::ToolFailure,
            PipelineError::MissingTool(_) => ErrorKind::MissingTool,
            PipelineError::ConfigRead(_) | PipelineError::ConfigParse(_) => ErrorKind::Config,
            PipelineError::InvalidSettings(_) => ErrorKind::InvalidSettings,
            PipelineError::Cache(_) => ErrorKind::Cache,
            PipelineError::Filesystem(_) => ErrorKind::Filesystem,
        }
    }

    pub fn invalid_file(path: impl Into<String>, reason: impl Into<String>) -> Self {
        PipelineError::InvalidFile {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return PipelineError::Timeout(err.to_string());
        }
        if err.is_builder() {
            return PipelineError::InvalidLocator(err.to_string());
        }
        PipelineError::Http(err.to_string())
    }
}
