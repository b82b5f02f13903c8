use std::io::{self, Write};

use serde::Serialize;

use crate::failed::FailedFile;
use crate::metadata::FileMetadata;

#[derive(Debug, Clone, Serialize)]
pub struct ProcessResult {
    pub locator: String,
    pub files: Vec<FileMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessReport {
    pub results: Vec<ProcessResult>,
    pub failed: Vec<FailedFile>,
}

impl ProcessReport {
    pub fn succeeded(&self) -> bool {
        self.results.iter().all(|result| result.error.is_none())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyResult {
    pub filename: String,
    pub path: String,
    pub valid: bool,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_process(report: &ProcessReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_verify(results: &[VerifyResult]) -> io::Result<()> {
        Self::print_json(&results)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}
