use std::io::Write;

use regex::Regex;
use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::{CONTENT_RANGE, RANGE};
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

use crate::config::NetworkConfig;
use crate::domain::extension_for_mime;
use crate::error::PipelineError;
use crate::http::{build_client, handle_status, send_with_retries};

const API_BASE: &str = "https://www.googleapis.com/drive/v3/files";
const DRIVE_HOSTS: &[&str] = &["drive.google.com", "docs.google.com"];
const NATIVE_PREFIX: &str = "application/vnd.google-apps.";
pub const EXPORT_MIME: &str = "application/pdf";
pub const CHUNK_SIZE: u64 = 8 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub mime_type: String,
}

impl DriveFile {
    /// Editor-format documents have no bytes of their own and must be exported.
    pub fn is_native(&self) -> bool {
        self.mime_type.starts_with(NATIVE_PREFIX)
    }

    pub fn extension(&self) -> Option<String> {
        if self.is_native() {
            return Some("pdf".to_string());
        }
        self.name
            .as_deref()
            .and_then(crate::domain::extension_of)
            .or_else(|| extension_for_mime(&self.mime_type).map(|ext| ext.to_string()))
    }
}

pub trait DriveClient: Send + Sync {
    fn file_info(&self, id: &str) -> Result<DriveFile, PipelineError>;
    fn download(&self, file: &DriveFile, sink: &mut dyn Write) -> Result<(), PipelineError>;
}

pub fn is_drive_url(value: &str) -> bool {
    Url::parse(value)
        .ok()
        .and_then(|url| url.host_str().map(|host| host.to_ascii_lowercase()))
        .map(|host| DRIVE_HOSTS.contains(&host.as_str()))
        .unwrap_or(false)
}

/// Resolves the file id from `/file/d/{id}/view`, `/document/d/{id}/edit`,
/// `open?id={id}` and `uc?id={id}` links.
pub fn extract_file_id(value: &str) -> Option<String> {
    let url = Url::parse(value).ok()?;
    let path_id = Regex::new(r"/d/([A-Za-z0-9_-]{10,})").ok()?;
    if let Some(caps) = path_id.captures(url.path()) {
        return Some(caps[1].to_string());
    }
    url.query_pairs()
        .find(|(key, _)| key == "id")
        .map(|(_, id)| id.into_owned())
        .filter(|id| !id.is_empty())
}

pub struct DriveHttpClient {
    client: Client,
    api_key: Option<String>,
    max_retries: usize,
}

impl DriveHttpClient {
    pub fn new(network: &NetworkConfig, api_key: Option<String>) -> Result<Self, PipelineError> {
        Ok(Self {
            client: build_client(network, None)?,
            api_key,
            max_retries: network.max_retries,
        })
    }

    fn api_key(&self) -> Result<&str, PipelineError> {
        self.api_key.as_deref().ok_or_else(|| {
            PipelineError::InvalidSettings("drive api key is not configured".to_string())
        })
    }

    fn export(&self, file: &DriveFile, sink: &mut dyn Write) -> Result<(), PipelineError> {
        let key = self.api_key()?;
        let url = format!("{API_BASE}/{}/export", file.id);
        let response = send_with_retries(self.max_retries, || {
            self.client
                .get(&url)
                .query(&[("mimeType", EXPORT_MIME), ("key", key)])
        })?;
        let mut response = handle_status(response, &url)?;
        response
            .copy_to(sink)
            .map_err(PipelineError::from_reqwest)?;
        Ok(())
    }

    fn download_chunked(&self, file: &DriveFile, sink: &mut dyn Write) -> Result<(), PipelineError> {
        let key = self.api_key()?;
        let url = format!("{API_BASE}/{}", file.id);
        let mut offset = 0u64;
        loop {
            let range = format!("bytes={}-{}", offset, offset + CHUNK_SIZE - 1);
            let response = send_with_retries(self.max_retries, || {
                self.client
                    .get(&url)
                    .query(&[("alt", "media"), ("supportsAllDrives", "true"), ("key", key)])
                    .header(RANGE, range.as_str())
            })?;
            if response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
                break;
            }
            let partial = response.status() == StatusCode::PARTIAL_CONTENT;
            let total = response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|value| value.to_str().ok())
                .and_then(total_from_content_range);
            let mut response = handle_status(response, &url)?;
            let written = response
                .copy_to(sink)
                .map_err(PipelineError::from_reqwest)?;
            offset += written;
            debug!(id = %file.id, offset, ?total, "drive chunk");
            if is_last_chunk(partial, written, offset, total) {
                break;
            }
        }
        Ok(())
    }
}

impl DriveClient for DriveHttpClient {
    fn file_info(&self, id: &str) -> Result<DriveFile, PipelineError> {
        let key = self.api_key()?;
        let url = format!("{API_BASE}/{id}");
        let response = send_with_retries(self.max_retries, || {
            self.client.get(&url).query(&[
                ("fields", "id,name,mimeType"),
                ("supportsAllDrives", "true"),
                ("key", key),
            ])
        })?;
        let response = handle_status(response, &url)?;
        response
            .json::<DriveFile>()
            .map_err(|err| PipelineError::Http(format!("drive metadata for {id}: {err}")))
    }

    fn download(&self, file: &DriveFile, sink: &mut dyn Write) -> Result<(), PipelineError> {
        if file.is_native() {
            info!(id = %file.id, mime = %file.mime_type, "exporting drive document");
            self.export(file, sink)
        } else {
            info!(id = %file.id, "downloading drive file");
            self.download_chunked(file, sink)
        }
    }
}

/// True when no further range request is needed.
fn is_last_chunk(partial: bool, written: u64, offset: u64, total: Option<u64>) -> bool {
    !partial || written < CHUNK_SIZE || total.is_some_and(|total| offset >= total)
}

/// Total size from `bytes start-end/total`.
fn total_from_content_range(value: &str) -> Option<u64> {
    value.rsplit_once('/')?.1.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_id_shapes() {
        assert_eq!(
            extract_file_id("https://drive.google.com/file/d/1AbCdEfGhIjKlMn/view?usp=sharing")
                .as_deref(),
            Some("1AbCdEfGhIjKlMn")
        );
        assert_eq!(
            extract_file_id("https://docs.google.com/document/d/1AbCdEfGhIjKlMn_-x/edit").as_deref(),
            Some("1AbCdEfGhIjKlMn_-x")
        );
        assert_eq!(
            extract_file_id("https://drive.google.com/open?id=1AbCdEfGhIjKlMn").as_deref(),
            Some("1AbCdEfGhIjKlMn")
        );
        assert_eq!(extract_file_id("https://drive.google.com/drive/my-drive"), None);
    }

    #[test]
    fn native_files_export_to_pdf() {
        let doc = DriveFile {
            id: "x".to_string(),
            name: Some("Lesson".to_string()),
            mime_type: "application/vnd.google-apps.document".to_string(),
        };
        assert!(doc.is_native());
        assert_eq!(doc.extension().as_deref(), Some("pdf"));
        let clip = DriveFile {
            id: "y".to_string(),
            name: Some("clip".to_string()),
            mime_type: "video/mp4".to_string(),
        };
        assert_eq!(clip.extension().as_deref(), Some("mp4"));
    }

    #[test]
    fn content_range_total() {
        assert_eq!(total_from_content_range("bytes 0-99/1234"), Some(1234));
        assert_eq!(total_from_content_range("bytes */*"), None);
    }

    #[test]
    fn ranged_download_stops() {
        // server ignored the range and sent the whole body
        assert!(is_last_chunk(false, CHUNK_SIZE, CHUNK_SIZE, None));
        assert!(is_last_chunk(true, 10, CHUNK_SIZE + 10, None));
        assert!(is_last_chunk(true, 0, CHUNK_SIZE, None));
        assert!(is_last_chunk(true, CHUNK_SIZE, 2 * CHUNK_SIZE, Some(2 * CHUNK_SIZE)));
    }

    #[test]
    fn ranged_download_continues() {
        assert!(!is_last_chunk(true, CHUNK_SIZE, CHUNK_SIZE, None));
        assert!(!is_last_chunk(true, CHUNK_SIZE, CHUNK_SIZE, Some(3 * CHUNK_SIZE)));
    }

    #[test]
    fn drive_hosts() {
        assert!(is_drive_url("https://drive.google.com/file/d/abc/view"));
        assert!(!is_drive_url("https://google.com/drive"));
    }
}
