use std::io::Write;
use std::thread;
use std::time::Duration;

use percent_encoding::percent_decode_str;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT};

use crate::config::NetworkConfig;
use crate::error::PipelineError;

/// What the server told us about a downloaded body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseInfo {
    pub final_url: String,
    pub content_type: Option<String>,
    pub content_disposition: Option<String>,
}

impl ResponseInfo {
    pub fn suggested_filename(&self) -> Option<String> {
        self.content_disposition
            .as_deref()
            .and_then(filename_from_content_disposition)
    }
}

pub trait WebClient: Send + Sync {
    /// Streams the body of a GET request into `sink`.
    fn fetch(&self, url: &str, sink: &mut dyn Write) -> Result<ResponseInfo, PipelineError>;
}

#[derive(Clone)]
pub struct HttpWebClient {
    client: Client,
    max_retries: usize,
}

impl HttpWebClient {
    pub fn new(network: &NetworkConfig) -> Result<Self, PipelineError> {
        Ok(Self {
            client: build_client(network, None)?,
            max_retries: network.max_retries,
        })
    }

    pub fn send_with_retries<F>(&self, make_req: F) -> Result<Response, PipelineError>
    where
        F: FnMut() -> RequestBuilder,
    {
        send_with_retries(self.max_retries, make_req)
    }
}

impl WebClient for HttpWebClient {
    fn fetch(&self, url: &str, sink: &mut dyn Write) -> Result<ResponseInfo, PipelineError> {
        let response = self.send_with_retries(|| self.client.get(url))?;
        let mut response = handle_status(response, url)?;
        let info = ResponseInfo {
            final_url: response.url().to_string(),
            content_type: header_string(response.headers(), CONTENT_TYPE.as_str()),
            content_disposition: header_string(response.headers(), CONTENT_DISPOSITION.as_str()),
        };
        response
            .copy_to(sink)
            .map_err(PipelineError::from_reqwest)?;
        Ok(info)
    }
}

pub fn build_client(
    network: &NetworkConfig,
    proxy: Option<&str>,
) -> Result<Client, PipelineError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&format!("content-packager/{}", env!("CARGO_PKG_VERSION")))
            .map_err(|err| PipelineError::Http(err.to_string()))?,
    );
    let mut builder = Client::builder()
        .default_headers(headers)
        .connect_timeout(network.connect_timeout())
        .timeout(network.read_timeout());
    if let Some(proxy) = proxy {
        let proxy = reqwest::Proxy::all(proxy)
            .map_err(|err| PipelineError::InvalidSettings(format!("proxy {proxy}: {err}")))?;
        builder = builder.proxy(proxy);
    }
    builder.build().map_err(|err| PipelineError::Http(err.to_string()))
}

pub fn handle_status(response: Response, url: &str) -> Result<Response, PipelineError> {
    if response.status().is_success() {
        return Ok(response);
    }
    Err(PipelineError::HttpStatus {
        status: response.status().as_u16(),
        url: url.to_string(),
    })
}

pub fn send_with_retries<F>(max_retries: usize, mut make_req: F) -> Result<Response, PipelineError>
where
    F: FnMut() -> RequestBuilder,
{
    const BASE_DELAY_MS: u64 = 200;
    let mut attempt = 0usize;
    loop {
        match make_req().send() {
            Ok(resp) => {
                let status = resp.status().as_u16();
                if attempt < max_retries && is_retryable_status(status) {
                    let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                    thread::sleep(Duration::from_millis(delay));
                    attempt += 1;
                    continue;
                }
                return Ok(resp);
            }
            Err(err) => {
                if attempt < max_retries && is_retryable_error(&err) {
                    let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                    thread::sleep(Duration::from_millis(delay));
                    attempt += 1;
                    continue;
                }
                return Err(PipelineError::from_reqwest(err));
            }
        }
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
}

/// Extracts a filename from a `Content-Disposition` header. The RFC 5987
/// `filename*=charset''value` form wins over plain `filename=`.
pub fn filename_from_content_disposition(header: &str) -> Option<String> {
    let mut plain = None;
    let mut extended = None;
    for param in split_params(header) {
        let Some((key, value)) = param.split_once('=') else {
            continue;
        };
        match key.trim().to_ascii_lowercase().as_str() {
            "filename*" => extended = decode_extended(value.trim()),
            "filename" => plain = Some(unquote(value.trim())),
            _ => {}
        }
    }
    extended
        .or(plain)
        .map(|name| basename(&name))
        .filter(|name| !name.is_empty())
}

fn split_params(header: &str) -> Vec<String> {
    let mut params = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for ch in header.chars() {
        match ch {
            '"' => {
                quoted = !quoted;
                current.push(ch);
            }
            ';' if !quoted => {
                params.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    if !current.trim().is_empty() {
        params.push(current.trim().to_string());
    }
    params
}

fn decode_extended(value: &str) -> Option<String> {
    let value = unquote(value);
    let mut parts = value.splitn(3, '\'');
    let charset = parts.next()?;
    let _language = parts.next()?;
    let encoded = parts.next()?;
    let decoded = percent_decode_str(encoded);
    if charset.eq_ignore_ascii_case("utf-8") {
        decoded.decode_utf8().ok().map(|value| value.into_owned())
    } else {
        Some(decoded.decode_utf8_lossy().into_owned())
    }
}

fn unquote(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.len() >= 2 && trimmed.starts_with('"') && trimmed.ends_with('"') {
        trimmed[1..trimmed.len() - 1].replace("\\\"", "\"")
    } else {
        trimmed.to_string()
    }
}

fn basename(name: &str) -> String {
    name.rsplit(['/', '\\']).next().unwrap_or(name).trim().to_string()
}

/// Last non-empty path segment of a URL, percent-decoded.
pub fn filename_from_url(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let segment = parsed
        .path_segments()?
        .filter(|segment| !segment.is_empty())
        .next_back()?;
    let decoded = percent_decode_str(segment).decode_utf8_lossy().into_owned();
    (!decoded.is_empty()).then_some(decoded)
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}
