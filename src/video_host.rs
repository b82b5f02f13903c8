use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::{debug, info, warn};
use url::Url;

use crate::error::PipelineError;

const HOSTING_DOMAINS: &[&str] = &["youtube.com", "youtu.be", "vimeo.com"];

/// What to fetch for a single video.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoRequest {
    pub max_height: u32,
    pub use_proxy: bool,
}

pub trait VideoHostClient: Send + Sync {
    /// Downloads the video into `dest_dir` and returns the written file.
    fn download_video(
        &self,
        url: &str,
        request: &VideoRequest,
        dest_dir: &Path,
    ) -> Result<PathBuf, PipelineError>;

    /// Downloads one subtitle track as WebVTT into `dest_dir`.
    fn download_subtitle(
        &self,
        url: &str,
        language: &str,
        use_proxy: bool,
        dest_dir: &Path,
    ) -> Result<PathBuf, PipelineError>;
}

pub fn is_hosting_url(value: &str) -> bool {
    let Ok(url) = Url::parse(value) else {
        return false;
    };
    if !matches!(url.scheme(), "http" | "https") {
        return false;
    }
    let Some(host) = url.host_str() else {
        return false;
    };
    let host = host.to_ascii_lowercase();
    HOSTING_DOMAINS
        .iter()
        .any(|domain| host == *domain || host.ends_with(&format!(".{domain}")))
}

/// Prefers a height-bounded mp4+m4a pair, then progressive mp4, then anything.
pub fn format_selector(max_height: u32) -> String {
    format!(
        "bestvideo[height<={max_height}][ext=mp4]+bestaudio[ext=m4a]/best[height<={max_height}][ext=mp4]/best[ext=mp4]/best"
    )
}

/// Drives the `yt-dlp` command-line downloader.
#[derive(Debug, Clone)]
pub struct YtDlpClient {
    program: PathBuf,
    proxies: Vec<String>,
}

impl YtDlpClient {
    pub fn new(program: &str, proxies: Vec<String>) -> Self {
        let program = if program.contains(['/', '\\']) {
            PathBuf::from(program)
        } else {
            find_in_path(program).unwrap_or_else(|| PathBuf::from(program))
        };
        Self { program, proxies }
    }

    fn run(&self, args: &[String]) -> Result<(), PipelineError> {
        debug!(program = %self.program.display(), ?args, "running downloader");
        let output = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::NotFound => {
                    PipelineError::MissingTool(self.program.display().to_string())
                }
                _ => PipelineError::ToolFailure {
                    tool: "yt-dlp".to_string(),
                    message: err.to_string(),
                },
            })?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let message = if stderr.is_empty() {
            format!("command failed: {}", self.program.display())
        } else {
            stderr
        };
        Err(PipelineError::ToolFailure {
            tool: "yt-dlp".to_string(),
            message,
        })
    }

    /// Runs once directly, or once per configured proxy until one succeeds.
    fn run_with_proxies(&self, args: Vec<String>, use_proxy: bool) -> Result<(), PipelineError> {
        if !use_proxy || self.proxies.is_empty() {
            return self.run(&args);
        }
        let mut last_err = None;
        for proxy in &self.proxies {
            let mut proxied = vec!["--proxy".to_string(), proxy.clone()];
            proxied.extend(args.iter().cloned());
            match self.run(&proxied) {
                Ok(()) => return Ok(()),
                Err(err @ PipelineError::MissingTool(_)) => return Err(err),
                Err(err) => {
                    warn!(%proxy, error = %err, "download through proxy failed");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| PipelineError::ToolFailure {
            tool: "yt-dlp".to_string(),
            message: "no proxy succeeded".to_string(),
        }))
    }
}

impl VideoHostClient for YtDlpClient {
    fn download_video(
        &self,
        url: &str,
        request: &VideoRequest,
        dest_dir: &Path,
    ) -> Result<PathBuf, PipelineError> {
        info!(%url, max_height = request.max_height, "downloading hosted video");
        let template = dest_dir.join("video.%(ext)s");
        let args = vec![
            "--no-playlist".to_string(),
            "--no-progress".to_string(),
            "-f".to_string(),
            format_selector(request.max_height),
            "--merge-output-format".to_string(),
            "mp4".to_string(),
            "-o".to_string(),
            template.to_string_lossy().to_string(),
            url.to_string(),
        ];
        self.run_with_proxies(args, request.use_proxy)?;
        find_output(dest_dir, "video.")
    }

    fn download_subtitle(
        &self,
        url: &str,
        language: &str,
        use_proxy: bool,
        dest_dir: &Path,
    ) -> Result<PathBuf, PipelineError> {
        info!(%url, %language, "downloading subtitle track");
        let template = dest_dir.join("subtitle.%(ext)s");
        let args = vec![
            "--no-playlist".to_string(),
            "--skip-download".to_string(),
            "--write-subs".to_string(),
            "--write-auto-subs".to_string(),
            "--sub-langs".to_string(),
            language.to_string(),
            "--sub-format".to_string(),
            "vtt".to_string(),
            "--convert-subs".to_string(),
            "vtt".to_string(),
            "-o".to_string(),
            template.to_string_lossy().to_string(),
            url.to_string(),
        ];
        self.run_with_proxies(args, use_proxy)?;
        find_output(dest_dir, "subtitle.").map_err(|_| PipelineError::MissingLanguage {
            path: url.to_string(),
            language: language.to_string(),
        })
    }
}

fn find_output(dir: &Path, prefix: &str) -> Result<PathBuf, PipelineError> {
    let entries = fs::read_dir(dir).map_err(|err| PipelineError::Filesystem(err.to_string()))?;
    let mut found = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .map(|name| name.starts_with(prefix) && !name.ends_with(".part"))
                .unwrap_or(false)
        })
        .collect::<Vec<_>>();
    found.sort();
    found
        .into_iter()
        .next()
        .ok_or_else(|| PipelineError::EmptyOutput(format!("{}*", dir.join(prefix).display())))
}

pub fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.exists() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.exists() {
            return Some(plain);
        }
    }
    None
}
