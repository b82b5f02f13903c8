use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use crate::config::ToolPaths;
use crate::error::PipelineError;
use crate::settings::{AudioContext, DEFAULT_AUDIO_BITRATE, VideoContext};

/// Stream facts read from a media file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaProbe {
    pub duration: Option<f64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub has_video: bool,
    pub has_audio: bool,
}

pub trait MediaTool: Send + Sync {
    fn probe(&self, path: &Path) -> Result<MediaProbe, PipelineError>;
    fn transcode(&self, input: &Path, output: &Path, args: &[String]) -> Result<(), PipelineError>;
    /// Decodes the whole file and reports how far decoding got, in seconds.
    fn decode_duration(&self, path: &Path) -> Result<Option<f64>, PipelineError>;
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: Option<FfprobeFormat>,
    streams: Option<Vec<FfprobeStream>>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    duration: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FfmpegTool {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl FfmpegTool {
    pub fn new(tools: &ToolPaths) -> Self {
        Self {
            ffmpeg: PathBuf::from(&tools.ffmpeg),
            ffprobe: PathBuf::from(&tools.ffprobe),
        }
    }

    fn run(&self, program: &Path, args: &[String]) -> Result<Output, PipelineError> {
        debug!(program = %program.display(), ?args, "running media tool");
        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::NotFound => {
                    PipelineError::MissingTool(program.display().to_string())
                }
                _ => PipelineError::ToolFailure {
                    tool: program.display().to_string(),
                    message: err.to_string(),
                },
            })
    }
}

impl MediaTool for FfmpegTool {
    fn probe(&self, path: &Path) -> Result<MediaProbe, PipelineError> {
        let args = vec![
            "-v".to_string(),
            "error".to_string(),
            "-show_format".to_string(),
            "-show_streams".to_string(),
            "-of".to_string(),
            "json".to_string(),
            path.to_string_lossy().to_string(),
        ];
        let output = self.run(&self.ffprobe, &args)?;
        if !output.status.success() {
            return Err(tool_failure("ffprobe", &output));
        }
        parse_probe(&output.stdout)
    }

    fn transcode(&self, input: &Path, output: &Path, args: &[String]) -> Result<(), PipelineError> {
        let mut full = vec![
            "-y".to_string(),
            "-v".to_string(),
            "error".to_string(),
            "-i".to_string(),
            input.to_string_lossy().to_string(),
        ];
        full.extend(args.iter().cloned());
        full.push(output.to_string_lossy().to_string());
        let result = self.run(&self.ffmpeg, &full)?;
        if !result.status.success() {
            return Err(tool_failure("ffmpeg", &result));
        }
        Ok(())
    }

    fn decode_duration(&self, path: &Path) -> Result<Option<f64>, PipelineError> {
        let args = vec![
            "-i".to_string(),
            path.to_string_lossy().to_string(),
            "-f".to_string(),
            "null".to_string(),
            "-".to_string(),
        ];
        let output = self.run(&self.ffmpeg, &args)?;
        if !output.status.success() {
            return Err(tool_failure("ffmpeg", &output));
        }
        Ok(last_progress_time(&String::from_utf8_lossy(&output.stderr)))
    }
}

fn tool_failure(tool: &str, output: &Output) -> PipelineError {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let message = if stderr.is_empty() {
        format!("exited with {}", output.status)
    } else {
        stderr
    };
    PipelineError::ToolFailure {
        tool: tool.to_string(),
        message,
    }
}

pub fn parse_probe(stdout: &[u8]) -> Result<MediaProbe, PipelineError> {
    let parsed: FfprobeOutput =
        serde_json::from_slice(stdout).map_err(|err| PipelineError::ToolFailure {
            tool: "ffprobe".to_string(),
            message: format!("unreadable output: {err}"),
        })?;
    let streams = parsed.streams.unwrap_or_default();
    let video = streams
        .iter()
        .find(|stream| stream.codec_type.as_deref() == Some("video"));
    let has_audio = streams
        .iter()
        .any(|stream| stream.codec_type.as_deref() == Some("audio"));
    let duration = parsed
        .format
        .and_then(|format| format.duration)
        .or_else(|| streams.iter().find_map(|stream| stream.duration.clone()))
        .and_then(|value| value.trim().parse::<f64>().ok())
        .filter(|value| value.is_finite() && *value > 0.0);
    Ok(MediaProbe {
        duration,
        width: video.and_then(|stream| stream.width),
        height: video.and_then(|stream| stream.height),
        has_video: video.is_some(),
        has_audio,
    })
}

/// Parses the last `time=HH:MM:SS.xx` progress marker ffmpeg printed.
pub fn last_progress_time(stderr: &str) -> Option<f64> {
    let pattern = Regex::new(r"time=(\d+):(\d{2}):(\d{2}(?:\.\d+)?)").ok()?;
    let caps = pattern.captures_iter(stderr).last()?;
    let hours: f64 = caps[1].parse().ok()?;
    let minutes: f64 = caps[2].parse().ok()?;
    let seconds: f64 = caps[3].parse().ok()?;
    let total = hours * 3600.0 + minutes * 60.0 + seconds;
    (total > 0.0).then_some(total)
}

/// Bounded-resolution H.264 with mono low-bitrate audio and the moov atom up
/// front for progressive playback.
pub fn video_args(ctx: &VideoContext) -> Vec<String> {
    let height = ctx.effective_max_height();
    let scale = match ctx.max_width {
        Some(width) => format!(
            "scale=w='trunc(min(iw,{width})/2)*2':h='trunc(min(ih,{height})/2)*2':force_original_aspect_ratio=decrease,pad=ceil(iw/2)*2:ceil(ih/2)*2"
        ),
        None => format!("scale=w=-2:h='trunc(min(ih,{height})/2)*2'"),
    };
    vec![
        "-vf".to_string(),
        scale,
        "-c:v".to_string(),
        "libx264".to_string(),
        "-preset".to_string(),
        "slow".to_string(),
        "-crf".to_string(),
        ctx.effective_crf().to_string(),
        "-c:a".to_string(),
        "aac".to_string(),
        "-b:a".to_string(),
        "32k".to_string(),
        "-ac".to_string(),
        "1".to_string(),
        "-movflags".to_string(),
        "faststart".to_string(),
    ]
}

pub fn audio_args(ctx: &AudioContext) -> Vec<String> {
    let mut args = vec![
        "-vn".to_string(),
        "-c:a".to_string(),
        "libmp3lame".to_string(),
        "-ac".to_string(),
        "1".to_string(),
    ];
    match (ctx.audio_quality, ctx.audio_bitrate.as_deref()) {
        (Some(quality), None) => {
            args.push("-q:a".to_string());
            args.push(quality.to_string());
        }
        (_, bitrate) => {
            args.push("-b:a".to_string());
            args.push(bitrate.unwrap_or(DEFAULT_AUDIO_BITRATE).to_string());
        }
    }
    args
}

pub fn round_duration(seconds: f64) -> u64 {
    seconds.max(0.0).round() as u64
}
