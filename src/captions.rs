use std::collections::BTreeMap;
use std::fmt::Write as _;

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use regex::Regex;

/// Language code given to tracks whose source format carries no language.
pub const UNKNOWN_LANGUAGE: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cue {
    pub start_ms: u64,
    pub end_ms: u64,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Srt,
    Sbv,
    WebVtt,
    Ttml,
}

impl Dialect {
    pub fn name(&self) -> &'static str {
        match self {
            Dialect::Srt => "srt",
            Dialect::Sbv => "sbv",
            Dialect::WebVtt => "webvtt",
            Dialect::Ttml => "ttml",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CaptionError {
    #[error("unrecognized subtitle format")]
    UnknownDialect,
    #[error("malformed {dialect} at cue {index}: {reason}")]
    Malformed {
        dialect: &'static str,
        index: usize,
        reason: String,
    },
    #[error("malformed ttml: {0}")]
    Xml(String),
    #[error("no captions found")]
    Empty,
}

/// Cues grouped by language.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptionSet {
    tracks: BTreeMap<String, Vec<Cue>>,
}

impl CaptionSet {
    pub fn languages(&self) -> Vec<&str> {
        self.tracks.keys().map(|lang| lang.as_str()).collect()
    }

    pub fn track(&self, language: &str) -> Option<&[Cue]> {
        self.tracks.get(language).map(|cues| cues.as_slice())
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.values().all(|cues| cues.is_empty())
    }

    /// Renames the unknown-language track, if any, unless a track with the
    /// requested language already exists.
    pub fn resolve_unknown(&mut self, language: &str) {
        if self.tracks.contains_key(language) {
            return;
        }
        if let Some(cues) = self.tracks.remove(UNKNOWN_LANGUAGE) {
            self.tracks.insert(language.to_string(), cues);
        }
    }

    fn push(&mut self, language: &str, cue: Cue) {
        self.tracks.entry(language.to_string()).or_default().push(cue);
    }
}

pub fn detect(content: &str) -> Option<Dialect> {
    let content = strip_bom(content).trim_start();
    if content.starts_with("WEBVTT") {
        return Some(Dialect::WebVtt);
    }
    if content.starts_with('<') {
        return content.contains("<tt").then_some(Dialect::Ttml);
    }
    let srt = Regex::new(r"^\d+\s*\r?\n\s*\d{1,2}:\d{2}:\d{2}[,.]\d{1,3}\s*-->").ok()?;
    if srt.is_match(content) {
        return Some(Dialect::Srt);
    }
    let sbv = Regex::new(r"^\d{1,2}:\d{2}:\d{2}\.\d{1,3},\d{1,2}:\d{2}:\d{2}\.\d{1,3}").ok()?;
    if sbv.is_match(content) {
        return Some(Dialect::Sbv);
    }
    None
}

pub fn read(content: &str) -> Result<(Dialect, CaptionSet), CaptionError> {
    let dialect = detect(content).ok_or(CaptionError::UnknownDialect)?;
    let content = strip_bom(content);
    let set = match dialect {
        Dialect::Srt => read_blocks(content, Dialect::Srt)?,
        Dialect::Sbv => read_blocks(content, Dialect::Sbv)?,
        Dialect::WebVtt => read_blocks(content, Dialect::WebVtt)?,
        Dialect::Ttml => read_ttml(content)?,
    };
    if set.is_empty() {
        return Err(CaptionError::Empty);
    }
    Ok((dialect, set))
}

fn strip_bom(content: &str) -> &str {
    content.strip_prefix('\u{feff}').unwrap_or(content)
}

fn split_blocks(content: &str) -> Vec<Vec<&str>> {
    let mut blocks = Vec::new();
    let mut current = Vec::new();
    for line in content.lines() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            if !current.is_empty() {
                blocks.push(std::mem::take(&mut current));
            }
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        blocks.push(current);
    }
    blocks
}

/// SRT, SBV and WebVTT are all blank-line separated blocks with a timing
/// line followed by text; they differ in the timing syntax.
fn read_blocks(content: &str, dialect: Dialect) -> Result<CaptionSet, CaptionError> {
    let mut set = CaptionSet::default();
    for (index, block) in split_blocks(content).into_iter().enumerate() {
        let timing_at = match dialect {
            Dialect::Sbv => Some(0),
            _ => block.iter().position(|line| line.contains("-->")),
        };
        let Some(timing_at) = timing_at else {
            if dialect == Dialect::WebVtt {
                // header, NOTE, STYLE and REGION blocks
                continue;
            }
            return Err(malformed(dialect, index, "missing timing line"));
        };
        let (start, end) = parse_timing(block[timing_at], dialect)
            .ok_or_else(|| malformed(dialect, index, block[timing_at]))?;
        let text = block[timing_at + 1..].join("\n");
        let text = match dialect {
            Dialect::WebVtt => strip_tags(&text),
            _ => text,
        };
        set.push(
            UNKNOWN_LANGUAGE,
            Cue {
                start_ms: start,
                end_ms: end,
                text,
            },
        );
    }
    Ok(set)
}

fn malformed(dialect: Dialect, index: usize, reason: &str) -> CaptionError {
    CaptionError::Malformed {
        dialect: dialect.name(),
        index,
        reason: reason.to_string(),
    }
}

fn parse_timing(line: &str, dialect: Dialect) -> Option<(u64, u64)> {
    let (start, end) = match dialect {
        Dialect::Sbv => line.split_once(',')?,
        _ => line.split_once("-->")?,
    };
    // WebVTT cue settings follow the end time
    let end = end.split_whitespace().next()?;
    Some((parse_clock(start.trim())?, parse_clock(end)?))
}

/// Parses `HH:MM:SS,mmm`, `HH:MM:SS.mmm` or `MM:SS.mmm`.
fn parse_clock(value: &str) -> Option<u64> {
    let value = value.replace(',', ".");
    let (clock, fraction) = match value.split_once('.') {
        Some((clock, fraction)) => (clock.to_string(), fraction.to_string()),
        None => (value.clone(), String::new()),
    };
    let parts = clock
        .split(':')
        .map(|part| part.trim().parse::<u64>().ok())
        .collect::<Option<Vec<_>>>()?;
    let (hours, minutes, seconds) = match parts.as_slice() {
        [h, m, s] => (*h, *m, *s),
        [m, s] => (0, *m, *s),
        _ => return None,
    };
    if !fraction.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    let millis = if fraction.is_empty() {
        0
    } else {
        let digits = &fraction[..fraction.len().min(3)];
        let scale = 10u64.pow(3 - digits.len() as u32);
        digits.parse::<u64>().ok()? * scale
    };
    hours
        .checked_mul(60)?
        .checked_add(minutes)?
        .checked_mul(60)?
        .checked_add(seconds)?
        .checked_mul(1000)?
        .checked_add(millis)
}

/// Parses TTML time expressions: clock time (`00:00:01.500`, or with a
/// trailing `:frames` field) and offset time (`1.5s`, `1500ms`, `2m`, `1h`).
fn parse_ttml_time(value: &str) -> Option<u64> {
    let value = value.trim();
    for (suffix, factor) in [("ms", 1.0), ("s", 1000.0), ("m", 60_000.0), ("h", 3_600_000.0)] {
        if let Some(number) = value.strip_suffix(suffix) {
            if let Ok(number) = number.parse::<f64>() {
                let millis = (number * factor).round();
                return (millis.is_finite() && (0.0..u64::MAX as f64).contains(&millis))
                    .then_some(millis as u64);
            }
        }
    }
    let parts = value.split(':').collect::<Vec<_>>();
    if parts.len() == 4 {
        // frames are dropped
        return parse_clock(&parts[..3].join(":"));
    }
    parse_clock(value)
}

fn strip_tags(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_tag = false;
    for ch in text.chars() {
        match ch {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            _ if !in_tag => out.push(ch),
            _ => {}
        }
    }
    out
}

fn lang_attribute(element: &BytesStart<'_>) -> Option<String> {
    element
        .attributes()
        .flatten()
        .find(|attr| attr.key.as_ref() == b"xml:lang")
        .and_then(|attr| attr.unescape_value().ok().map(|value| value.trim().to_string()))
        .filter(|value| !value.is_empty())
}

fn attribute(element: &BytesStart<'_>, name: &[u8]) -> Option<String> {
    element
        .attributes()
        .flatten()
        .find(|attr| attr.key.local_name().as_ref() == name)
        .and_then(|attr| attr.unescape_value().ok().map(|value| value.into_owned()))
}

struct OpenParagraph {
    language: String,
    begin: Option<u64>,
    end: Option<u64>,
    duration: Option<u64>,
    text: String,
}

fn read_ttml(content: &str) -> Result<CaptionSet, CaptionError> {
    let mut reader = Reader::from_str(content);
    let mut buf = Vec::new();
    let mut set = CaptionSet::default();
    // language in scope for each open element
    let mut languages: Vec<String> = Vec::new();
    let mut paragraph: Option<OpenParagraph> = None;
    let mut index = 0usize;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref element)) => {
                let inherited = languages
                    .last()
                    .cloned()
                    .unwrap_or_else(|| UNKNOWN_LANGUAGE.to_string());
                let language = lang_attribute(element).unwrap_or(inherited);
                if element.local_name().as_ref() == b"p" {
                    paragraph = Some(OpenParagraph {
                        language: language.clone(),
                        begin: attribute(element, b"begin").and_then(|v| parse_ttml_time(&v)),
                        end: attribute(element, b"end").and_then(|v| parse_ttml_time(&v)),
                        duration: attribute(element, b"dur").and_then(|v| parse_ttml_time(&v)),
                        text: String::new(),
                    });
                }
                languages.push(language);
            }
            Ok(Event::Empty(ref element)) => {
                if element.local_name().as_ref() == b"br" {
                    if let Some(open) = paragraph.as_mut() {
                        open.text.push('\n');
                    }
                }
            }
            Ok(Event::Text(text)) => {
                if let Some(open) = paragraph.as_mut() {
                    let value = text
                        .unescape()
                        .map_err(|err| CaptionError::Xml(err.to_string()))?;
                    open.text.push_str(&value);
                }
            }
            Ok(Event::End(ref element)) => {
                languages.pop();
                if element.local_name().as_ref() == b"p" {
                    if let Some(open) = paragraph.take() {
                        let start = open
                            .begin
                            .ok_or_else(|| malformed(Dialect::Ttml, index, "missing begin"))?;
                        let end = open
                            .end
                            .or_else(|| open.duration.and_then(|dur| start.checked_add(dur)))
                            .ok_or_else(|| malformed(Dialect::Ttml, index, "missing end"))?;
                        set.push(
                            &open.language,
                            Cue {
                                start_ms: start,
                                end_ms: end,
                                text: open.text.trim().to_string(),
                            },
                        );
                        index += 1;
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(err) => return Err(CaptionError::Xml(err.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(set)
}

fn format_timestamp(ms: u64) -> String {
    let hours = ms / 3_600_000;
    let minutes = (ms / 60_000) % 60;
    let seconds = (ms / 1000) % 60;
    let millis = ms % 1000;
    format!("{hours:02}:{minutes:02}:{seconds:02}.{millis:03}")
}

pub fn write_webvtt(cues: &[Cue]) -> String {
    let mut out = String::from("WEBVTT\n");
    for cue in cues {
        let _ = write!(
            out,
            "\n{} --> {}\n{}\n",
            format_timestamp(cue.start_ms),
            format_timestamp(cue.end_ms),
            cue.text
        );
    }
    out
}
