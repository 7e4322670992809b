//! Subtitle parsing.
//!
//! Supports SRT, WebVTT and ASS/SSA. ASS override tags for bold, italic,
//! underline, font size and primary color are extracted into a [`CueStyle`];
//! everything else (karaoke, positioning, drawing) is stripped.

use std::path::Path;
use std::time::Duration;

/// Error type for subtitle operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubtitleError {
    /// Failed to parse timestamp
    InvalidTimestamp(String),
    /// Failed to parse subtitle file format
    ParseError(String),
    /// Empty subtitle file
    EmptyFile,
    /// Failed to read the subtitle source
    Io(String),
    /// No subtitle source for the requested track
    UnknownTrack(String),
}

impl std::fmt::Display for SubtitleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubtitleError::InvalidTimestamp(s) => write!(f, "Invalid timestamp: {s}"),
            SubtitleError::ParseError(s) => write!(f, "Parse error: {s}"),
            SubtitleError::EmptyFile => write!(f, "Empty subtitle file"),
            SubtitleError::Io(s) => write!(f, "I/O error: {s}"),
            SubtitleError::UnknownTrack(id) => write!(f, "Unknown subtitle track: {id}"),
        }
    }
}

impl std::error::Error for SubtitleError {}

impl From<std::io::Error> for SubtitleError {
    fn from(err: std::io::Error) -> Self {
        SubtitleError::Io(err.to_string())
    }
}

/// Inline styling carried by a cue.
///
/// SRT and VTT cues always use the default style.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CueStyle {
    pub bold: bool,
    pub italic: bool,
    pub underline: bool,
    /// Font size override in points
    pub font_size: Option<f32>,
    /// Primary text color override (RGB)
    pub color: Option<[u8; 3]>,
}

/// A single subtitle cue with timing and text.
#[derive(Debug, Clone, PartialEq)]
pub struct Cue {
    /// Start of the display interval, inclusive
    pub start_micros: u64,
    /// End of the display interval, inclusive
    pub end_micros: u64,
    /// Text content (may contain newlines for multi-line subtitles)
    pub text: String,
    pub style: CueStyle,
}

impl Cue {
    /// Creates an unstyled cue.
    pub fn new(start_micros: u64, end_micros: u64, text: impl Into<String>) -> Self {
        Self {
            start_micros,
            end_micros,
            text: text.into(),
            style: CueStyle::default(),
        }
    }

    fn from_durations(start: Duration, end: Duration, text: String, style: CueStyle) -> Self {
        Self {
            start_micros: start.as_micros() as u64,
            end_micros: end.as_micros() as u64,
            text,
            style,
        }
    }

    /// Returns true if `position_micros` falls inside `[start, end]`.
    pub fn contains(&self, position_micros: u64) -> bool {
        self.start_micros <= position_micros && position_micros <= self.end_micros
    }
}

/// Subtitle file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubtitleFormat {
    Srt,
    Vtt,
    Ass,
}

impl SubtitleFormat {
    /// Detects the format from a file extension (`.srt`, `.vtt`, `.ass`, `.ssa`).
    pub fn from_extension(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "srt" => Some(SubtitleFormat::Srt),
            "vtt" => Some(SubtitleFormat::Vtt),
            "ass" | "ssa" => Some(SubtitleFormat::Ass),
            _ => None,
        }
    }

    /// Detects the format from content markers, defaulting to SRT.
    pub fn sniff(content: &str) -> Self {
        let content = content.strip_prefix('\u{FEFF}').unwrap_or(content);
        if content.trim_start().starts_with("WEBVTT") {
            return SubtitleFormat::Vtt;
        }
        let ass_marker = content.lines().any(|line| {
            let line = line.trim().to_ascii_lowercase();
            line.starts_with("[script info]")
                || line.starts_with("[events]")
                || line.starts_with("format:")
                || line.starts_with("dialogue:")
        });
        if ass_marker {
            SubtitleFormat::Ass
        } else {
            SubtitleFormat::Srt
        }
    }
}

/// A loaded subtitle track
#[derive(Debug, Clone, Default)]
pub struct SubtitleTrack {
    /// All cues in the track, sorted by start time
    pub cues: Vec<Cue>,
    /// Optional language identifier (e.g., "en", "es")
    pub language: Option<String>,
    /// Optional track title
    pub title: Option<String>,
}

impl SubtitleTrack {
    /// Create an empty subtitle track
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a track from cues in any order.
    pub fn from_cues(mut cues: Vec<Cue>) -> Self {
        cues.sort_by_key(|c| c.start_micros);
        Self {
            cues,
            language: None,
            title: None,
        }
    }

    /// Parses `content` in the given format.
    pub fn parse(content: &str, format: SubtitleFormat) -> Result<Self, SubtitleError> {
        match format {
            SubtitleFormat::Srt => Self::from_srt(content),
            SubtitleFormat::Vtt => Self::from_vtt(content),
            SubtitleFormat::Ass => Self::from_ass(content),
        }
    }

    /// Reads and parses a subtitle file, detecting the format by extension
    /// and then by content.
    pub fn from_path(path: &Path) -> Result<Self, SubtitleError> {
        let content = std::fs::read_to_string(path)?;
        let format = SubtitleFormat::from_extension(path)
            .unwrap_or_else(|| SubtitleFormat::sniff(&content));
        tracing::debug!("Parsing {:?} as {:?}", path, format);
        Self::parse(&content, format)
    }

    /// Parse subtitle track from SRT format
    ///
    /// SRT format:
    /// ```text
    /// 1
    /// 00:00:01,000 --> 00:00:04,000
    /// First subtitle line
    ///
    /// 2
    /// 00:00:05,000 --> 00:00:08,000
    /// Second subtitle line
    /// With multiple lines
    /// ```
    pub fn from_srt(content: &str) -> Result<Self, SubtitleError> {
        let mut cues = Vec::new();

        // Normalize CRLF to LF for consistent parsing
        let content = content.strip_prefix('\u{FEFF}').unwrap_or(content);
        let content = content.replace("\r\n", "\n");

        for block in content.split("\n\n") {
            let block = block.trim();
            if block.is_empty() {
                continue;
            }

            let lines: Vec<&str> = block.lines().collect();

            // The index line is optional, find the timing line by pattern
            let Some(timing_idx) = lines.iter().position(|line| line.contains("-->")) else {
                continue;
            };

            let (start, end) = parse_srt_timing(lines[timing_idx])?;

            let text = lines[timing_idx + 1..].join("\n");
            if !text.is_empty() {
                cues.push(Cue::from_durations(start, end, text, CueStyle::default()));
            }
        }

        finish(cues)
    }

    /// Parse subtitle track from WebVTT format
    ///
    /// VTT format:
    /// ```text
    /// WEBVTT
    ///
    /// 00:00:01.000 --> 00:00:04.000
    /// First subtitle line
    ///
    /// 00:00:05.000 --> 00:00:08.000
    /// Second subtitle line
    /// ```
    pub fn from_vtt(content: &str) -> Result<Self, SubtitleError> {
        let mut cues = Vec::new();

        let content = content.strip_prefix('\u{FEFF}').unwrap_or(content);
        let lines: Vec<&str> = content.lines().collect();

        if lines.is_empty() || !lines[0].trim().starts_with("WEBVTT") {
            return Err(SubtitleError::ParseError(
                "Missing WEBVTT header".to_string(),
            ));
        }

        let mut i = 1;
        while i < lines.len() {
            let line = lines[i].trim();

            if line.is_empty() {
                i += 1;
                continue;
            }

            // NOTE and STYLE blocks run until the next blank line
            if line.starts_with("NOTE") || line.starts_with("STYLE") {
                i += 1;
                while i < lines.len() && !lines[i].trim().is_empty() {
                    i += 1;
                }
                continue;
            }

            if line.contains("-->") {
                let (start, end) = parse_vtt_timing(line)?;

                let mut text_lines = Vec::new();
                i += 1;
                while i < lines.len() && !lines[i].trim().is_empty() {
                    text_lines.push(lines[i].trim());
                    i += 1;
                }

                let text = text_lines.join("\n");
                if !text.is_empty() {
                    cues.push(Cue::from_durations(start, end, text, CueStyle::default()));
                }
            } else {
                // Cue identifier
                i += 1;
            }
        }

        finish(cues)
    }

    /// Parse subtitle track from ASS/SSA format
    ///
    /// Only the `[Events]` section is read. Column positions come from its
    /// `Format:` line; `Dialogue:` lines before a `Format:` line are skipped.
    /// ```text
    /// [Events]
    /// Format: Layer, Start, End, Style, Name, MarginL, MarginR, MarginV, Effect, Text
    /// Dialogue: 0,0:00:01.00,0:00:04.00,Default,,0,0,0,,{\b1}Bold{\b0} text
    /// ```
    pub fn from_ass(content: &str) -> Result<Self, SubtitleError> {
        let mut cues = Vec::new();
        let mut in_events = false;
        let mut columns: Option<AssColumns> = None;

        let content = content.strip_prefix('\u{FEFF}').unwrap_or(content);
        for line in content.lines() {
            let trimmed = line.trim();

            if trimmed.starts_with('[') && trimmed.ends_with(']') {
                in_events = trimmed.eq_ignore_ascii_case("[Events]");
                columns = None;
                continue;
            }
            if !in_events {
                continue;
            }

            if let Some(format) = strip_prefix_ignore_case(trimmed, "Format:") {
                columns = AssColumns::from_format(format);
                if columns.is_none() {
                    tracing::warn!("ASS Format line lacks Start/End/Text: {}", format);
                }
                continue;
            }

            if let Some(dialogue) = strip_prefix_ignore_case(trimmed, "Dialogue:") {
                let Some(columns) = &columns else {
                    continue;
                };
                match columns.parse_dialogue(dialogue.trim()) {
                    Some(cue) => cues.push(cue),
                    None => tracing::trace!("Skipping malformed Dialogue line: {}", dialogue),
                }
            }
        }

        finish(cues)
    }

    /// Total number of cues in the track
    pub fn len(&self) -> usize {
        self.cues.len()
    }

    /// Check if the track has no cues
    pub fn is_empty(&self) -> bool {
        self.cues.is_empty()
    }
}

fn finish(mut cues: Vec<Cue>) -> Result<SubtitleTrack, SubtitleError> {
    if cues.is_empty() {
        return Err(SubtitleError::EmptyFile);
    }
    cues.sort_by_key(|c| c.start_micros);
    Ok(SubtitleTrack {
        cues,
        language: None,
        title: None,
    })
}

fn strip_prefix_ignore_case<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    let head = line.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &line[prefix.len()..])
}

/// Parse SRT timing line: "00:00:01,000 --> 00:00:04,000"
fn parse_srt_timing(line: &str) -> Result<(Duration, Duration), SubtitleError> {
    let (start_str, end_str) = line
        .split_once("-->")
        .ok_or_else(|| SubtitleError::InvalidTimestamp(line.to_string()))?;

    let start = parse_srt_timestamp(start_str.trim())?;
    let end = parse_srt_timestamp(end_str.trim())?;
    Ok((start, end))
}

/// Parse SRT timestamp: "00:00:01,000" (comma for milliseconds)
fn parse_srt_timestamp(s: &str) -> Result<Duration, SubtitleError> {
    let s = s.replace(',', ".");
    parse_timestamp_common(&s)
}

/// Parse VTT timing line: "00:00:01.000 --> 00:00:04.000 align:start"
fn parse_vtt_timing(line: &str) -> Result<(Duration, Duration), SubtitleError> {
    let (start_str, rest) = line
        .split_once("-->")
        .ok_or_else(|| SubtitleError::InvalidTimestamp(line.to_string()))?;

    // Cue settings may follow the end timestamp
    let end_str = rest.split_whitespace().next().unwrap_or(rest.trim());

    let start = parse_timestamp_common(start_str.trim())?;
    let end = parse_timestamp_common(end_str)?;
    Ok((start, end))
}

/// Common timestamp parsing: "HH:MM:SS.mmm" or "MM:SS.mmm"
fn parse_timestamp_common(s: &str) -> Result<Duration, SubtitleError> {
    let invalid = || SubtitleError::InvalidTimestamp(s.to_string());
    let parts: Vec<&str> = s.split(':').collect();

    let (hours, minutes, seconds_str) = match parts.len() {
        2 => (0u64, parts[0], parts[1]),
        3 => {
            let h: u64 = parts[0].parse().map_err(|_| invalid())?;
            (h, parts[1], parts[2])
        }
        _ => return Err(invalid()),
    };

    let minutes: u64 = minutes.parse().map_err(|_| invalid())?;

    let (secs, frac) = seconds_str.split_once('.').unwrap_or((seconds_str, ""));
    let seconds: u64 = secs.parse().map_err(|_| invalid())?;

    let millis: u64 = if frac.is_empty() {
        0
    } else {
        // Pad or truncate to 3 digits
        let ms_str = format!("{frac:0<3}");
        ms_str
            .get(..3)
            .ok_or_else(invalid)?
            .parse()
            .map_err(|_| invalid())?
    };

    timestamp_millis(hours, minutes, seconds, millis)
        .map(Duration::from_millis)
        .ok_or_else(invalid)
}

/// Sums timestamp fields into milliseconds. `None` if the result, or the same
/// instant in microseconds, does not fit in a `u64`.
fn timestamp_millis(hours: u64, minutes: u64, seconds: u64, millis: u64) -> Option<u64> {
    let total = hours
        .checked_mul(3_600_000)?
        .checked_add(minutes.checked_mul(60_000)?)?
        .checked_add(seconds.checked_mul(1000)?)?
        .checked_add(millis)?;
    total.checked_mul(1000)?;
    Some(total)
}

/// Parse ASS time: "H:MM:SS.CC" (centiseconds)
fn parse_ass_time(s: &str) -> Option<Duration> {
    let mut parts = s.trim().split(':');
    let hours: u64 = parts.next()?.parse().ok()?;
    let minutes: u64 = parts.next()?.parse().ok()?;
    let (secs, centis) = parts.next()?.split_once('.')?;
    if parts.next().is_some() {
        return None;
    }
    let seconds: u64 = secs.parse().ok()?;
    let centis: u64 = centis.parse().ok()?;
    timestamp_millis(hours, minutes, seconds, centis.checked_mul(10)?).map(Duration::from_millis)
}

/// Column positions from an `[Events]` Format line.
struct AssColumns {
    count: usize,
    start: usize,
    end: usize,
    text: usize,
}

impl AssColumns {
    fn from_format(format: &str) -> Option<Self> {
        let fields: Vec<&str> = format.split(',').map(str::trim).collect();
        let find = |name: &str| fields.iter().position(|f| f.eq_ignore_ascii_case(name));
        Some(Self {
            count: fields.len(),
            start: find("Start")?,
            end: find("End")?,
            text: find("Text")?,
        })
    }

    fn parse_dialogue(&self, line: &str) -> Option<Cue> {
        // The text column is last and may itself contain commas
        let values: Vec<&str> = line.splitn(self.count, ',').collect();
        if values.len() < self.count {
            return None;
        }
        let start = parse_ass_time(values[self.start])?;
        let end = parse_ass_time(values[self.end])?;
        let raw = values[self.text..].join(",");
        let (text, style) = extract_ass_style(raw.trim());
        Some(Cue::from_durations(start, end, text, style))
    }
}

/// Applies supported override tags and returns the cleaned text.
fn extract_ass_style(raw: &str) -> (String, CueStyle) {
    let mut style = CueStyle::default();
    let mut text = String::with_capacity(raw.len());
    let mut rest = raw;

    while let Some(open) = rest.find('{') {
        text.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            // Unterminated block, keep it as text
            text.push_str(&rest[open..]);
            rest = "";
            break;
        };
        for tag in after[..close].split('\\').filter(|t| !t.is_empty()) {
            apply_ass_tag(tag, &mut style);
        }
        rest = &after[close + 1..];
    }
    text.push_str(rest);

    let text = text.replace("\\N", "\n").replace("\\n", "\n").replace("\\h", " ");
    (text.trim().to_string(), style)
}

fn apply_ass_tag(tag: &str, style: &mut CueStyle) {
    match tag {
        t if t.starts_with("b1") => style.bold = true,
        t if t.starts_with("b0") => style.bold = false,
        t if t.starts_with("i1") => style.italic = true,
        t if t.starts_with("i0") => style.italic = false,
        t if t.starts_with("u1") => style.underline = true,
        t if t.starts_with("u0") => style.underline = false,
        t if t.starts_with("fs") => {
            if let Some(size) = t[2..].trim().parse::<f32>().ok().filter(|s| *s > 0.0) {
                style.font_size = Some(size);
            }
        }
        t if t.starts_with("c&H") || t.starts_with("1c&H") => {
            let hex = t.trim_start_matches('1').trim_start_matches("c&H").trim_end_matches('&');
            if let Some(color) = parse_ass_color(hex) {
                style.color = Some(color);
            }
        }
        _ => {}
    }
}

/// ASS colors are BGR hex ("BBGGRR"); returns RGB.
fn parse_ass_color(hex: &str) -> Option<[u8; 3]> {
    if hex.len() != 6 {
        return None;
    }
    let byte = |range: std::ops::Range<usize>| u8::from_str_radix(hex.get(range)?, 16).ok();
    let blue = byte(0..2)?;
    let green = byte(2..4)?;
    let red = byte(4..6)?;
    Some([red, green, blue])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_srt_timestamp() {
        let ts = parse_srt_timestamp("00:01:23,456").unwrap();
        assert_eq!(ts, Duration::from_millis(83456));
    }

    #[test]
    fn test_parse_vtt_timestamp() {
        let ts = parse_timestamp_common("00:01:23.456").unwrap();
        assert_eq!(ts, Duration::from_millis(83456));

        // Short form (MM:SS.mmm)
        let ts = parse_timestamp_common("01:23.456").unwrap();
        assert_eq!(ts, Duration::from_millis(83456));

        assert!(parse_timestamp_common("1:2:3:4").is_err());
    }

    #[test]
    fn test_parse_ass_time() {
        assert_eq!(parse_ass_time("0:01:02.50"), Some(Duration::from_millis(62_500)));
        assert_eq!(parse_ass_time("1:00:00.00"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_ass_time("01:02.50"), None);
        assert_eq!(parse_ass_time("0:01:02"), None);
    }

    #[test]
    fn test_parse_srt() {
        let srt = "1\r\n00:00:01,000 --> 00:00:04,000\r\nFirst subtitle\r\n\r\n\
                   00:00:05.000 --> 00:00:08,000\r\nSecond subtitle\r\nwith two lines\r\n";

        let track = SubtitleTrack::from_srt(srt).unwrap();
        assert_eq!(track.len(), 2);
        assert_eq!(track.cues[0].start_micros, 1_000_000);
        assert_eq!(track.cues[0].text, "First subtitle");
        assert_eq!(track.cues[1].text, "Second subtitle\nwith two lines");
        assert_eq!(track.cues[1].end_micros, 8_000_000);
    }

    #[test]
    fn test_oversized_timestamps_rejected() {
        let srt = "1\n9999999999999:00:00,000 --> 9999999999999:00:01,000\nx\n";
        let Err(SubtitleError::InvalidTimestamp(_)) = SubtitleTrack::from_srt(srt) else {
            panic!("Expected invalid timestamp error");
        };

        let vtt = "WEBVTT\n\n9999999999999:00:00.000 --> 9999999999999:00:01.000\nx\n";
        let Err(SubtitleError::InvalidTimestamp(_)) = SubtitleTrack::from_vtt(vtt) else {
            panic!("Expected invalid timestamp error");
        };

        assert_eq!(parse_ass_time("9999999999999:00:00.00"), None);
        let ass = "[Events]\n\
                   Format: Layer, Start, End, Style, Name, MarginL, MarginR, MarginV, Effect, Text\n\
                   Dialogue: 0,9999999999999:00:00.00,9999999999999:00:01.00,Default,,0,0,0,,x\n\
                   Dialogue: 0,0:00:01.00,0:00:02.00,Default,,0,0,0,,kept\n";
        let track = SubtitleTrack::from_ass(ass).unwrap();
        assert_eq!(track.len(), 1);
        assert_eq!(track.cues[0].text, "kept");
    }

    #[test]
    fn test_parse_srt_empty() {
        assert_eq!(SubtitleTrack::from_srt("\n\n").unwrap_err(), SubtitleError::EmptyFile);
    }

    #[test]
    fn test_parse_vtt() {
        let vtt = r#"WEBVTT

NOTE this is a comment
spanning lines

intro
00:00:01.000 --> 00:00:04.000 align:start position:10%
First subtitle

00:05.000 --> 00:08.000
Second subtitle
"#;

        let track = SubtitleTrack::from_vtt(vtt).unwrap();
        assert_eq!(track.len(), 2);
        assert_eq!(track.cues[0].text, "First subtitle");
        assert_eq!(track.cues[0].end_micros, 4_000_000);
        assert_eq!(track.cues[1].start_micros, 5_000_000);
    }

    #[test]
    fn test_vtt_requires_header() {
        let Err(SubtitleError::ParseError(_)) = SubtitleTrack::from_vtt("00:01.000 --> 00:02.000\nx")
        else {
            panic!("Expected missing header error");
        };
    }

    #[test]
    fn test_parse_ass() {
        let ass = r#"[Script Info]
Title: Example
ScriptType: v4.00+

[V4+ Styles]
Format: Name, Fontname, Fontsize
Style: Default,Arial,20

[Events]
Format: Layer, Start, End, Style, Name, MarginL, MarginR, MarginV, Effect, Text
Dialogue: 0,0:00:05.00,0:00:07.50,Default,,0,0,0,,Second, with a comma
Dialogue: 0,0:00:01.00,0:00:04.00,Default,,0,0,0,,{\b1\i1\fs28\c&H0000FF&}Styled{\b0}\Nline\htwo
Dialogue: 0,bad,0:00:04.00,Default,,0,0,0,,Dropped
"#;

        let track = SubtitleTrack::from_ass(ass).unwrap();
        assert_eq!(track.len(), 2);

        let first = &track.cues[0];
        assert_eq!(first.start_micros, 1_000_000);
        assert_eq!(first.text, "Styled\nline two");
        // \b0 after \b1 wins
        assert!(!first.style.bold);
        assert!(first.style.italic);
        assert_eq!(first.style.font_size, Some(28.0));
        // BGR 0000FF is red
        assert_eq!(first.style.color, Some([255, 0, 0]));

        let second = &track.cues[1];
        assert_eq!(second.text, "Second, with a comma");
        assert_eq!(second.end_micros, 7_500_000);
        assert_eq!(second.style, CueStyle::default());
    }

    #[test]
    fn test_ass_dialogue_before_format_skipped() {
        let ass = "[Events]\nDialogue: 0,0:00:01.00,0:00:02.00,Default,,0,0,0,,Lost\n";
        assert_eq!(SubtitleTrack::from_ass(ass).unwrap_err(), SubtitleError::EmptyFile);
    }

    #[test]
    fn test_ass_alternate_color_tag() {
        let (text, style) = extract_ass_style(r"{\1c&H00FF00&\u1}green");
        assert_eq!(text, "green");
        assert_eq!(style.color, Some([0, 255, 0]));
        assert!(style.underline);
    }

    #[test]
    fn test_format_detection() {
        assert_eq!(
            SubtitleFormat::from_extension(Path::new("movie.en.SSA")),
            Some(SubtitleFormat::Ass)
        );
        assert_eq!(SubtitleFormat::from_extension(Path::new("movie.sub")), None);
        assert_eq!(SubtitleFormat::sniff("WEBVTT\n\n"), SubtitleFormat::Vtt);
        assert_eq!(SubtitleFormat::sniff("[Script Info]\nTitle: x"), SubtitleFormat::Ass);
        assert_eq!(
            SubtitleFormat::sniff("1\n00:00:01,000 --> 00:00:02,000\nhi"),
            SubtitleFormat::Srt
        );
    }
}
