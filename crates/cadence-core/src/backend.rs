//! Interfaces to the decode backend and the render sink.
//!
//! The core never demuxes or decodes itself. A [`MediaBackend`] exposes the
//! primitives the decode threads pull from, and a [`RenderSink`] receives
//! whatever the sync controller decides to present.

use std::fmt;

use bytes::Bytes;

use crate::error::PlaybackError;
use crate::frame_queue::Frame;
use crate::prefs::ContentId;
use crate::subtitles::Cue;

/// What to play.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSource {
    /// URI or file path understood by the backend
    pub uri: String,
    /// Stable identity for preference lookup, if known
    pub content_id: Option<ContentId>,
    /// Preferred audio track; backends may ignore it
    pub audio_track: Option<TrackId>,
}

impl MediaSource {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            content_id: None,
            audio_track: None,
        }
    }

    pub fn with_content_id(mut self, id: ContentId) -> Self {
        self.content_id = Some(id);
        self
    }

    pub fn with_audio_track(mut self, track: TrackId) -> Self {
        self.audio_track = Some(track);
        self
    }
}

/// Backend-assigned track index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackId(pub u32);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Elementary stream kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Video,
    Audio,
}

/// Description of one elementary stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackInfo {
    pub id: TrackId,
    pub kind: TrackKind,
    /// ISO language code, if tagged
    pub language: Option<String>,
    /// Codec name (e.g. "h264", "aac")
    pub codec: String,
    /// Audio channel count (0 for video)
    pub channels: u16,
    /// Audio sample rate in Hz (0 for video)
    pub sample_rate: u32,
}

impl TrackInfo {
    pub fn video(id: u32, codec: impl Into<String>) -> Self {
        Self {
            id: TrackId(id),
            kind: TrackKind::Video,
            language: None,
            codec: codec.into(),
            channels: 0,
            sample_rate: 0,
        }
    }

    pub fn audio(id: u32, codec: impl Into<String>, channels: u16, sample_rate: u32) -> Self {
        Self {
            id: TrackId(id),
            kind: TrackKind::Audio,
            language: None,
            codec: codec.into(),
            channels,
            sample_rate,
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    /// Human-readable name, e.g. "Track 2 (en) - 2 ch, 48kHz".
    ///
    /// Track numbers are 1-based.
    pub fn display_name(&self) -> String {
        let mut name = format!("Track {}", self.id.0 + 1);
        if let Some(lang) = &self.language {
            name.push_str(&format!(" ({lang})"));
        }
        match self.kind {
            TrackKind::Audio => {
                let khz = if self.sample_rate % 1000 == 0 {
                    format!("{}", self.sample_rate / 1000)
                } else {
                    format!("{:.1}", f64::from(self.sample_rate) / 1000.0)
                };
                name.push_str(&format!(" - {} ch, {}kHz", self.channels, khz));
            }
            TrackKind::Video => name.push_str(&format!(" - {}", self.codec)),
        }
        name
    }
}

/// Tracks chosen for a session. At least one must be present.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackSelection {
    pub video: Option<TrackInfo>,
    pub audio: Option<TrackInfo>,
}

impl TrackSelection {
    pub fn is_empty(&self) -> bool {
        self.video.is_none() && self.audio.is_none()
    }

    pub fn has_audio(&self) -> bool {
        self.audio.is_some()
    }
}

/// One unit read from a track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sample {
    /// Decoded data. `width`/`height` are 0 for audio.
    Data {
        pts_micros: u64,
        payload: Bytes,
        width: u32,
        height: u32,
    },
    /// The track has no more samples.
    EndOfStream,
}

/// How the backend should land a seek.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekMode {
    /// Nearest sync (key) frame to the target
    ClosestSync,
}

/// Demux/decode primitives consumed by the decode threads.
///
/// Methods take `&self` because the video and audio threads call into the
/// same backend concurrently.
pub trait MediaBackend: Send + Sync {
    /// Opens `source` and picks the tracks to play.
    fn select_tracks(&self, source: &MediaSource) -> Result<TrackSelection, PlaybackError>;

    /// Reads and decodes the next sample of `track`.
    fn read_sample(&self, track: TrackId) -> Result<Sample, PlaybackError>;

    /// Repositions `track` near `target_micros`.
    fn seek(&self, track: TrackId, target_micros: u64, mode: SeekMode) -> Result<(), PlaybackError>;

    /// Audio output's hardware position, available only while an audio
    /// output is active.
    fn hardware_clock_micros(&self) -> Option<u64>;

    /// Media duration, if known.
    fn duration_micros(&self) -> Option<u64> {
        None
    }

    /// Pauses or resumes the audio output.
    fn set_paused(&self, _paused: bool) {}
}

/// Receives presentation decisions from the sync controller.
pub trait RenderSink: Send + Sync {
    /// Presents a video frame.
    fn render_frame(&self, frame: &Frame);

    /// Shows a cue, or hides the current one when `None`.
    fn show_cue(&self, cue: Option<&Cue>);

    /// Hands decoded audio to the output.
    fn queue_audio(&self, _pts_micros: u64, _payload: &Bytes) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_name() {
        let track = TrackInfo::audio(1, "aac", 2, 48_000).with_language("en");
        assert_eq!(track.display_name(), "Track 2 (en) - 2 ch, 48kHz");

        let track = TrackInfo::audio(0, "ac3", 6, 44_100);
        assert_eq!(track.display_name(), "Track 1 - 6 ch, 44.1kHz");

        assert_eq!(TrackInfo::video(0, "h264").display_name(), "Track 1 - h264");
    }

    #[test]
    fn test_selection() {
        let mut selection = TrackSelection::default();
        assert!(selection.is_empty());
        selection.audio = Some(TrackInfo::audio(1, "aac", 2, 48_000));
        assert!(!selection.is_empty());
        assert!(selection.has_audio());
    }
}
