//! cadence-core: playback synchronization core.
//!
//! This crate keeps decoded video, audio and subtitle cues aligned to one
//! playback clock. It contains:
//!
//! - Clocks: [`clock`] (hardware-driven and standalone, swappable at runtime)
//! - Buffering: [`frame_queue`] (bounded, clock-gated, drops late frames)
//! - Subtitles: [`subtitles`] (SRT/WebVTT/ASS parsing), [`cue_tracker`] (cursor lookup)
//! - Control: [`player`] (state machine, seeks), backed by [`session`], [`decode`] and [`sync`]
//! - Persistence: [`prefs`] (per-content resume position, tracks, offsets)
//!
//! The crate never demuxes or decodes media itself. Embedders provide a
//! [`MediaBackend`] for decoding and a [`RenderSink`] for presentation.

pub mod backend;
pub mod clock;
pub mod config;
pub mod cue_tracker;
mod decode;
pub mod error;
pub mod frame_queue;
pub mod metrics;
pub mod player;
pub mod prefs;
pub mod session;
pub mod subtitles;
mod sync;

pub use backend::{
    MediaBackend, MediaSource, RenderSink, Sample, SeekMode, TrackId, TrackInfo, TrackKind,
    TrackSelection,
};
pub use clock::{ClockKind, ClockSource, HardwareClock, PlaybackClock, SharedClock, StandaloneClock};
pub use config::SyncConfig;
pub use cue_tracker::{CueTimeline, CueTracker, FileSubtitleProvider, SubtitleHandle, SubtitleProvider};
pub use error::PlaybackError;
pub use frame_queue::{Frame, FrameQueue};
pub use metrics::{MetricsSnapshot, PlaybackMetrics};
pub use player::{Player, PlayerEvent, SeekOutcome};
pub use prefs::{
    load_playback_prefs, ContentId, JsonPreferenceStore, MemoryPreferenceStore, PlaybackPrefs,
    PrefField, PrefKey, PrefValue, PreferenceStore, PrefsError,
};
pub use session::{SessionState, StateCell};
pub use subtitles::{Cue, CueStyle, SubtitleError, SubtitleFormat, SubtitleTrack};
