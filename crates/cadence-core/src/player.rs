//! Headless playback controller.
//!
//! [`Player`] is the control surface over one [`MediaBackend`]: it owns the
//! session state machine, swaps clocks as playback starts and stops, and
//! coordinates seeks across the decode threads. Presentation goes to the
//! [`RenderSink`] handed to [`Player::prepare`].
//!
//! Control calls are safe from any thread. They serialize on the session
//! slot, except for the wait phase of a seek, so a newer seek or a stop can
//! always interrupt one in flight.

use std::sync::Arc;
use std::thread;

use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use poll_promise::Promise;

use crate::backend::{MediaBackend, MediaSource, RenderSink, TrackId, TrackSelection};
use crate::clock::{ClockKind, ClockSource, HardwareClock, PlaybackClock, StandaloneClock};
use crate::config::SyncConfig;
use crate::cue_tracker::{SubtitleHandle, SubtitleProvider};
use crate::decode::{SeekBarrier, SeekWait};
use crate::error::PlaybackError;
use crate::metrics::MetricsSnapshot;
use crate::prefs::PlaybackPrefs;
use crate::session::{DecoderSession, SessionContext, SessionState};
use crate::subtitles::{Cue, SubtitleError};

/// Events buffered for the embedder before new ones are dropped.
const EVENT_CAPACITY: usize = 256;

/// Notifications published by a [`Player`].
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    /// The session moved to a new state
    StateChanged(SessionState),
    /// An error occurred; [`PlaybackError::is_fatal`] tells whether it
    /// ended the session
    Error(PlaybackError),
    /// Every track finished and the last frame was presented
    EndOfStream,
    /// A seek landed and playback resumed from the target
    SeekCompleted { target_micros: u64 },
}

/// How a call to [`Player::seek_to`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekOutcome {
    /// Every decode thread repositioned
    Completed,
    /// A newer seek or a stop took over before this one finished
    Superseded,
    /// The decode threads did not acknowledge in time; playback resumed at
    /// the target anyway
    TimedOut,
}

/// Headless player.
///
/// # State Machine
///
/// ```text
/// new(backend)
///   → Idle
///
/// prepare()  [Idle/Stopped]            → Prepared
/// play()     [Prepared/Paused]         → Playing
/// pause()    [Playing]                 → Paused
/// seek_to()  [Playing/Paused/Seeking]  → Seeking → back where it started
/// stop()     [Prepared..Stopped]       → Stopped
/// release()  [any]                     → Released
/// ```
pub struct Player {
    backend: Arc<dyn MediaBackend>,
    ctx: Arc<SessionContext>,
    barrier: Arc<SeekBarrier>,
    /// Resources of the current session. Also the control lock.
    session: Mutex<Option<DecoderSession>>,
    events_rx: Receiver<PlayerEvent>,
    /// Scrub position while the user drags a seek bar
    preview_micros: Mutex<Option<u64>>,
    /// Position the next `play()` from Prepared starts at
    start_position: Mutex<Option<u64>>,
    /// Audio track applied to the next `prepare()`
    preferred_audio: Mutex<Option<TrackId>>,
}

impl Player {
    /// Creates an idle player with default tunables.
    pub fn new(backend: Arc<dyn MediaBackend>) -> Self {
        Self::with_config(backend, SyncConfig::default())
    }

    /// Creates an idle player with `config`.
    pub fn with_config(backend: Arc<dyn MediaBackend>, config: SyncConfig) -> Self {
        let (events_tx, events_rx) = crossbeam_channel::bounded(EVENT_CAPACITY);
        Self {
            backend,
            ctx: Arc::new(SessionContext::new(config.validate(), events_tx)),
            barrier: Arc::new(SeekBarrier::new()),
            session: Mutex::new(None),
            events_rx,
            preview_micros: Mutex::new(None),
            start_position: Mutex::new(None),
            preferred_audio: Mutex::new(None),
        }
    }

    /// Sets where subtitle tracks are loaded from.
    pub fn with_subtitle_provider(self, provider: Arc<dyn SubtitleProvider>) -> Self {
        self.ctx.subtitles.set_provider(provider);
        self
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Selects tracks and allocates a paused session for `source`.
    ///
    /// Blocks while the backend opens the media; see [`Player::prepare_async`].
    pub fn prepare(
        &self,
        source: MediaSource,
        sink: Arc<dyn RenderSink>,
    ) -> Result<(), PlaybackError> {
        let from = self.ctx.state.transition(
            "prepare",
            &[SessionState::Idle, SessionState::Stopped],
            SessionState::Preparing,
        )?;

        // A session that failed on its own is still parked in the slot
        let stale = self.session.lock().take();
        if let Some(stale) = stale {
            self.shutdown_session(stale);
        }

        let mut source = source;
        if source.audio_track.is_none() {
            source.audio_track = *self.preferred_audio.lock();
        }
        tracing::info!("Preparing {}", source.uri);

        self.ctx.clear_error();
        self.ctx.subtitles.request_cursor_reset();
        self.ctx.clock.swap(ClockSource::Standalone(StandaloneClock::frozen_at(0)));
        self.ctx.publish_position(0);
        self.backend.set_paused(true);

        let session =
            match DecoderSession::start(&self.backend, source, sink, &self.ctx, &self.barrier) {
                Ok(session) => session,
                Err(e) => {
                    tracing::warn!("prepare failed: {}", e);
                    self.ctx.state.compare_and_set(SessionState::Preparing, from);
                    return Err(e);
                }
            };

        let mut slot = self.session.lock();
        if !self.ctx.state.compare_and_set(SessionState::Preparing, SessionState::Prepared) {
            // Released while we were allocating
            let state = self.ctx.state.load();
            drop(slot);
            self.shutdown_session(session);
            return Err(PlaybackError::InvalidTransition {
                operation: "prepare",
                state,
            });
        }
        *slot = Some(session);
        drop(slot);

        self.ctx.emit(PlayerEvent::StateChanged(SessionState::Prepared));
        Ok(())
    }

    /// Runs [`Player::prepare`] on a background thread.
    pub fn prepare_async(
        self: &Arc<Self>,
        source: MediaSource,
        sink: Arc<dyn RenderSink>,
    ) -> Promise<Result<(), PlaybackError>> {
        let (sender, promise) = Promise::new();
        let player = Arc::clone(self);
        thread::spawn(move || {
            sender.send(player.prepare(source, sink));
        });
        promise
    }

    /// Starts or resumes playback.
    pub fn play(&self) -> Result<(), PlaybackError> {
        let slot = self.session.lock();
        let left = self.ctx.state.transition(
            "play",
            &[SessionState::Prepared, SessionState::Paused],
            SessionState::Playing,
        )?;
        let Some(session) = slot.as_ref() else {
            self.ctx.state.compare_and_set(SessionState::Playing, left);
            return Err(PlaybackError::InvalidTransition {
                operation: "play",
                state: left,
            });
        };

        let mut position = self.ctx.clock.position_micros();
        if left == SessionState::Prepared {
            if let Some(start) = self.start_position.lock().take() {
                position = clamp_to(start, session.duration_micros);
                tracing::info!("Starting playback at {}us", position);
                session.queue.clear();
                self.ctx.subtitles.request_cursor_reset();
                let generation = self.barrier.begin(session.seek_participants());
                session.seek(position, generation);
                self.ctx.publish_position(position);
            }
        }

        self.backend.set_paused(false);
        self.ctx.clock.swap(self.running_clock(session, position));
        session.play();
        drop(slot);

        self.ctx.emit(PlayerEvent::StateChanged(SessionState::Playing));
        Ok(())
    }

    /// Pauses playback, freezing the clock where it is.
    pub fn pause(&self) -> Result<(), PlaybackError> {
        let slot = self.session.lock();
        self.ctx
            .state
            .transition("pause", &[SessionState::Playing], SessionState::Paused)?;

        let position = self.ctx.freeze_clock();
        self.ctx.publish_position(position);
        self.backend.set_paused(true);
        if let Some(session) = slot.as_ref() {
            session.pause();
        }
        drop(slot);

        tracing::debug!("Paused at {}us", position);
        self.ctx.emit(PlayerEvent::StateChanged(SessionState::Paused));
        Ok(())
    }

    /// Halts playback and frees the session. `prepare()` may follow.
    pub fn stop(&self) -> Result<(), PlaybackError> {
        let mut slot = self.session.lock();
        let left = self.ctx.state.transition(
            "stop",
            &[
                SessionState::Prepared,
                SessionState::Playing,
                SessionState::Paused,
                SessionState::Seeking,
                SessionState::Stopped,
            ],
            SessionState::Stopped,
        )?;

        self.barrier.cancel();
        *self.preview_micros.lock() = None;
        let position = self.ctx.freeze_clock();
        self.ctx.publish_position(position);
        self.backend.set_paused(true);
        let session = slot.take();
        drop(slot);

        if let Some(session) = session {
            self.shutdown_session(session);
        }
        if left != SessionState::Stopped {
            tracing::info!("Stopped at {}us", position);
            self.ctx.emit(PlayerEvent::StateChanged(SessionState::Stopped));
        }
        Ok(())
    }

    /// Frees everything. Terminal and idempotent.
    pub fn release(&self) {
        let mut slot = self.session.lock();
        let previous = self.ctx.state.force(SessionState::Released);
        if previous == SessionState::Released {
            return;
        }

        self.barrier.cancel();
        *self.preview_micros.lock() = None;
        let position = self.ctx.freeze_clock();
        self.ctx.publish_position(position);
        self.backend.set_paused(true);
        let session = slot.take();
        drop(slot);

        if let Some(session) = session {
            self.shutdown_session(session);
        }
        self.ctx.subtitles.clear();
        tracing::info!("Released player (was {})", previous);
        self.ctx.emit(PlayerEvent::StateChanged(SessionState::Released));
    }

    // ========================================================================
    // Seeking
    // ========================================================================

    /// Repositions playback to `target_micros`.
    ///
    /// Blocks until every decode thread repositioned, a newer seek took over,
    /// or the seek timeout elapsed. Playback then continues in the state the
    /// seek was issued from.
    pub fn seek_to(&self, target_micros: u64) -> Result<SeekOutcome, PlaybackError> {
        let (origin, target, generation) = {
            let slot = self.session.lock();
            let (origin, superseding) = self.ctx.state.enter_seeking("seek_to")?;
            self.ctx.metrics.record_seek_requested();
            if superseding {
                self.ctx.metrics.record_seek_superseded();
            }
            let Some(session) = slot.as_ref() else {
                self.ctx.state.compare_and_set(SessionState::Seeking, origin);
                return Err(PlaybackError::InvalidTransition {
                    operation: "seek_to",
                    state: origin,
                });
            };

            let target = clamp_to(target_micros, session.duration_micros);
            session.queue.clear();
            self.ctx.subtitles.request_cursor_reset();
            self.ctx.clock.swap(ClockSource::Standalone(StandaloneClock::frozen_at(target)));
            self.ctx.publish_position(target);

            let generation = self.barrier.begin(session.seek_participants());
            session.seek(target, generation);
            (origin, target, generation)
        };
        tracing::debug!("Seek to {}us issued (generation {})", target, generation);

        let outcome = match self.barrier.wait(generation, self.ctx.config.seek_timeout) {
            SeekWait::Completed(Ok(())) => SeekOutcome::Completed,
            SeekWait::Completed(Err(e)) => {
                self.ctx.fail(e.clone());
                return Err(e);
            }
            SeekWait::Superseded => {
                tracing::debug!("Seek to {}us superseded", target);
                return Ok(SeekOutcome::Superseded);
            }
            SeekWait::TimedOut => {
                tracing::warn!(
                    "Seek to {}us not acknowledged within {:?}, resuming anyway",
                    target,
                    self.ctx.config.seek_timeout
                );
                self.ctx.metrics.record_seek_timeout();
                self.ctx.emit(PlayerEvent::Error(PlaybackError::Timeout(format!(
                    "seek to {target}us"
                ))));
                SeekOutcome::TimedOut
            }
        };

        let slot = self.session.lock();
        if self.barrier.generation() != generation
            || !self.ctx.state.compare_and_set(SessionState::Seeking, origin)
        {
            tracing::debug!("Seek to {}us overtaken before resuming", target);
            return Ok(SeekOutcome::Superseded);
        }
        if origin == SessionState::Playing {
            if let Some(session) = slot.as_ref() {
                self.ctx.clock.swap(self.running_clock(session, target));
            }
        }
        drop(slot);

        if outcome == SeekOutcome::Completed {
            self.ctx.metrics.record_seek_completed();
        }
        self.ctx.emit(PlayerEvent::SeekCompleted {
            target_micros: target,
        });
        self.ctx.emit(PlayerEvent::StateChanged(origin));
        Ok(outcome)
    }

    /// Shows where a drag would land without moving playback.
    ///
    /// Returns the cue at the preview position, and makes
    /// [`Player::position_micros`] report the preview until the drag is
    /// committed or cancelled.
    pub fn seek_preview(&self, target_micros: u64) -> Result<Option<Cue>, PlaybackError> {
        let state = self.ctx.state.load();
        if !state.has_session() {
            return Err(PlaybackError::InvalidTransition {
                operation: "seek_preview",
                state,
            });
        }
        let target = clamp_to(target_micros, self.duration_micros());
        *self.preview_micros.lock() = Some(target);
        tracing::trace!("Seek preview at {}us", target);
        Ok(self.ctx.subtitles.current_cue(target))
    }

    /// Ends a drag by seeking to `target_micros`.
    pub fn seek_commit(&self, target_micros: u64) -> Result<SeekOutcome, PlaybackError> {
        *self.preview_micros.lock() = None;
        self.seek_to(target_micros)
    }

    /// Ends a drag without seeking.
    pub fn cancel_seek_preview(&self) {
        *self.preview_micros.lock() = None;
    }

    // ========================================================================
    // Observation
    // ========================================================================

    pub fn state(&self) -> SessionState {
        self.ctx.state.load()
    }

    pub fn is_playing(&self) -> bool {
        self.state() == SessionState::Playing
    }

    /// Current playback position, or the scrub position during a drag.
    pub fn position_micros(&self) -> u64 {
        if let Some(preview) = *self.preview_micros.lock() {
            return preview;
        }
        if self.state().has_session() {
            self.ctx.clock.position_micros()
        } else {
            self.ctx.published_position()
        }
    }

    pub fn duration_micros(&self) -> Option<u64> {
        self.session.lock().as_ref().and_then(|s| s.duration_micros)
    }

    /// Tracks of the current session.
    pub fn tracks(&self) -> Option<TrackSelection> {
        self.session.lock().as_ref().map(|s| s.tracks.clone())
    }

    /// Frames evicted or dropped late since the player was created.
    pub fn dropped_frame_count(&self) -> u64 {
        self.ctx.metrics.dropped_frames()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.ctx.metrics.snapshot()
    }

    /// Which clock drives playback right now.
    pub fn clock_kind(&self) -> ClockKind {
        self.ctx.clock.kind()
    }

    /// The error that ended the last session, if any.
    pub fn last_error(&self) -> Option<PlaybackError> {
        self.ctx.last_error()
    }

    /// Receiver for [`PlayerEvent`]s. Every clone shares one queue.
    pub fn events(&self) -> Receiver<PlayerEvent> {
        self.events_rx.clone()
    }

    // ========================================================================
    // Subtitles and preferences
    // ========================================================================

    pub fn subtitles(&self) -> &SubtitleHandle {
        &self.ctx.subtitles
    }

    /// Loads a subtitle track in the background. The latest load wins.
    pub fn load_subtitle_track(&self, track_id: &str) -> Promise<Result<usize, SubtitleError>> {
        self.ctx.subtitles.load_track(track_id)
    }

    /// Shifts subtitle timing. Positive offsets show cues later.
    pub fn set_subtitle_offset(&self, offset_micros: i64) {
        self.ctx.subtitles.set_offset(offset_micros);
    }

    /// Cue visible at `position_micros`, with the offset applied.
    pub fn current_cue(&self, position_micros: u64) -> Option<Cue> {
        self.ctx.subtitles.current_cue(position_micros)
    }

    /// Sets the speed of the standalone clock. Hardware clocks follow the
    /// audio output instead.
    pub fn set_playback_rate(&self, rate: f64) {
        if !rate.is_finite() || rate <= 0.0 {
            tracing::warn!("Ignoring playback rate {}", rate);
            return;
        }
        self.ctx.set_playback_rate(rate);
        if let ClockSource::Standalone(clock) = &*self.ctx.clock.current() {
            clock.set_rate(rate);
        }
    }

    pub fn playback_rate(&self) -> f64 {
        self.ctx.playback_rate()
    }

    /// Position the next `play()` from Prepared starts at.
    pub fn set_start_position(&self, position_micros: u64) {
        *self.start_position.lock() = Some(position_micros);
    }

    /// Applies stored preferences.
    ///
    /// Resume position and audio track take effect on the next
    /// `play()`/`prepare()`. Returns the subtitle load, if one was started.
    pub fn apply_prefs(
        &self,
        prefs: &PlaybackPrefs,
    ) -> Option<Promise<Result<usize, SubtitleError>>> {
        if let Some(position) = prefs.resume_position_micros {
            self.set_start_position(position);
        }
        *self.preferred_audio.lock() = prefs.audio_track;
        self.set_subtitle_offset(prefs.subtitle_offset_micros);
        self.set_playback_rate(prefs.playback_speed);
        prefs
            .subtitle_track
            .as_deref()
            .map(|track| self.load_subtitle_track(track))
    }

    /// Tears down `session`, reporting threads that would not exit.
    fn shutdown_session(&self, session: DecoderSession) {
        let timeout = self.ctx.config.join_timeout;
        if !session.shutdown(timeout) {
            self.ctx.emit(PlayerEvent::Error(PlaybackError::Timeout(format!(
                "session threads did not exit within {timeout:?}"
            ))));
        }
    }

    /// Picks the clock for playing from `position_micros`.
    fn running_clock(&self, session: &DecoderSession, position_micros: u64) -> ClockSource {
        if session.tracks.has_audio() && self.backend.hardware_clock_micros().is_some() {
            tracing::debug!("Using hardware audio clock from {}us", position_micros);
            let backend = Arc::clone(&self.backend);
            return ClockSource::Hardware(HardwareClock::new(position_micros, move || {
                backend.hardware_clock_micros()
            }));
        }
        tracing::debug!("Using standalone clock from {}us", position_micros);
        ClockSource::Standalone(StandaloneClock::running_from(
            position_micros,
            self.ctx.playback_rate(),
        ))
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.release();
    }
}

fn clamp_to(target_micros: u64, duration_micros: Option<u64>) -> u64 {
    duration_micros.map_or(target_micros, |d| target_micros.min(d))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_to_duration() {
        assert_eq!(clamp_to(5_000, Some(3_000)), 3_000);
        assert_eq!(clamp_to(5_000, None), 5_000);
        assert_eq!(clamp_to(0, Some(3_000)), 0);
    }
}
