//! Decoder session state machine.
//!
//! ```text
//! new()
//!   → Idle
//!
//! prepare()  [Idle/Stopped]          → Preparing → Prepared (Idle/Stopped on failure)
//! play()     [Prepared/Paused]       → Playing
//! pause()    [Playing]               → Paused
//! seek_to()  [Playing/Paused]        → Seeking → state it was entered from
//! seek_to()  [Seeking]               → Seeking (supersedes the pending seek)
//! stop()     [Prepared..Seeking]     → Stopped
//! decode error                       → Stopped
//! release()  [any]                   → Released (terminal)
//! ```
//!
//! Every transition is a compare-and-set on one atomic cell, so two racing
//! callers can never both leave the same state.
//!
//! A [`DecoderSession`] owns the resources of one playback attempt (decode
//! threads, frame queue, render loop). The [`SessionContext`] is what those
//! threads share with the control surface.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Sender, TrySendError};
use parking_lot::Mutex;

use crate::backend::{MediaBackend, MediaSource, RenderSink, TrackSelection};
use crate::clock::{ClockSource, PlaybackClock, SharedClock, StandaloneClock};
use crate::config::SyncConfig;
use crate::cue_tracker::SubtitleHandle;
use crate::decode::{DecodeThread, SeekBarrier};
use crate::error::PlaybackError;
use crate::frame_queue::FrameQueue;
use crate::metrics::PlaybackMetrics;
use crate::player::PlayerEvent;
use crate::sync::SyncController;

/// Lifecycle state of a playback session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SessionState {
    /// No session allocated
    Idle = 0,
    /// `prepare()` is allocating resources
    Preparing = 1,
    /// Resources allocated, not started
    Prepared = 2,
    Playing = 3,
    Paused = 4,
    /// A seek is in flight
    Seeking = 5,
    /// Halted; `prepare()` may start a new session
    Stopped = 6,
    /// Terminal
    Released = 7,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Idle,
            1 => SessionState::Preparing,
            2 => SessionState::Prepared,
            3 => SessionState::Playing,
            4 => SessionState::Paused,
            5 => SessionState::Seeking,
            6 => SessionState::Stopped,
            _ => SessionState::Released,
        }
    }

    /// True while a session holds decode resources.
    pub fn has_session(self) -> bool {
        matches!(
            self,
            SessionState::Prepared
                | SessionState::Playing
                | SessionState::Paused
                | SessionState::Seeking
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Atomic state cell with compare-and-set transitions.
pub struct StateCell {
    state: AtomicU8,
    /// State to return to when the in-flight seek finishes
    seek_origin: AtomicU8,
}

impl StateCell {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(SessionState::Idle as u8),
            seek_origin: AtomicU8::new(SessionState::Paused as u8),
        }
    }

    /// Current state.
    pub fn load(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Moves to `to` if the current state is one of `from`.
    ///
    /// Returns the state that was left.
    pub fn transition(
        &self,
        operation: &'static str,
        from: &[SessionState],
        to: SessionState,
    ) -> Result<SessionState, PlaybackError> {
        let mut current = self.load();
        loop {
            if !from.contains(&current) {
                return Err(PlaybackError::InvalidTransition {
                    operation,
                    state: current,
                });
            }
            match self.state.compare_exchange(
                current as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if current != to {
                        tracing::debug!("{}: {} -> {}", operation, current, to);
                    }
                    return Ok(current);
                }
                Err(actual) => current = SessionState::from_u8(actual),
            }
        }
    }

    /// Moves from exactly `expected` to `to`. Returns false if the state
    /// changed underneath.
    pub fn compare_and_set(&self, expected: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(expected as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Enters Seeking from Playing or Paused, or stays in Seeking to
    /// supersede a pending seek.
    ///
    /// Returns the state the seek will return to and whether a pending seek
    /// was superseded.
    pub fn enter_seeking(
        &self,
        operation: &'static str,
    ) -> Result<(SessionState, bool), PlaybackError> {
        let left = self.transition(
            operation,
            &[SessionState::Playing, SessionState::Paused, SessionState::Seeking],
            SessionState::Seeking,
        )?;
        if left == SessionState::Seeking {
            Ok((self.seek_origin(), true))
        } else {
            self.seek_origin.store(left as u8, Ordering::Release);
            Ok((left, false))
        }
    }

    /// State the pending seek returns to.
    pub fn seek_origin(&self) -> SessionState {
        SessionState::from_u8(self.seek_origin.load(Ordering::Acquire))
    }

    /// Unconditionally moves to `to`, returning the previous state.
    pub fn force(&self, to: SessionState) -> SessionState {
        SessionState::from_u8(self.state.swap(to as u8, Ordering::AcqRel))
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Shared session context
// ============================================================================

/// State shared between the control surface, the decode threads and the
/// render loop.
pub(crate) struct SessionContext {
    pub(crate) state: StateCell,
    pub(crate) config: SyncConfig,
    pub(crate) metrics: PlaybackMetrics,
    pub(crate) clock: SharedClock,
    pub(crate) subtitles: SubtitleHandle,
    /// Last position observed by the render loop
    position_us: AtomicU64,
    /// Playback rate as f64 bits
    rate_bits: AtomicU64,
    last_error: Mutex<Option<PlaybackError>>,
    events: Sender<PlayerEvent>,
}

impl SessionContext {
    pub(crate) fn new(config: SyncConfig, events: Sender<PlayerEvent>) -> Self {
        Self {
            state: StateCell::new(),
            config,
            metrics: PlaybackMetrics::new(),
            clock: SharedClock::default(),
            subtitles: SubtitleHandle::new(),
            position_us: AtomicU64::new(0),
            rate_bits: AtomicU64::new(1.0f64.to_bits()),
            last_error: Mutex::new(None),
            events,
        }
    }

    pub(crate) fn publish_position(&self, position_micros: u64) {
        self.position_us.store(position_micros, Ordering::Release);
    }

    pub(crate) fn published_position(&self) -> u64 {
        self.position_us.load(Ordering::Acquire)
    }

    pub(crate) fn playback_rate(&self) -> f64 {
        f64::from_bits(self.rate_bits.load(Ordering::Acquire))
    }

    pub(crate) fn set_playback_rate(&self, rate: f64) {
        self.rate_bits.store(rate.to_bits(), Ordering::Release);
    }

    pub(crate) fn last_error(&self) -> Option<PlaybackError> {
        self.last_error.lock().clone()
    }

    pub(crate) fn clear_error(&self) {
        *self.last_error.lock() = None;
    }

    /// Freezes the clock where it is.
    pub(crate) fn freeze_clock(&self) -> u64 {
        let position = self.clock.position_micros();
        self.clock.swap(ClockSource::Standalone(StandaloneClock::frozen_at(position)));
        position
    }

    /// Sends an event; dropped if nobody drains the channel.
    pub(crate) fn emit(&self, event: PlayerEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                tracing::trace!("Event channel full, dropping {:?}", event);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Ends the current session after a fatal error.
    ///
    /// Moves to Stopped (unless already past it), freezes the clock and
    /// reports the error through `last_error()` and the event channel.
    pub(crate) fn fail(&self, error: PlaybackError) {
        *self.last_error.lock() = Some(error.clone());
        let stopped = self.state.transition(
            "decode",
            &[
                SessionState::Prepared,
                SessionState::Playing,
                SessionState::Paused,
                SessionState::Seeking,
            ],
            SessionState::Stopped,
        );
        if stopped.is_ok() {
            let position = self.freeze_clock();
            tracing::error!("Session stopped at {}us: {}", position, error);
            self.emit(PlayerEvent::StateChanged(SessionState::Stopped));
        }
        self.emit(PlayerEvent::Error(error));
    }
}

// ============================================================================
// Decoder session
// ============================================================================

/// Resources of one playback attempt, from `prepare()` to `stop()`.
pub(crate) struct DecoderSession {
    pub(crate) source: MediaSource,
    pub(crate) tracks: TrackSelection,
    pub(crate) duration_micros: Option<u64>,
    pub(crate) queue: Arc<FrameQueue>,
    decoders: Vec<DecodeThread>,
    sync: Option<SyncController>,
}

impl DecoderSession {
    /// Selects tracks and spawns paused decode threads plus the render loop.
    pub(crate) fn start(
        backend: &Arc<dyn MediaBackend>,
        source: MediaSource,
        sink: Arc<dyn RenderSink>,
        ctx: &Arc<SessionContext>,
        barrier: &Arc<SeekBarrier>,
    ) -> Result<Self, PlaybackError> {
        let tracks = backend.select_tracks(&source)?;
        if tracks.is_empty() {
            return Err(PlaybackError::ResourceUnavailable(format!(
                "no playable tracks in {}",
                source.uri
            )));
        }

        let queue = Arc::new(FrameQueue::with_metrics(
            ctx.config.queue_capacity,
            ctx.config.late_threshold,
            ctx.metrics.clone(),
        ));
        let mut session = Self {
            source,
            duration_micros: backend.duration_micros(),
            queue: Arc::clone(&queue),
            tracks: tracks.clone(),
            decoders: Vec::with_capacity(2),
            sync: None,
        };

        // On any error below, dropping `session` signals the spawned threads
        if let Some(video) = &tracks.video {
            session.decoders.push(DecodeThread::spawn_video(
                Arc::clone(backend),
                video.id,
                Arc::clone(&queue),
                Arc::clone(ctx),
                Arc::clone(barrier),
            )?);
        }
        if let Some(audio) = &tracks.audio {
            session.decoders.push(DecodeThread::spawn_audio(
                Arc::clone(backend),
                audio.id,
                Arc::clone(&sink),
                Arc::clone(ctx),
                Arc::clone(barrier),
            )?);
        }

        let ended = session.decoders.iter().map(DecodeThread::ended_flag).collect();
        session.sync = Some(SyncController::spawn(Arc::clone(ctx), queue, sink, ended)?);

        tracing::info!(
            "Session ready for {} (video: {}, audio: {}, duration: {:?})",
            session.source.uri,
            tracks.video.as_ref().map_or("none".to_string(), |t| t.display_name()),
            tracks.audio.as_ref().map_or("none".to_string(), |t| t.display_name()),
            session.duration_micros.map(Duration::from_micros)
        );
        Ok(session)
    }

    /// Number of threads that acknowledge a seek.
    pub(crate) fn seek_participants(&self) -> usize {
        self.decoders.len()
    }

    pub(crate) fn play(&self) {
        self.decoders.iter().for_each(DecodeThread::play);
    }

    pub(crate) fn pause(&self) {
        self.decoders.iter().for_each(DecodeThread::pause);
    }

    pub(crate) fn seek(&self, target_micros: u64, generation: u64) {
        for decoder in &self.decoders {
            decoder.seek(target_micros, generation);
        }
    }

    /// Stops every thread, waiting up to `timeout` for each, and drops
    /// buffered frames.
    ///
    /// Returns false if any thread was abandoned.
    pub(crate) fn shutdown(mut self, timeout: Duration) -> bool {
        // Signal everything first so the threads wind down in parallel
        for decoder in &self.decoders {
            decoder.stop();
        }
        if let Some(sync) = self.sync.as_mut() {
            sync.cancel();
        }

        let mut joined = true;
        for decoder in self.decoders.drain(..) {
            let kind = decoder.kind();
            if !decoder.shutdown(timeout) {
                tracing::warn!("Abandoned {:?} decode thread for {}", kind, self.source.uri);
                joined = false;
            }
        }
        if let Some(sync) = self.sync.take() {
            joined &= sync.shutdown(timeout);
        }
        self.queue.clear();
        joined
    }
}
