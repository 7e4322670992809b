//! Sync controller: the render loop.
//!
//! Every tick reads the clock once and presents whatever is due at that
//! position: the next frame from the [`FrameQueue`] and the current cue.
//! The loop runs on its own thread, driven by a crossbeam ticker, until its
//! cancel channel fires or is dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{select, Receiver, Sender};

use crate::backend::RenderSink;
use crate::clock::{ClockSource, PlaybackClock, StandaloneClock};
use crate::cue_tracker::CueTracker;
use crate::decode::join_with_timeout;
use crate::error::PlaybackError;
use crate::frame_queue::FrameQueue;
use crate::player::PlayerEvent;
use crate::session::{SessionContext, SessionState};
use crate::subtitles::Cue;

/// Handle to a running render loop.
pub(crate) struct SyncController {
    handle: Option<JoinHandle<()>>,
    /// Dropping the sender cancels the loop
    cancel_tx: Option<Sender<()>>,
}

impl SyncController {
    /// Spawns the render loop.
    ///
    /// `ended` holds one end-of-stream flag per decode thread.
    pub(crate) fn spawn(
        ctx: Arc<SessionContext>,
        queue: Arc<FrameQueue>,
        sink: Arc<dyn RenderSink>,
        ended: Vec<Arc<AtomicBool>>,
    ) -> Result<Self, PlaybackError> {
        let (cancel_tx, cancel_rx) = crossbeam_channel::bounded(1);
        let interval = ctx.config.tick_interval;
        let render_loop = RenderLoop::new(ctx, queue, sink, ended);

        let handle = thread::Builder::new()
            .name("cadence-sync".to_string())
            .spawn(move || render_loop.run(interval, cancel_rx))
            .map_err(|e| {
                PlaybackError::ResourceUnavailable(format!("failed to spawn sync thread: {e}"))
            })?;

        Ok(Self {
            handle: Some(handle),
            cancel_tx: Some(cancel_tx),
        })
    }

    /// Cancels the loop without waiting.
    pub(crate) fn cancel(&mut self) {
        if let Some(tx) = self.cancel_tx.take() {
            let _ = tx.try_send(());
        }
    }

    /// Cancels the loop and waits up to `timeout` for it to exit.
    pub(crate) fn shutdown(mut self, timeout: Duration) -> bool {
        self.cancel();
        match self.handle.take() {
            Some(handle) => join_with_timeout(handle, timeout, "sync"),
            None => true,
        }
    }
}

impl Drop for SyncController {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// State owned by the render thread.
pub(crate) struct RenderLoop {
    ctx: Arc<SessionContext>,
    queue: Arc<FrameQueue>,
    sink: Arc<dyn RenderSink>,
    ended: Vec<Arc<AtomicBool>>,
    tracker: CueTracker,
    /// Last cue handed to the sink
    shown_cue: Option<Cue>,
    last_position: Option<u64>,
    eos_reported: bool,
}

impl RenderLoop {
    pub(crate) fn new(
        ctx: Arc<SessionContext>,
        queue: Arc<FrameQueue>,
        sink: Arc<dyn RenderSink>,
        ended: Vec<Arc<AtomicBool>>,
    ) -> Self {
        let tracker = ctx.subtitles.tracker();
        Self {
            ctx,
            queue,
            sink,
            ended,
            tracker,
            shown_cue: None,
            last_position: None,
            eos_reported: false,
        }
    }

    fn run(mut self, interval: Duration, cancel_rx: Receiver<()>) {
        tracing::debug!("Render loop started ({:?} ticks)", interval);
        let ticker = crossbeam_channel::tick(interval);
        loop {
            select! {
                recv(ticker) -> _ => self.tick(),
                recv(cancel_rx) -> _ => break,
            }
        }
        tracing::debug!("Render loop exiting");
    }

    /// One render decision.
    pub(crate) fn tick(&mut self) {
        match self.ctx.state.load() {
            SessionState::Seeking => return,
            state if !state.has_session() => return,
            _ => {}
        }

        self.check_clock_health();

        let position = self.ctx.clock.position_micros();
        self.detect_discontinuity(position);
        self.ctx.publish_position(position);

        if let Some(frame) = self.queue.pop_for_render(position) {
            tracing::trace!("Rendering frame at {}us (clock {}us)", frame.pts_micros, position);
            self.sink.render_frame(&frame);
            self.ctx.metrics.record_render();
        }

        let cue = self.ctx.subtitles.track(&mut self.tracker, position);
        if cue != self.shown_cue.as_ref() {
            self.sink.show_cue(cue);
            self.shown_cue = cue.cloned();
        }

        self.check_end_of_stream();
    }

    /// Replaces a hardware clock that stopped reporting with a standalone
    /// clock at the last good position.
    fn check_clock_health(&mut self) {
        let clock = self.ctx.clock.current();
        let position = match &*clock {
            ClockSource::Hardware(hardware) if !hardware.is_healthy() => {
                hardware.last_position_micros()
            }
            _ => return,
        };
        let replacement = if self.ctx.state.load() == SessionState::Playing {
            StandaloneClock::running_from(position, self.ctx.playback_rate())
        } else {
            StandaloneClock::frozen_at(position)
        };
        tracing::warn!("Audio clock unhealthy at {}us, falling back to standalone clock", position);
        self.ctx.clock.swap(ClockSource::Standalone(replacement));
        self.ctx.metrics.record_clock_fallback();
    }

    /// A backwards step or a forward jump past the threshold restarts the
    /// cue cursor.
    fn detect_discontinuity(&mut self, position: u64) {
        let jump_threshold = self.ctx.config.jump_threshold.as_micros() as u64;
        if let Some(last) = self.last_position {
            if position < last || position - last > jump_threshold {
                tracing::debug!("Clock discontinuity {}us -> {}us", last, position);
                self.tracker.reset_cursor();
                self.ctx.metrics.record_discontinuity();
            }
        }
        self.last_position = Some(position);
    }

    fn check_end_of_stream(&mut self) {
        let all_ended = !self.ended.is_empty() && self.ended.iter().all(|f| f.load(Ordering::Acquire));
        if !all_ended {
            self.eos_reported = false;
            return;
        }
        if !self.eos_reported && self.queue.is_empty() {
            self.eos_reported = true;
            tracing::info!("Playback reached end of stream");
            self.ctx.emit(PlayerEvent::EndOfStream);
        }
    }
}
