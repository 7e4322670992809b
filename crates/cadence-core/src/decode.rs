//! Decode threads.
//!
//! One thread per elementary stream pulls samples from the backend and hands
//! them on: video frames into the [`FrameQueue`], audio straight to the
//! render sink, paced against the clock. Threads start paused and are driven
//! by [`DecodeCommand`]s over a crossbeam channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::{Condvar, Mutex};

use crate::backend::{MediaBackend, RenderSink, Sample, SeekMode, TrackId, TrackKind};
use crate::clock::PlaybackClock;
use crate::error::PlaybackError;
use crate::frame_queue::{Frame, FrameQueue};
use crate::session::SessionContext;

/// Commands sent to a decode thread.
#[derive(Debug, Clone)]
pub(crate) enum DecodeCommand {
    /// Start or resume decoding
    Play,
    /// Pause decoding
    Pause,
    /// Reposition the track; acknowledged through the seek barrier
    Seek { target_micros: u64, generation: u64 },
    /// Exit the thread
    Stop,
}

// ============================================================================
// Seek barrier
// ============================================================================

struct SeekProgress {
    generation: u64,
    pending: usize,
    error: Option<PlaybackError>,
}

/// Outcome of waiting on a seek.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SeekWait {
    /// Every decode thread acknowledged
    Completed(Result<(), PlaybackError>),
    /// A newer seek (or a stop) replaced this one
    Superseded,
    /// Not every thread acknowledged before the deadline
    TimedOut,
}

/// Collects one acknowledgement per decode thread for the latest seek.
///
/// Acknowledgements for older generations are ignored, so a superseded seek
/// can never complete the newer one.
pub(crate) struct SeekBarrier {
    progress: Mutex<SeekProgress>,
    changed: Condvar,
}

impl SeekBarrier {
    pub(crate) fn new() -> Self {
        Self {
            progress: Mutex::new(SeekProgress {
                generation: 0,
                pending: 0,
                error: None,
            }),
            changed: Condvar::new(),
        }
    }

    /// Starts a seek that `participants` threads will acknowledge.
    ///
    /// Returns the new generation; any unfinished seek is superseded.
    pub(crate) fn begin(&self, participants: usize) -> u64 {
        let mut progress = self.progress.lock();
        progress.generation += 1;
        progress.pending = participants;
        progress.error = None;
        self.changed.notify_all();
        progress.generation
    }

    /// Generation of the latest seek.
    pub(crate) fn generation(&self) -> u64 {
        self.progress.lock().generation
    }

    /// Records one thread's result for `generation`.
    pub(crate) fn acknowledge(&self, generation: u64, result: Result<(), PlaybackError>) {
        let mut progress = self.progress.lock();
        if progress.generation != generation || progress.pending == 0 {
            return;
        }
        progress.pending -= 1;
        if let Err(e) = result {
            progress.error.get_or_insert(e);
        }
        if progress.pending == 0 {
            self.changed.notify_all();
        }
    }

    /// Abandons any in-flight seek; its waiter returns `Superseded`.
    pub(crate) fn cancel(&self) {
        let mut progress = self.progress.lock();
        progress.generation += 1;
        progress.pending = 0;
        progress.error = None;
        self.changed.notify_all();
    }

    /// Waits up to `timeout` for every acknowledgement of `generation`.
    pub(crate) fn wait(&self, generation: u64, timeout: Duration) -> SeekWait {
        let deadline = Instant::now() + timeout;
        let mut progress = self.progress.lock();
        loop {
            if progress.generation != generation {
                return SeekWait::Superseded;
            }
            if progress.pending == 0 {
                return SeekWait::Completed(progress.error.take().map_or(Ok(()), Err));
            }
            if self.changed.wait_until(&mut progress, deadline).timed_out() {
                if progress.generation != generation {
                    return SeekWait::Superseded;
                }
                if progress.pending == 0 {
                    return SeekWait::Completed(progress.error.take().map_or(Ok(()), Err));
                }
                return SeekWait::TimedOut;
            }
        }
    }
}

// ============================================================================
// Decode thread
// ============================================================================

/// Where decoded samples go.
enum Output {
    Video(Arc<FrameQueue>),
    Audio(Arc<dyn RenderSink>),
}

/// A decode thread for one track.
pub(crate) struct DecodeThread {
    kind: TrackKind,
    /// Handle to the decode thread
    handle: Option<JoinHandle<()>>,
    /// Channel to send commands to the decode thread
    command_tx: Sender<DecodeCommand>,
    /// Flag to signal the thread should stop
    stop_flag: Arc<AtomicBool>,
    /// Set when the track reached end of stream, cleared by seeks
    ended: Arc<AtomicBool>,
}

impl DecodeThread {
    /// Spawns a paused video decode thread filling `queue`.
    pub(crate) fn spawn_video(
        backend: Arc<dyn MediaBackend>,
        track: TrackId,
        queue: Arc<FrameQueue>,
        ctx: Arc<SessionContext>,
        barrier: Arc<SeekBarrier>,
    ) -> Result<Self, PlaybackError> {
        Self::spawn(TrackKind::Video, backend, track, Output::Video(queue), ctx, barrier)
    }

    /// Spawns a paused audio decode thread feeding `sink`.
    pub(crate) fn spawn_audio(
        backend: Arc<dyn MediaBackend>,
        track: TrackId,
        sink: Arc<dyn RenderSink>,
        ctx: Arc<SessionContext>,
        barrier: Arc<SeekBarrier>,
    ) -> Result<Self, PlaybackError> {
        Self::spawn(TrackKind::Audio, backend, track, Output::Audio(sink), ctx, barrier)
    }

    fn spawn(
        kind: TrackKind,
        backend: Arc<dyn MediaBackend>,
        track: TrackId,
        output: Output,
        ctx: Arc<SessionContext>,
        barrier: Arc<SeekBarrier>,
    ) -> Result<Self, PlaybackError> {
        let (command_tx, command_rx) = crossbeam_channel::unbounded();
        let stop_flag = Arc::new(AtomicBool::new(false));
        let ended = Arc::new(AtomicBool::new(false));

        let worker = DecodeWorker {
            kind,
            track,
            backend,
            output,
            ctx,
            barrier,
            command_rx,
            stop_flag: Arc::clone(&stop_flag),
            ended: Arc::clone(&ended),
            playing: false,
            pending_audio: None,
        };

        let name = match kind {
            TrackKind::Video => "cadence-video-decode",
            TrackKind::Audio => "cadence-audio-decode",
        };
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || worker.run())
            .map_err(|e| {
                PlaybackError::ResourceUnavailable(format!("failed to spawn {name}: {e}"))
            })?;
        tracing::debug!("Spawned {:?} decode thread for track {}", kind, track);

        Ok(Self {
            kind,
            handle: Some(handle),
            command_tx,
            stop_flag,
            ended,
        })
    }

    pub(crate) fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Starts or resumes decoding.
    pub(crate) fn play(&self) {
        let _ = self.command_tx.send(DecodeCommand::Play);
    }

    /// Pauses decoding.
    pub(crate) fn pause(&self) {
        let _ = self.command_tx.send(DecodeCommand::Pause);
    }

    /// Repositions the track; the thread acknowledges `generation` on the
    /// seek barrier.
    pub(crate) fn seek(&self, target_micros: u64, generation: u64) {
        let _ = self.command_tx.send(DecodeCommand::Seek {
            target_micros,
            generation,
        });
    }

    /// End-of-stream flag shared with the render loop.
    pub(crate) fn ended_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.ended)
    }

    /// Signals the thread to exit without waiting.
    pub(crate) fn stop(&self) {
        self.stop_flag.store(true, Ordering::Release);
        let _ = self.command_tx.send(DecodeCommand::Stop);
    }

    /// Stops the thread and waits up to `timeout` for it to exit.
    ///
    /// Returns false if the thread was abandoned.
    pub(crate) fn shutdown(mut self, timeout: Duration) -> bool {
        self.stop();
        match self.handle.take() {
            Some(handle) => join_with_timeout(handle, timeout, &format!("{:?} decode", self.kind)),
            None => true,
        }
    }
}

impl Drop for DecodeThread {
    fn drop(&mut self) {
        // Detaches; the thread exits on its next iteration
        self.stop();
    }
}

/// Joins `handle`, giving up after `timeout`.
///
/// An abandoned thread keeps running detached until it next checks its stop
/// signal.
pub(crate) fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration, what: &str) -> bool {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            tracing::warn!("{} thread did not exit within {:?}, abandoning it", what, timeout);
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
    if handle.join().is_err() {
        tracing::error!("{} thread panicked", what);
    }
    true
}

struct DecodeWorker {
    kind: TrackKind,
    track: TrackId,
    backend: Arc<dyn MediaBackend>,
    output: Output,
    ctx: Arc<SessionContext>,
    barrier: Arc<SeekBarrier>,
    command_rx: Receiver<DecodeCommand>,
    stop_flag: Arc<AtomicBool>,
    ended: Arc<AtomicBool>,
    playing: bool,
    /// Audio sample read but not yet due
    pending_audio: Option<(u64, Bytes)>,
}

impl DecodeWorker {
    fn run(mut self) {
        let idle_backoff = self.ctx.config.idle_backoff;

        loop {
            if self.stop_flag.load(Ordering::Acquire) {
                break;
            }

            let idle = !self.playing
                || self.ended.load(Ordering::Acquire)
                || !self.ctx.state.load().has_session();

            // Block briefly for commands when there is nothing to decode
            let command = if idle {
                match self.command_rx.recv_timeout(idle_backoff) {
                    Ok(cmd) => Some(cmd),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            } else {
                match self.command_rx.try_recv() {
                    Ok(cmd) => Some(cmd),
                    Err(TryRecvError::Empty) => None,
                    Err(TryRecvError::Disconnected) => break,
                }
            };

            if let Some(cmd) = command {
                if !self.process_command(cmd) {
                    break;
                }
                continue;
            }
            if idle {
                continue;
            }

            if let Err(e) = self.step(idle_backoff) {
                let error = match e {
                    PlaybackError::BackendFailure(_) => e,
                    other => PlaybackError::BackendFailure(other.to_string()),
                };
                tracing::error!("{:?} decode failed on track {}: {}", self.kind, self.track, error);
                self.ctx.fail(error);
                break;
            }
        }

        tracing::debug!("{:?} decode thread exiting", self.kind);
    }

    /// Returns false when the thread should exit.
    fn process_command(&mut self, cmd: DecodeCommand) -> bool {
        match cmd {
            DecodeCommand::Stop => return false,
            DecodeCommand::Play => self.playing = true,
            DecodeCommand::Pause => self.playing = false,
            DecodeCommand::Seek {
                target_micros,
                generation,
            } => {
                self.pending_audio = None;
                let result = self.backend.seek(self.track, target_micros, SeekMode::ClosestSync);
                match &result {
                    Ok(()) => {
                        // Drop anything decoded before the backend moved
                        if let Output::Video(queue) = &self.output {
                            queue.clear();
                        }
                        self.ended.store(false, Ordering::Release);
                        tracing::debug!(
                            "{:?} track {} seeked to {}us",
                            self.kind,
                            self.track,
                            target_micros
                        );
                    }
                    Err(e) => tracing::error!("Seek failed on track {}: {}", self.track, e),
                }
                self.barrier.acknowledge(generation, result);
            }
        }
        true
    }

    /// Decodes at most one sample.
    fn step(&mut self, idle_backoff: Duration) -> Result<(), PlaybackError> {
        match &self.output {
            Output::Video(queue) => {
                if queue.is_full() {
                    thread::sleep(idle_backoff);
                    return Ok(());
                }
                // Read before decoding so a concurrent flush invalidates the frame
                let generation = queue.generation();
                match self.backend.read_sample(self.track)? {
                    Sample::Data {
                        pts_micros,
                        payload,
                        width,
                        height,
                    } => {
                        queue.push_if_current(Frame::new(pts_micros, payload, width, height), generation);
                    }
                    Sample::EndOfStream => {
                        queue.set_eos();
                        self.mark_ended();
                    }
                }
            }
            Output::Audio(sink) => {
                if self.pending_audio.is_none() {
                    match self.backend.read_sample(self.track)? {
                        Sample::Data {
                            pts_micros, payload, ..
                        } => self.pending_audio = Some((pts_micros, payload)),
                        Sample::EndOfStream => {
                            self.mark_ended();
                            return Ok(());
                        }
                    }
                }

                let lead = self.ctx.config.audio_lead.as_micros() as u64;
                let horizon = self.ctx.clock.position_micros().saturating_add(lead);
                match self.pending_audio.take() {
                    Some((pts, payload)) if pts <= horizon => sink.queue_audio(pts, &payload),
                    Some(early) => {
                        self.pending_audio = Some(early);
                        thread::sleep(idle_backoff);
                    }
                    None => {}
                }
            }
        }
        Ok(())
    }

    fn mark_ended(&self) {
        if !self.ended.swap(true, Ordering::AcqRel) {
            tracing::info!("{:?} track {} reached end of stream", self.kind, self.track);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_barrier_completes_after_all_acks() {
        let barrier = Arc::new(SeekBarrier::new());
        let generation = barrier.begin(2);

        let acker = Arc::clone(&barrier);
        let t = thread::spawn(move || {
            acker.acknowledge(generation, Ok(()));
            thread::sleep(Duration::from_millis(10));
            acker.acknowledge(generation, Ok(()));
        });

        assert_eq!(
            barrier.wait(generation, Duration::from_secs(2)),
            SeekWait::Completed(Ok(()))
        );
        t.join().unwrap();
    }

    #[test]
    fn test_barrier_ignores_stale_acks() {
        let barrier = SeekBarrier::new();
        let first = barrier.begin(1);
        let second = barrier.begin(1);
        assert_eq!(barrier.generation(), second);

        barrier.acknowledge(first, Ok(()));
        assert_eq!(barrier.wait(first, Duration::from_millis(10)), SeekWait::Superseded);
        assert_eq!(barrier.wait(second, Duration::from_millis(20)), SeekWait::TimedOut);

        barrier.acknowledge(second, Err(PlaybackError::BackendFailure("io".into())));
        let SeekWait::Completed(Err(PlaybackError::BackendFailure(_))) =
            barrier.wait(second, Duration::from_millis(10))
        else {
            panic!("Expected the failed ack to surface");
        };
    }

    #[test]
    fn test_barrier_cancel() {
        let barrier = SeekBarrier::new();
        let generation = barrier.begin(1);
        barrier.cancel();
        assert_eq!(barrier.wait(generation, Duration::from_millis(50)), SeekWait::Superseded);
    }

    #[test]
    fn test_join_with_timeout_abandons() {
        let handle = thread::spawn(|| thread::sleep(Duration::from_millis(300)));
        assert!(!join_with_timeout(handle, Duration::from_millis(20), "slow"));

        let handle = thread::spawn(|| {});
        assert!(join_with_timeout(handle, Duration::from_secs(1), "fast"));
    }
}
