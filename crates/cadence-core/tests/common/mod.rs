//! Shared fixtures: a synthetic backend and a recording sink.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use cadence_core::{
    Cue, Frame, MediaBackend, MediaSource, PlaybackError, PlayerEvent, RenderSink, Sample,
    SeekMode, TrackId, TrackInfo, TrackSelection,
};
use crossbeam_channel::Receiver;
use parking_lot::Mutex;

pub const VIDEO: TrackId = TrackId(0);
pub const AUDIO: TrackId = TrackId(1);

/// Backend producing one sample per `frame_interval` up to `duration`.
pub struct MockBackend {
    video: bool,
    audio: bool,
    duration_us: u64,
    frame_interval_us: u64,
    positions: Mutex<HashMap<TrackId, u64>>,
    fail_reads: AtomicBool,
    seek_delay: Mutex<Duration>,
    hardware_clock: AtomicBool,
    output: Mutex<AudioOutput>,
    pub seeks: Mutex<Vec<(TrackId, u64)>>,
    pub paused: AtomicBool,
}

impl MockBackend {
    pub fn new(duration: Duration) -> Self {
        Self {
            video: true,
            audio: true,
            duration_us: duration.as_micros() as u64,
            frame_interval_us: 40_000,
            positions: Mutex::new(HashMap::new()),
            fail_reads: AtomicBool::new(false),
            seek_delay: Mutex::new(Duration::ZERO),
            hardware_clock: AtomicBool::new(false),
            output: Mutex::new(AudioOutput::default()),
            seeks: Mutex::new(Vec::new()),
            paused: AtomicBool::new(true),
        }
    }

    pub fn video_only(mut self) -> Self {
        self.audio = false;
        self
    }

    pub fn without_tracks(mut self) -> Self {
        self.video = false;
        self.audio = false;
        self
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_seek_delay(&self, delay: Duration) {
        *self.seek_delay.lock() = delay;
    }

    pub fn set_hardware_clock(&self, enabled: bool) {
        self.hardware_clock.store(enabled, Ordering::SeqCst);
    }
}

impl MediaBackend for MockBackend {
    fn select_tracks(&self, _source: &MediaSource) -> Result<TrackSelection, PlaybackError> {
        self.positions.lock().clear();
        Ok(TrackSelection {
            video: self.video.then(|| TrackInfo::video(VIDEO.0, "h264")),
            audio: self.audio.then(|| TrackInfo::audio(AUDIO.0, "aac", 2, 48_000)),
        })
    }

    fn read_sample(&self, track: TrackId) -> Result<Sample, PlaybackError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(PlaybackError::BackendFailure("injected read failure".into()));
        }
        let mut positions = self.positions.lock();
        let pos = positions.entry(track).or_insert(0);
        if *pos >= self.duration_us {
            return Ok(Sample::EndOfStream);
        }
        let pts = *pos;
        *pos += self.frame_interval_us;
        let (width, height) = if track == VIDEO { (4, 4) } else { (0, 0) };
        Ok(Sample::Data {
            pts_micros: pts,
            payload: Bytes::from_static(&[0u8; 16]),
            width,
            height,
        })
    }

    fn seek(&self, track: TrackId, target_micros: u64, _mode: SeekMode) -> Result<(), PlaybackError> {
        let delay = *self.seek_delay.lock();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        if track == AUDIO {
            self.output.lock().restart_at(target_micros);
        }
        self.positions.lock().insert(track, target_micros);
        self.seeks.lock().push((track, target_micros));
        Ok(())
    }

    fn hardware_clock_micros(&self) -> Option<u64> {
        if self.hardware_clock.load(Ordering::SeqCst) {
            Some(self.output.lock().position_micros())
        } else {
            None
        }
    }

    fn duration_micros(&self) -> Option<u64> {
        Some(self.duration_us)
    }

    fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
        self.output.lock().set_running(!paused);
    }
}

/// Emulated audio output: advances while running, jumps on audio seeks.
#[derive(Default)]
struct AudioOutput {
    base_us: u64,
    started_at: Option<Instant>,
}

impl AudioOutput {
    fn position_micros(&self) -> u64 {
        self.base_us + self.started_at.map_or(0, |t| t.elapsed().as_micros() as u64)
    }

    fn restart_at(&mut self, position_us: u64) {
        self.base_us = position_us;
        if self.started_at.is_some() {
            self.started_at = Some(Instant::now());
        }
    }

    fn set_running(&mut self, running: bool) {
        match (running, self.started_at) {
            (true, None) => self.started_at = Some(Instant::now()),
            (false, Some(_)) => {
                self.base_us = self.position_micros();
                self.started_at = None;
            }
            _ => {}
        }
    }
}

/// Sink remembering what it was asked to present.
#[derive(Default)]
pub struct RecordingSink {
    pub frames: Mutex<Vec<u64>>,
    pub cues: Mutex<Vec<Option<String>>>,
    pub audio_samples: AtomicUsize,
}

impl RenderSink for RecordingSink {
    fn render_frame(&self, frame: &Frame) {
        self.frames.lock().push(frame.pts_micros);
    }

    fn show_cue(&self, cue: Option<&Cue>) {
        self.cues.lock().push(cue.map(|c| c.text.clone()));
    }

    fn queue_audio(&self, _pts_micros: u64, _payload: &Bytes) {
        self.audio_samples.fetch_add(1, Ordering::SeqCst);
    }
}

/// Polls `condition` until it holds or `timeout` elapses.
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Everything currently buffered on the event channel.
pub fn drain_events(rx: &Receiver<PlayerEvent>) -> Vec<PlayerEvent> {
    rx.try_iter().collect()
}
