//! Frame queue for video playback.
//!
//! A bounded buffer of decoded frames between the video decode thread
//! (producer) and the render loop (consumer). Neither side ever blocks:
//!
//! - [`FrameQueue::push`] evicts the oldest frame when full, so memory stays
//!   bounded at `capacity` frames and the freshest content wins.
//! - [`FrameQueue::pop_for_render`] drops frames that are more than the late
//!   threshold behind the clock, returns the first frame that is due, and
//!   leaves future frames queued.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::config::{DEFAULT_LATE_THRESHOLD, DEFAULT_QUEUE_CAPACITY};
use crate::metrics::PlaybackMetrics;

/// A decoded video frame. Immutable after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Presentation timestamp in microseconds from stream start
    pub pts_micros: u64,
    /// Opaque decoded picture data
    pub payload: Bytes,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

impl Frame {
    /// Creates a new frame.
    pub fn new(pts_micros: u64, payload: Bytes, width: u32, height: u32) -> Self {
        Self {
            pts_micros,
            payload,
            width,
            height,
        }
    }

    /// Returns (width, height).
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Presentation timestamp as a `Duration`.
    pub fn pts(&self) -> Duration {
        Duration::from_micros(self.pts_micros)
    }
}

/// A thread-safe, bounded, non-blocking queue of decoded frames.
pub struct FrameQueue {
    /// Frames in decode order (oldest at the front)
    frames: Mutex<VecDeque<Frame>>,
    /// Maximum number of frames held
    capacity: usize,
    /// Staleness after which a frame is dropped instead of rendered
    late_threshold_us: u64,
    /// Bumped on every clear; frames decoded for an older generation are stale
    generation: AtomicU64,
    /// End of stream reached by the producer
    eos: AtomicBool,
    /// Eviction and late-drop counters
    metrics: PlaybackMetrics,
}

impl FrameQueue {
    /// Creates a queue with the given capacity and late threshold.
    pub fn new(capacity: usize, late_threshold: Duration) -> Self {
        Self::with_metrics(capacity, late_threshold, PlaybackMetrics::new())
    }

    /// Creates a queue that records into shared metrics.
    pub fn with_metrics(capacity: usize, late_threshold: Duration, metrics: PlaybackMetrics) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            late_threshold_us: late_threshold.as_micros() as u64,
            generation: AtomicU64::new(0),
            eos: AtomicBool::new(false),
            metrics,
        }
    }

    /// Creates a queue with capacity 10 and a 40ms late threshold.
    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY, DEFAULT_LATE_THRESHOLD)
    }

    /// Pushes a frame, evicting the oldest one if the queue is full.
    ///
    /// Never blocks.
    pub fn push(&self, frame: Frame) {
        let mut frames = self.frames.lock();
        self.push_locked(&mut frames, frame);
    }

    /// Pushes a frame only if no clear happened since `generation` was read.
    ///
    /// The decode thread reads [`FrameQueue::generation`] before decoding and
    /// passes it here, so a frame decoded before a seek flush never lands in
    /// the queue after it. Returns false if the frame was discarded.
    pub fn push_if_current(&self, frame: Frame, generation: u64) -> bool {
        let mut frames = self.frames.lock();
        if self.generation.load(Ordering::Acquire) != generation {
            tracing::trace!("Discarding stale frame at {}us (pre-flush)", frame.pts_micros);
            return false;
        }
        self.push_locked(&mut frames, frame);
        true
    }

    fn push_locked(&self, frames: &mut VecDeque<Frame>, frame: Frame) {
        if frames.len() >= self.capacity {
            if let Some(evicted) = frames.pop_front() {
                self.metrics.record_eviction();
                tracing::trace!(
                    "FrameQueue full, evicted frame at {}us for {}us",
                    evicted.pts_micros,
                    frame.pts_micros
                );
            }
        }
        frames.push_back(frame);
        self.metrics.record_push();
    }

    /// Returns the next frame that is due at `clock_us`, if any.
    ///
    /// Frames more than the late threshold behind the clock are dropped in
    /// the same call. A frame ahead of the clock stays queued and `None` is
    /// returned. Never blocks.
    pub fn pop_for_render(&self, clock_us: u64) -> Option<Frame> {
        let late_before = clock_us.saturating_sub(self.late_threshold_us);
        let mut frames = self.frames.lock();

        while let Some(front) = frames.front() {
            if front.pts_micros < late_before {
                let pts = front.pts_micros;
                frames.pop_front();
                self.metrics.record_late_drop();
                tracing::trace!(
                    "Dropped late frame at {}us (clock {}us, {}us behind)",
                    pts,
                    clock_us,
                    clock_us - pts
                );
                continue;
            }
            if front.pts_micros <= clock_us {
                return frames.pop_front();
            }
            return None;
        }
        None
    }

    /// Presentation timestamp of the oldest queued frame.
    pub fn peek_pts(&self) -> Option<u64> {
        self.frames.lock().front().map(|f| f.pts_micros)
    }

    /// Number of queued frames.
    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    /// Returns true if no frames are queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if the next push will evict.
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Maximum number of queued frames.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The late-drop threshold.
    pub fn late_threshold(&self) -> Duration {
        Duration::from_micros(self.late_threshold_us)
    }

    /// Current flush generation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Drops every queued frame (seek/stop) and resets end-of-stream.
    ///
    /// Returns the number of frames dropped.
    pub fn clear(&self) -> usize {
        let dropped = {
            let mut frames = self.frames.lock();
            let count = frames.len();
            frames.clear();
            self.generation.fetch_add(1, Ordering::AcqRel);
            count
        };
        self.eos.store(false, Ordering::Release);
        tracing::debug!("FrameQueue::clear: dropped {} frames", dropped);
        dropped
    }

    /// Marks that the producer reached end of stream.
    pub fn set_eos(&self) {
        self.eos.store(true, Ordering::Release);
    }

    /// Returns true if the producer reached end of stream.
    pub fn is_eos(&self) -> bool {
        self.eos.load(Ordering::Acquire)
    }

    /// Returns the metrics this queue records into.
    pub fn metrics(&self) -> &PlaybackMetrics {
        &self.metrics
    }
}

impl Default for FrameQueue {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn make_test_frame(pts_micros: u64) -> Frame {
        Frame::new(pts_micros, Bytes::from_static(&[16; 8]), 4, 2)
    }

    fn ms(v: u64) -> u64 {
        v * 1_000
    }

    #[test]
    fn test_push_evicts_oldest() {
        let queue = FrameQueue::new(3, DEFAULT_LATE_THRESHOLD);
        for pts in [0, 33, 66, 99] {
            queue.push(make_test_frame(ms(pts)));
        }

        assert_eq!(queue.len(), 3);
        assert!(queue.is_full());
        assert_eq!(queue.peek_pts(), Some(ms(33)));
        assert_eq!(queue.metrics().snapshot().frames_evicted, 1);
        assert_eq!(queue.metrics().dropped_frames(), 1);
    }

    #[test]
    fn test_pop_drops_late_frames_in_one_call() {
        let queue = FrameQueue::new(3, Duration::from_millis(40));
        for pts in [100, 140, 180, 220] {
            queue.push(make_test_frame(ms(pts)));
        }

        let Some(frame) = queue.pop_for_render(ms(260)) else {
            panic!("Expected a frame due at 260ms");
        };
        assert_eq!(frame.pts_micros, ms(180));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.peek_pts(), Some(ms(220)));

        let snap = queue.metrics().snapshot();
        // 100 evicted on overflow, 140 dropped late
        assert_eq!(snap.frames_evicted, 1);
        assert_eq!(snap.frames_late, 1);
    }

    #[test]
    fn test_pop_drops_both_stale_frames_when_queue_holds_all() {
        let queue = FrameQueue::new(4, Duration::from_millis(40));
        for pts in [100, 140, 180, 220] {
            queue.push(make_test_frame(ms(pts)));
        }

        let Some(frame) = queue.pop_for_render(ms(260)) else {
            panic!("Expected a frame due at 260ms");
        };
        assert_eq!(frame.pts_micros, ms(180));
        assert_eq!(queue.metrics().snapshot().frames_late, 2);
        assert_eq!(queue.peek_pts(), Some(ms(220)));
    }

    #[test]
    fn test_pop_future_frame_stays_queued() {
        let queue = FrameQueue::with_default_capacity();
        queue.push(make_test_frame(ms(500)));

        assert!(queue.pop_for_render(ms(400)).is_none());
        assert_eq!(queue.len(), 1);

        let Some(frame) = queue.pop_for_render(ms(500)) else {
            panic!("Frame at exactly the clock should render");
        };
        assert_eq!(frame.pts_micros, ms(500));
    }

    #[test]
    fn test_frame_within_threshold_renders() {
        let queue = FrameQueue::new(4, Duration::from_millis(40));
        queue.push(make_test_frame(ms(100)));

        // Exactly threshold-stale is still rendered
        let Some(frame) = queue.pop_for_render(ms(140)) else {
            panic!("Frame 40ms stale should still render");
        };
        assert_eq!(frame.pts_micros, ms(100));
    }

    #[test]
    fn test_clear_bumps_generation() {
        let queue = FrameQueue::with_default_capacity();
        queue.push(make_test_frame(0));
        queue.set_eos();
        let generation = queue.generation();

        assert_eq!(queue.clear(), 1);
        assert!(queue.is_empty());
        assert!(!queue.is_eos());
        assert!(!queue.push_if_current(make_test_frame(ms(10)), generation));
        assert!(queue.push_if_current(make_test_frame(ms(10)), queue.generation()));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_random_pushes_respect_capacity_and_keep_newest() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..50 {
            let capacity = rng.gen_range(1..12);
            let queue = FrameQueue::new(capacity, DEFAULT_LATE_THRESHOLD);
            let mut pts = 0u64;
            for _ in 0..rng.gen_range(1..60) {
                pts += rng.gen_range(1..50_000);
                queue.push(make_test_frame(pts));
                assert!(queue.len() <= capacity);

                // The newest frame is always still queued
                let newest = queue.frames.lock().back().map(|f| f.pts_micros);
                assert_eq!(newest, Some(pts));
            }
        }
    }

    #[test]
    fn test_random_pops_never_return_future_or_dropped_frames() {
        let mut rng = StdRng::seed_from_u64(42);
        let queue = FrameQueue::new(6, Duration::from_millis(40));
        let mut dropped_or_rendered = std::collections::HashSet::new();
        let mut clock = 0u64;
        let mut pts = 0u64;

        for _ in 0..2_000 {
            if rng.gen_bool(0.6) {
                pts += rng.gen_range(10_000..45_000);
                queue.push(make_test_frame(pts));
            }
            clock += rng.gen_range(0..60_000);

            let before: Vec<u64> = queue.frames.lock().iter().map(|f| f.pts_micros).collect();
            let popped = queue.pop_for_render(clock);
            let after: Vec<u64> = queue.frames.lock().iter().map(|f| f.pts_micros).collect();

            if let Some(frame) = popped {
                assert!(frame.pts_micros <= clock, "popped a future frame");
                assert!(
                    !dropped_or_rendered.contains(&frame.pts_micros),
                    "popped a frame that was already dropped"
                );
                dropped_or_rendered.insert(frame.pts_micros);
            }
            for gone in before.iter().filter(|p| !after.contains(p)) {
                dropped_or_rendered.insert(*gone);
            }
        }
    }
}
