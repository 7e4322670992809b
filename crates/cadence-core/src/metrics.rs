//! Playback counters.
//!
//! Lock-free counters shared between the decode threads, the render loop and
//! the control surface. Take a [`PlaybackMetrics::snapshot`] for a consistent
//! view suitable for display or assertions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Shared playback counters. Cloning shares the same counters.
#[derive(Clone, Default)]
pub struct PlaybackMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Default)]
struct MetricsInner {
    /// Frames accepted by the frame queue
    frames_pushed: AtomicU64,
    /// Frames evicted because the queue was full
    frames_evicted: AtomicU64,
    /// Frames dropped for being later than the late threshold
    frames_late: AtomicU64,
    /// Frames handed to the render sink
    frames_rendered: AtomicU64,
    /// Seek requests received (preview excluded)
    seeks_requested: AtomicU64,
    /// Seeks acknowledged by every decode thread
    seeks_completed: AtomicU64,
    /// Seeks replaced by a newer request before completing
    seeks_superseded: AtomicU64,
    /// Seeks that gave up waiting for the backend
    seeks_timed_out: AtomicU64,
    /// Hardware clock replaced by a standalone clock
    clock_fallbacks: AtomicU64,
    /// Clock jumps handled as a fresh start by the render loop
    discontinuities: AtomicU64,
}

impl PlaybackMetrics {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_push(&self) {
        self.inner.frames_pushed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_eviction(&self) {
        self.inner.frames_evicted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_late_drop(&self) {
        self.inner.frames_late.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_render(&self) {
        self.inner.frames_rendered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_seek_requested(&self) {
        self.inner.seeks_requested.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_seek_completed(&self) {
        self.inner.seeks_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_seek_superseded(&self) {
        self.inner.seeks_superseded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_seek_timeout(&self) {
        self.inner.seeks_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_clock_fallback(&self) {
        self.inner.clock_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_discontinuity(&self) {
        self.inner.discontinuities.fetch_add(1, Ordering::Relaxed);
    }

    /// Frames dropped for any reason (evicted or late).
    pub fn dropped_frames(&self) -> u64 {
        self.inner.frames_evicted.load(Ordering::Relaxed)
            + self.inner.frames_late.load(Ordering::Relaxed)
    }

    /// Returns a point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let i = &self.inner;
        MetricsSnapshot {
            frames_pushed: i.frames_pushed.load(Ordering::Relaxed),
            frames_evicted: i.frames_evicted.load(Ordering::Relaxed),
            frames_late: i.frames_late.load(Ordering::Relaxed),
            frames_rendered: i.frames_rendered.load(Ordering::Relaxed),
            seeks_requested: i.seeks_requested.load(Ordering::Relaxed),
            seeks_completed: i.seeks_completed.load(Ordering::Relaxed),
            seeks_superseded: i.seeks_superseded.load(Ordering::Relaxed),
            seeks_timed_out: i.seeks_timed_out.load(Ordering::Relaxed),
            clock_fallbacks: i.clock_fallbacks.load(Ordering::Relaxed),
            discontinuities: i.discontinuities.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`PlaybackMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub frames_pushed: u64,
    pub frames_evicted: u64,
    pub frames_late: u64,
    pub frames_rendered: u64,
    pub seeks_requested: u64,
    pub seeks_completed: u64,
    pub seeks_superseded: u64,
    pub seeks_timed_out: u64,
    pub clock_fallbacks: u64,
    pub discontinuities: u64,
}

impl MetricsSnapshot {
    /// Frames dropped for any reason.
    pub fn dropped_frames(&self) -> u64 {
        self.frames_evicted + self.frames_late
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "rendered={} pushed={} evicted={} late={} seeks={}/{} (superseded={}, timed_out={}) clock_fallbacks={} jumps={}",
            self.frames_rendered,
            self.frames_pushed,
            self.frames_evicted,
            self.frames_late,
            self.seeks_completed,
            self.seeks_requested,
            self.seeks_superseded,
            self.seeks_timed_out,
            self.clock_fallbacks,
            self.discontinuities
        )
    }
}
