//! Playback clocks.
//!
//! A [`PlaybackClock`] reports the authoritative playback position in
//! microseconds. Two variants exist:
//!
//! - [`HardwareClock`]: follows the audio output's hardware timestamp. Video
//!   slaves to it whenever audio is playing.
//! - [`StandaloneClock`]: free-running monotonic clock for sessions without a
//!   (healthy) audio track.
//!
//! The active clock lives behind a [`SharedClock`], which swaps whole clocks
//! by reference. Readers clone the current `Arc` under a read lock and never
//! observe a half-built clock.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};

/// Consecutive failed hardware queries before the hardware clock reports
/// itself unhealthy.
const HARDWARE_MISS_LIMIT: u32 = 5;

/// Source of playback time.
pub trait PlaybackClock: Send + Sync {
    /// Current playback position in microseconds.
    fn position_micros(&self) -> u64;
}

/// Which clock variant is driving playback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockKind {
    /// Audio hardware timestamp
    Hardware,
    /// Monotonic system clock
    Standalone,
}

// ============================================================================
// Standalone clock
// ============================================================================

struct StandaloneState {
    /// Position at the last start/stop/reset
    base_us: u64,
    /// Set while running
    started_at: Option<Instant>,
    /// Playback rate applied to elapsed wall time
    rate: f64,
}

/// Free-running clock: `base + elapsed * rate` while running, frozen at
/// `base` while stopped.
pub struct StandaloneClock {
    state: Mutex<StandaloneState>,
}

impl StandaloneClock {
    /// Creates a stopped clock at zero.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StandaloneState {
                base_us: 0,
                started_at: None,
                rate: 1.0,
            }),
        }
    }

    /// Creates a stopped clock frozen at `base_us`.
    pub fn frozen_at(base_us: u64) -> Self {
        let clock = Self::new();
        clock.state.lock().base_us = base_us;
        clock
    }

    /// Creates a clock already running from `base_us` at the given rate.
    pub fn running_from(base_us: u64, rate: f64) -> Self {
        let clock = Self::new();
        clock.set_rate(rate);
        clock.start(base_us);
        clock
    }

    /// Starts (or restarts) the clock from `base_us`.
    pub fn start(&self, base_us: u64) {
        let mut state = self.state.lock();
        state.base_us = base_us;
        state.started_at = Some(Instant::now());
    }

    /// Stops the clock. Elapsed time is folded into the base, so the position
    /// stays where it was.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        if let Some(started) = state.started_at.take() {
            state.base_us = state.base_us.saturating_add(scaled_elapsed(started, state.rate));
        }
    }

    /// Stops the clock and rewinds it to zero.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.base_us = 0;
        state.started_at = None;
    }

    /// Returns true while the clock is advancing.
    pub fn is_running(&self) -> bool {
        self.state.lock().started_at.is_some()
    }

    /// Changes the playback rate without a position jump.
    pub fn set_rate(&self, rate: f64) {
        let rate = if rate.is_finite() && rate > 0.0 { rate } else { 1.0 };
        let mut state = self.state.lock();
        if let Some(started) = state.started_at {
            state.base_us = state.base_us.saturating_add(scaled_elapsed(started, state.rate));
            state.started_at = Some(Instant::now());
        }
        state.rate = rate;
    }

    /// Current playback rate.
    pub fn rate(&self) -> f64 {
        self.state.lock().rate
    }
}

impl Default for StandaloneClock {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackClock for StandaloneClock {
    fn position_micros(&self) -> u64 {
        let state = self.state.lock();
        match state.started_at {
            Some(started) => state.base_us.saturating_add(scaled_elapsed(started, state.rate)),
            None => state.base_us,
        }
    }
}

fn scaled_elapsed(started: Instant, rate: f64) -> u64 {
    let elapsed = started.elapsed().as_micros() as u64;
    if rate == 1.0 {
        elapsed
    } else {
        (elapsed as f64 * rate) as u64
    }
}

// ============================================================================
// Hardware clock
// ============================================================================

type HardwareQuery = Box<dyn Fn() -> Option<u64> + Send + Sync>;

/// Clock driven by the audio output's hardware timestamp.
///
/// Never reports less than it reported before: a hardware value below the
/// last one is clamped. When the query returns `None` the last good value is
/// reported, and after a few consecutive misses the clock marks itself
/// unhealthy so the sync controller can fall back to a standalone clock.
pub struct HardwareClock {
    query: HardwareQuery,
    last_us: AtomicU64,
    misses: AtomicU32,
    healthy: AtomicBool,
}

impl HardwareClock {
    /// Creates a hardware clock that never reports less than `floor_us`.
    pub fn new(floor_us: u64, query: impl Fn() -> Option<u64> + Send + Sync + 'static) -> Self {
        Self {
            query: Box::new(query),
            last_us: AtomicU64::new(floor_us),
            misses: AtomicU32::new(0),
            healthy: AtomicBool::new(true),
        }
    }

    /// Returns false once the hardware stopped reporting timestamps.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Last position this clock reported.
    pub fn last_position_micros(&self) -> u64 {
        self.last_us.load(Ordering::Acquire)
    }
}

impl PlaybackClock for HardwareClock {
    fn position_micros(&self) -> u64 {
        match (self.query)() {
            Some(hw_us) => {
                self.misses.store(0, Ordering::Relaxed);
                self.healthy.store(true, Ordering::Release);
                let previous = self.last_us.fetch_max(hw_us, Ordering::AcqRel);
                previous.max(hw_us)
            }
            None => {
                let misses = self.misses.fetch_add(1, Ordering::Relaxed) + 1;
                if misses >= HARDWARE_MISS_LIMIT && self.healthy.swap(false, Ordering::AcqRel) {
                    tracing::warn!("Hardware clock stopped reporting after {} queries", misses);
                }
                self.last_us.load(Ordering::Acquire)
            }
        }
    }
}

// ============================================================================
// Clock source and shared handle
// ============================================================================

/// One of the two clock variants.
pub enum ClockSource {
    /// Audio hardware driven
    Hardware(HardwareClock),
    /// Free-running
    Standalone(StandaloneClock),
}

impl ClockSource {
    /// Which variant this is.
    pub fn kind(&self) -> ClockKind {
        match self {
            ClockSource::Hardware(_) => ClockKind::Hardware,
            ClockSource::Standalone(_) => ClockKind::Standalone,
        }
    }

    /// Standalone clocks are always healthy.
    pub fn is_healthy(&self) -> bool {
        match self {
            ClockSource::Hardware(clock) => clock.is_healthy(),
            ClockSource::Standalone(_) => true,
        }
    }
}

impl PlaybackClock for ClockSource {
    fn position_micros(&self) -> u64 {
        match self {
            ClockSource::Hardware(clock) => clock.position_micros(),
            ClockSource::Standalone(clock) => clock.position_micros(),
        }
    }
}

/// Shared, swappable clock handle.
///
/// Cloning the handle shares the slot; [`SharedClock::swap`] replaces the
/// clock for every holder at once.
#[derive(Clone)]
pub struct SharedClock {
    current: Arc<RwLock<Arc<ClockSource>>>,
}

impl SharedClock {
    /// Creates a handle holding `source`.
    pub fn new(source: ClockSource) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(source))),
        }
    }

    /// Returns the active clock.
    pub fn current(&self) -> Arc<ClockSource> {
        Arc::clone(&*self.current.read())
    }

    /// Installs a new clock, returning the one it replaced.
    pub fn swap(&self, source: ClockSource) -> Arc<ClockSource> {
        let next = Arc::new(source);
        tracing::debug!("Clock swap -> {:?}", next.kind());
        std::mem::replace(&mut *self.current.write(), next)
    }

    /// Kind of the active clock.
    pub fn kind(&self) -> ClockKind {
        self.current().kind()
    }
}

impl Default for SharedClock {
    fn default() -> Self {
        Self::new(ClockSource::Standalone(StandaloneClock::new()))
    }
}

impl PlaybackClock for SharedClock {
    fn position_micros(&self) -> u64 {
        self.current().position_micros()
    }
}
