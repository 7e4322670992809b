//! Current-cue tracking for a moving playback position.
//!
//! The render loop owns a [`CueTracker`], which walks a cursor over the
//! sorted cues of a [`CueTimeline`]. Consecutive positions from normal
//! playback move the cursor by at most one cue, so lookups are amortized
//! O(1); a seek costs O(distance).
//!
//! The control thread talks to a [`SubtitleHandle`] instead. Loading a
//! track builds a new timeline off-thread and swaps it in by reference; the
//! tracker notices the new `Arc` on its next refresh and restarts its cursor.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use poll_promise::Promise;

use crate::subtitles::{Cue, SubtitleError, SubtitleTrack};

/// An immutable cue sequence sorted by start time.
#[derive(Debug, Default)]
pub struct CueTimeline {
    cues: Vec<Cue>,
    track_id: Option<String>,
}

impl CueTimeline {
    /// Builds a timeline from a parsed track.
    pub fn new(track_id: Option<String>, track: SubtitleTrack) -> Self {
        let mut cues = track.cues;
        cues.sort_by_key(|c| c.start_micros);
        Self { cues, track_id }
    }

    /// A timeline with no cues.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn cues(&self) -> &[Cue] {
        &self.cues
    }

    /// Id of the track this timeline was loaded from.
    pub fn track_id(&self) -> Option<&str> {
        self.track_id.as_deref()
    }

    pub fn len(&self) -> usize {
        self.cues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cues.is_empty()
    }

    /// Stateless lookup by binary search.
    ///
    /// Returns the cue that started last at or before `position_micros` if
    /// its interval still covers the position.
    pub fn lookup(&self, position_micros: u64) -> Option<&Cue> {
        let idx = self.cues.partition_point(|c| c.start_micros <= position_micros);
        let cue = self.cues.get(idx.checked_sub(1)?)?;
        cue.contains(position_micros).then_some(cue)
    }
}

/// Cursor-based current-cue lookup, owned by one thread.
pub struct CueTracker {
    timeline: Arc<CueTimeline>,
    cursor: usize,
}

impl CueTracker {
    pub fn new(timeline: Arc<CueTimeline>) -> Self {
        Self {
            timeline,
            cursor: 0,
        }
    }

    /// Returns the cue covering `position_micros`, if any.
    pub fn current(&mut self, position_micros: u64) -> Option<&Cue> {
        let cues = self.timeline.cues();
        if cues.is_empty() {
            return None;
        }
        let last = cues.len() - 1;
        self.cursor = self.cursor.min(last);

        while self.cursor > 0 && position_micros < cues[self.cursor].start_micros {
            self.cursor -= 1;
        }
        while self.cursor < last && position_micros > cues[self.cursor].end_micros {
            self.cursor += 1;
        }

        let cue = &cues[self.cursor];
        cue.contains(position_micros).then_some(cue)
    }

    /// Installs a new timeline and restarts the cursor.
    pub fn replace_timeline(&mut self, timeline: Arc<CueTimeline>) {
        self.timeline = timeline;
        self.cursor = 0;
    }

    /// Restarts the cursor (after a seek or clock discontinuity).
    pub fn reset_cursor(&mut self) {
        self.cursor = 0;
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn timeline(&self) -> &Arc<CueTimeline> {
        &self.timeline
    }
}

impl Default for CueTracker {
    fn default() -> Self {
        Self::new(Arc::new(CueTimeline::empty()))
    }
}

// ============================================================================
// Subtitle providers
// ============================================================================

/// Resolves a subtitle track id to a parsed track.
///
/// Called from a background thread; implementations may block on I/O.
pub trait SubtitleProvider: Send + Sync {
    fn load(&self, track_id: &str) -> Result<SubtitleTrack, SubtitleError>;
}

/// Provider backed by subtitle files on disk.
#[derive(Debug, Default, Clone)]
pub struct FileSubtitleProvider {
    files: HashMap<String, PathBuf>,
}

impl FileSubtitleProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `path` under `track_id`.
    pub fn with_file(mut self, track_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.files.insert(track_id.into(), path.into());
        self
    }

    /// Registered track ids, sorted.
    pub fn track_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.files.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

impl SubtitleProvider for FileSubtitleProvider {
    fn load(&self, track_id: &str) -> Result<SubtitleTrack, SubtitleError> {
        let path = self
            .files
            .get(track_id)
            .ok_or_else(|| SubtitleError::UnknownTrack(track_id.to_string()))?;
        SubtitleTrack::from_path(path)
    }
}

// ============================================================================
// Shared subtitle handle
// ============================================================================

struct HandleInner {
    timeline: RwLock<Arc<CueTimeline>>,
    /// Signed display offset; positive delays subtitles
    offset_us: AtomicI64,
    /// Bumped per load request; only the latest load may install
    load_generation: AtomicU64,
    /// Set by seeks; the render loop restarts its cursor on the next lookup
    cursor_reset: AtomicBool,
    provider: RwLock<Option<Arc<dyn SubtitleProvider>>>,
}

/// Control-thread surface for subtitles. Cloning shares the same state.
#[derive(Clone)]
pub struct SubtitleHandle {
    inner: Arc<HandleInner>,
}

impl SubtitleHandle {
    /// Creates a handle with an empty timeline and no provider.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HandleInner {
                timeline: RwLock::new(Arc::new(CueTimeline::empty())),
                offset_us: AtomicI64::new(0),
                load_generation: AtomicU64::new(0),
                cursor_reset: AtomicBool::new(false),
                provider: RwLock::new(None),
            }),
        }
    }

    /// Creates a handle that loads tracks through `provider`.
    pub fn with_provider(provider: Arc<dyn SubtitleProvider>) -> Self {
        let handle = Self::new();
        handle.set_provider(provider);
        handle
    }

    pub fn set_provider(&self, provider: Arc<dyn SubtitleProvider>) {
        *self.inner.provider.write() = Some(provider);
    }

    /// Loads a track on a background thread and installs it when parsed.
    ///
    /// If another load starts before this one finishes, this one's result is
    /// discarded. The promise resolves to the number of installed cues.
    pub fn load_track(&self, track_id: &str) -> Promise<Result<usize, SubtitleError>> {
        let generation = self.inner.load_generation.fetch_add(1, Ordering::AcqRel) + 1;
        let Some(provider) = self.inner.provider.read().clone() else {
            return Promise::from_ready(Err(SubtitleError::UnknownTrack(track_id.to_string())));
        };

        let (sender, promise) = Promise::new();
        let handle = self.clone();
        let track_id = track_id.to_string();
        std::thread::spawn(move || {
            let result = provider.load(&track_id).map(|track| {
                let timeline = CueTimeline::new(Some(track_id.clone()), track);
                let count = timeline.len();
                if handle.inner.load_generation.load(Ordering::Acquire) == generation {
                    handle.swap_timeline(timeline);
                    tracing::info!("Loaded subtitle track {} ({} cues)", track_id, count);
                } else {
                    tracing::debug!("Subtitle load of {} superseded, discarding", track_id);
                }
                count
            });
            if let Err(e) = &result {
                tracing::warn!("Failed to load subtitle track {}: {}", track_id, e);
            }
            sender.send(result);
        });
        promise
    }

    /// Installs an already-parsed track, cancelling any pending load.
    pub fn install(&self, track_id: Option<String>, track: SubtitleTrack) {
        self.inner.load_generation.fetch_add(1, Ordering::AcqRel);
        self.swap_timeline(CueTimeline::new(track_id, track));
    }

    /// Removes all cues, cancelling any pending load.
    pub fn clear(&self) {
        self.inner.load_generation.fetch_add(1, Ordering::AcqRel);
        self.swap_timeline(CueTimeline::empty());
    }

    fn swap_timeline(&self, timeline: CueTimeline) {
        *self.inner.timeline.write() = Arc::new(timeline);
    }

    /// The active timeline.
    pub fn timeline(&self) -> Arc<CueTimeline> {
        Arc::clone(&*self.inner.timeline.read())
    }

    /// Sets the display offset in microseconds.
    ///
    /// Cues are looked up at `position - offset`, so a positive offset shows
    /// subtitles later.
    pub fn set_offset(&self, offset_micros: i64) {
        self.inner.offset_us.store(offset_micros, Ordering::Release);
    }

    pub fn offset_micros(&self) -> i64 {
        self.inner.offset_us.load(Ordering::Acquire)
    }

    /// Position on the cue timeline for a playback position, or `None`
    /// when the offset moves it before zero.
    pub fn cue_position(&self, position_micros: u64) -> Option<u64> {
        let adjusted = i128::from(position_micros) - i128::from(self.offset_micros());
        u64::try_from(adjusted).ok()
    }

    /// Stateless lookup for callers without a tracker (e.g. the UI thread
    /// while scrubbing).
    pub fn current_cue(&self, position_micros: u64) -> Option<Cue> {
        let position = self.cue_position(position_micros)?;
        self.timeline().lookup(position).cloned()
    }

    /// Creates a tracker over the active timeline.
    pub fn tracker(&self) -> CueTracker {
        CueTracker::new(self.timeline())
    }

    /// Points `tracker` at the active timeline if it changed.
    ///
    /// Returns true if the tracker was reset.
    pub fn refresh(&self, tracker: &mut CueTracker) -> bool {
        let current = self.inner.timeline.read();
        if Arc::ptr_eq(&*current, tracker.timeline()) {
            return false;
        }
        tracker.replace_timeline(Arc::clone(&*current));
        true
    }

    /// Asks the render loop to restart its cursor.
    pub fn request_cursor_reset(&self) {
        self.inner.cursor_reset.store(true, Ordering::Release);
    }

    /// Offset-adjusted cursor lookup for the render loop.
    pub fn track<'a>(&self, tracker: &'a mut CueTracker, position_micros: u64) -> Option<&'a Cue> {
        if !self.refresh(tracker) && self.inner.cursor_reset.swap(false, Ordering::AcqRel) {
            tracker.reset_cursor();
        }
        let position = self.cue_position(position_micros)?;
        tracker.current(position)
    }
}

impl Default for SubtitleHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::time::{Duration, Instant};

    fn timeline(cues: &[(u64, u64, &str)]) -> Arc<CueTimeline> {
        let cues = cues.iter().map(|(s, e, t)| Cue::new(*s, *e, *t)).collect();
        Arc::new(CueTimeline::new(None, SubtitleTrack::from_cues(cues)))
    }

    fn text(cue: Option<&Cue>) -> Option<&str> {
        cue.map(|c| c.text.as_str())
    }

    fn wait_ready<T: Send + 'static>(promise: &Promise<T>) -> &T {
        let deadline = Instant::now() + Duration::from_secs(5);
        while promise.ready().is_none() {
            assert!(Instant::now() < deadline, "promise never resolved");
            std::thread::sleep(Duration::from_millis(2));
        }
        match promise.ready() {
            Some(value) => value,
            None => panic!("promise not ready"),
        }
    }

    struct StaticProvider;

    impl SubtitleProvider for StaticProvider {
        fn load(&self, track_id: &str) -> Result<SubtitleTrack, SubtitleError> {
            match track_id {
                "en" => Ok(SubtitleTrack::from_cues(vec![Cue::new(0, 1_000, "hello")])),
                "slow" => {
                    std::thread::sleep(Duration::from_millis(100));
                    Ok(SubtitleTrack::from_cues(vec![Cue::new(0, 1_000, "slow")]))
                }
                other => Err(SubtitleError::UnknownTrack(other.to_string())),
            }
        }
    }

    #[test]
    fn test_timeline_lookup() {
        let timeline = timeline(&[
            (5_000_000, 8_000_000, "Second"),
            (1_000_000, 4_000_000, "First"),
        ]);

        assert!(timeline.lookup(500_000).is_none());
        assert_eq!(text(timeline.lookup(2_000_000)), Some("First"));
        // End is inclusive
        assert_eq!(text(timeline.lookup(4_000_000)), Some("First"));
        assert!(timeline.lookup(4_500_000).is_none());
        assert_eq!(text(timeline.lookup(6_000_000)), Some("Second"));
        assert!(timeline.lookup(10_000_000).is_none());
    }

    #[test]
    fn test_gap_then_seek_back() {
        let mut tracker = CueTracker::new(timeline(&[(0, 1000, "a"), (1500, 2500, "b")]));

        assert_eq!(text(tracker.current(1200)), None);
        assert_eq!(text(tracker.current(1600)), Some("b"));
        assert_eq!(text(tracker.current(500)), Some("a"));
    }

    #[test]
    fn test_empty_timeline() {
        let mut tracker = CueTracker::default();
        assert!(tracker.current(0).is_none());
        assert!(tracker.current(u64::MAX).is_none());
    }

    #[test]
    fn test_replace_resets_cursor() {
        let mut tracker = CueTracker::new(timeline(&[(0, 10, "a"), (20, 30, "b"), (40, 50, "c")]));
        assert_eq!(text(tracker.current(45)), Some("c"));
        assert_eq!(tracker.cursor(), 2);

        tracker.replace_timeline(timeline(&[(0, 100, "x")]));
        assert_eq!(tracker.cursor(), 0);
        assert_eq!(text(tracker.current(45)), Some("x"));
    }

    #[test]
    fn test_cursor_matches_binary_search() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..40 {
            let mut cues = Vec::new();
            let mut t = 0u64;
            for i in 0..rng.gen_range(0..40) {
                t += rng.gen_range(0..500);
                let end = t + rng.gen_range(0..800);
                cues.push(Cue::new(t, end, format!("cue {i}")));
                t = end + 1;
            }
            let timeline = Arc::new(CueTimeline::new(None, SubtitleTrack::from_cues(cues)));
            let mut tracker = CueTracker::new(Arc::clone(&timeline));

            for _ in 0..300 {
                let position = rng.gen_range(0..t + 1_000);
                assert_eq!(
                    tracker.current(position),
                    timeline.lookup(position),
                    "mismatch at {position}"
                );
            }
        }
    }

    #[test]
    fn test_offset_shifts_lookup() {
        let handle = SubtitleHandle::new();
        handle.install(
            Some("en".into()),
            SubtitleTrack::from_cues(vec![Cue::new(1_000, 2_000, "a")]),
        );

        assert_eq!(handle.current_cue(1_500).map(|c| c.text), Some("a".to_string()));

        // Positive offset delays subtitles
        handle.set_offset(1_000);
        assert!(handle.current_cue(1_500).is_none());
        assert!(handle.current_cue(2_500).is_some());
        assert!(handle.current_cue(500).is_none());

        handle.set_offset(-1_000);
        assert!(handle.current_cue(500).is_some());
    }

    #[test]
    fn test_refresh_picks_up_new_timeline() {
        let handle = SubtitleHandle::new();
        let mut tracker = handle.tracker();
        assert!(handle.track(&mut tracker, 50).is_none());
        assert!(!handle.refresh(&mut tracker));

        handle.install(None, SubtitleTrack::from_cues(vec![Cue::new(0, 100, "new")]));
        assert_eq!(text(handle.track(&mut tracker, 50)), Some("new"));
        assert!(!handle.refresh(&mut tracker));
    }

    #[test]
    fn test_requested_cursor_reset() {
        let handle = SubtitleHandle::new();
        handle.install(
            None,
            SubtitleTrack::from_cues(vec![Cue::new(0, 10, "a"), Cue::new(20, 30, "b")]),
        );
        let mut tracker = handle.tracker();
        assert_eq!(text(handle.track(&mut tracker, 25)), Some("b"));
        assert_eq!(tracker.cursor(), 1);

        handle.request_cursor_reset();
        assert_eq!(text(handle.track(&mut tracker, 5)), Some("a"));
        assert_eq!(tracker.cursor(), 0);
        assert!(handle.track(&mut tracker, 15).is_none());
    }

    #[test]
    fn test_load_track_installs() {
        let handle = SubtitleHandle::with_provider(Arc::new(StaticProvider));
        let promise = handle.load_track("en");
        let Ok(count) = wait_ready(&promise) else {
            panic!("Expected load to succeed");
        };
        assert_eq!(*count, 1);
        assert_eq!(handle.timeline().track_id(), Some("en"));
        assert_eq!(handle.current_cue(500).map(|c| c.text), Some("hello".to_string()));
    }

    #[test]
    fn test_latest_load_wins() {
        let handle = SubtitleHandle::with_provider(Arc::new(StaticProvider));
        let slow = handle.load_track("slow");
        let fast = handle.load_track("en");
        wait_ready(&fast);
        wait_ready(&slow);
        assert_eq!(handle.timeline().track_id(), Some("en"));
    }

    #[test]
    fn test_load_errors() {
        let handle = SubtitleHandle::new();
        let promise = handle.load_track("en");
        let Err(SubtitleError::UnknownTrack(_)) = wait_ready(&promise) else {
            panic!("Expected UnknownTrack without a provider");
        };

        handle.set_provider(Arc::new(StaticProvider));
        let promise = handle.load_track("fr");
        assert!(wait_ready(&promise).is_err());
        assert!(handle.timeline().is_empty());
    }

    #[test]
    fn test_file_provider() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("movie.en.srt");
        std::fs::write(&path, "1\n00:00:01,000 --> 00:00:02,000\nFrom disk\n").unwrap();

        let provider = FileSubtitleProvider::new().with_file("en", &path);
        assert_eq!(provider.track_ids(), vec!["en"]);

        let track = provider.load("en").unwrap();
        assert_eq!(track.cues[0].text, "From disk");
        let Err(SubtitleError::UnknownTrack(_)) = provider.load("de") else {
            panic!("Expected UnknownTrack");
        };
    }
}
