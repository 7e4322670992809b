//! cadence Demo Application
//!
//! Plays a synthetic clip through [`cadence_core::Player`] and logs what the
//! sink is asked to present.
//!
//! ```bash
//! RUST_LOG=cadence_core=debug cargo run -p cadence-demo -- [config.json] [subtitles.srt]
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use cadence_core::{
    load_playback_prefs, ContentId, Cue, FileSubtitleProvider, Frame, JsonPreferenceStore,
    MediaBackend, MediaSource, PlaybackError, PlaybackPrefs, Player, PlayerEvent,
    PreferenceStore, RenderSink, Sample, SeekMode, SubtitleTrack, SyncConfig, TrackId, TrackInfo,
    TrackSelection,
};
use parking_lot::Mutex;

const CLIP_DURATION: Duration = Duration::from_secs(8);
const VIDEO_FRAME_US: u64 = 33_333;
const AUDIO_PACKET_US: u64 = 20_000;

const BUILTIN_SUBTITLES: &str = "1
00:00:00,500 --> 00:00:02,000
Synthetic clip

2
00:00:05,000 --> 00:00:06,500
After the seek
";

// ============================================================================
// Synthetic backend
// ============================================================================

/// Emulated audio output position.
struct AudioOutput {
    base_us: u64,
    started_at: Option<Instant>,
}

impl AudioOutput {
    fn position_micros(&self) -> u64 {
        let elapsed = self.started_at.map_or(0, |t| t.elapsed().as_micros() as u64);
        self.base_us + elapsed
    }
}

/// Backend producing a 30fps video track and a 20ms-packet audio track.
struct SyntheticBackend {
    positions: Mutex<HashMap<TrackId, u64>>,
    output: Mutex<AudioOutput>,
}

impl SyntheticBackend {
    const VIDEO: TrackId = TrackId(0);
    const AUDIO: TrackId = TrackId(1);

    fn new() -> Self {
        Self {
            positions: Mutex::new(HashMap::new()),
            output: Mutex::new(AudioOutput {
                base_us: 0,
                started_at: None,
            }),
        }
    }
}

impl MediaBackend for SyntheticBackend {
    fn select_tracks(&self, source: &MediaSource) -> Result<TrackSelection, PlaybackError> {
        tracing::info!("Opening synthetic source {}", source.uri);
        self.positions.lock().clear();
        Ok(TrackSelection {
            video: Some(TrackInfo::video(Self::VIDEO.0, "raw")),
            audio: Some(TrackInfo::audio(Self::AUDIO.0, "pcm", 2, 48_000).with_language("en")),
        })
    }

    fn read_sample(&self, track: TrackId) -> Result<Sample, PlaybackError> {
        let step = if track == Self::VIDEO {
            VIDEO_FRAME_US
        } else {
            AUDIO_PACKET_US
        };
        let mut positions = self.positions.lock();
        let pos = positions.entry(track).or_insert(0);
        if *pos >= CLIP_DURATION.as_micros() as u64 {
            return Ok(Sample::EndOfStream);
        }
        let pts = *pos;
        *pos += step;
        let (width, height) = if track == Self::VIDEO { (320, 180) } else { (0, 0) };
        Ok(Sample::Data {
            pts_micros: pts,
            payload: Bytes::from(pts.to_le_bytes().to_vec()),
            width,
            height,
        })
    }

    fn seek(&self, track: TrackId, target_micros: u64, _mode: SeekMode) -> Result<(), PlaybackError> {
        // Snap video to a one-second GOP
        let landed = if track == Self::VIDEO {
            target_micros - target_micros % 1_000_000
        } else {
            let mut output = self.output.lock();
            output.base_us = target_micros;
            if output.started_at.is_some() {
                output.started_at = Some(Instant::now());
            }
            target_micros
        };
        self.positions.lock().insert(track, landed);
        Ok(())
    }

    fn hardware_clock_micros(&self) -> Option<u64> {
        let output = self.output.lock();
        output.started_at.map(|_| output.position_micros())
    }

    fn duration_micros(&self) -> Option<u64> {
        Some(CLIP_DURATION.as_micros() as u64)
    }

    fn set_paused(&self, paused: bool) {
        let mut output = self.output.lock();
        match (paused, output.started_at) {
            (true, Some(_)) => {
                output.base_us = output.position_micros();
                output.started_at = None;
            }
            (false, None) => output.started_at = Some(Instant::now()),
            _ => {}
        }
    }
}

// ============================================================================
// Console sink
// ============================================================================

#[derive(Default)]
struct ConsoleSink {
    frames: AtomicU64,
    audio_packets: AtomicU64,
}

impl RenderSink for ConsoleSink {
    fn render_frame(&self, frame: &Frame) {
        let n = self.frames.fetch_add(1, Ordering::Relaxed);
        if n % 10 == 0 {
            let (w, h) = frame.dimensions();
            tracing::debug!("frame #{} pts={:?} {}x{}", n, frame.pts(), w, h);
        }
    }

    fn show_cue(&self, cue: Option<&Cue>) {
        match cue {
            Some(cue) => tracing::info!("subtitle: {}", cue.text),
            None => tracing::info!("subtitle cleared"),
        }
    }

    fn queue_audio(&self, _pts_micros: u64, _payload: &Bytes) {
        self.audio_packets.fetch_add(1, Ordering::Relaxed);
    }
}

// ============================================================================
// Main
// ============================================================================

fn load_config(path: Option<&str>) -> SyncConfig {
    let Some(path) = path else {
        return SyncConfig::default();
    };
    match std::fs::read_to_string(path) {
        Ok(json) => match SyncConfig::from_json(&json) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Invalid config {}: {}, using defaults", path, e);
                SyncConfig::default()
            }
        },
        Err(e) => {
            tracing::warn!("Cannot read config {}: {}, using defaults", path, e);
            SyncConfig::default()
        }
    }
}

fn log_events(player: &Player) {
    for event in player.events().try_iter() {
        match event {
            PlayerEvent::Error(e) => tracing::error!("player error: {}", e),
            other => tracing::info!("event: {:?}", other),
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cadence_core=info".parse().unwrap())
                .add_directive("cadence_demo=info".parse().unwrap()),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = load_config(args.first().map(String::as_str));
    if let Ok(json) = serde_json::to_string_pretty(&config) {
        tracing::debug!("config:\n{}", json);
    }

    let mut player = Player::with_config(Arc::new(SyntheticBackend::new()), config);
    if let Some(path) = args.get(1) {
        let provider = FileSubtitleProvider::new().with_file("external", path);
        player = player.with_subtitle_provider(Arc::new(provider));
    }

    // Preferences survive across runs in the temp directory
    let content = ContentId::from_bytes(b"cadence-demo synthetic clip");
    let store: Arc<dyn PreferenceStore> =
        match JsonPreferenceStore::open(std::env::temp_dir().join("cadence-demo-prefs.json")) {
            Ok(store) => Arc::new(store),
            Err(e) => {
                tracing::error!("Cannot open preference store: {}", e);
                return;
            }
        };
    let mut prefs = load_playback_prefs(Arc::clone(&store), content.clone())
        .block_and_take();
    if prefs.resume_position_micros.is_some_and(|p| p >= CLIP_DURATION.as_micros() as u64) {
        prefs.resume_position_micros = None;
    }
    if args.get(1).is_some() {
        prefs.subtitle_track = Some("external".to_string());
    }
    tracing::info!("Loaded preferences: {:?}", prefs);

    match player.apply_prefs(&prefs) {
        Some(load) => match load.block_and_take() {
            Ok(count) => tracing::info!("Loaded {} cues", count),
            Err(e) => tracing::warn!("Subtitle load failed: {}", e),
        },
        None => match SubtitleTrack::from_srt(BUILTIN_SUBTITLES) {
            Ok(track) => player.subtitles().install(Some("builtin".into()), track),
            Err(e) => tracing::warn!("Built-in subtitles failed to parse: {}", e),
        },
    }

    let sink = Arc::new(ConsoleSink::default());
    let source = MediaSource::new("synthetic://clip").with_content_id(content.clone());
    if let Err(e) = player.prepare(source, sink.clone()) {
        tracing::error!("prepare failed: {}", e);
        return;
    }

    let run = || -> Result<(), PlaybackError> {
        player.play()?;
        tracing::info!("Playing with {:?} clock", player.clock_kind());
        thread::sleep(Duration::from_secs(2));

        player.pause()?;
        tracing::info!("Paused at {:?}", Duration::from_micros(player.position_micros()));
        thread::sleep(Duration::from_millis(500));

        if let Some(cue) = player.seek_preview(5_200_000)? {
            tracing::info!("Scrubbing over \"{}\"", cue.text);
        }
        let outcome = player.seek_commit(5_200_000)?;
        tracing::info!("Seek finished: {:?}", outcome);
        log_events(&player);

        player.play()?;
        let deadline = Instant::now() + Duration::from_secs(4);
        let events = player.events();
        while Instant::now() < deadline {
            match events.recv_timeout(Duration::from_millis(100)) {
                Ok(PlayerEvent::EndOfStream) => {
                    tracing::info!("Reached end of stream");
                    break;
                }
                Ok(PlayerEvent::Error(e)) => return Err(e),
                Ok(other) => tracing::info!("event: {:?}", other),
                Err(_) => {}
            }
        }
        Ok(())
    };
    if let Err(e) = run() {
        tracing::error!("Playback failed: {}", e);
    }

    prefs.resume_position_micros = Some(player.position_micros());
    if let Err(e) = prefs.save(store.as_ref(), &content) {
        tracing::warn!("Failed to save preferences: {}", e);
    }

    if let Err(e) = player.stop() {
        tracing::warn!("stop failed: {}", e);
    }
    log_events(&player);
    tracing::info!(
        "Done: {} frames, {} audio packets, {}",
        sink.frames.load(Ordering::Relaxed),
        sink.audio_packets.load(Ordering::Relaxed),
        player.metrics()
    );
    player.release();
}
