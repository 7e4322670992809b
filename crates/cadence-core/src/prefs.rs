//! Per-content playback preferences.
//!
//! Everything the player remembers about a piece of content (resume point,
//! subtitle track and offset, audio track, speed) lives in one mapping keyed
//! by [`PrefKey`]: the content's [`ContentId`] plus the [`PrefField`]. The
//! player only reads preferences; writing them back is the caller's job.

use std::collections::HashMap;
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use poll_promise::Promise;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::backend::TrackId;

/// Leading bytes hashed into a content id.
const CONTENT_ID_PREFIX_LEN: usize = 64 * 1024;

/// Error type for preference storage
#[derive(Debug)]
pub enum PrefsError {
    /// Reading or writing the backing file failed
    Io(std::io::Error),
    /// The backing file is not valid preference JSON
    Serde(serde_json::Error),
}

impl fmt::Display for PrefsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrefsError::Io(e) => write!(f, "Preference I/O error: {e}"),
            PrefsError::Serde(e) => write!(f, "Preference format error: {e}"),
        }
    }
}

impl std::error::Error for PrefsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PrefsError::Io(e) => Some(e),
            PrefsError::Serde(e) => Some(e),
        }
    }
}

impl From<std::io::Error> for PrefsError {
    fn from(err: std::io::Error) -> Self {
        PrefsError::Io(err)
    }
}

impl From<serde_json::Error> for PrefsError {
    fn from(err: serde_json::Error) -> Self {
        PrefsError::Serde(err)
    }
}

/// Stable identity of a piece of content: the first 16 hex characters of a
/// SHA-256 over its byte length and leading bytes.
///
/// Renaming or moving a file keeps its id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentId(String);

impl ContentId {
    /// Hashes `total_len` and up to 64KiB of `leading` bytes.
    pub fn from_prefix(total_len: u64, leading: &[u8]) -> Self {
        let leading = &leading[..leading.len().min(CONTENT_ID_PREFIX_LEN)];
        let mut hasher = Sha256::new();
        hasher.update(total_len.to_le_bytes());
        hasher.update(leading);
        let digest = format!("{:x}", hasher.finalize());
        Self(digest[..16].to_string())
    }

    /// Id of an in-memory buffer.
    pub fn from_bytes(content: &[u8]) -> Self {
        Self::from_prefix(content.len() as u64, content)
    }

    /// Id of a file on disk.
    pub fn from_file(path: &Path) -> Result<Self, PrefsError> {
        let file = std::fs::File::open(path)?;
        let total_len = file.metadata()?.len();
        let mut leading = Vec::with_capacity(CONTENT_ID_PREFIX_LEN);
        file.take(CONTENT_ID_PREFIX_LEN as u64).read_to_end(&mut leading)?;
        Ok(Self::from_prefix(total_len, &leading))
    }

    /// Parses a previously stored id (16 lowercase hex characters).
    pub fn parse(s: &str) -> Option<Self> {
        let valid = s.len() == 16 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        valid.then(|| Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ContentId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("invalid content id: {value:?}"))
    }
}

impl From<ContentId> for String {
    fn from(id: ContentId) -> Self {
        id.0
    }
}

/// Which preference of a piece of content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrefField {
    ResumePosition,
    SubtitleTrack,
    SubtitleOffset,
    AudioTrack,
    PlaybackSpeed,
}

/// Structured preference key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrefKey {
    pub content: ContentId,
    pub field: PrefField,
}

impl PrefKey {
    pub fn new(content: ContentId, field: PrefField) -> Self {
        Self { content, field }
    }
}

/// A stored preference value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrefValue {
    /// Microseconds from stream start
    Position(u64),
    /// Subtitle track id
    Track(String),
    /// Signed microseconds
    Offset(i64),
    /// Backend audio track index
    AudioTrack(u32),
    /// Playback rate multiplier
    Speed(f64),
}

/// Key/value storage for preferences.
pub trait PreferenceStore: Send + Sync {
    fn get(&self, key: &PrefKey) -> Option<PrefValue>;

    fn set(&self, key: PrefKey, value: PrefValue) -> Result<(), PrefsError>;

    fn remove(&self, key: &PrefKey) -> Result<(), PrefsError>;
}

/// Volatile store, for tests and sessions without persistence.
#[derive(Default)]
pub struct MemoryPreferenceStore {
    entries: RwLock<HashMap<PrefKey, PrefValue>>,
}

impl MemoryPreferenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl PreferenceStore for MemoryPreferenceStore {
    fn get(&self, key: &PrefKey) -> Option<PrefValue> {
        self.entries.read().get(key).cloned()
    }

    fn set(&self, key: PrefKey, value: PrefValue) -> Result<(), PrefsError> {
        self.entries.write().insert(key, value);
        Ok(())
    }

    fn remove(&self, key: &PrefKey) -> Result<(), PrefsError> {
        self.entries.write().remove(key);
        Ok(())
    }
}

/// On-disk layout of [`JsonPreferenceStore`].
#[derive(Debug, Default, Serialize, Deserialize)]
struct PrefsFile {
    version: u32,
    entries: Vec<PrefEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PrefEntry {
    key: PrefKey,
    value: PrefValue,
}

/// Store persisted as a JSON file, rewritten on every change.
pub struct JsonPreferenceStore {
    path: PathBuf,
    entries: RwLock<HashMap<PrefKey, PrefValue>>,
}

impl JsonPreferenceStore {
    /// Opens the store at `path`. A missing file is an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, PrefsError> {
        let path = path.into();
        let entries = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let file: PrefsFile = serde_json::from_str(&content)?;
            tracing::debug!("Loaded {} preferences from {:?}", file.entries.len(), path);
            file.entries.into_iter().map(|e| (e.key, e.value)).collect()
        } else {
            tracing::debug!("No preference file at {:?}, starting empty", path);
            HashMap::new()
        };
        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self, entries: &HashMap<PrefKey, PrefValue>) -> Result<(), PrefsError> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let mut list: Vec<PrefEntry> = entries
            .iter()
            .map(|(key, value)| PrefEntry {
                key: key.clone(),
                value: value.clone(),
            })
            .collect();
        list.sort_by(|a, b| {
            (&a.key.content, a.key.field as u8).cmp(&(&b.key.content, b.key.field as u8))
        });
        let file = PrefsFile {
            version: 1,
            entries: list,
        };
        let content = serde_json::to_string_pretty(&file)?;

        // Write then rename so a crash never leaves a truncated file
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl PreferenceStore for JsonPreferenceStore {
    fn get(&self, key: &PrefKey) -> Option<PrefValue> {
        self.entries.read().get(key).cloned()
    }

    fn set(&self, key: PrefKey, value: PrefValue) -> Result<(), PrefsError> {
        let mut entries = self.entries.write();
        let mut updated = entries.clone();
        updated.insert(key, value);
        self.save(&updated)?;
        *entries = updated;
        Ok(())
    }

    fn remove(&self, key: &PrefKey) -> Result<(), PrefsError> {
        let mut entries = self.entries.write();
        if !entries.contains_key(key) {
            return Ok(());
        }
        let mut updated = entries.clone();
        updated.remove(key);
        self.save(&updated)?;
        *entries = updated;
        Ok(())
    }
}

/// Everything the player consumes from preferences for one content id.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackPrefs {
    pub resume_position_micros: Option<u64>,
    pub subtitle_track: Option<String>,
    pub subtitle_offset_micros: i64,
    pub audio_track: Option<TrackId>,
    pub playback_speed: f64,
}

impl Default for PlaybackPrefs {
    fn default() -> Self {
        Self {
            resume_position_micros: None,
            subtitle_track: None,
            subtitle_offset_micros: 0,
            audio_track: None,
            playback_speed: 1.0,
        }
    }
}

impl PlaybackPrefs {
    /// Reads every field for `content`. Missing or mistyped entries keep
    /// their defaults.
    pub fn load(store: &dyn PreferenceStore, content: &ContentId) -> Self {
        let get = |field| store.get(&PrefKey::new(content.clone(), field));
        let mut prefs = Self::default();

        for field in [
            PrefField::ResumePosition,
            PrefField::SubtitleTrack,
            PrefField::SubtitleOffset,
            PrefField::AudioTrack,
            PrefField::PlaybackSpeed,
        ] {
            match (field, get(field)) {
                (_, None) => {}
                (PrefField::ResumePosition, Some(PrefValue::Position(us))) => {
                    prefs.resume_position_micros = Some(us)
                }
                (PrefField::SubtitleTrack, Some(PrefValue::Track(id))) => prefs.subtitle_track = Some(id),
                (PrefField::SubtitleOffset, Some(PrefValue::Offset(us))) => {
                    prefs.subtitle_offset_micros = us
                }
                (PrefField::AudioTrack, Some(PrefValue::AudioTrack(id))) => {
                    prefs.audio_track = Some(TrackId(id))
                }
                (PrefField::PlaybackSpeed, Some(PrefValue::Speed(rate))) if rate.is_finite() && rate > 0.0 => {
                    prefs.playback_speed = rate
                }
                (field, Some(value)) => {
                    tracing::warn!("Ignoring {:?} preference for {}: {:?}", field, content, value)
                }
            }
        }
        prefs
    }

    /// Writes every set field for `content`.
    pub fn save(&self, store: &dyn PreferenceStore, content: &ContentId) -> Result<(), PrefsError> {
        let key = |field| PrefKey::new(content.clone(), field);
        if let Some(us) = self.resume_position_micros {
            store.set(key(PrefField::ResumePosition), PrefValue::Position(us))?;
        }
        if let Some(id) = &self.subtitle_track {
            store.set(key(PrefField::SubtitleTrack), PrefValue::Track(id.clone()))?;
        }
        if let Some(id) = self.audio_track {
            store.set(key(PrefField::AudioTrack), PrefValue::AudioTrack(id.0))?;
        }
        store.set(key(PrefField::SubtitleOffset), PrefValue::Offset(self.subtitle_offset_micros))?;
        store.set(key(PrefField::PlaybackSpeed), PrefValue::Speed(self.playback_speed))?;
        Ok(())
    }
}

/// Loads [`PlaybackPrefs`] on a background thread.
pub fn load_playback_prefs(
    store: Arc<dyn PreferenceStore>,
    content: ContentId,
) -> Promise<PlaybackPrefs> {
    let (sender, promise) = Promise::new();
    std::thread::spawn(move || {
        let prefs = PlaybackPrefs::load(store.as_ref(), &content);
        tracing::debug!("Loaded playback prefs for {}: {:?}", content, prefs);
        sender.send(prefs);
    });
    promise
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_id_shape() {
        let id = ContentId::from_bytes(b"some video bytes");
        assert_eq!(id.as_str().len(), 16);
        assert!(ContentId::parse(id.as_str()).is_some());
        assert_eq!(ContentId::from_bytes(b"some video bytes"), id);
        assert_ne!(ContentId::from_bytes(b"other video bytes"), id);

        assert!(ContentId::parse("not-hex").is_none());
        assert!(ContentId::parse("ABCDEF0123456789").is_none());
    }

    #[test]
    fn test_content_id_ignores_path() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.mkv");
        let b = dir.path().join("renamed.mkv");
        std::fs::write(&a, vec![7u8; 100_000]).unwrap();
        std::fs::write(&b, vec![7u8; 100_000]).unwrap();

        assert_eq!(ContentId::from_file(&a).unwrap(), ContentId::from_file(&b).unwrap());
        assert_eq!(ContentId::from_file(&a).unwrap(), ContentId::from_bytes(&vec![7u8; 100_000]));
    }

    #[test]
    fn test_keys_isolated_per_content() {
        let store = MemoryPreferenceStore::new();
        let a = ContentId::from_bytes(b"a");
        let b = ContentId::from_bytes(b"b");

        store
            .set(PrefKey::new(a.clone(), PrefField::ResumePosition), PrefValue::Position(5_000))
            .unwrap();
        store
            .set(PrefKey::new(b.clone(), PrefField::ResumePosition), PrefValue::Position(9_000))
            .unwrap();

        assert_eq!(PlaybackPrefs::load(&store, &a).resume_position_micros, Some(5_000));
        assert_eq!(PlaybackPrefs::load(&store, &b).resume_position_micros, Some(9_000));

        store.remove(&PrefKey::new(a.clone(), PrefField::ResumePosition)).unwrap();
        assert_eq!(PlaybackPrefs::load(&store, &a).resume_position_micros, None);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_mistyped_value_ignored() {
        let store = MemoryPreferenceStore::new();
        let id = ContentId::from_bytes(b"x");
        store
            .set(PrefKey::new(id.clone(), PrefField::PlaybackSpeed), PrefValue::Track("fast".into()))
            .unwrap();
        assert_eq!(PlaybackPrefs::load(&store, &id).playback_speed, 1.0);
    }

    #[test]
    fn test_json_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prefs").join("playback.json");
        let id = ContentId::from_bytes(b"movie");
        let prefs = PlaybackPrefs {
            resume_position_micros: Some(61_000_000),
            subtitle_track: Some("en".to_string()),
            subtitle_offset_micros: -250_000,
            audio_track: Some(TrackId(2)),
            playback_speed: 1.25,
        };

        {
            let store = JsonPreferenceStore::open(&path).unwrap();
            prefs.save(&store, &id).unwrap();
        }

        let store = JsonPreferenceStore::open(&path).unwrap();
        assert_eq!(PlaybackPrefs::load(&store, &id), prefs);
        assert_eq!(
            PlaybackPrefs::load(&store, &ContentId::from_bytes(b"other")),
            PlaybackPrefs::default()
        );
    }

    #[test]
    fn test_json_store_failed_write_keeps_memory_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let parent = dir.path().join("prefs");
        let path = parent.join("playback.json");
        let id = ContentId::from_bytes(b"movie");
        let resume = PrefKey::new(id.clone(), PrefField::ResumePosition);
        let speed = PrefKey::new(id, PrefField::PlaybackSpeed);

        let store = JsonPreferenceStore::open(&path).unwrap();
        store.set(resume.clone(), PrefValue::Position(1_000)).unwrap();

        // A plain file where the directory was makes every write fail
        std::fs::remove_dir_all(&parent).unwrap();
        std::fs::write(&parent, "blocked").unwrap();

        let Err(PrefsError::Io(_)) = store.set(speed.clone(), PrefValue::Speed(1.5)) else {
            panic!("Expected an io error");
        };
        assert_eq!(store.get(&speed), None);

        let Err(PrefsError::Io(_)) = store.remove(&resume) else {
            panic!("Expected an io error");
        };
        assert_eq!(store.get(&resume), Some(PrefValue::Position(1_000)));
    }

    #[test]
    fn test_json_store_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prefs.json");
        std::fs::write(&path, "{ not json").unwrap();
        let Err(PrefsError::Serde(_)) = JsonPreferenceStore::open(&path) else {
            panic!("Expected a serde error");
        };
    }

    #[test]
    fn test_async_load() {
        let store = Arc::new(MemoryPreferenceStore::new());
        let id = ContentId::from_bytes(b"async");
        store
            .set(PrefKey::new(id.clone(), PrefField::PlaybackSpeed), PrefValue::Speed(2.0))
            .unwrap();

        let promise = load_playback_prefs(store, id);
        let prefs = promise.block_until_ready();
        assert_eq!(prefs.playback_speed, 2.0);
    }
}
