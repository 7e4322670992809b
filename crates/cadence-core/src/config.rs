//! Tunables for the synchronization core.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default number of decoded frames buffered ahead of the clock.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10;

/// Default staleness after which a queued frame is dropped instead of rendered.
pub const DEFAULT_LATE_THRESHOLD: Duration = Duration::from_millis(40);

/// Bounds for the render tick interval.
const MIN_TICK_INTERVAL: Duration = Duration::from_millis(40);
const MAX_TICK_INTERVAL: Duration = Duration::from_millis(200);

/// Configuration for a player and the sessions it creates.
///
/// Every field has a default, so a JSON config only needs the keys it
/// overrides. Durations are written in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Frame queue capacity
    pub queue_capacity: usize,
    /// Frames older than `clock - late_threshold` are dropped
    #[serde(with = "duration_ms", rename = "late_threshold_ms")]
    pub late_threshold: Duration,
    /// Render loop polling interval (clamped to 40-200ms)
    #[serde(with = "duration_ms", rename = "tick_interval_ms")]
    pub tick_interval: Duration,
    /// Forward clock jump treated as a discontinuity
    #[serde(with = "duration_ms", rename = "jump_threshold_ms")]
    pub jump_threshold: Duration,
    /// How long a seek commit waits for the decode threads to acknowledge
    #[serde(with = "duration_ms", rename = "seek_timeout_ms")]
    pub seek_timeout: Duration,
    /// How long stop/release wait for a decode thread before abandoning it
    #[serde(with = "duration_ms", rename = "join_timeout_ms")]
    pub join_timeout: Duration,
    /// How far the audio thread may decode ahead of the clock
    #[serde(with = "duration_ms", rename = "audio_lead_ms")]
    pub audio_lead: Duration,
    /// Decode thread backoff when it has nothing to do
    #[serde(with = "duration_ms", rename = "idle_backoff_ms")]
    pub idle_backoff: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            late_threshold: DEFAULT_LATE_THRESHOLD,
            tick_interval: MIN_TICK_INTERVAL,
            jump_threshold: Duration::from_secs(1),
            seek_timeout: Duration::from_secs(2),
            join_timeout: Duration::from_millis(500),
            audio_lead: Duration::from_millis(300),
            idle_backoff: Duration::from_millis(5),
        }
    }
}

impl SyncConfig {
    /// Parses a config from JSON. Missing keys keep their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str::<Self>(json).map(Self::validate)
    }

    /// Sets the frame queue capacity.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Sets the late-frame threshold.
    pub fn with_late_threshold(mut self, threshold: Duration) -> Self {
        self.late_threshold = threshold;
        self
    }

    /// Sets the render tick interval.
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Sets the seek acknowledgement timeout.
    pub fn with_seek_timeout(mut self, timeout: Duration) -> Self {
        self.seek_timeout = timeout;
        self
    }

    /// Sets the decode thread join timeout.
    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    /// Clamps values into their supported ranges.
    pub fn validate(mut self) -> Self {
        if self.queue_capacity == 0 {
            tracing::warn!("queue_capacity 0 is not usable, using 1");
            self.queue_capacity = 1;
        }
        let clamped = self.tick_interval.clamp(MIN_TICK_INTERVAL, MAX_TICK_INTERVAL);
        if clamped != self.tick_interval {
            tracing::warn!(
                "tick_interval {:?} outside {:?}..={:?}, using {:?}",
                self.tick_interval,
                MIN_TICK_INTERVAL,
                MAX_TICK_INTERVAL,
                clamped
            );
            self.tick_interval = clamped;
        }
        self
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.queue_capacity, 10);
        assert_eq!(config.late_threshold, Duration::from_millis(40));
        assert_eq!(config.tick_interval, Duration::from_millis(40));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = SyncConfig::from_json(r#"{ "queue_capacity": 4, "seek_timeout_ms": 750 }"#)
            .unwrap();
        assert_eq!(config.queue_capacity, 4);
        assert_eq!(config.seek_timeout, Duration::from_millis(750));
        assert_eq!(config.late_threshold, DEFAULT_LATE_THRESHOLD);
    }

    #[test]
    fn test_validate_clamps() {
        let config = SyncConfig::default()
            .with_queue_capacity(0)
            .with_tick_interval(Duration::from_millis(5))
            .validate();
        assert_eq!(config.queue_capacity, 1);
        assert_eq!(config.tick_interval, Duration::from_millis(40));

        let config = SyncConfig::default()
            .with_tick_interval(Duration::from_secs(1))
            .validate();
        assert_eq!(config.tick_interval, Duration::from_millis(200));
    }
}
