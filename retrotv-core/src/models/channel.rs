use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::id::ChannelId;

/// How a channel's backing stream is produced and served.
///
/// Doubles as the session kind: at most one backing subprocess exists per
/// (channel, mode) pair regardless of viewer count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamMode {
    Hls,
    HlsSlower,
    Concat,
}

impl std::fmt::Display for StreamMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hls => write!(f, "hls"),
            Self::HlsSlower => write!(f, "hls_slower"),
            Self::Concat => write!(f, "concat"),
        }
    }
}

/// A virtual broadcast channel.
///
/// `duration_ms` is always kept equal to the sum of the owned lineup's item
/// durations; the store updates it on every lineup items write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub number: ChannelId,
    pub uuid: Uuid,
    pub name: String,
    /// Epoch-millisecond anchor of the repeating playback cycle
    pub start_time_ms: i64,
    /// Total lineup duration in milliseconds
    pub duration_ms: i64,
    pub stream_mode: StreamMode,
    /// Name of the transcode configuration used when spawning ffmpeg
    pub transcode_config: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Channel {
    #[must_use]
    pub fn new(number: ChannelId, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            number,
            uuid: Uuid::new_v4(),
            name: name.into(),
            start_time_ms: now.timestamp_millis(),
            duration_ms: 0,
            stream_mode: StreamMode::Hls,
            transcode_config: "default".to_string(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Named ffmpeg transcode settings, resolved by name at session start.
///
/// Codec and filter-graph internals stay opaque to the core; these fields
/// only parameterize the subprocess argv.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscodeConfig {
    pub name: String,
    pub resolution: String,
    pub video_codec: String,
    pub audio_codec: String,
    pub video_bitrate_kbps: u32,
    pub audio_bitrate_kbps: u32,
    pub buffer_size_kb: u32,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            resolution: "1920x1080".to_string(),
            video_codec: "libx264".to_string(),
            audio_codec: "aac".to_string(),
            video_bitrate_kbps: 3000,
            audio_bitrate_kbps: 192,
            buffer_size_kb: 2048,
        }
    }
}
