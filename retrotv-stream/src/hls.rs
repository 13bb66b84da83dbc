//! Live HLS playlist state.
//!
//! One playlist per HLS session, growing as the writer lands segments and
//! trimmed so long-running channels never accumulate an unbounded manifest.
//! A `parking_lot::RwLock` gives readers a consistent snapshot while the
//! writer appends; trim recomputes the media/discontinuity sequence numbers
//! so clients joining mid-stream still see a valid window.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::RwLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub sequence: u64,
    /// Stream-relative start in milliseconds
    pub start_ms: i64,
    pub duration_ms: i64,
    /// TS filename within the session working directory
    pub ts_name: String,
    /// Whether a timestamp discontinuity precedes this segment
    pub discontinuity: bool,
}

impl Segment {
    #[must_use]
    pub const fn end_ms(&self) -> i64 {
        self.start_ms + self.duration_ms
    }
}

#[derive(Debug, Default)]
struct PlaylistState {
    segments: VecDeque<Segment>,
    /// Sequence of the first segment still in the window
    media_sequence: u64,
    /// Count of discontinuities trimmed out of the window
    discontinuity_sequence: u64,
    next_sequence: u64,
    ended: bool,
}

/// Thread-safe live playlist shared between the segment writer, the
/// trimmer, and manifest readers.
#[derive(Debug, Default, Clone)]
pub struct HlsPlaylist {
    state: Arc<RwLock<PlaylistState>>,
}

impl HlsPlaylist {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a finished segment, assigning it the next sequence number.
    pub fn append_segment(&self, start_ms: i64, duration_ms: i64, ts_name: impl Into<String>, discontinuity: bool) -> u64 {
        let mut state = self.state.write();
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.segments.push_back(Segment {
            sequence,
            start_ms,
            duration_ms,
            ts_name: ts_name.into(),
            discontinuity,
        });
        sequence
    }

    /// Drop every segment that ends at or before `cutoff_ms`, advancing the
    /// sequence counters so the manifest stays valid for mid-stream joins.
    pub fn trim_playlist(&self, cutoff_ms: i64) {
        let mut state = self.state.write();
        loop {
            let Some(front) = state.segments.front() else {
                break;
            };
            if front.end_ms() > cutoff_ms {
                break;
            }
            let sequence = front.sequence;
            let discontinuity = front.discontinuity;
            state.segments.pop_front();
            state.media_sequence = sequence + 1;
            if discontinuity {
                state.discontinuity_sequence += 1;
            }
        }
    }

    /// Keep at most `window` segments, trimming the oldest.
    pub fn enforce_window(&self, window: usize) {
        let cutoff = {
            let state = self.state.read();
            if state.segments.len() <= window {
                return;
            }
            let drop_count = state.segments.len() - window;
            state.segments[drop_count - 1].end_ms()
        };
        self.trim_playlist(cutoff);
    }

    /// Mark the stream finished; the manifest gains `EXT-X-ENDLIST`.
    pub fn mark_ended(&self) {
        self.state.write().ended = true;
    }

    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.state.read().segments.len()
    }

    /// Snapshot of the current window (oldest first).
    #[must_use]
    pub fn segments(&self) -> Vec<Segment> {
        self.state.read().segments.iter().cloned().collect()
    }

    /// Render the manifest. `ts_url` maps a segment filename to the URL the
    /// client fetches it from.
    #[must_use]
    pub fn render<F>(&self, mut ts_url: F) -> String
    where
        F: FnMut(&str) -> String,
    {
        let state = self.state.read();
        let mut out = String::new();

        out.push_str("#EXTM3U\n");
        out.push_str("#EXT-X-VERSION:3\n");

        let target_sec = state
            .segments
            .iter()
            .map(|s| (s.duration_ms + 999) / 1000)
            .max()
            .unwrap_or(10);
        out.push_str(&format!("#EXT-X-TARGETDURATION:{target_sec}\n"));
        out.push_str(&format!("#EXT-X-MEDIA-SEQUENCE:{}\n", state.media_sequence));
        if state.discontinuity_sequence > 0 {
            out.push_str(&format!(
                "#EXT-X-DISCONTINUITY-SEQUENCE:{}\n",
                state.discontinuity_sequence
            ));
        }

        for segment in &state.segments {
            if segment.discontinuity {
                out.push_str("#EXT-X-DISCONTINUITY\n");
            }
            let duration_sec = segment.duration_ms as f64 / 1000.0;
            out.push_str(&format!("#EXTINF:{duration_sec:.3},\n"));
            out.push_str(&ts_url(&segment.ts_name));
            out.push('\n');
        }

        if state.ended {
            out.push_str("#EXT-X-ENDLIST\n");
        }

        out
    }
}
