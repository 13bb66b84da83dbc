//! Lineup document model.
//!
//! A Lineup is owned 1:1 by a Channel: created with it, mutated on every
//! schedule edit, deleted with it. The `start_time_offsets` cumulative-sum
//! invariant is what every playback position calculation depends on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::id::{ChannelId, ProgramId};
use super::schedule::Schedule;

/// Current persisted document schema version
pub const LINEUP_SCHEMA_VERSION: u32 = 1;

/// Optional group tag on a content item (how the item was scheduled)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgramGroup {
    FillerList { id: String },
    CustomShow { id: String },
    SmartCollection { id: String },
}

/// One playable entry in a channel's lineup.
///
/// Every consumption site matches exhaustively; adding a variant is a
/// compile-time-checked change everywhere it's handled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LineupItem {
    /// Reference to a resolved, persisted program
    Content {
        program_id: ProgramId,
        duration_ms: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group: Option<ProgramGroup>,
    },
    /// Flex filler with no program identity
    Offline { duration_ms: i64 },
    /// Plays another channel's current programming
    Redirect { channel: ChannelId, duration_ms: i64 },
}

impl LineupItem {
    #[must_use]
    pub const fn duration_ms(&self) -> i64 {
        match self {
            Self::Content { duration_ms, .. }
            | Self::Offline { duration_ms }
            | Self::Redirect { duration_ms, .. } => *duration_ms,
        }
    }

    #[must_use]
    pub const fn is_offline(&self) -> bool {
        matches!(self, Self::Offline { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnDemandState {
    Paused,
    Running,
}

/// State for channels whose position is viewing-progress based.
///
/// `cursor_ms` advances only with live playback time, never wall clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnDemandConfig {
    pub state: OnDemandState,
    pub cursor_ms: i64,
    pub last_checkpoint: DateTime<Utc>,
}

impl Default for OnDemandConfig {
    fn default() -> Self {
        Self {
            state: OnDemandState::Paused,
            cursor_ms: 0,
            last_checkpoint: Utc::now(),
        }
    }
}

/// A drawn item whose program has no persisted identity yet.
///
/// Held in a side list and spliced into `items` on the next materialization
/// pass, once the resolver has upserted it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingProgram {
    /// External identity used for deduplication on upsert
    pub external_key: String,
    pub duration_ms: i64,
    /// Index in `items` where the placeholder offline item sits
    pub item_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<ProgramGroup>,
}

/// Persisted per-channel lineup document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Lineup {
    pub items: Vec<LineupItem>,
    /// `offsets[i] == Σ items[0..i].duration_ms`
    pub start_time_offsets: Vec<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule: Option<Schedule>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_demand: Option<OnDemandConfig>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pending_programs: Vec<PendingProgram>,
    pub version: u32,
    pub last_updated: DateTime<Utc>,
}

impl Default for Lineup {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            start_time_offsets: Vec::new(),
            schedule: None,
            on_demand: None,
            pending_programs: Vec::new(),
            version: LINEUP_SCHEMA_VERSION,
            last_updated: Utc::now(),
        }
    }
}

impl Lineup {
    /// Recompute the whole offsets array from item durations.
    pub fn recompute_offsets(&mut self) {
        self.recompute_offsets_from(0);
    }

    /// Recompute offsets from `join` forward, leaving earlier entries
    /// untouched. Used by append-mode materialization so small incremental
    /// edits don't rewalk the entire lineup.
    pub fn recompute_offsets_from(&mut self, join: usize) {
        self.start_time_offsets.truncate(join);
        let mut acc = if join == 0 {
            0
        } else {
            self.start_time_offsets[join - 1] + self.items[join - 1].duration_ms()
        };
        for item in &self.items[join..] {
            self.start_time_offsets.push(acc);
            acc += item.duration_ms();
        }
    }

    #[must_use]
    pub fn total_duration_ms(&self) -> i64 {
        self.items.iter().map(LineupItem::duration_ms).sum()
    }

    /// Locate the item playing at `offset_ms` into the cycle.
    ///
    /// Returns `(item_index, offset_into_item_ms)`, or `None` for an empty
    /// lineup or an offset past the cycle end.
    #[must_use]
    pub fn item_at_offset(&self, offset_ms: i64) -> Option<(usize, i64)> {
        if self.items.is_empty() || offset_ms < 0 || offset_ms >= self.total_duration_ms() {
            return None;
        }
        let index = match self.start_time_offsets.binary_search(&offset_ms) {
            Ok(i) => i,
            Err(i) => i - 1,
        };
        Some((index, offset_ms - self.start_time_offsets[index]))
    }

    /// Validate the document invariants required before any write commits.
    pub fn validate(&self) -> Result<(), String> {
        if self.version == 0 || self.version > LINEUP_SCHEMA_VERSION {
            return Err(format!("unsupported schema version {}", self.version));
        }
        if self.start_time_offsets.len() != self.items.len() {
            return Err(format!(
                "offsets length {} != items length {}",
                self.start_time_offsets.len(),
                self.items.len()
            ));
        }
        let mut acc = 0;
        for (i, (item, offset)) in self.items.iter().zip(&self.start_time_offsets).enumerate() {
            if item.duration_ms() <= 0 {
                return Err(format!("item {i} has non-positive duration"));
            }
            if *offset != acc {
                return Err(format!("offset {i} is {offset}, expected {acc}"));
            }
            acc += item.duration_ms();
        }
        Ok(())
    }
}

/// Partial update merged by [`crate::store::LineupStore::save`]; only
/// supplied fields are touched.
#[derive(Debug, Clone, Default)]
pub struct LineupUpdate {
    pub items: Option<Vec<LineupItem>>,
    pub schedule: Option<Option<Schedule>>,
    pub on_demand: Option<Option<OnDemandConfig>>,
    pub pending_programs: Option<Vec<PendingProgram>>,
}

impl LineupUpdate {
    #[must_use]
    pub fn items(items: Vec<LineupItem>) -> Self {
        Self {
            items: Some(items),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn on_demand(config: Option<OnDemandConfig>) -> Self {
        Self {
            on_demand: Some(config),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn content(id: &str, duration_ms: i64) -> LineupItem {
        LineupItem::Content {
            program_id: ProgramId::from(id),
            duration_ms,
            group: None,
        }
    }

    #[test]
    fn test_offsets_are_cumulative_durations() {
        let mut lineup = Lineup {
            items: vec![content("a", 100), content("b", 250), LineupItem::Offline { duration_ms: 50 }],
            ..Lineup::default()
        };
        lineup.recompute_offsets();

        assert_eq!(lineup.start_time_offsets, vec![0, 100, 350]);
        assert_eq!(lineup.total_duration_ms(), 400);
        assert!(lineup.validate().is_ok());
    }

    #[test]
    fn test_recompute_from_join_point() {
        let mut lineup = Lineup {
            items: vec![content("a", 100), content("b", 200)],
            ..Lineup::default()
        };
        lineup.recompute_offsets();

        lineup.items.push(content("c", 300));
        lineup.items.push(LineupItem::Offline { duration_ms: 25 });
        lineup.recompute_offsets_from(2);

        assert_eq!(lineup.start_time_offsets, vec![0, 100, 300, 600]);
        assert!(lineup.validate().is_ok());
    }

    #[test]
    fn test_item_at_offset() {
        let mut lineup = Lineup {
            items: vec![content("a", 100), content("b", 200), content("c", 300)],
            ..Lineup::default()
        };
        lineup.recompute_offsets();

        assert_eq!(lineup.item_at_offset(0), Some((0, 0)));
        assert_eq!(lineup.item_at_offset(99), Some((0, 99)));
        assert_eq!(lineup.item_at_offset(100), Some((1, 0)));
        assert_eq!(lineup.item_at_offset(450), Some((2, 150)));
        assert_eq!(lineup.item_at_offset(600), None);
        assert_eq!(lineup.item_at_offset(-1), None);
    }

    #[test]
    fn test_validate_rejects_drifted_offsets() {
        let lineup = Lineup {
            items: vec![content("a", 100), content("b", 200)],
            start_time_offsets: vec![0, 150],
            ..Lineup::default()
        };
        assert!(lineup.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_duration() {
        let mut lineup = Lineup {
            items: vec![content("a", 0)],
            ..Lineup::default()
        };
        lineup.recompute_offsets();
        assert!(lineup.validate().is_err());
    }
}
