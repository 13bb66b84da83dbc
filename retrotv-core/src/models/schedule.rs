//! Abstract schedule model.
//!
//! A Schedule never stores concrete items; slots reference programming by
//! class (show, movie, filler list, ...) and are resolved against program
//! pools only at materialization time.

use serde::{Deserialize, Serialize};

use super::id::ChannelId;

/// What class of programming a slot draws from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SlotProgramming {
    Show { show_id: String },
    Movie,
    CustomShow { id: String },
    FillerList { id: String },
    SmartCollection { id: String },
    Redirect { channel: ChannelId },
    Flex,
}

impl SlotProgramming {
    /// Flex and redirect slots have intrinsic content and never draw from a
    /// pool.
    #[must_use]
    pub const fn draws_from_pool(&self) -> bool {
        !matches!(self, Self::Flex | Self::Redirect { .. })
    }
}

/// Order in which a slot draws items from its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotOrder {
    /// Sequential cursor per pool
    Next,
    /// Draw without replacement until exhausted, then reshuffle
    Shuffle,
    /// Shuffle once, then sequential
    OrderedShuffle,
}

/// How much a slot draws before yielding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum FillMode {
    /// Draw until the next anchor or horizon
    Fill,
    /// Draw exactly N items
    Count { count: usize },
    /// Draw until the slot-local target, then flex-pad to the boundary
    Duration { target_ms: i64 },
}

/// Where remainder flex lands inside a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlexPreference {
    /// One flex item at slot end
    End,
    /// Remainder split evenly between drawn items
    Distribute,
}

/// Length of the repeating period a time schedule walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulePeriod {
    Day,
    Week,
}

impl SchedulePeriod {
    #[must_use]
    pub const fn duration_ms(self) -> i64 {
        match self {
            Self::Day => 24 * 60 * 60 * 1000,
            Self::Week => 7 * 24 * 60 * 60 * 1000,
        }
    }
}

/// A slot at a fixed offset inside a repeating period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSlot {
    /// Offset from the period start, in milliseconds
    pub offset_ms: i64,
    pub programming: SlotProgramming,
    pub order: SlotOrder,
    pub fill: FillMode,
    /// Set when the referenced show/list no longer resolves; the slot is
    /// excluded from drawing but stays visible in the data model.
    #[serde(default)]
    pub is_missing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSchedule {
    pub period: SchedulePeriod,
    /// Slots ordered by `offset_ms`
    pub slots: Vec<TimeSlot>,
    /// Snap slot/flex boundaries to round wall-clock marks (0 = no snapping)
    #[serde(default)]
    pub pad_ms: i64,
    #[serde(default = "default_flex_preference")]
    pub flex_preference: FlexPreference,
    /// Anchor the first cycle at the next midnight instead of now
    #[serde(default)]
    pub start_tomorrow: bool,
}

/// A weighted slot for random scheduling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomSlot {
    pub programming: SlotProgramming,
    pub order: SlotOrder,
    pub fill: FillMode,
    pub weight: u32,
    /// Slot cannot be drawn again until this much scheduled time has passed
    #[serde(default)]
    pub cooldown_ms: i64,
    /// Nominal duration drawn per visit (used by `FillMode::Duration`)
    #[serde(default)]
    pub duration_ms: i64,
    #[serde(default)]
    pub is_missing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomSchedule {
    pub slots: Vec<RandomSlot>,
    /// Scheduling horizon in days
    pub max_days: u32,
    /// Optional item-count ceiling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_items: Option<usize>,
    #[serde(default)]
    pub pad_ms: i64,
    #[serde(default = "default_flex_preference")]
    pub flex_preference: FlexPreference,
}

const fn default_flex_preference() -> FlexPreference {
    FlexPreference::End
}

/// Abstract per-channel schedule, resolved to a concrete lineup by the slot
/// scheduler and materializer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    Time(TimeSchedule),
    Random(RandomSchedule),
}
