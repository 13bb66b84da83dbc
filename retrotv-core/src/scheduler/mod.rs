//! Slot scheduling: turns an abstract per-channel [`Schedule`] into an
//! ordered, time-addressed sequence of scheduled entries.
//!
//! The schedulers are deterministic given an injected random source; all
//! wall-clock input arrives as an explicit `now_ms` argument.

pub mod pool;
pub mod random;
pub mod time;
pub mod worker;

pub use pool::{PoolItem, PoolItemId, ProgramPool};
pub use random::schedule_random;
pub use time::schedule_time;
pub use worker::ScheduleWorkerPool;

use crate::models::{ChannelId, Schedule};
use rand::RngCore;
use std::collections::HashMap;

/// One entry produced by a scheduler, not yet resolved to a persisted item.
#[derive(Debug, Clone, PartialEq)]
pub enum ScheduledEntry {
    /// A drawn program from a slot's pool
    Item(PoolItem),
    /// Flex filler covering a gap or remainder
    Flex { duration_ms: i64 },
    /// The slot plays another channel
    Redirect { channel: ChannelId, duration_ms: i64 },
}

impl ScheduledEntry {
    #[must_use]
    pub fn duration_ms(&self) -> i64 {
        match self {
            Self::Item(item) => item.duration_ms,
            Self::Flex { duration_ms } | Self::Redirect { duration_ms, .. } => *duration_ms,
        }
    }
}

/// Scheduler result: ordered entries plus the absolute cycle start.
#[derive(Debug, Clone)]
pub struct SchedulerOutput {
    pub entries: Vec<ScheduledEntry>,
    /// Epoch milliseconds the first entry is anchored at
    pub cycle_start_ms: i64,
}

impl SchedulerOutput {
    #[must_use]
    pub fn total_duration_ms(&self) -> i64 {
        self.entries.iter().map(ScheduledEntry::duration_ms).sum()
    }
}

/// Dispatch a schedule to the matching scheduler.
///
/// `pools` is keyed by slot index within the schedule's slot list.
pub fn build_schedule(
    schedule: &Schedule,
    pools: &mut HashMap<usize, ProgramPool>,
    now_ms: i64,
    rng: &mut dyn RngCore,
) -> SchedulerOutput {
    match schedule {
        Schedule::Time(time) => schedule_time(time, pools, now_ms, rng),
        Schedule::Random(random) => schedule_random(random, pools, now_ms, rng),
    }
}
