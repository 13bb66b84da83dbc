//! Time-slot scheduler: slots at fixed offsets inside a repeating day/week
//! period, filled from program pools under a draw-order policy.

use std::collections::HashMap;

use rand::RngCore;

use crate::models::{FillMode, FlexPreference, SlotProgramming, TimeSchedule, TimeSlot};

use super::{ProgramPool, ScheduledEntry, SchedulerOutput};

/// Build one full period of programming from a time schedule.
///
/// Every slot's entries sum to exactly its available duration, so the whole
/// output covers exactly one period when the slots leave no intentional gap
/// before the first slot offset.
pub fn schedule_time(
    schedule: &TimeSchedule,
    pools: &mut HashMap<usize, ProgramPool>,
    now_ms: i64,
    rng: &mut dyn RngCore,
) -> SchedulerOutput {
    let period_ms = schedule.period.duration_ms();
    let mut period_start_ms = now_ms - now_ms.rem_euclid(period_ms);
    if schedule.start_tomorrow {
        period_start_ms += period_ms;
    }

    // Walk slots in offset order; the schedule editor keeps them sorted but
    // a stored document may not be.
    let mut order: Vec<usize> = (0..schedule.slots.len()).collect();
    order.sort_by_key(|&i| schedule.slots[i].offset_ms);

    // Entries are emitted starting from the earliest slot, so the playback
    // anchor is that slot's wall-clock airtime, not the period boundary.
    let first_offset_ms = order
        .first()
        .map(|&i| schedule.slots[i].offset_ms)
        .unwrap_or(0);
    let cycle_start_ms = period_start_ms + first_offset_ms;

    let mut entries = Vec::new();
    for (walk, &slot_index) in order.iter().enumerate() {
        let slot = &schedule.slots[slot_index];
        let available = if walk + 1 < order.len() {
            schedule.slots[order[walk + 1]].offset_ms - slot.offset_ms
        } else {
            // Last slot wraps through the period boundary to the first slot.
            period_ms - slot.offset_ms + schedule.slots[order[0]].offset_ms
        };
        if available <= 0 {
            tracing::warn!(slot_index, available, "slot has no room, skipping");
            continue;
        }

        fill_slot(
            slot,
            pools.get_mut(&slot_index),
            available,
            schedule.pad_ms,
            schedule.flex_preference,
            rng,
            &mut entries,
        );
    }

    SchedulerOutput {
        entries,
        cycle_start_ms,
    }
}

/// Fill one slot's available duration; the pushed entries always sum to
/// exactly `available`.
fn fill_slot(
    slot: &TimeSlot,
    pool: Option<&mut ProgramPool>,
    available: i64,
    pad_ms: i64,
    flex_preference: FlexPreference,
    rng: &mut dyn RngCore,
    entries: &mut Vec<ScheduledEntry>,
) {
    match &slot.programming {
        SlotProgramming::Flex => {
            entries.push(ScheduledEntry::Flex {
                duration_ms: available,
            });
            return;
        }
        SlotProgramming::Redirect { channel } => {
            entries.push(ScheduledEntry::Redirect {
                channel: *channel,
                duration_ms: available,
            });
            return;
        }
        _ => {}
    }

    if slot.is_missing {
        entries.push(ScheduledEntry::Flex {
            duration_ms: available,
        });
        return;
    }

    let Some(pool) = pool.filter(|p| !p.is_empty()) else {
        tracing::warn!(offset_ms = slot.offset_ms, "slot pool is empty, degrading to flex");
        entries.push(ScheduledEntry::Flex {
            duration_ms: available,
        });
        return;
    };

    let (target, max_count) = match slot.fill {
        FillMode::Fill => (available, usize::MAX),
        FillMode::Count { count } => (available, count),
        FillMode::Duration { target_ms } => (target_ms.min(available), usize::MAX),
    };

    let mut slot_entries: Vec<ScheduledEntry> = Vec::new();
    let mut drawn_count = 0usize;
    let mut cum = 0i64;

    while drawn_count < max_count {
        match pool.min_duration_ms() {
            Some(min) if cum + min <= target => {}
            _ => break,
        }
        let Some(item) = pool.draw(slot.order, rng) else {
            break;
        };
        if cum + item.duration_ms > target {
            // Drawn but does not fit; the draw cursor stays advanced.
            break;
        }
        cum += item.duration_ms;
        drawn_count += 1;
        slot_entries.push(ScheduledEntry::Item(item));

        // Snap the next boundary to a round wall-clock mark.
        if pad_ms > 0 {
            let into_period = slot.offset_ms + cum;
            let rem = into_period.rem_euclid(pad_ms);
            if rem != 0 {
                let pad = pad_ms - rem;
                if cum + pad <= target {
                    cum += pad;
                    slot_entries.push(ScheduledEntry::Flex { duration_ms: pad });
                }
            }
        }
    }

    let remainder = available - cum;
    if remainder > 0 {
        match flex_preference {
            FlexPreference::End => {
                slot_entries.push(ScheduledEntry::Flex {
                    duration_ms: remainder,
                });
            }
            FlexPreference::Distribute => distribute_flex(&mut slot_entries, remainder),
        }
    }

    entries.append(&mut slot_entries);
}

/// Split `remainder` evenly into flex chunks after each drawn item; the last
/// chunk absorbs the division remainder so the total stays exact.
fn distribute_flex(slot_entries: &mut Vec<ScheduledEntry>, remainder: i64) {
    let item_positions: Vec<usize> = slot_entries
        .iter()
        .enumerate()
        .filter(|(_, e)| matches!(e, ScheduledEntry::Item(_)))
        .map(|(i, _)| i)
        .collect();

    if item_positions.is_empty() {
        slot_entries.push(ScheduledEntry::Flex {
            duration_ms: remainder,
        });
        return;
    }

    let n = item_positions.len() as i64;
    let chunk = remainder / n;
    let extra = remainder % n;

    // Insert back-to-front so earlier positions stay valid.
    for (k, &pos) in item_positions.iter().enumerate().rev() {
        let mut duration_ms = chunk;
        if k as i64 == n - 1 {
            duration_ms += extra;
        }
        if duration_ms > 0 {
            slot_entries.insert(pos + 1, ScheduledEntry::Flex { duration_ms });
        }
    }
}
