//! Lineup materialization: scheduler output plus resolved pools become a
//! concrete lineup with the offset invariant every playback calculation
//! depends on.

use crate::error::Result;
use crate::models::{Lineup, LineupItem, PendingProgram};
use crate::resolver::ProgramPoolResolver;
use crate::scheduler::{PoolItemId, ScheduledEntry, SchedulerOutput};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterializeMode {
    /// Replace the whole lineup
    Replace,
    /// Concatenate and recompute offsets from the join point only
    Append,
}

/// Resolve scheduler output into the lineup, in place.
///
/// External references the resolver persists become content items; the rest
/// land as offline placeholders recorded in `pending_programs`, to be
/// spliced in by a later pass (see [`merge_pending`]).
pub async fn materialize(
    lineup: &mut Lineup,
    output: SchedulerOutput,
    resolver: &dyn ProgramPoolResolver,
    mode: MaterializeMode,
) -> Result<()> {
    let join = match mode {
        MaterializeMode::Replace => 0,
        MaterializeMode::Append => lineup.items.len(),
    };

    // Upsert every external reference in one batch, deduplicated by key.
    let mut externals: Vec<PendingProgram> = Vec::new();
    for (i, entry) in output.entries.iter().enumerate() {
        if let ScheduledEntry::Item(item) = entry {
            if let PoolItemId::External(key) = &item.id {
                if externals.iter().all(|p| &p.external_key != key) {
                    externals.push(PendingProgram {
                        external_key: key.clone(),
                        duration_ms: item.duration_ms,
                        item_index: join + i,
                        group: item.group.clone(),
                    });
                }
            }
        }
    }
    let resolved = if externals.is_empty() {
        std::collections::HashMap::new()
    } else {
        resolver.upsert(&externals).await?
    };

    let mut new_items = Vec::with_capacity(output.entries.len());
    let mut new_pending = Vec::new();
    for entry in output.entries {
        let index = join + new_items.len();
        match entry {
            ScheduledEntry::Flex { duration_ms } => {
                new_items.push(LineupItem::Offline { duration_ms });
            }
            ScheduledEntry::Redirect {
                channel,
                duration_ms,
            } => {
                new_items.push(LineupItem::Redirect {
                    channel,
                    duration_ms,
                });
            }
            ScheduledEntry::Item(item) => match item.id {
                PoolItemId::Resolved(program_id) => {
                    new_items.push(LineupItem::Content {
                        program_id,
                        duration_ms: item.duration_ms,
                        group: item.group,
                    });
                }
                PoolItemId::External(key) => {
                    if let Some(program_id) = resolved.get(&key) {
                        new_items.push(LineupItem::Content {
                            program_id: program_id.clone(),
                            duration_ms: item.duration_ms,
                            group: item.group,
                        });
                    } else {
                        // Placeholder keeps durations/offsets stable until
                        // the program resolves.
                        new_pending.push(PendingProgram {
                            external_key: key,
                            duration_ms: item.duration_ms,
                            item_index: index,
                            group: item.group,
                        });
                        new_items.push(LineupItem::Offline {
                            duration_ms: item.duration_ms,
                        });
                    }
                }
            },
        }
    }

    match mode {
        MaterializeMode::Replace => {
            lineup.items = new_items;
            lineup.pending_programs = new_pending;
            lineup.recompute_offsets();
        }
        MaterializeMode::Append => {
            lineup.items.extend(new_items);
            lineup.pending_programs.extend(new_pending);
            lineup.recompute_offsets_from(join);
        }
    }
    Ok(())
}

/// Retry the lineup's pending programs against the resolver, splicing any
/// that now persist into their placeholder positions. Durations are fixed at
/// schedule time, so a splice never moves offsets.
pub async fn merge_pending(
    lineup: &mut Lineup,
    resolver: &dyn ProgramPoolResolver,
) -> Result<usize> {
    if lineup.pending_programs.is_empty() {
        return Ok(0);
    }

    let resolved = resolver.upsert(&lineup.pending_programs).await?;
    let mut merged = 0usize;

    lineup.pending_programs.retain(|pending| {
        let Some(program_id) = resolved.get(&pending.external_key) else {
            return true;
        };
        let Some(item) = lineup.items.get_mut(pending.item_index) else {
            tracing::warn!(
                key = %pending.external_key,
                index = pending.item_index,
                "pending program points past lineup end, dropping"
            );
            return false;
        };
        if item.duration_ms() != pending.duration_ms {
            tracing::warn!(key = %pending.external_key, "pending duration drifted, dropping");
            return false;
        }
        *item = LineupItem::Content {
            program_id: program_id.clone(),
            duration_ms: pending.duration_ms,
            group: pending.group.clone(),
        };
        merged += 1;
        false
    });

    Ok(merged)
}
