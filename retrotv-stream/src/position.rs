//! Playback position calculation.
//!
//! Wall-clock channels derive their position from the epoch anchor and the
//! lineup's repeating cycle; on-demand channels use the viewing-progress
//! cursor instead.

use retrotv_core::models::{Channel, Lineup, LineupItem};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackPosition {
    pub item_index: usize,
    pub offset_into_item_ms: i64,
}

/// Position for a wall-clock channel at `now_ms`, or `None` for an empty
/// lineup.
#[must_use]
pub fn wall_clock_position(channel: &Channel, lineup: &Lineup, now_ms: i64) -> Option<PlaybackPosition> {
    let total = lineup.total_duration_ms();
    if total <= 0 {
        return None;
    }
    let cycle_offset = (now_ms - channel.start_time_ms).rem_euclid(total);
    position_at(lineup, cycle_offset)
}

/// Position for an on-demand channel: the cursor, wrapped into the cycle.
#[must_use]
pub fn cursor_position(lineup: &Lineup, cursor_ms: i64) -> Option<PlaybackPosition> {
    let total = lineup.total_duration_ms();
    if total <= 0 {
        return None;
    }
    position_at(lineup, cursor_ms.rem_euclid(total))
}

/// Pick the right calculation for the channel's mode.
#[must_use]
pub fn playback_position(channel: &Channel, lineup: &Lineup, now_ms: i64) -> Option<PlaybackPosition> {
    match &lineup.on_demand {
        Some(config) => cursor_position(lineup, config.cursor_ms),
        None => wall_clock_position(channel, lineup, now_ms),
    }
}

fn position_at(lineup: &Lineup, cycle_offset: i64) -> Option<PlaybackPosition> {
    let (item_index, offset_into_item_ms) = lineup.item_at_offset(cycle_offset)?;
    Some(PlaybackPosition {
        item_index,
        offset_into_item_ms,
    })
}

/// Whether the item at a position is a redirect that still needs one hop of
/// resolution. A redirect reached through another redirect plays as offline
/// filler; the hop itself is the session manager's job since it needs the
/// target channel's lineup.
#[must_use]
pub fn redirect_target(lineup: &Lineup, position: PlaybackPosition) -> Option<retrotv_core::models::ChannelId> {
    match lineup.items.get(position.item_index) {
        Some(LineupItem::Redirect { channel, .. }) => Some(*channel),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use retrotv_core::models::{ChannelId, OnDemandConfig, OnDemandState, ProgramId};

    fn content(id: &str, duration_ms: i64) -> LineupItem {
        LineupItem::Content {
            program_id: ProgramId::from(id),
            duration_ms,
            group: None,
        }
    }

    fn lineup_of(items: Vec<LineupItem>) -> Lineup {
        let mut lineup = Lineup {
            items,
            ..Lineup::default()
        };
        lineup.recompute_offsets();
        lineup
    }

    #[test]
    fn test_wall_clock_wraps_the_cycle() {
        let mut channel = Channel::new(ChannelId(1), "Test");
        channel.start_time_ms = 1_000;
        let lineup = lineup_of(vec![content("a", 600), content("b", 400)]);

        // 2.3 cycles after the anchor: offset 300 into the cycle.
        let pos = wall_clock_position(&channel, &lineup, 1_000 + 2_300).expect("position");
        assert_eq!(pos, PlaybackPosition { item_index: 0, offset_into_item_ms: 300 });

        // Before the anchor, rem_euclid keeps the offset positive.
        let pos = wall_clock_position(&channel, &lineup, 900).expect("position");
        assert_eq!(pos.item_index, 1);
        assert_eq!(pos.offset_into_item_ms, 300);
    }

    #[test]
    fn test_on_demand_uses_cursor_not_wall_clock() {
        let mut channel = Channel::new(ChannelId(1), "Test");
        channel.start_time_ms = 0;
        let mut lineup = lineup_of(vec![content("a", 600), content("b", 400)]);
        lineup.on_demand = Some(OnDemandConfig {
            state: OnDemandState::Paused,
            cursor_ms: 700,
            last_checkpoint: chrono::Utc::now(),
        });

        // Wall clock says item 0; the cursor says item 1.
        let pos = playback_position(&channel, &lineup, 100).expect("position");
        assert_eq!(pos, PlaybackPosition { item_index: 1, offset_into_item_ms: 100 });
    }

    #[test]
    fn test_empty_lineup_has_no_position() {
        let channel = Channel::new(ChannelId(1), "Test");
        let lineup = Lineup::default();
        assert!(wall_clock_position(&channel, &lineup, 0).is_none());
        assert!(cursor_position(&lineup, 0).is_none());
    }

    #[test]
    fn test_redirect_target_only_for_redirect_items() {
        let lineup = lineup_of(vec![
            content("a", 600),
            LineupItem::Redirect { channel: ChannelId(7), duration_ms: 400 },
        ]);

        let on_content = PlaybackPosition { item_index: 0, offset_into_item_ms: 10 };
        assert!(redirect_target(&lineup, on_content).is_none());

        let on_redirect = PlaybackPosition { item_index: 1, offset_into_item_ms: 10 };
        assert_eq!(redirect_target(&lineup, on_redirect), Some(ChannelId(7)));
    }
}
