//! Weighted program pools and slot draw policies.

use rand::seq::SliceRandom;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::models::{ProgramGroup, ProgramId, SlotOrder};

/// Identity of a pool item: either already persisted, or an external
/// reference the materializer still has to upsert.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolItemId {
    Resolved(ProgramId),
    External(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolItem {
    pub id: PoolItemId,
    pub duration_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<ProgramGroup>,
}

/// An ordered pool of candidate programs for one slot, with the draw state
/// each [`SlotOrder`] policy needs.
#[derive(Debug, Clone)]
pub struct ProgramPool {
    items: Vec<PoolItem>,
    /// Sequential position for `Next` and `OrderedShuffle`
    cursor: usize,
    /// Remaining indices for `Shuffle` (drawn without replacement)
    deck: Vec<usize>,
    /// One-time permutation for `OrderedShuffle`
    order: Option<Vec<usize>>,
}

impl ProgramPool {
    #[must_use]
    pub fn new(items: Vec<PoolItem>) -> Self {
        Self {
            items,
            cursor: 0,
            deck: Vec::new(),
            order: None,
        }
    }

    /// Start the sequential cursor mid-pool, used when appending to an
    /// existing lineup so `Next` draws continue where the lineup left off.
    #[must_use]
    pub fn with_cursor(mut self, cursor: usize) -> Self {
        if !self.items.is_empty() {
            self.cursor = cursor % self.items.len();
        }
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn items(&self) -> &[PoolItem] {
        &self.items
    }

    /// Shortest item duration, used to decide whether another draw can fit.
    #[must_use]
    pub fn min_duration_ms(&self) -> Option<i64> {
        self.items.iter().map(|i| i.duration_ms).min()
    }

    /// Draw the next item under the given order policy.
    pub fn draw(&mut self, order: SlotOrder, rng: &mut dyn RngCore) -> Option<PoolItem> {
        if self.items.is_empty() {
            return None;
        }
        let index = match order {
            SlotOrder::Next => {
                let i = self.cursor % self.items.len();
                self.cursor += 1;
                i
            }
            SlotOrder::Shuffle => {
                if self.deck.is_empty() {
                    self.deck = (0..self.items.len()).collect();
                    self.deck.shuffle(rng);
                }
                // deck is non-empty after the refill above
                self.deck.pop()?
            }
            SlotOrder::OrderedShuffle => {
                if self.order.is_none() {
                    let mut order: Vec<usize> = (0..self.items.len()).collect();
                    order.shuffle(rng);
                    self.order = Some(order);
                }
                let order = self.order.as_ref()?;
                let i = order[self.cursor % order.len()];
                self.cursor += 1;
                i
            }
        };
        self.items.get(index).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn pool(n: usize) -> ProgramPool {
        ProgramPool::new(
            (0..n)
                .map(|i| PoolItem {
                    id: PoolItemId::External(format!("e{i}")),
                    duration_ms: 1_000,
                    group: None,
                })
                .collect(),
        )
    }

    fn key(item: &PoolItem) -> String {
        match &item.id {
            PoolItemId::External(k) => k.clone(),
            PoolItemId::Resolved(id) => id.to_string(),
        }
    }

    #[test]
    fn test_next_is_a_wrapping_cursor() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut pool = pool(3);
        let drawn: Vec<String> = (0..5)
            .map(|_| key(&pool.draw(SlotOrder::Next, &mut rng).expect("draw")))
            .collect();
        assert_eq!(drawn, vec!["e0", "e1", "e2", "e0", "e1"]);
    }

    #[test]
    fn test_with_cursor_continues_mid_pool() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut pool = pool(3).with_cursor(2);
        assert_eq!(key(&pool.draw(SlotOrder::Next, &mut rng).expect("draw")), "e2");
        assert_eq!(key(&pool.draw(SlotOrder::Next, &mut rng).expect("draw")), "e0");
    }

    #[test]
    fn test_shuffle_draws_without_replacement() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut pool = pool(5);
        let mut first_round: Vec<String> = (0..5)
            .map(|_| key(&pool.draw(SlotOrder::Shuffle, &mut rng).expect("draw")))
            .collect();
        first_round.sort();
        assert_eq!(first_round, vec!["e0", "e1", "e2", "e3", "e4"]);

        // deck refills and keeps drawing
        assert!(pool.draw(SlotOrder::Shuffle, &mut rng).is_some());
    }

    #[test]
    fn test_ordered_shuffle_is_stable_after_first_shuffle() {
        let mut rng = StdRng::seed_from_u64(9);
        let mut pool = pool(4);
        let first_cycle: Vec<String> = (0..4)
            .map(|_| key(&pool.draw(SlotOrder::OrderedShuffle, &mut rng).expect("draw")))
            .collect();
        let second_cycle: Vec<String> = (0..4)
            .map(|_| key(&pool.draw(SlotOrder::OrderedShuffle, &mut rng).expect("draw")))
            .collect();
        assert_eq!(first_cycle, second_cycle);
    }

    #[test]
    fn test_empty_pool_draws_nothing() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut pool = ProgramPool::new(Vec::new());
        assert!(pool.draw(SlotOrder::Next, &mut rng).is_none());
        assert!(pool.draw(SlotOrder::Shuffle, &mut rng).is_none());
    }
}
