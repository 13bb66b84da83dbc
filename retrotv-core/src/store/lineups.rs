//! Durable, race-free per-channel lineup persistence.
//!
//! One lazily-created, reused exclusive lock per channel id; every read and
//! write for that channel funnels through it. The cached document lives on
//! the same lock-table entry, so a cache hit never races a writer.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value as JsonValue;
use tokio::io::AsyncWriteExt;

use crate::error::{Error, Result};
use crate::models::{ChannelId, Lineup, LineupUpdate};

/// Per-channel entry in the lock table: exclusive lock + cached document.
struct ChannelSlot {
    lock: tokio::sync::Mutex<()>,
    cached: parking_lot::Mutex<Option<Lineup>>,
}

impl ChannelSlot {
    fn new() -> Self {
        Self {
            lock: tokio::sync::Mutex::new(()),
            cached: parking_lot::Mutex::new(None),
        }
    }
}

/// File-backed lineup document store with per-channel locking and caching.
pub struct LineupStore {
    dir: PathBuf,
    slots: DashMap<ChannelId, Arc<ChannelSlot>>,
    max_repair_passes: u32,
}

impl LineupStore {
    pub fn new(dir: impl Into<PathBuf>, max_repair_passes: u32) -> Self {
        Self {
            dir: dir.into(),
            slots: DashMap::new(),
            max_repair_passes,
        }
    }

    fn slot(&self, channel: ChannelId) -> Arc<ChannelSlot> {
        self.slots
            .entry(channel)
            .or_insert_with(|| Arc::new(ChannelSlot::new()))
            .clone()
    }

    fn path(&self, channel: ChannelId) -> PathBuf {
        self.dir.join(format!("{channel}.json"))
    }

    fn deleted_path(&self, channel: ChannelId) -> PathBuf {
        self.dir.join(format!("{channel}.json.deleted"))
    }

    /// Load a channel's lineup, creating an empty default on first access.
    ///
    /// Returns the cached copy unless `force_read` is set. A document that
    /// fails validation even after bounded default-merge repair degrades to
    /// the empty default (logged as corruption, never a crash).
    pub async fn load(&self, channel: ChannelId, force_read: bool) -> Result<Lineup> {
        let slot = self.slot(channel);
        let _guard = slot.lock.lock().await;

        if !force_read {
            let cached = slot.cached.lock().clone();
            if let Some(cached) = cached {
                return Ok(cached);
            }
        }

        let lineup = self.read_or_create(channel).await?;
        *slot.cached.lock() = Some(lineup.clone());
        Ok(lineup)
    }

    /// Merge a partial update into the stored lineup and commit it.
    ///
    /// Only supplied fields are touched; an `items` update recomputes the
    /// offsets array. The merged document is validated before anything is
    /// written, so a rejected save leaves disk and cache untouched.
    pub async fn save(&self, channel: ChannelId, update: LineupUpdate) -> Result<Lineup> {
        let slot = self.slot(channel);
        let _guard = slot.lock.lock().await;

        // Bound scope for the cache guard; it must not live across an await.
        let cached = slot.cached.lock().clone();
        let mut lineup = match cached {
            Some(cached) => cached,
            None => self.read_or_create(channel).await?,
        };

        if let Some(items) = update.items {
            lineup.items = items;
            lineup.recompute_offsets();
        }
        if let Some(schedule) = update.schedule {
            lineup.schedule = schedule;
        }
        if let Some(on_demand) = update.on_demand {
            lineup.on_demand = on_demand;
        }
        if let Some(pending) = update.pending_programs {
            lineup.pending_programs = pending;
        }
        lineup.last_updated = chrono::Utc::now();

        lineup
            .validate()
            .map_err(|reason| Error::InvalidInput(format!("lineup for {channel}: {reason}")))?;

        self.write_atomic(channel, &lineup).await?;
        *slot.cached.lock() = Some(lineup.clone());
        Ok(lineup)
    }

    /// Soft-delete via rename so an owning transaction can roll back.
    pub async fn mark_for_deletion(&self, channel: ChannelId) -> Result<()> {
        let slot = self.slot(channel);
        let _guard = slot.lock.lock().await;

        let path = self.path(channel);
        if tokio::fs::try_exists(&path).await? {
            tokio::fs::rename(&path, self.deleted_path(channel)).await?;
        }
        *slot.cached.lock() = None;
        tracing::info!(%channel, "lineup marked for deletion");
        Ok(())
    }

    /// Undo [`mark_for_deletion`](Self::mark_for_deletion).
    pub async fn restore(&self, channel: ChannelId) -> Result<()> {
        let slot = self.slot(channel);
        let _guard = slot.lock.lock().await;

        let deleted = self.deleted_path(channel);
        if tokio::fs::try_exists(&deleted).await? {
            tokio::fs::rename(&deleted, self.path(channel)).await?;
            tracing::info!(%channel, "lineup restored");
        }
        Ok(())
    }

    async fn read_or_create(&self, channel: ChannelId) -> Result<Lineup> {
        let path = self.path(channel);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(self.parse_with_repair(channel, &bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let lineup = Lineup::default();
                self.write_atomic(channel, &lineup).await?;
                Ok(lineup)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Parse a stored document, attempting bounded default-merge repair
    /// before degrading to the empty default.
    fn parse_with_repair(&self, channel: ChannelId, bytes: &[u8]) -> Lineup {
        match serde_json::from_slice::<Lineup>(bytes) {
            Ok(lineup) if lineup.validate().is_ok() => return lineup,
            Ok(_) | Err(_) => {}
        }

        let stored: JsonValue = serde_json::from_slice(bytes).unwrap_or(JsonValue::Null);
        let mut candidate = stored;
        for pass in 0..self.max_repair_passes {
            candidate = repair_pass(pass, &candidate);
            if let Ok(lineup) = serde_json::from_value::<Lineup>(candidate.clone()) {
                let mut lineup = lineup;
                lineup.recompute_offsets();
                if lineup.validate().is_ok() {
                    tracing::warn!(%channel, pass, "lineup repaired by default merge");
                    return lineup;
                }
            }
        }

        tracing::error!(%channel, "lineup corrupt beyond repair, degrading to empty");
        Lineup::default()
    }

    async fn write_atomic(&self, channel: ChannelId, lineup: &Lineup) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let tmp = self.dir.join(format!("{channel}.json.tmp"));

        let bytes = serde_json::to_vec_pretty(lineup)?;
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, self.path(channel)).await?;
        Ok(())
    }
}

/// One bounded repair attempt: overlay the stored object's known fields onto
/// schema defaults (pass 0), then additionally drop malformed items (pass 1+).
fn repair_pass(pass: u32, stored: &JsonValue) -> JsonValue {
    let mut base = serde_json::to_value(Lineup::default()).unwrap_or_default();
    let (Some(base_map), Some(stored_map)) = (base.as_object().cloned(), stored.as_object())
    else {
        return base;
    };

    let mut merged = base_map;
    for (key, value) in stored_map {
        if merged.contains_key(key) && !value.is_null() {
            merged.insert(key.clone(), value.clone());
        }
    }

    if pass > 0 {
        if let Some(items) = merged.get("items").and_then(JsonValue::as_array).cloned() {
            let kept: Vec<JsonValue> = items
                .into_iter()
                .filter(|item| {
                    serde_json::from_value::<crate::models::LineupItem>(item.clone())
                        .map(|i| i.duration_ms() > 0)
                        .unwrap_or(false)
                })
                .collect();
            merged.insert("items".to_string(), JsonValue::Array(kept));
        }
    }

    // Stored offsets are never trusted here; the caller recomputes them
    // before validating.
    merged.insert("start_time_offsets".to_string(), JsonValue::Array(Vec::new()));

    base = JsonValue::Object(merged);
    base
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LineupItem, ProgramId};

    fn content(id: &str, duration_ms: i64) -> LineupItem {
        LineupItem::Content {
            program_id: ProgramId::from(id),
            duration_ms,
            group: None,
        }
    }

    fn store(dir: &tempfile::TempDir) -> LineupStore {
        LineupStore::new(dir.path(), 2)
    }

    #[tokio::test]
    async fn test_first_load_creates_empty_default() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir);

        let lineup = store.load(ChannelId(1), false).await.expect("load");
        assert!(lineup.items.is_empty());
        assert!(dir.path().join("1.json").exists());
    }

    #[tokio::test]
    async fn test_load_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir);

        store
            .save(ChannelId(1), LineupUpdate::items(vec![content("a", 100)]))
            .await
            .expect("save");

        let first = store.load(ChannelId(1), false).await.expect("load");
        let second = store.load(ChannelId(1), false).await.expect("load");
        assert_eq!(first.items, second.items);
        assert_eq!(first.start_time_offsets, second.start_time_offsets);
        assert_eq!(first.last_updated, second.last_updated);
    }

    #[tokio::test]
    async fn test_store_futures_run_on_spawned_tasks() {
        // tokio::spawn requires Send futures, so this is also a guard
        // against holding a sync lock guard across an await point.
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(store(&dir));

        let writer = Arc::clone(&store);
        tokio::spawn(async move {
            writer
                .save(ChannelId(2), LineupUpdate::items(vec![content("a", 100)]))
                .await
        })
        .await
        .expect("join")
        .expect("save");

        let reader = Arc::clone(&store);
        let lineup = tokio::spawn(async move { reader.load(ChannelId(2), false).await })
            .await
            .expect("join")
            .expect("load");
        assert_eq!(lineup.items.len(), 1);
    }

    #[tokio::test]
    async fn test_save_items_recomputes_offsets() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir);

        let lineup = store
            .save(
                ChannelId(7),
                LineupUpdate::items(vec![content("a", 100), content("b", 200)]),
            )
            .await
            .expect("save");

        assert_eq!(lineup.start_time_offsets, vec![0, 100]);
        assert_eq!(lineup.total_duration_ms(), 300);

        // other fields untouched by an items-only update
        assert!(lineup.schedule.is_none());
    }

    #[tokio::test]
    async fn test_rejected_save_persists_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir);

        store
            .save(ChannelId(3), LineupUpdate::items(vec![content("a", 100)]))
            .await
            .expect("save");

        let err = store
            .save(ChannelId(3), LineupUpdate::items(vec![content("bad", 0)]))
            .await
            .expect_err("zero duration must be rejected");
        assert!(matches!(err, Error::InvalidInput(_)));

        let lineup = store.load(ChannelId(3), true).await.expect("load");
        assert_eq!(lineup.items.len(), 1);
        assert_eq!(lineup.items[0].duration_ms(), 100);
    }

    #[tokio::test]
    async fn test_mark_for_deletion_and_restore() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir);

        store
            .save(ChannelId(9), LineupUpdate::items(vec![content("a", 100)]))
            .await
            .expect("save");

        store.mark_for_deletion(ChannelId(9)).await.expect("delete");
        assert!(!dir.path().join("9.json").exists());
        assert!(dir.path().join("9.json.deleted").exists());

        store.restore(ChannelId(9)).await.expect("restore");
        let lineup = store.load(ChannelId(9), true).await.expect("load");
        assert_eq!(lineup.items.len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_document_degrades_to_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("4.json"), b"{not json at all").expect("write");

        let store = store(&dir);
        let lineup = store.load(ChannelId(4), true).await.expect("load");
        assert!(lineup.items.is_empty());
    }

    #[tokio::test]
    async fn test_drifted_offsets_repaired_by_default_merge() {
        let dir = tempfile::tempdir().expect("tempdir");
        let doc = serde_json::json!({
            "items": [{"type": "offline", "duration_ms": 500}],
            "start_time_offsets": [42],
            "version": 1,
            "last_updated": chrono::Utc::now(),
        });
        std::fs::write(
            dir.path().join("5.json"),
            serde_json::to_vec(&doc).expect("json"),
        )
        .expect("write");

        let store = store(&dir);
        let lineup = store.load(ChannelId(5), true).await.expect("load");
        assert_eq!(lineup.items.len(), 1);
        assert_eq!(lineup.start_time_offsets, vec![0]);
    }
}
