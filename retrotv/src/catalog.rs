//! File-backed program catalog.
//!
//! A single JSON document describes what the media library offers: shows
//! with their episodes, a movie list, and the named filler/custom/smart
//! groupings schedules can draw from. Entry paths double as program ids;
//! playback resolves them under the configured media root.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use retrotv_core::models::{PendingProgram, ProgramGroup, ProgramId, SlotProgramming};
use retrotv_core::resolver::ProgramPoolResolver;
use retrotv_core::scheduler::{PoolItem, PoolItemId, ProgramPool};
use retrotv_core::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Path relative to the media root; also the program's identity
    pub path: String,
    pub duration_ms: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogDocument {
    pub shows: HashMap<String, Vec<CatalogEntry>>,
    pub movies: Vec<CatalogEntry>,
    pub filler_lists: HashMap<String, Vec<CatalogEntry>>,
    pub custom_shows: HashMap<String, Vec<CatalogEntry>>,
    pub smart_collections: HashMap<String, Vec<CatalogEntry>>,
}

pub struct JsonCatalog {
    doc: CatalogDocument,
}

impl JsonCatalog {
    /// Load `catalog.json` from the data directory; a missing file yields
    /// an empty catalog so a fresh install still starts.
    pub async fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let path = dir.as_ref().join("catalog.json");
        let doc = match tokio::fs::read(&path).await {
            Ok(raw) => serde_json::from_slice(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no catalog file, starting empty");
                CatalogDocument::default()
            }
            Err(e) => return Err(Error::Io(e)),
        };
        Ok(Self { doc })
    }

    pub fn from_document(doc: CatalogDocument) -> Self {
        Self { doc }
    }

    fn pool_of(entries: &[CatalogEntry], group: Option<ProgramGroup>) -> ProgramPool {
        ProgramPool::new(
            entries
                .iter()
                .map(|entry| PoolItem {
                    id: PoolItemId::Resolved(ProgramId::from(entry.path.as_str())),
                    duration_ms: entry.duration_ms,
                    group: group.clone(),
                })
                .collect(),
        )
    }

    fn named(
        map: &HashMap<String, Vec<CatalogEntry>>,
        id: &str,
        kind: &str,
        group: Option<ProgramGroup>,
    ) -> Result<ProgramPool> {
        match map.get(id) {
            Some(entries) => Ok(Self::pool_of(entries, group)),
            None => Err(Error::NotFound(format!("{kind} '{id}'"))),
        }
    }
}

#[async_trait]
impl ProgramPoolResolver for JsonCatalog {
    async fn resolve_group(&self, programming: &SlotProgramming) -> Result<ProgramPool> {
        match programming {
            SlotProgramming::Show { show_id } => {
                Self::named(&self.doc.shows, show_id, "show", None)
            }
            SlotProgramming::Movie => Ok(Self::pool_of(&self.doc.movies, None)),
            SlotProgramming::FillerList { id } => Self::named(
                &self.doc.filler_lists,
                id,
                "filler list",
                Some(ProgramGroup::FillerList { id: id.clone() }),
            ),
            SlotProgramming::CustomShow { id } => Self::named(
                &self.doc.custom_shows,
                id,
                "custom show",
                Some(ProgramGroup::CustomShow { id: id.clone() }),
            ),
            SlotProgramming::SmartCollection { id } => Self::named(
                &self.doc.smart_collections,
                id,
                "smart collection",
                Some(ProgramGroup::SmartCollection { id: id.clone() }),
            ),
            SlotProgramming::Redirect { .. } | SlotProgramming::Flex => Err(Error::InvalidInput(
                "slot programming has no program pool".to_string(),
            )),
        }
    }

    /// Catalog paths are already stable identities, so every external key
    /// resolves to itself.
    async fn upsert(&self, programs: &[PendingProgram]) -> Result<HashMap<String, ProgramId>> {
        Ok(programs
            .iter()
            .map(|p| (p.external_key.clone(), ProgramId::from(p.external_key.as_str())))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, duration_ms: i64) -> CatalogEntry {
        CatalogEntry {
            path: path.to_string(),
            duration_ms,
        }
    }

    fn catalog() -> JsonCatalog {
        let mut doc = CatalogDocument::default();
        doc.shows.insert(
            "cheers".to_string(),
            vec![entry("cheers/s01e01.mkv", 1_320_000)],
        );
        doc.filler_lists
            .insert("ads".to_string(), vec![entry("ads/spot1.mp4", 30_000)]);
        JsonCatalog::from_document(doc)
    }

    #[tokio::test]
    async fn test_show_resolves_to_its_episodes() {
        let pool = catalog()
            .resolve_group(&SlotProgramming::Show {
                show_id: "cheers".to_string(),
            })
            .await
            .expect("pool");
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.items()[0].duration_ms, 1_320_000);
        assert!(pool.items()[0].group.is_none());
    }

    #[tokio::test]
    async fn test_filler_items_carry_their_group() {
        let pool = catalog()
            .resolve_group(&SlotProgramming::FillerList {
                id: "ads".to_string(),
            })
            .await
            .expect("pool");
        assert_eq!(
            pool.items()[0].group,
            Some(ProgramGroup::FillerList {
                id: "ads".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_unknown_show_is_not_found() {
        let err = catalog()
            .resolve_group(&SlotProgramming::Show {
                show_id: "gone".to_string(),
            })
            .await
            .expect_err("missing");
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_missing_catalog_file_starts_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let catalog = JsonCatalog::load(dir.path()).await.expect("load");
        let pool = catalog
            .resolve_group(&SlotProgramming::Movie)
            .await
            .expect("pool");
        assert!(pool.is_empty());
    }
}
