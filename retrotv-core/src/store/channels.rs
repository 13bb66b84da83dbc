//! Channel row storage contract.
//!
//! The core only needs transactional get/set of Channel rows and named
//! transcode configs; the trait keeps the backing store swappable.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::error::Result;
use crate::models::{Channel, ChannelId, TranscodeConfig};

#[async_trait]
pub trait ChannelRepository: Send + Sync {
    async fn get(&self, number: ChannelId) -> Result<Option<Channel>>;
    async fn upsert(&self, channel: Channel) -> Result<()>;
    async fn delete(&self, number: ChannelId) -> Result<()>;
    async fn list(&self) -> Result<Vec<Channel>>;

    /// Update only the duration of a channel row (lineup write side effect).
    async fn set_duration(&self, number: ChannelId, duration_ms: i64) -> Result<()>;

    async fn get_transcode_config(&self, name: &str) -> Result<Option<TranscodeConfig>>;
    async fn upsert_transcode_config(&self, config: TranscodeConfig) -> Result<()>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct ChannelsDocument {
    channels: BTreeMap<u32, Channel>,
    transcode_configs: BTreeMap<String, TranscodeConfig>,
}

/// Single-file JSON implementation, good for one process and small catalogs.
///
/// Every mutation rewrites the document atomically under one lock, which is
/// the transactional guarantee the contract asks for.
pub struct JsonChannelRepository {
    path: PathBuf,
    state: tokio::sync::Mutex<Option<ChannelsDocument>>,
}

impl JsonChannelRepository {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            path: dir.into().join("channels.json"),
            state: tokio::sync::Mutex::new(None),
        }
    }

    async fn doc<'a>(
        &self,
        guard: &'a mut Option<ChannelsDocument>,
    ) -> Result<&'a mut ChannelsDocument> {
        if guard.is_none() {
            let doc = match tokio::fs::read(&self.path).await {
                Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                    tracing::error!(path = %self.path.display(), "channels document corrupt: {e}");
                    ChannelsDocument::default()
                }),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => ChannelsDocument::default(),
                Err(e) => return Err(e.into()),
            };
            *guard = Some(doc);
        }
        Ok(guard.get_or_insert_with(ChannelsDocument::default))
    }

    async fn commit(&self, doc: &ChannelsDocument) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(doc)?;
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl ChannelRepository for JsonChannelRepository {
    async fn get(&self, number: ChannelId) -> Result<Option<Channel>> {
        let mut guard = self.state.lock().await;
        let doc = self.doc(&mut guard).await?;
        Ok(doc.channels.get(&number.as_u32()).cloned())
    }

    async fn upsert(&self, channel: Channel) -> Result<()> {
        let mut guard = self.state.lock().await;
        let doc = self.doc(&mut guard).await?;
        doc.channels.insert(channel.number.as_u32(), channel);
        self.commit(doc).await
    }

    async fn delete(&self, number: ChannelId) -> Result<()> {
        let mut guard = self.state.lock().await;
        let doc = self.doc(&mut guard).await?;
        doc.channels.remove(&number.as_u32());
        self.commit(doc).await
    }

    async fn list(&self) -> Result<Vec<Channel>> {
        let mut guard = self.state.lock().await;
        let doc = self.doc(&mut guard).await?;
        Ok(doc.channels.values().cloned().collect())
    }

    async fn set_duration(&self, number: ChannelId, duration_ms: i64) -> Result<()> {
        let mut guard = self.state.lock().await;
        let doc = self.doc(&mut guard).await?;
        if let Some(channel) = doc.channels.get_mut(&number.as_u32()) {
            channel.duration_ms = duration_ms;
            channel.updated_at = chrono::Utc::now();
            self.commit(doc).await?;
        }
        Ok(())
    }

    async fn get_transcode_config(&self, name: &str) -> Result<Option<TranscodeConfig>> {
        let mut guard = self.state.lock().await;
        let doc = self.doc(&mut guard).await?;
        Ok(doc.transcode_configs.get(name).cloned())
    }

    async fn upsert_transcode_config(&self, config: TranscodeConfig) -> Result<()> {
        let mut guard = self.state.lock().await;
        let doc = self.doc(&mut guard).await?;
        doc.transcode_configs.insert(config.name.clone(), config);
        self.commit(doc).await
    }
}
