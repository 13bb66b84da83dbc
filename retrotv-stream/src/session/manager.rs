//! Session registry and lifecycle.
//!
//! `get_or_create` is single-flight per key: concurrent viewers of the
//! same channel and mode share one session and exactly one backing
//! process. A per-key creation lock plus a double check on the registry
//! closes the race without holding a global lock across the spawn.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use retrotv_core::config::StreamingConfig;
use retrotv_core::models::{Channel, ChannelId, Lineup, LineupItem, StreamMode, TranscodeConfig};
use retrotv_core::store::{ChannelRepository, LineupStore};

use crate::error::{SessionError, SessionResult};
use crate::ffmpeg::{SpawnRequest, Spawner, StreamProcess};
use crate::ondemand::OnDemandController;
use crate::position::{cursor_position, redirect_target, wall_clock_position, PlaybackPosition};
use crate::session::{epoch_ms, run_segmenter, Session, SessionKey, SessionState};

/// Synthesized source played where the lineup has nothing to show.
const OFFLINE_SOURCE: &str = "lavfi:smptebars=size=1280x720:rate=30";

pub struct SessionManager {
    sessions: DashMap<SessionKey, Arc<Session>>,
    creation_locks: DashMap<SessionKey, Arc<Mutex<()>>>,
    channels: Arc<dyn ChannelRepository>,
    lineups: Arc<LineupStore>,
    ondemand: Arc<OnDemandController>,
    spawner: Arc<dyn Spawner>,
    config: StreamingConfig,
    cancel: CancellationToken,
}

impl SessionManager {
    pub fn new(
        channels: Arc<dyn ChannelRepository>,
        lineups: Arc<LineupStore>,
        ondemand: Arc<OnDemandController>,
        spawner: Arc<dyn Spawner>,
        config: StreamingConfig,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            creation_locks: DashMap::new(),
            channels,
            lineups,
            ondemand,
            spawner,
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Fetch the live session for a key, starting one if none exists.
    pub async fn get_or_create(
        self: &Arc<Self>,
        channel: ChannelId,
        mode: StreamMode,
    ) -> SessionResult<Arc<Session>> {
        let key = (channel, mode);

        if let Some(session) = self.live_session(&key) {
            return Ok(session);
        }

        let lock = self
            .creation_locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // A racing caller may have created it while we waited.
        if let Some(session) = self.live_session(&key) {
            return Ok(session);
        }

        let session = self.create_session(key).await?;
        self.sessions.insert(key, session.clone());
        Ok(session)
    }

    pub fn get(&self, channel: ChannelId, mode: StreamMode) -> Option<Arc<Session>> {
        self.live_session(&(channel, mode))
    }

    fn live_session(&self, key: &SessionKey) -> Option<Arc<Session>> {
        let session = self.sessions.get(key)?;
        if session.state() == SessionState::Ended {
            return None;
        }
        Some(session.clone())
    }

    async fn create_session(self: &Arc<Self>, key: SessionKey) -> SessionResult<Arc<Session>> {
        let (channel_id, mode) = key;
        let channel = self
            .channels
            .get(channel_id)
            .await?
            .ok_or(SessionError::ChannelNotFound(channel_id.as_u32()))?;
        let lineup = self.lineups.load(channel_id, false).await?;
        let transcode = self.transcode_config(&channel).await?;

        // On-demand channels resume from their cursor and start advancing
        // it; wall-clock channels derive position from the epoch anchor.
        let now_ms = epoch_ms();
        let resumed_cursor = self.ondemand.resume(channel_id).await?;
        let position = match resumed_cursor {
            Some(cursor_ms) => cursor_position(&lineup, cursor_ms),
            None => wall_clock_position(&channel, &lineup, now_ms),
        };

        let (input, seek_ms) = match position {
            Some(position) => self.resolve_input(&lineup, position, now_ms).await?,
            None => {
                tracing::warn!(channel = %channel_id, "empty lineup, playing offline source");
                (OFFLINE_SOURCE.to_string(), 0)
            }
        };

        let workdir = self
            .config
            .session_dir
            .join(format!("{channel_id}-{mode}"));
        tokio::fs::create_dir_all(&workdir)
            .await
            .map_err(|e| SessionError::Generic(anyhow::anyhow!("session workdir: {e}")))?;

        let request = SpawnRequest {
            ffmpeg_path: self.config.ffmpeg_path.clone(),
            transcode,
            mode,
            input,
            seek_ms,
            workdir: workdir.clone(),
        };
        tracing::info!(
            channel = %channel_id,
            %mode,
            input = %request.input,
            seek_ms,
            "starting session"
        );

        let cancel = self.cancel.child_token();
        let session = Arc::new(Session::new(key, workdir, cancel));

        let mut process = self.spawner.spawn(&request).await?;

        // The backing process must produce output promptly or the session
        // is declared dead before any viewer ever buffers on it.
        let first_output =
            std::time::Duration::from_secs(self.config.first_output_timeout_seconds);
        let first_chunk = match tokio::time::timeout(first_output, process.next_chunk()).await {
            Ok(Ok(Some(chunk))) => chunk,
            Ok(Ok(None)) => {
                let _ = process.kill().await;
                self.ondemand.pause(channel_id).await?;
                return Err(SessionError::Generic(anyhow::anyhow!(
                    "backing process exited before producing output"
                )));
            }
            Ok(Err(e)) => {
                let _ = process.kill().await;
                self.ondemand.pause(channel_id).await?;
                return Err(SessionError::Generic(anyhow::anyhow!(
                    "backing process read failed: {e}"
                )));
            }
            Err(_) => {
                let _ = process.kill().await;
                self.ondemand.pause(channel_id).await?;
                return Err(SessionError::Generic(anyhow::anyhow!(
                    "no output within {}s",
                    self.config.first_output_timeout_seconds
                )));
            }
        };

        session.set_state(SessionState::Running);

        if matches!(mode, StreamMode::Hls | StreamMode::HlsSlower) {
            // Subscribe before the first broadcast so no output is missed.
            let stream = session.subscribe();
            tokio::spawn(run_segmenter(
                session.clone(),
                stream,
                self.config.hls_window_segments,
            ));
        }

        session.broadcast(first_chunk);
        tokio::spawn(pump(session.clone(), process));

        Ok(session)
    }

    async fn transcode_config(&self, channel: &Channel) -> SessionResult<TranscodeConfig> {
        match self
            .channels
            .get_transcode_config(&channel.transcode_config)
            .await?
        {
            Some(config) => Ok(config),
            None if channel.transcode_config == "default" => Ok(TranscodeConfig::default()),
            None => Err(SessionError::TranscodeConfigNotFound(
                channel.transcode_config.clone(),
            )),
        }
    }

    /// Turn a lineup position into the spawn input, following at most one
    /// redirect hop. A redirect landing on another redirect, or on a
    /// channel with nothing to play, degrades to the offline source.
    async fn resolve_input(
        &self,
        lineup: &Lineup,
        position: PlaybackPosition,
        now_ms: i64,
    ) -> SessionResult<(String, i64)> {
        if let Some(target) = redirect_target(lineup, position) {
            let Some(target_channel) = self.channels.get(target).await? else {
                tracing::warn!(%target, "redirect to unknown channel, playing offline source");
                return Ok((OFFLINE_SOURCE.to_string(), 0));
            };
            let target_lineup = self.lineups.load(target, false).await?;
            let Some(target_position) =
                wall_clock_position(&target_channel, &target_lineup, now_ms)
            else {
                return Ok((OFFLINE_SOURCE.to_string(), 0));
            };
            return Ok(self.input_for_item(&target_lineup, target_position));
        }
        Ok(self.input_for_item(lineup, position))
    }

    fn input_for_item(&self, lineup: &Lineup, position: PlaybackPosition) -> (String, i64) {
        match lineup.items.get(position.item_index) {
            Some(LineupItem::Content { program_id, .. }) => (
                self.config
                    .media_root
                    .join(program_id.as_str())
                    .to_string_lossy()
                    .into_owned(),
                position.offset_into_item_ms,
            ),
            // Offline blocks and unresolved redirects both play filler.
            _ => (OFFLINE_SOURCE.to_string(), 0),
        }
    }

    /// Record a viewer heartbeat. Returns false when no live session or
    /// connection matches.
    pub fn heartbeat(&self, channel: ChannelId, mode: StreamMode, token: &str) -> bool {
        match self.live_session(&(channel, mode)) {
            Some(session) => session.record_heartbeat(token),
            None => false,
        }
    }

    /// Tear a session down immediately, skipping the idle grace period.
    pub async fn stop_session(&self, channel: ChannelId, mode: StreamMode) -> bool {
        let Some((key, session)) = self.sessions.remove(&(channel, mode)) else {
            return false;
        };
        self.teardown(key, session).await;
        true
    }

    /// One reaper pass: prune stale connections, then tear down sessions
    /// that have been idle past the grace period.
    pub async fn sweep_once(&self, now_ms: i64) {
        let timeout_ms = (self.config.heartbeat_timeout_seconds * 1_000) as i64;
        let mut doomed: Vec<SessionKey> = Vec::new();

        for entry in self.sessions.iter() {
            let session = entry.value();
            let pruned = session.prune_stale(now_ms, timeout_ms);
            if pruned > 0 {
                tracing::debug!(session = ?session.key, pruned, "pruned stale connections");
            }
            let drained = session.state() == SessionState::Draining
                || session.state() == SessionState::Ended;
            let idle_past_grace = session
                .idle_for_ms(now_ms)
                .is_some_and(|idle| idle >= timeout_ms);
            if drained || idle_past_grace {
                doomed.push(*entry.key());
            }
        }

        for key in doomed {
            if let Some((key, session)) = self.sessions.remove(&key) {
                tracing::info!(session = ?key, "reaping idle session");
                self.teardown(key, session).await;
            }
        }
    }

    /// Background reaper loop; stops when the manager is cancelled.
    pub fn spawn_reaper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        let interval = std::time::Duration::from_secs(self.config.reap_interval_seconds);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => manager.sweep_once(epoch_ms()).await,
                    _ = manager.cancel.cancelled() => break,
                }
            }
        })
    }

    /// Stop every session, pausing on-demand cursors. Used at shutdown.
    pub async fn stop_all(&self) {
        let keys: Vec<SessionKey> = self.sessions.iter().map(|e| *e.key()).collect();
        for key in keys {
            if let Some((key, session)) = self.sessions.remove(&key) {
                self.teardown(key, session).await;
            }
        }
    }

    async fn teardown(&self, key: SessionKey, session: Arc<Session>) {
        session.cancel.cancel();
        session.set_state(SessionState::Ended);
        if let Err(e) = self.ondemand.pause(key.0).await {
            tracing::warn!(session = ?key, "cursor pause on teardown failed: {e}");
        }
        if let Err(e) = tokio::fs::remove_dir_all(&session.workdir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(session = ?key, "workdir cleanup failed: {e}");
            }
        }
        self.creation_locks.remove(&key);
        tracing::info!(session = ?key, "session ended");
    }

    /// Current sessions and their viewer counts.
    pub fn session_overview(&self) -> HashMap<SessionKey, usize> {
        self.sessions
            .iter()
            .map(|entry| (*entry.key(), entry.value().connection_count()))
            .collect()
    }
}

/// Owns the backing process: forwards output to the fan-out, flips the
/// session to draining at end of stream, kills the process on cancel.
async fn pump(session: Arc<Session>, mut process: Box<dyn StreamProcess>) {
    loop {
        tokio::select! {
            _ = session.cancel.cancelled() => {
                if let Err(e) = process.kill().await {
                    tracing::warn!(session = ?session.key, "kill failed: {e}");
                }
                break;
            }
            chunk = process.next_chunk() => match chunk {
                Ok(Some(chunk)) => session.broadcast(chunk),
                Ok(None) => {
                    tracing::info!(session = ?session.key, "backing process ended");
                    session.set_state(SessionState::Draining);
                    break;
                }
                Err(e) => {
                    tracing::warn!(session = ?session.key, "backing process read failed: {e}");
                    session.set_state(SessionState::Draining);
                    break;
                }
            },
        }
    }
}
