//! Live session state.
//!
//! One [`Session`] exists per `(channel, stream mode)` pair while anyone is
//! watching. The session owns the fan-out channel viewers subscribe to, the
//! connection table the reaper prunes, and (for HLS modes) the rolling
//! playlist. Lifecycle transitions are published through a watch channel so
//! the transport can wait for `Running` without polling.

pub mod manager;

use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;

use retrotv_core::models::{generate_token, ChannelId, StreamMode};

use crate::hls::HlsPlaylist;

/// Sessions are keyed by channel and mode; the same channel can serve an
/// HLS viewer and a raw-transport viewer from two independent pipelines.
pub type SessionKey = (ChannelId, StreamMode);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Backing process spawned, waiting for first output.
    Starting,
    /// First output seen; viewers are being fed.
    Running,
    /// Backing process ended; buffered output drains, no new viewers.
    Draining,
    /// Torn down. The registry entry is stale and must be replaced.
    Ended,
}

/// One viewer of a session, identified by a per-connection token.
#[derive(Debug)]
pub struct Connection {
    pub ip: String,
    pub user_agent: String,
    last_heartbeat_ms: AtomicI64,
}

impl Connection {
    fn new(ip: String, user_agent: String, now_ms: i64) -> Self {
        Self {
            ip,
            user_agent,
            last_heartbeat_ms: AtomicI64::new(now_ms),
        }
    }

    pub fn last_heartbeat_ms(&self) -> i64 {
        self.last_heartbeat_ms.load(Ordering::Acquire)
    }
}

/// Capacity of the fan-out ring. A lagging viewer skips chunks rather than
/// stalling the producer.
const BROADCAST_CAPACITY: usize = 256;

#[derive(Debug)]
pub struct Session {
    pub key: SessionKey,
    pub workdir: PathBuf,
    pub playlist: HlsPlaylist,
    pub cancel: CancellationToken,
    state: watch::Sender<SessionState>,
    sender: broadcast::Sender<Bytes>,
    connections: DashMap<String, Connection>,
    /// Epoch ms when the last connection left; 0 while connections exist.
    idle_since_ms: AtomicI64,
}

impl Session {
    pub fn new(key: SessionKey, workdir: PathBuf, cancel: CancellationToken) -> Self {
        let (state, _) = watch::channel(SessionState::Starting);
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            key,
            workdir,
            playlist: HlsPlaylist::new(),
            cancel,
            state,
            sender,
            connections: DashMap::new(),
            idle_since_ms: AtomicI64::new(epoch_ms()),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn set_state(&self, next: SessionState) {
        self.state.send_replace(next);
    }

    /// Watch lifecycle transitions (e.g. wait for `Running`).
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Subscribe to the output fan-out from the current position onward.
    pub fn subscribe(&self) -> BroadcastStream<Bytes> {
        BroadcastStream::new(self.sender.subscribe())
    }

    /// Push a chunk to all subscribers. No subscribers is not an error;
    /// the reaper decides when an unwatched session dies.
    pub fn broadcast(&self, chunk: Bytes) {
        let _ = self.sender.send(chunk);
    }

    /// Register a viewer and return their connection token.
    pub fn attach(&self, ip: impl Into<String>, user_agent: impl Into<String>) -> String {
        let token = generate_token();
        self.connections.insert(
            token.clone(),
            Connection::new(ip.into(), user_agent.into(), epoch_ms()),
        );
        self.idle_since_ms.store(0, Ordering::Release);
        token
    }

    /// Remove a viewer. Returns false for an unknown token.
    pub fn detach(&self, token: &str) -> bool {
        let removed = self.connections.remove(token).is_some();
        if removed && self.connections.is_empty() {
            self.idle_since_ms.store(epoch_ms(), Ordering::Release);
        }
        removed
    }

    /// Refresh a viewer's liveness. Returns false for an unknown token.
    pub fn record_heartbeat(&self, token: &str) -> bool {
        match self.connections.get(token) {
            Some(conn) => {
                conn.last_heartbeat_ms.store(epoch_ms(), Ordering::Release);
                true
            }
            None => false,
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Token of an existing connection from the same client, for players
    /// that poll without carrying their token through.
    pub fn find_connection(&self, ip: &str, user_agent: &str) -> Option<String> {
        self.connections
            .iter()
            .find(|entry| entry.value().ip == ip && entry.value().user_agent == user_agent)
            .map(|entry| entry.key().clone())
    }

    /// Drop connections whose last heartbeat is older than `timeout_ms`.
    /// Returns how many were dropped.
    pub fn prune_stale(&self, now_ms: i64, timeout_ms: i64) -> usize {
        let before = self.connections.len();
        self.connections
            .retain(|_, conn| now_ms - conn.last_heartbeat_ms() < timeout_ms);
        let dropped = before - self.connections.len();
        if dropped > 0 && self.connections.is_empty() {
            self.idle_since_ms.store(now_ms, Ordering::Release);
        }
        dropped
    }

    /// How long the session has had zero connections, or `None` while
    /// someone is attached.
    pub fn idle_for_ms(&self, now_ms: i64) -> Option<i64> {
        if !self.connections.is_empty() {
            return None;
        }
        let since = self.idle_since_ms.load(Ordering::Acquire);
        if since == 0 {
            return None;
        }
        Some(now_ms - since)
    }
}

pub(crate) fn epoch_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Segment length per mode. The slower variant trades latency for fewer,
/// longer segments that survive flakier clients.
pub(crate) fn segment_duration_ms(mode: StreamMode) -> i64 {
    match mode {
        StreamMode::Hls => 4_000,
        StreamMode::HlsSlower => 8_000,
        StreamMode::Concat => 4_000,
    }
}

/// Cut the session's transport stream into numbered segment files and keep
/// the playlist window rolling. Runs until the session is cancelled or the
/// producer ends.
pub(crate) async fn run_segmenter(
    session: Arc<Session>,
    mut stream: BroadcastStream<Bytes>,
    window: usize,
) {
    use futures::StreamExt;
    use tokio::io::AsyncWriteExt;

    let segment_ms = segment_duration_ms(session.key.1);
    let mut seq: u64 = 0;
    let mut written: std::collections::VecDeque<String> = std::collections::VecDeque::new();
    let mut current: Option<(tokio::fs::File, String, i64, tokio::time::Instant)> = None;

    loop {
        let chunk = tokio::select! {
            _ = session.cancel.cancelled() => break,
            next = stream.next() => match next {
                Some(Ok(chunk)) => chunk,
                // Lagged: the ring overwrote chunks we never read. Skip.
                Some(Err(_)) => continue,
                None => break,
            },
        };

        // Roll to a new segment on first output and on every boundary.
        let roll = match &current {
            None => true,
            Some((_, _, _, opened)) => opened.elapsed().as_millis() as i64 >= segment_ms,
        };
        if roll {
            if let Some((mut file, name, start_ms, opened)) = current.take() {
                let duration_ms = opened.elapsed().as_millis() as i64;
                if let Err(e) = file.flush().await {
                    tracing::warn!(session = ?session.key, "segment flush failed: {e}");
                }
                session
                    .playlist
                    .append_segment(start_ms, duration_ms, name.clone(), false);
                session.playlist.enforce_window(window);
                written.push_back(name);
            }
            // Evict files the playlist no longer references.
            while written.len() > window {
                if let Some(old) = written.pop_front() {
                    let _ = tokio::fs::remove_file(session.workdir.join(&old)).await;
                }
            }
            let name = format!("seg{seq}.ts");
            seq += 1;
            match tokio::fs::File::create(session.workdir.join(&name)).await {
                Ok(file) => {
                    current = Some((file, name, epoch_ms(), tokio::time::Instant::now()));
                }
                Err(e) => {
                    tracing::error!(session = ?session.key, "cannot create segment file: {e}");
                    break;
                }
            }
        }

        if let Some((file, _, _, _)) = current.as_mut() {
            if let Err(e) = file.write_all(&chunk).await {
                tracing::warn!(session = ?session.key, "segment write failed: {e}");
                break;
            }
        }
    }
    session.playlist.mark_ended();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(
            (ChannelId(1), StreamMode::Hls),
            PathBuf::from("/tmp"),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_attach_detach_tracks_idle_anchor() {
        let session = session();
        assert!(session.idle_for_ms(epoch_ms() + 1).is_some());

        let token = session.attach("10.0.0.1", "vlc/3.0");
        assert_eq!(session.connection_count(), 1);
        assert!(session.idle_for_ms(epoch_ms() + 1).is_none());

        assert!(session.detach(&token));
        assert!(!session.detach(&token));
        assert!(session.idle_for_ms(epoch_ms() + 1).is_some());
    }

    #[tokio::test]
    async fn test_prune_drops_only_stale_connections() {
        let session = session();
        let stale = session.attach("10.0.0.1", "vlc/3.0");
        let fresh = session.attach("10.0.0.2", "mpv/0.38");

        let now = epoch_ms();
        if let Some(conn) = session.connections.get(&stale) {
            conn.last_heartbeat_ms.store(now - 60_000, Ordering::Release);
        }
        if let Some(conn) = session.connections.get(&fresh) {
            conn.last_heartbeat_ms.store(now - 1_000, Ordering::Release);
        }

        assert_eq!(session.prune_stale(now, 30_000), 1);
        assert_eq!(session.connection_count(), 1);
        assert!(session.record_heartbeat(&fresh));
        assert!(!session.record_heartbeat(&stale));
    }

    #[tokio::test]
    async fn test_find_connection_matches_client_not_strangers() {
        let session = session();
        let token = session.attach("10.0.0.1", "vlc/3.0");

        assert_eq!(
            session.find_connection("10.0.0.1", "vlc/3.0"),
            Some(token.clone())
        );
        assert_eq!(session.find_connection("10.0.0.2", "vlc/3.0"), None);
        assert_eq!(session.find_connection("10.0.0.1", "mpv/0.38"), None);

        session.detach(&token);
        assert_eq!(session.find_connection("10.0.0.1", "vlc/3.0"), None);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_subscribers() {
        use futures::StreamExt;

        let session = session();
        let mut a = session.subscribe();
        let mut b = session.subscribe();
        session.broadcast(Bytes::from_static(b"ts-data"));

        let got_a = a.next().await.expect("chunk").expect("ok");
        let got_b = b.next().await.expect("chunk").expect("ok");
        assert_eq!(got_a, Bytes::from_static(b"ts-data"));
        assert_eq!(got_b, Bytes::from_static(b"ts-data"));
    }

    #[tokio::test]
    async fn test_state_transitions_are_observable() {
        let session = session();
        assert_eq!(session.state(), SessionState::Starting);

        let mut rx = session.watch_state();
        session.set_state(SessionState::Running);
        rx.changed().await.expect("state change");
        assert_eq!(*rx.borrow(), SessionState::Running);
    }
}
