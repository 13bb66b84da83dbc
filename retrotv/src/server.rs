//! HTTP surface.
//!
//! Two route families: `/api/*` is the management plane (channels,
//! lineups, schedule builds) and `/media-player/*` is what players point
//! at. Player requests lazily start the channel's session; playlist
//! refreshes double as heartbeats so an HLS player keeps its session
//! alive without extra calls.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use dashmap::DashMap;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use retrotv_core::materializer::{materialize, merge_pending, MaterializeMode};
use retrotv_core::models::{Channel, ChannelId, LineupItem, LineupUpdate, Schedule, StreamMode};
use retrotv_core::resolver::ProgramPoolResolver;
use retrotv_core::scheduler::{build_schedule, ProgramPool, ScheduleWorkerPool};
use retrotv_core::store::{ChannelRepository, LineupStore};
use retrotv_core::Config;
use retrotv_stream::session::Session;
use retrotv_stream::{SessionError, SessionManager};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub channels: Arc<dyn ChannelRepository>,
    pub lineups: Arc<LineupStore>,
    pub resolver: Arc<dyn ProgramPoolResolver>,
    pub workers: Arc<ScheduleWorkerPool>,
    pub sessions: Arc<SessionManager>,
    /// Per-channel mutexes guarding lineup read-modify-write cycles.
    pub build_locks: Arc<DashMap<ChannelId, Arc<Mutex<()>>>>,
}

impl AppState {
    fn build_lock(&self, id: ChannelId) -> Arc<Mutex<()>> {
        self.build_locks.entry(id).or_default().clone()
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/sessions", get(list_sessions))
        .route("/api/channels", get(list_channels))
        .route(
            "/api/channels/{number}",
            get(get_channel).put(upsert_channel).delete(delete_channel),
        )
        .route(
            "/api/channels/{number}/lineup",
            get(get_lineup).put(put_lineup),
        )
        .route("/api/channels/{number}/schedule", post(post_schedule))
        .route(
            "/api/channels/{number}/lineup/merge-pending",
            post(post_merge_pending),
        )
        .route(
            "/media-player/{number}/hls/playlist.m3u8",
            get(hls_playlist),
        )
        .route("/media-player/{number}/hls/{segment}", get(hls_segment))
        .route("/media-player/{number}/video.ts", get(raw_stream))
        .route(
            "/media-player/{number}/session/{token}/heartbeat",
            post(session_heartbeat),
        )
        .route("/media-player/{number}/session", delete(stop_session))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Error mapping

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

impl From<retrotv_core::Error> for ApiError {
    fn from(err: retrotv_core::Error) -> Self {
        use retrotv_core::Error;
        let status = match &err {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        let status = match &err {
            SessionError::ChannelNotFound(_) => StatusCode::NOT_FOUND,
            SessionError::TranscodeConfigNotFound(_) => StatusCode::UNPROCESSABLE_ENTITY,
            SessionError::Generic(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// ---------------------------------------------------------------------------
// Management plane

async fn health() -> impl IntoResponse {
    "OK"
}

async fn list_channels(State(state): State<AppState>) -> ApiResult<Json<Vec<Channel>>> {
    Ok(Json(state.channels.list().await?))
}

#[derive(Debug, Serialize)]
pub struct SessionOverview {
    pub channel: u32,
    pub mode: StreamMode,
    pub viewers: usize,
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionOverview>> {
    let mut sessions: Vec<SessionOverview> = state
        .sessions
        .session_overview()
        .into_iter()
        .map(|((channel, mode), viewers)| SessionOverview {
            channel: channel.as_u32(),
            mode,
            viewers,
        })
        .collect();
    sessions.sort_by_key(|s| s.channel);
    Json(sessions)
}

async fn get_channel(
    State(state): State<AppState>,
    Path(number): Path<u32>,
) -> ApiResult<Json<Channel>> {
    let channel = require_channel(&state, ChannelId(number)).await?;
    Ok(Json(channel))
}

#[derive(Debug, Deserialize)]
pub struct ChannelRequest {
    pub name: String,
    #[serde(default)]
    pub stream_mode: Option<StreamMode>,
    #[serde(default)]
    pub transcode_config: Option<String>,
    #[serde(default)]
    pub start_time_ms: Option<i64>,
}

async fn upsert_channel(
    State(state): State<AppState>,
    Path(number): Path<u32>,
    Json(request): Json<ChannelRequest>,
) -> ApiResult<Json<Channel>> {
    let id = ChannelId(number);
    let mut channel = state
        .channels
        .get(id)
        .await?
        .unwrap_or_else(|| Channel::new(id, request.name.clone()));
    channel.name = request.name;
    if let Some(mode) = request.stream_mode {
        channel.stream_mode = mode;
    }
    if let Some(config) = request.transcode_config {
        channel.transcode_config = config;
    }
    if let Some(anchor) = request.start_time_ms {
        channel.start_time_ms = anchor;
    }
    channel.updated_at = chrono::Utc::now();
    state.channels.upsert(channel.clone()).await?;
    Ok(Json(channel))
}

async fn delete_channel(
    State(state): State<AppState>,
    Path(number): Path<u32>,
) -> ApiResult<StatusCode> {
    let id = ChannelId(number);
    require_channel(&state, id).await?;
    stop_all_modes(&state, id).await;
    state.channels.delete(id).await?;
    state.lineups.mark_for_deletion(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_lineup(
    State(state): State<AppState>,
    Path(number): Path<u32>,
) -> ApiResult<Json<retrotv_core::models::Lineup>> {
    require_channel(&state, ChannelId(number)).await?;
    Ok(Json(state.lineups.load(ChannelId(number), false).await?))
}

#[derive(Debug, Serialize)]
pub struct LineupSummary {
    pub items: usize,
    pub total_duration_ms: i64,
}

async fn put_lineup(
    State(state): State<AppState>,
    Path(number): Path<u32>,
    Json(items): Json<Vec<LineupItem>>,
) -> ApiResult<Json<LineupSummary>> {
    let id = ChannelId(number);
    require_channel(&state, id).await?;
    let saved = state.lineups.save(id, LineupUpdate::items(items)).await?;
    let total = saved.total_duration_ms();
    state.channels.set_duration(id, total).await?;
    Ok(Json(LineupSummary {
        items: saved.items.len(),
        total_duration_ms: total,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ScheduleRequest {
    pub schedule: Schedule,
    /// Append to the existing lineup instead of replacing it
    #[serde(default)]
    pub append: bool,
}

async fn post_schedule(
    State(state): State<AppState>,
    Path(number): Path<u32>,
    Json(request): Json<ScheduleRequest>,
) -> ApiResult<Json<LineupSummary>> {
    let id = ChannelId(number);
    let mut channel = require_channel(&state, id).await?;
    let ScheduleRequest {
        mut schedule,
        append,
    } = request;

    let mut pools: HashMap<usize, ProgramPool> = HashMap::new();
    for (index, programming) in slot_programming(&schedule) {
        if !programming.draws_from_pool() {
            continue;
        }
        match state.resolver.resolve_group(&programming).await {
            Ok(pool) => {
                pools.insert(index, pool);
            }
            // A vanished show marks its slot missing; it plays flex until the
            // programming comes back rather than failing the whole build.
            Err(e) if e.is_not_found() => {
                tracing::warn!(channel = %id, slot = index, "slot programming missing: {e}");
                mark_slot_missing(&mut schedule, index);
            }
            Err(e) => return Err(e.into()),
        }
    }

    let build_input = schedule.clone();
    let now_ms = chrono::Utc::now().timestamp_millis();
    let output = state
        .workers
        .run(move || {
            let mut rng = rand::rng();
            build_schedule(&build_input, &mut pools, now_ms, &mut rng)
        })
        .await?;
    let cycle_start_ms = output.cycle_start_ms;

    // Serialize the read-modify-write; two builds landing together must not
    // lose each other's items.
    let lock = state.build_lock(id);
    let _guard = lock.lock().await;

    let mut lineup = state.lineups.load(id, false).await?;
    let mode = if append {
        MaterializeMode::Append
    } else {
        MaterializeMode::Replace
    };
    materialize(&mut lineup, output, state.resolver.as_ref(), mode).await?;

    let mut update = LineupUpdate::items(lineup.items);
    update.schedule = Some(Some(schedule));
    update.pending_programs = Some(lineup.pending_programs);
    let saved = state.lineups.save(id, update).await?;

    // A fresh build re-anchors the channel so slot offsets line up with the
    // wall clock; appends keep playing from the existing anchor.
    if !append {
        channel.start_time_ms = cycle_start_ms;
        channel.updated_at = chrono::Utc::now();
        state.channels.upsert(channel).await?;
    }
    let total = saved.total_duration_ms();
    state.channels.set_duration(id, total).await?;

    tracing::info!(channel = %id, items = saved.items.len(), total_duration_ms = total, "schedule built");
    Ok(Json(LineupSummary {
        items: saved.items.len(),
        total_duration_ms: total,
    }))
}

#[derive(Debug, Serialize)]
pub struct MergeSummary {
    pub merged: usize,
}

async fn post_merge_pending(
    State(state): State<AppState>,
    Path(number): Path<u32>,
) -> ApiResult<Json<MergeSummary>> {
    let id = ChannelId(number);
    require_channel(&state, id).await?;

    let lock = state.build_lock(id);
    let _guard = lock.lock().await;

    let mut lineup = state.lineups.load(id, false).await?;
    let merged = merge_pending(&mut lineup, state.resolver.as_ref()).await?;
    if merged > 0 {
        let mut update = LineupUpdate::items(lineup.items);
        update.pending_programs = Some(lineup.pending_programs);
        state.lineups.save(id, update).await?;
    }
    Ok(Json(MergeSummary { merged }))
}

// ---------------------------------------------------------------------------
// Player plane

#[derive(Debug, Deserialize)]
pub struct PlayerQuery {
    #[serde(default)]
    pub token: Option<String>,
}

async fn hls_playlist(
    State(state): State<AppState>,
    Path(number): Path<u32>,
    Query(query): Query<PlayerQuery>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let id = ChannelId(number);
    let channel = require_channel(&state, id).await?;
    let mode = hls_mode(&channel);
    let session = state.sessions.get_or_create(id, mode).await?;

    // A known token refreshes its heartbeat. Without one, a repeat poll from
    // the same client reuses its connection so polling players do not pile
    // up phantom viewers.
    let ip = client_ip(&headers);
    let agent = user_agent(&headers);
    let token = match query.token {
        Some(token) if session.record_heartbeat(&token) => token,
        _ => match session.find_connection(&ip, &agent) {
            Some(token) => {
                session.record_heartbeat(&token);
                token
            }
            None => session.attach(ip, agent),
        },
    };

    let playlist = session
        .playlist
        .render(|name| format!("/media-player/{number}/hls/{name}?token={token}"));

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/vnd.apple.mpegurl")
        .header(header::CACHE_CONTROL, "no-cache, no-store")
        .body(Body::from(playlist))
        .map_err(|e| ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: e.to_string(),
        })?)
}

async fn hls_segment(
    State(state): State<AppState>,
    Path((number, segment)): Path<(u32, String)>,
    Query(query): Query<PlayerQuery>,
) -> ApiResult<Response> {
    if segment.contains(['/', '\\']) || !segment.ends_with(".ts") {
        return Err(ApiError::bad_request("invalid segment name"));
    }
    let id = ChannelId(number);
    let channel = require_channel(&state, id).await?;
    let session = state
        .sessions
        .get(id, hls_mode(&channel))
        .ok_or_else(|| ApiError::not_found("no live session"))?;
    if let Some(token) = &query.token {
        session.record_heartbeat(token);
    }

    let data = tokio::fs::read(session.workdir.join(&segment))
        .await
        .map_err(|_| ApiError::not_found(format!("segment '{segment}'")))?;

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "video/mp2t")
        .header(header::CACHE_CONTROL, "no-cache, no-store")
        .body(Body::from(data))
        .map_err(|e| ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: e.to_string(),
        })?)
}

/// Raw MPEG-TS stream; the connection-lifetime body is the session handle,
/// so dropping the response detaches the viewer.
async fn raw_stream(
    State(state): State<AppState>,
    Path(number): Path<u32>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let id = ChannelId(number);
    require_channel(&state, id).await?;
    let session = state.sessions.get_or_create(id, StreamMode::Concat).await?;
    let token = session.attach(client_ip(&headers), user_agent(&headers));

    let guard = DetachOnDrop {
        session: session.clone(),
        token,
    };
    let stream = session.subscribe().filter_map(move |chunk| {
        guard.session.record_heartbeat(&guard.token);
        // Lagged receivers skip ahead instead of ending the response.
        let out = match chunk {
            Ok(bytes) => Some(Ok::<_, std::io::Error>(bytes)),
            Err(_) => None,
        };
        std::future::ready(out)
    });

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "video/mp2t")
        .header(header::CACHE_CONTROL, "no-cache, no-store")
        .body(Body::from_stream(stream))
        .map_err(|e| ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: e.to_string(),
        })?)
}

struct DetachOnDrop {
    session: Arc<Session>,
    token: String,
}

impl Drop for DetachOnDrop {
    fn drop(&mut self) {
        self.session.detach(&self.token);
    }
}

async fn session_heartbeat(
    State(state): State<AppState>,
    Path((number, token)): Path<(u32, String)>,
) -> ApiResult<StatusCode> {
    let id = ChannelId(number);
    let alive = ALL_MODES
        .iter()
        .any(|mode| state.sessions.heartbeat(id, *mode, &token));
    if alive {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found("no matching connection"))
    }
}

async fn stop_session(
    State(state): State<AppState>,
    Path(number): Path<u32>,
) -> ApiResult<StatusCode> {
    if stop_all_modes(&state, ChannelId(number)).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found("no live session"))
    }
}

// ---------------------------------------------------------------------------
// Helpers

const ALL_MODES: [StreamMode; 3] = [StreamMode::Hls, StreamMode::HlsSlower, StreamMode::Concat];

async fn require_channel(state: &AppState, id: ChannelId) -> ApiResult<Channel> {
    state
        .channels
        .get(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("channel {id}")))
}

async fn stop_all_modes(state: &AppState, id: ChannelId) -> bool {
    let mut stopped = false;
    for mode in ALL_MODES {
        stopped |= state.sessions.stop_session(id, mode).await;
    }
    stopped
}

fn slot_programming(schedule: &Schedule) -> Vec<(usize, retrotv_core::models::SlotProgramming)> {
    match schedule {
        Schedule::Time(time) => time
            .slots
            .iter()
            .enumerate()
            .map(|(i, slot)| (i, slot.programming.clone()))
            .collect(),
        Schedule::Random(random) => random
            .slots
            .iter()
            .enumerate()
            .map(|(i, slot)| (i, slot.programming.clone()))
            .collect(),
    }
}

fn mark_slot_missing(schedule: &mut Schedule, index: usize) {
    match schedule {
        Schedule::Time(time) => {
            if let Some(slot) = time.slots.get_mut(index) {
                slot.is_missing = true;
            }
        }
        Schedule::Random(random) => {
            if let Some(slot) = random.slots.get_mut(index) {
                slot.is_missing = true;
            }
        }
    }
}

fn hls_mode(channel: &Channel) -> StreamMode {
    match channel.stream_mode {
        StreamMode::HlsSlower => StreamMode::HlsSlower,
        _ => StreamMode::Hls,
    }
}

fn user_agent(headers: &HeaderMap) -> String {
    headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .unwrap_or("")
        .trim()
        .to_string()
}
