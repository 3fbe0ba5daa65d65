// ============================
// viewsync-lib/src/http.rs
// ============================
//! The HTTP surface: page shells, the JSON API, and the WebSocket route.
//!
//! Every mutating POST must carry an `X-CSRF-Token` matching the token
//! bound to the caller's `sync_session` cookie; safe methods bypass the
//! check. Selected read endpoints carry their own per-address rate limits.

use axum::{
    extract::{ConnectInfo, Path, Query, Request, State},
    http::{header, HeaderMap, Method, StatusCode},
    middleware::{self, Next},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::admin::generate_secure_token;
use crate::dispatcher::room_detail;
use crate::error::AppError;
use crate::jobs::JobKind;
use crate::sessions::EventRateLimiter;
use crate::validation;
use crate::ws_router::ws_handler;
use crate::AppState;

const SESSION_COOKIE: &str = "sync_session";
const CSRF_HEADER: &str = "x-csrf-token";

/// State for the HTTP routes: the app plus per-surface rate limiters.
pub struct HttpState {
    pub app: Arc<AppState>,
    api_limiter: EventRateLimiter,
    thumb_limiter: EventRateLimiter,
}

/// Build the full router: pages, API, and the `/ws` upgrade route.
pub fn create_router(app: Arc<AppState>) -> Router {
    let http_state = Arc::new(HttpState {
        app: app.clone(),
        api_limiter: EventRateLimiter::new(),
        thumb_limiter: EventRateLimiter::with_limits(
            50,
            Duration::from_secs(60),
            Duration::from_secs(60),
        ),
    });

    let api = Router::new()
        .route("/api/csrf-token", get(csrf_token))
        .route("/api/files", get(list_files))
        .route("/api/tracks/orphans", get(track_orphans))
        .route("/api/tracks/{filename}", get(tracks_for))
        .route("/api/thumbnail/{filename}", get(thumbnail))
        .route("/api/server-mode", get(server_mode))
        .route("/api/rooms", get(list_rooms))
        .route("/api/rooms/{code}", get(room_by_code))
        .route("/api/ffmpeg/auth", post(ffmpeg_auth))
        .route("/api/ffmpeg/run-preset", post(ffmpeg_run_preset))
        .route("/api/ffmpeg/cancel", post(ffmpeg_cancel))
        .route("/api/ffmpeg/jobs", get(ffmpeg_jobs))
        .route("/api/ffmpeg/encoders", get(ffmpeg_encoders))
        .layer(middleware::from_fn_with_state(
            http_state.clone(),
            csrf_guard,
        ))
        .with_state(http_state.clone());

    let pages = Router::new()
        .route("/", get(landing))
        .route("/admin", get(admin_page))
        .route("/admin/{room_code}", get(admin_page_for_room))
        .route("/watch/{room_code}", get(watch_page))
        .with_state(http_state);

    let ws = Router::new().route("/ws", get(ws_handler)).with_state(app);

    pages
        .merge(api)
        .merge(ws)
        .fallback(not_found)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

fn session_from_headers(headers: &HeaderMap) -> Option<String> {
    let cookies = headers.get(header::COOKIE)?.to_str().ok()?;
    cookies
        .split(';')
        .map(str::trim)
        .find_map(|cookie| cookie.strip_prefix(&format!("{SESSION_COOKIE}=")).map(str::to_string))
}

fn session_cookie_header(session_id: &str) -> String {
    format!("{SESSION_COOKIE}={session_id}; Path=/; HttpOnly; SameSite=Strict")
}

/// CSRF middleware: safe methods pass, mutating requests must present a
/// valid `(sync_session, X-CSRF-Token)` pair.
async fn csrf_guard(
    State(state): State<Arc<HttpState>>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let method = request.method();
    if matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS) {
        return Ok(next.run(request).await);
    }

    let session = session_from_headers(request.headers())
        .ok_or_else(|| AppError::Auth("missing session cookie".to_string()))?;
    let token = request
        .headers()
        .get(CSRF_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Auth("missing CSRF token".to_string()))?;

    if !state.app.csrf.verify(&session, token) {
        return Err(AppError::Auth("invalid or expired CSRF token".to_string()));
    }
    Ok(next.run(request).await)
}

/// Existing session from the cookie, or a fresh one plus its Set-Cookie
/// header value.
fn session_or_new(headers: &HeaderMap) -> (String, Option<String>) {
    match session_from_headers(headers) {
        Some(session) => (session, None),
        None => {
            let session = generate_secure_token();
            let cookie = session_cookie_header(&session);
            (session, Some(cookie))
        },
    }
}

fn page_shell(title: &str, hydration: Option<serde_json::Value>) -> String {
    let hydration_script = hydration
        .map(|data| format!("<script>window.__VIEWSYNC__ = {data};</script>"))
        .unwrap_or_default();
    format!(
        "<!doctype html><html><head><meta charset=\"utf-8\"><title>{title}</title></head>\
         <body><div id=\"app\"></div>{hydration_script}</body></html>"
    )
}

async fn landing(State(state): State<Arc<HttpState>>) -> Html<String> {
    let title = if state.app.settings.server_mode {
        "viewsync - rooms"
    } else {
        "viewsync"
    };
    Html(page_shell(title, None))
}

async fn admin_shell(state: &HttpState, headers: &HeaderMap, room_code: Option<String>) -> Response {
    let (session, set_cookie) = session_or_new(headers);
    let token = state
        .app
        .csrf
        .current(&session)
        .unwrap_or_else(|| state.app.csrf.issue(&session));

    let settings = &state.app.settings;
    let hydration = settings.data_hydration.then(|| {
        json!({
            "csrfToken": token,
            "serverMode": settings.server_mode,
            "roomCode": room_code,
            "chatEnabled": settings.chat_enabled,
            "mediaToolsEnabled": state.app.jobs.enabled(),
            "volumeStep": settings.volume_step,
            "maxVolume": settings.max_volume,
            "skipSeconds": settings.skip_seconds,
            "skipIntroSeconds": settings.skip_intro_seconds,
            "subtitleRenderer": settings.subtitle_renderer,
            "videoAutoplay": settings.video_autoplay,
            "clientControlsDisabled": settings.client_controls_disabled,
            "joinMode": settings.join_mode,
            "bslMode": settings.bsl_mode,
        })
    });

    let mut response = Html(page_shell("viewsync - admin", hydration)).into_response();
    if let Some(cookie) = set_cookie {
        if let Ok(value) = cookie.parse() {
            response.headers_mut().insert(header::SET_COOKIE, value);
        }
    }
    response
}

async fn admin_page(State(state): State<Arc<HttpState>>, headers: HeaderMap) -> Response {
    admin_shell(&state, &headers, None).await
}

async fn admin_page_for_room(
    State(state): State<Arc<HttpState>>,
    Path(room_code): Path<String>,
    headers: HeaderMap,
) -> Response {
    admin_shell(&state, &headers, Some(room_code.to_uppercase())).await
}

async fn watch_page(Path(room_code): Path<String>) -> Html<String> {
    Html(page_shell(
        &format!("viewsync - {}", room_code.to_uppercase()),
        None,
    ))
}

/// Issue (or refresh) the CSRF token bound to the caller's session.
async fn csrf_token(State(state): State<Arc<HttpState>>, headers: HeaderMap) -> Response {
    let (session, set_cookie) = session_or_new(&headers);
    let token = state
        .app
        .csrf
        .current(&session)
        .unwrap_or_else(|| state.app.csrf.issue(&session));

    let mut response = Json(json!({ "token": token })).into_response();
    if let Some(cookie) = set_cookie {
        if let Ok(value) = cookie.parse() {
            response.headers_mut().insert(header::SET_COOKIE, value);
        }
    }
    response
}

async fn list_files(
    State(state): State<Arc<HttpState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Result<Response, AppError> {
    state
        .api_limiter
        .check(addr.ip())
        .map_err(|_| AppError::RateLimit)?;
    let files = state.app.media.list_media().await?;
    Ok(Json(files).into_response())
}

async fn tracks_for(
    State(state): State<Arc<HttpState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(filename): Path<String>,
) -> Result<Response, AppError> {
    state
        .api_limiter
        .check(addr.ip())
        .map_err(|_| AppError::RateLimit)?;
    validation::validate_filename(&filename)
        .map_err(|e| AppError::Validation(e.to_string()))?;
    let tracks = state.app.media.tracks_for(&filename).await?;
    Ok(Json(tracks).into_response())
}

async fn track_orphans(State(state): State<Arc<HttpState>>) -> Result<Response, AppError> {
    let orphans = state.app.media.orphan_sidecars().await?;
    Ok(Json(json!({ "orphans": orphans })).into_response())
}

#[derive(Debug, Deserialize)]
struct ThumbnailQuery {
    #[serde(default = "default_thumb_width")]
    width: u32,
}

fn default_thumb_width() -> u32 {
    720
}

async fn thumbnail(
    State(state): State<Arc<HttpState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(filename): Path<String>,
    Query(query): Query<ThumbnailQuery>,
) -> Result<Response, AppError> {
    state
        .thumb_limiter
        .check(addr.ip())
        .map_err(|_| AppError::RateLimit)?;
    validation::validate_filename(&filename)
        .map_err(|e| AppError::Validation(e.to_string()))?;

    let width = query.width.clamp(80, 1920);
    match state.app.media.thumbnail_url(&filename, width).await {
        Some(url) => Ok(Json(json!({ "thumbnail": url })).into_response()),
        None => Err(AppError::NotFound(filename)),
    }
}

async fn server_mode(State(state): State<Arc<HttpState>>) -> Json<serde_json::Value> {
    Json(json!({ "serverMode": state.app.settings.server_mode }))
}

async fn list_rooms(State(state): State<Arc<HttpState>>) -> Json<serde_json::Value> {
    Json(json!({ "rooms": state.app.rooms.list_public().await }))
}

async fn room_by_code(
    State(state): State<Arc<HttpState>>,
    Path(code): Path<String>,
) -> Result<Response, AppError> {
    let room = state.app.rooms.find(&code).ok_or(AppError::RoomNotFound)?;
    Ok(Json(room_detail(&room).await).into_response())
}

#[derive(Debug, Deserialize)]
struct ToolsAuthRequest {
    password: String,
}

async fn ffmpeg_auth(
    State(state): State<Arc<HttpState>>,
    Json(body): Json<ToolsAuthRequest>,
) -> Json<serde_json::Value> {
    let success = state.app.jobs.verify_password(&body.password);
    Json(json!({ "success": success }))
}

#[derive(Debug, Deserialize)]
struct RunPresetRequest {
    password: String,
    filename: String,
    #[serde(flatten)]
    kind: JobKind,
}

async fn ffmpeg_run_preset(
    State(state): State<Arc<HttpState>>,
    Json(body): Json<RunPresetRequest>,
) -> Result<Response, AppError> {
    if !state.app.jobs.verify_password(&body.password) {
        return Err(AppError::Auth("invalid tools password".to_string()));
    }
    validation::validate_filename(&body.filename)
        .map_err(|e| AppError::Validation(e.to_string()))?;

    let job_id = state.app.jobs.enqueue(body.kind, body.filename)?;
    Ok(Json(json!({ "success": true, "jobId": job_id })).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelRequest {
    password: String,
    job_id: String,
}

async fn ffmpeg_cancel(
    State(state): State<Arc<HttpState>>,
    Json(body): Json<CancelRequest>,
) -> Result<Response, AppError> {
    if !state.app.jobs.verify_password(&body.password) {
        return Err(AppError::Auth("invalid tools password".to_string()));
    }
    state.app.jobs.cancel(&body.job_id)?;
    Ok(Json(json!({ "success": true })).into_response())
}

async fn ffmpeg_jobs(State(state): State<Arc<HttpState>>) -> Json<serde_json::Value> {
    Json(json!({ "jobs": state.app.jobs.list() }))
}

async fn ffmpeg_encoders(State(state): State<Arc<HttpState>>) -> Json<serde_json::Value> {
    // populated once an encoder toolchain probe is wired into the runner
    Json(json!({
        "enabled": state.app.jobs.enabled(),
        "encoders": [],
    }))
}

/// 404 for unknown paths, in the API error envelope.
pub async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": { "code": "NF_001", "message": "not found" } })),
    )
}
