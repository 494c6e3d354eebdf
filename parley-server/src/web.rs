//! HTTP surface: room CRUD, login/logout/profile, and static client files.
//!
//! Everything here is thin request/response plumbing over the database and
//! the live room buffers; the relay itself lives in [`crate::relay`]. Every
//! endpoint except the login flow requires a valid session: JSON-accepting
//! clients get a 401, browsers get redirected to the login page.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Redirect, Response};
use axum::routing::get;
use axum::{Extension, Form, Router};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::buffer::StoredMessage;
use crate::db::{Conversation, Room};
use crate::relay;
use crate::server::SharedState;
use crate::session::{cookie_value, SESSION_COOKIE};

/// Errors surfaced to HTTP clients as JSON bodies.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("not found")]
    NotFound,
    #[error("database unavailable")]
    Database,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Database => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

/// Session data attached to a request by [`require_session`].
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub token: String,
    pub username: String,
}

/// Build the axum router: WebSocket endpoint, room CRUD, auth flow, and
/// (optionally) the static client.
pub fn router(state: Arc<SharedState>) -> Router {
    let protected = Router::new()
        .route("/chat", get(list_rooms).post(create_room))
        .route("/chat/{room_id}", get(room_info))
        .route("/chat/{room_id}/messages", get(room_messages))
        .route("/profile", get(profile))
        .route("/logout", get(logout))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            require_session,
        ));

    let mut app = Router::new()
        .merge(protected)
        // The relay broker does its own handshake authentication so that a
        // bad token closes the upgraded socket rather than failing the
        // HTTP upgrade.
        .route("/ws", get(relay::ws_upgrade))
        .route("/login", get(login_page).post(login));

    // Serve the browser client if a static directory is configured.
    if let Some(ref static_dir) = state.config.static_dir {
        let dir = std::path::PathBuf::from(static_dir);
        if dir.exists() {
            tracing::info!("Serving client from {}", dir.display());
            let index_path = dir.join("index.html");
            let serve = tower_http::services::ServeDir::new(&dir)
                .append_index_html_on_directories(true)
                .fallback(tower_http::services::ServeFile::new(index_path));
            app = app.fallback_service(serve);
        } else {
            tracing::warn!("Static dir not found: {}", dir.display());
        }
    }

    app.with_state(state).layer(middleware::from_fn(log_request))
}

// ── Middleware ─────────────────────────────────────────────────────────

async fn log_request(req: Request, next: Next) -> Response {
    tracing::info!(method = %req.method(), path = %req.uri().path(), "request");
    next.run(req).await
}

/// Resolve the session cookie and stash the result on the request, or turn
/// the request away.
async fn require_session(
    State(state): State<Arc<SharedState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let token = req
        .headers()
        .get(header::COOKIE)
        .and_then(|value| value.to_str().ok())
        .and_then(|cookies| cookie_value(cookies, SESSION_COOKIE));

    let auth = token.and_then(|token| {
        state
            .sessions
            .lookup(&token)
            .map(|username| AuthSession { token, username })
    });

    match auth {
        Some(session) => {
            req.extensions_mut().insert(session);
            next.run(req).await
        }
        None => {
            let wants_json = req
                .headers()
                .get(header::ACCEPT)
                .and_then(|value| value.to_str().ok())
                .is_some_and(|accept| accept.contains("application/json"));
            if wants_json {
                StatusCode::UNAUTHORIZED.into_response()
            } else {
                Redirect::to("/login").into_response()
            }
        }
    }
}

// ── Rooms ──────────────────────────────────────────────────────────────

/// A room joined with its live pending buffer, as returned by `GET /chat`.
#[derive(Serialize)]
struct RoomWithMessages {
    #[serde(flatten)]
    room: Room,
    messages: Vec<StoredMessage>,
}

async fn list_rooms(
    State(state): State<Arc<SharedState>>,
) -> Result<Json<Vec<RoomWithMessages>>, ApiError> {
    let rooms = state.with_db(|db| db.list_rooms()).ok_or(ApiError::Database)?;
    let list = rooms
        .into_iter()
        .map(|room| {
            let messages = state.buffers.pending(&room.id);
            RoomWithMessages { room, messages }
        })
        .collect();
    Ok(Json(list))
}

#[derive(Deserialize)]
struct CreateRoom {
    name: Option<String>,
    image: Option<String>,
}

async fn create_room(
    State(state): State<Arc<SharedState>>,
    Json(body): Json<CreateRoom>,
) -> Result<Json<Room>, ApiError> {
    let name = body
        .name
        .filter(|name| !name.is_empty())
        .ok_or_else(|| ApiError::BadRequest("No name field.".to_string()))?;

    let room = Room {
        id: format!("id-{}", chrono::Utc::now().timestamp_millis()),
        name,
        image: body.image,
    };
    state
        .with_db(|db| db.add_room(&room))
        .ok_or(ApiError::Database)?;
    // New rooms start relaying immediately, before any message arrives.
    state.buffers.seed(&room.id);
    tracing::info!(room_id = %room.id, name = %room.name, "Created room");
    Ok(Json(room))
}

async fn room_info(
    Path(room_id): Path<String>,
    State(state): State<Arc<SharedState>>,
) -> Result<Json<Room>, ApiError> {
    state
        .with_db(|db| db.get_room(&room_id))
        .ok_or(ApiError::Database)?
        .map(Json)
        .ok_or(ApiError::NotFound)
}

#[derive(Deserialize)]
struct MessagesQuery {
    before: Option<u64>,
}

/// The most recent archived conversation with `timestamp < before`
/// (defaulting to now). The client pages backwards through history by
/// passing each block's timestamp as the next `before`.
async fn room_messages(
    Path(room_id): Path<String>,
    Query(query): Query<MessagesQuery>,
    State(state): State<Arc<SharedState>>,
) -> Result<Json<Conversation>, ApiError> {
    let before = query
        .before
        .unwrap_or_else(|| chrono::Utc::now().timestamp_millis() as u64);
    state
        .with_db(|db| db.latest_conversation_before(&room_id, before))
        .ok_or(ApiError::Database)?
        .map(Json)
        .ok_or(ApiError::NotFound)
}

// ── Auth flow ──────────────────────────────────────────────────────────

/// The login page: the static client's `login.html` when present, otherwise
/// a minimal built-in form.
async fn login_page(State(state): State<Arc<SharedState>>) -> Response {
    if let Some(ref dir) = state.config.static_dir {
        let path = std::path::Path::new(dir).join("login.html");
        if let Ok(contents) = tokio::fs::read_to_string(&path).await {
            return axum::response::Html(contents).into_response();
        }
    }
    axum::response::Html(
        r#"<!DOCTYPE html>
<html><head><meta charset="utf-8"><title>parley</title></head>
<body>
<h1>parley</h1>
<form method="post" action="/login">
  <label>Username <input name="username" autocomplete="username"></label>
  <label>Password <input name="password" type="password" autocomplete="current-password"></label>
  <button type="submit">Sign in</button>
</form>
</body></html>"#,
    )
    .into_response()
}

#[derive(Deserialize)]
struct LoginForm {
    username: String,
    password: String,
}

async fn login(State(state): State<Arc<SharedState>>, Form(form): Form<LoginForm>) -> Response {
    let user = state.with_db(|db| db.get_user(&form.username)).flatten();

    match user {
        Some(user) if verify_password(&form.password, &user.password) => {
            let max_age = Duration::from_millis(state.config.session_ttl_ms);
            let token = state.sessions.create(&user.username, max_age);
            tracing::info!(username = %user.username, "Login succeeded");
            let cookie = format!(
                "{SESSION_COOKIE}={token}; Max-Age={}; Path=/",
                max_age.as_secs()
            );
            ([(header::SET_COOKIE, cookie)], Redirect::to("/")).into_response()
        }
        _ => {
            tracing::info!(username = %form.username, "Login failed");
            Redirect::to("/login").into_response()
        }
    }
}

async fn logout(
    State(state): State<Arc<SharedState>>,
    Extension(auth): Extension<AuthSession>,
) -> Response {
    state.sessions.delete(&auth.token);
    let cookie = format!("{SESSION_COOKIE}=; Max-Age=0; Path=/");
    ([(header::SET_COOKIE, cookie)], Redirect::to("/login")).into_response()
}

async fn profile(Extension(auth): Extension<AuthSession>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "username": auth.username }))
}

/// Check a password against its stored salted hash.
///
/// Stored format (fixed, inherited from the user database): a 20-character
/// salt followed by `base64(sha256(password + salt))`.
pub fn verify_password(password: &str, salted_hash: &str) -> bool {
    let (Some(salt), Some(expected)) = (salted_hash.get(..20), salted_hash.get(20..)) else {
        return false;
    };
    let digest = Sha256::digest(format!("{password}{salt}").as_bytes());
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(digest) == expected
}
