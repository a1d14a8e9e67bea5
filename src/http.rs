//! HTTP surface: one WebSocket connection per mounted client, each backed by its own
//! notification tracker, plus a plain endpoint for sending messages.

use axum::{
    Json, Router,
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::auth::TokenVerifier;
use crate::db::parse_user_id;
use crate::db::pg_store::PgMessageStore;
use crate::error::{StoreError, TrackerError};
use crate::store::{MessageRecord, MessageStore};
use crate::tracker::{NotificationTracker, TrackerConfig, TrackerHandle};
use crate::unread::{UnreadState, UserId};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<PgMessageStore>,
    pub verifier: TokenVerifier,
    pub tracker_config: TrackerConfig,
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl From<sqlx::Error> for ApiError {
    fn from(error: sqlx::Error) -> Self {
        ApiError::Store(StoreError::Database(error))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) | ApiError::Store(StoreError::InvalidId(_)) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Store(StoreError::Unavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Store(StoreError::Database(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, self.to_string()).into_response()
    }
}

/// Frames sent by the browser over the notifications socket.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientFrame {
    #[serde(rename_all = "camelCase")]
    MarkRead { correspondent_id: UserId },
    DismissToast,
    Refresh,
}

/// Frames pushed to the browser.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerFrame {
    State(UnreadState),
    Error { message: String },
}

#[derive(Debug, Deserialize)]
pub struct NotificationParams {
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    receiver_id: UserId,
    content: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/notifications", get(notifications))
        .route("/messages", post(send_message))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Browsers cannot set headers on a WebSocket handshake, so the token may also come
/// from the query string. The header wins when both are present.
fn authenticate(
    verifier: &TokenVerifier,
    headers: &HeaderMap,
    query_token: Option<&str>,
) -> Result<UserId, ApiError> {
    let token = bearer_token(headers)
        .or(query_token)
        .ok_or_else(|| ApiError::Unauthenticated("Missing token".to_string()))?;
    let claims = verifier
        .verify(token)
        .map_err(|e| ApiError::Unauthenticated(format!("Invalid token: {}", e)))?;
    Ok(claims.user_id())
}

async fn notifications(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<NotificationParams>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let viewer = authenticate(&state.verifier, &headers, params.token.as_deref())?;
    let store: Arc<dyn MessageStore> = state.store.clone();
    let config = state.tracker_config.clone();
    Ok(ws.on_upgrade(move |socket| serve_socket(socket, store, config, viewer)))
}

async fn serve_socket(
    mut socket: WebSocket,
    store: Arc<dyn MessageStore>,
    config: TrackerConfig,
    viewer: UserId,
) {
    info!(%viewer, "notifications socket opened");
    let handle = NotificationTracker::spawn(store, config, Some(viewer.clone()));
    let mut state_rx = handle.watch();

    let initial = ServerFrame::State(state_rx.borrow_and_update().clone());
    if send_frame(&mut socket, &initial).await.is_ok() {
        loop {
            tokio::select! {
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let frame = ServerFrame::State(state_rx.borrow_and_update().clone());
                    if send_frame(&mut socket, &frame).await.is_err() {
                        break;
                    }
                }
                incoming = socket.recv() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientFrame>(text.as_str()) {
                            Ok(frame) => {
                                if apply_frame(&handle, &viewer, frame).await.is_err() {
                                    break;
                                }
                            }
                            Err(error) => {
                                debug!(%error, "bad client frame");
                                let frame = ServerFrame::Error {
                                    message: format!("Unrecognized frame: {}", error),
                                };
                                if send_frame(&mut socket, &frame).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                },
            }
        }
    }

    handle.shutdown().await;
    info!(%viewer, "notifications socket closed");
}

async fn apply_frame(
    handle: &TrackerHandle,
    viewer: &UserId,
    frame: ClientFrame,
) -> Result<(), TrackerError> {
    match frame {
        ClientFrame::MarkRead { correspondent_id } => handle.mark_read(correspondent_id).await,
        ClientFrame::DismissToast => handle.dismiss_toast().await,
        ClientFrame::Refresh => handle.set_viewer(Some(viewer.clone())).await,
    }
}

async fn send_frame(socket: &mut WebSocket, frame: &ServerFrame) -> Result<(), axum::Error> {
    let text = match serde_json::to_string(frame) {
        Ok(text) => text,
        Err(error) => {
            warn!(%error, "failed to encode frame");
            return Ok(());
        }
    };
    socket.send(Message::Text(text.into())).await
}

async fn send_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SendMessage>,
) -> Result<Json<MessageRecord>, ApiError> {
    let sender = authenticate(&state.verifier, &headers, None)?;
    let content = body.content.trim();
    if content.is_empty() {
        return Err(ApiError::BadRequest("Message content is required".to_string()));
    }

    let row = state
        .store
        .messages()
        .insert_message(
            parse_user_id(&sender)?,
            parse_user_id(&body.receiver_id)?,
            content,
        )
        .await?;
    Ok(Json(MessageRecord::from(row)))
}
