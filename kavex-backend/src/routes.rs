use crate::error::AppError;
use crate::helpers::hash_token;
use crate::validation;
use crate::AppState;

use axum::{
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    Json,
};
use axum_extra::TypedHeader;
use axum_macros::debug_handler;
use headers::authorization::Bearer;
use headers::Authorization;
use serde::Serialize;
use std::sync::Arc;

#[derive(Serialize)]
pub(crate) struct StatusResponse {
    linked: bool,
    guild_id: u64,
    channel_id: u64,
    status: String,
    session_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_seen_at: Option<i64>,
}

/// Upgrade into a plugin bridge session.
pub(crate) async fn bridge_socket(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let bridge = state.bridge.clone();
    ws.max_message_size(state.config.max_frame_bytes)
        .on_upgrade(move |socket| async move {
            bridge.run(socket).await;
        })
}

/// Plugin self-check: which link does my token belong to, and is it live?
#[debug_handler]
pub(crate) async fn status(
    State(state): State<Arc<AppState>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
) -> Result<impl IntoResponse, AppError> {
    validation::validate_token(auth.token())?;
    let token_hash = hash_token(auth.token(), &state.config.token_pepper);

    let link = state
        .db
        .get_link_by_token_hash(token_hash)
        .await?
        .ok_or(AppError::Unauthorized)?;

    let session_active = state.registry.lookup(link.channel_id).await.is_some();

    Ok(Json(StatusResponse {
        linked: true,
        guild_id: link.guild_id,
        channel_id: link.channel_id,
        status: link.status.to_string(),
        session_active,
        last_seen_at: link.last_seen_at,
    }))
}
