use std::borrow::Cow;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, Query,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::debug;

use crate::{
    protocol::{close_code, error_frame_for, RoomId},
    services,
    utils::error::ErrorCode,
    Error,
};

use super::session;

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

/// `GET /ws/room/{room_id}?token={jwt}`
///
/// A malformed room id is rejected before the upgrade with a plain 404.
/// Everything after the upgrade speaks the wire protocol: token, room and
/// privacy failures send an `error.v1` and close.
pub async fn upgrade(
    Path(room_id): Path<String>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    if services().globals.shutting_down() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let Ok(room_id) = RoomId::parse(&room_id) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    ws.on_upgrade(move |socket| accept(socket, room_id, query.token))
}

async fn accept(socket: WebSocket, room_id: RoomId, token: Option<String>) {
    let principal = match token.as_deref() {
        Some(token) => match services().auth.validate_token(token) {
            Ok(principal) => principal,
            Err(error) => return refuse(socket, error).await,
        },
        None => {
            return refuse(
                socket,
                Error::BadRequest(ErrorCode::Unauthorized, "Missing access token."),
            )
            .await
        }
    };

    let room = match services().store.room(&room_id) {
        Ok(Some(room)) if room.deleted_at.is_none() => room,
        Ok(_) => {
            return refuse(
                socket,
                Error::BadRequest(ErrorCode::RoomNotFound, "Room does not exist."),
            )
            .await
        }
        Err(error) => return refuse(socket, error).await,
    };

    if let Err(error) = services().auth.check_join(&principal, &room) {
        return refuse(socket, error).await;
    }

    debug!(%room_id, user_id = %principal.user_id, "connection accepted");
    session::run(socket, room_id, principal).await;
}

/// Sends the application error, then closes. The gateway never sends
/// `room.state`; that is the session's job after a valid join.
async fn refuse(mut socket: WebSocket, error: Error) {
    let frame = error_frame_for(&error, None);
    let _ = socket.send(Message::Text(frame)).await;

    let code = match error.wire_code() {
        ErrorCode::Internal => close_code::INTERNAL,
        _ => close_code::POLICY_VIOLATION,
    };
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: Cow::Borrowed("connection refused"),
        })))
        .await;
}
