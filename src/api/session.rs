//! One client's lifecycle on one socket.
//!
//! ```text
//!   CONNECTED ──join received──▶ JOINED ──disconnect──▶ GRACE ──reconnect──▶ JOINED
//!       │                            │                    │
//!       │ 10s no join                │ close              │ 5 min expiry
//!       ▼                            ▼                    ▼
//!     CLOSED(1008)                CLOSED(1000)          GONE
//! ```
//!
//! Inbound handling is strictly sequential: decode, authorize, forward to
//! the room actor, await the reply, write. Broadcasts reach this connection
//! through the registry fan-out and are written in actor emission order.

use std::{borrow::Cow, time::Duration};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{
    sink::SinkExt,
    stream::{SplitStream, StreamExt},
};
use lru_cache::LruCache;
use tokio::{
    sync::mpsc,
    time::{sleep_until, Instant},
};
use tracing::{debug, warn};

use crate::{
    protocol::{
        close_code, error_frame, error_frame_for, ClientMessage, Envelope, ParticipantId, Role,
        RoomId,
    },
    service::{auth::Principal, rate_limiting::TokenBucket, registry::SessionId},
    services, utils,
    utils::error::ErrorCode,
    Error,
};

const DEDUP_CACHE_SIZE: usize = 256;
const DEDUP_TTL: Duration = Duration::from_secs(60);

/// Result of a request kept for its requestId, so a retransmission gets the
/// original outcome instead of a second application.
struct CachedReply {
    frame: Option<String>,
    cached_at: Instant,
}

struct Joined {
    session_id: SessionId,
    participant_id: ParticipantId,
    role: Role,
}

enum Exit {
    /// Client said goodbye or asked to leave; participant is gone.
    Graceful,
    /// Transport died or heartbeat lapsed; participant enters grace.
    Ungraceful,
    /// Never joined; nothing to clean up room-side.
    NeverJoined,
}

pub(crate) async fn run(socket: WebSocket, room_id: RoomId, principal: Principal) {
    let (mut sink, mut stream) = socket.split();
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

    // All writes leave through this task, in queue order
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if sink.send(message).await.is_err() || closing {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut session = Session {
        room_id,
        principal,
        outbound,
        inbound_bucket: TokenBucket::new(
            services().globals.config.message_rate_limit,
            services().globals.config.message_rate_limit,
            Duration::from_secs(60),
        ),
        dedup: LruCache::new(DEDUP_CACHE_SIZE),
        joined: None,
    };

    let exit = session.run(&mut stream).await;

    match (&exit, &session.joined) {
        (Exit::Graceful, Some(joined)) => {
            services()
                .registry
                .leave(&session.room_id, joined.session_id);
            services()
                .rooms
                .leave(&session.room_id, joined.participant_id.clone(), "left")
                .await;
        }
        (Exit::Ungraceful, Some(joined)) => {
            services()
                .registry
                .leave(&session.room_id, joined.session_id);
            services()
                .rooms
                .disconnected(&session.room_id, joined.participant_id.clone())
                .await;
        }
        _ => {}
    }

    // Dropping the session drops the outbound sender, the registry entry is
    // gone, so the writer drains and stops
    drop(session);
    let _ = writer.await;
}

struct Session {
    room_id: RoomId,
    principal: Principal,
    outbound: mpsc::UnboundedSender<Message>,
    inbound_bucket: TokenBucket,
    dedup: LruCache<String, CachedReply>,
    joined: Option<Joined>,
}

impl Session {
    async fn run(&mut self, stream: &mut SplitStream<WebSocket>) -> Exit {
        let drain = services().globals.draining.watch();
        tokio::pin!(drain);

        let token_deadline = self.token_deadline();

        // CONNECTED: nothing but a valid join gets us further
        let join_deadline = Instant::now() + services().globals.join_deadline();
        loop {
            tokio::select! {
                () = &mut drain => {
                    self.close(close_code::GOING_AWAY, "server shutting down");
                    return Exit::NeverJoined;
                }
                () = sleep_until(join_deadline) => {
                    self.send_frame(error_frame(
                        ErrorCode::PolicyViolation,
                        "No join received within the deadline.",
                        None,
                        None,
                    ));
                    self.close(close_code::POLICY_VIOLATION, "join deadline exceeded");
                    return Exit::NeverJoined;
                }
                () = sleep_until(token_deadline) => {
                    self.expire_token();
                    return Exit::NeverJoined;
                }
                message = stream.next() => match message {
                    None | Some(Err(_)) => return Exit::NeverJoined,
                    Some(Ok(Message::Close(_))) => return Exit::NeverJoined,
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Binary(_))) => self.send_frame(error_frame(
                        ErrorCode::Validation,
                        "Only text frames are accepted.",
                        None,
                        None,
                    )),
                    Some(Ok(Message::Text(text))) => {
                        if self.handle_connected(&text).await {
                            break;
                        }
                    }
                }
            }
        }

        // JOINED: pump messages until the peer goes away
        let heartbeat = services().globals.heartbeat_timeout();
        let mut heartbeat_deadline = Instant::now() + heartbeat;
        loop {
            tokio::select! {
                () = &mut drain => {
                    self.close(close_code::GOING_AWAY, "server shutting down");
                    return Exit::Ungraceful;
                }
                () = sleep_until(heartbeat_deadline) => {
                    debug!("heartbeat timeout, closing");
                    self.close(close_code::GOING_AWAY, "heartbeat timeout");
                    return Exit::Ungraceful;
                }
                () = sleep_until(token_deadline) => {
                    self.expire_token();
                    return Exit::Ungraceful;
                }
                message = stream.next() => match message {
                    None | Some(Err(_)) => return Exit::Ungraceful,
                    Some(Ok(Message::Close(_))) => {
                        self.close(close_code::NORMAL, "bye");
                        return Exit::Graceful;
                    }
                    Some(Ok(Message::Ping(_))) => {
                        // The transport pongs for us; a ping is proof of life
                        heartbeat_deadline = Instant::now() + heartbeat;
                    }
                    // A pong on this socket proves nothing about the peer's
                    // intent to rejoin; only room.join.v1 restores a session
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Binary(_))) => self.send_frame(error_frame(
                        ErrorCode::Validation,
                        "Only text frames are accepted.",
                        None,
                        None,
                    )),
                    Some(Ok(Message::Text(text))) => {
                        if self.handle_joined(&text).await {
                            self.close(close_code::NORMAL, "bye");
                            return Exit::Graceful;
                        }
                    }
                }
            }
        }
    }

    fn token_deadline(&self) -> Instant {
        let now = utils::secs_since_unix_epoch();
        let remaining = self.principal.expires_at.saturating_sub(now);
        Instant::now()
            .checked_add(Duration::from_secs(remaining))
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(86400 * 365 * 30))
    }

    fn expire_token(&mut self) {
        self.send_frame(error_frame(
            ErrorCode::Unauthorized,
            "Access token expired.",
            None,
            None,
        ));
        self.close(close_code::GOING_AWAY, "token expired");
    }

    /// Handles one text frame before the join. Returns `true` once joined.
    async fn handle_connected(&mut self, text: &str) -> bool {
        let Some(envelope) = self.decode(text) else {
            return false;
        };
        let request_id = envelope.request_id.clone();

        let message = match ClientMessage::parse(&envelope) {
            Ok(message) => message,
            Err(error) => {
                self.send_error(&error, request_id.as_deref());
                return false;
            }
        };

        let ClientMessage::Join(join) = message else {
            self.send_error(
                &Error::BadRequest(ErrorCode::InvalidState, "Join the room first."),
                request_id.as_deref(),
            );
            return false;
        };

        let display_name = join.display_name.trim().to_owned();
        if display_name.is_empty() || display_name.chars().count() > 64 {
            self.send_error(
                &Error::BadRequest(
                    ErrorCode::Validation,
                    "Display name must be between 1 and 64 characters.",
                ),
                request_id.as_deref(),
            );
            return false;
        }

        // Attach to the registry first so no broadcast between snapshot and
        // fan-out can be missed; duplicates are resolved client-side by
        // event id.
        let session_id = services().registry.next_session_id();
        services()
            .registry
            .join(&self.room_id, session_id, self.outbound.clone());

        let outcome = services()
            .rooms
            .register(
                &self.room_id,
                self.principal.clone(),
                display_name,
                join.role,
                join.last_event_id,
                request_id.clone(),
            )
            .await;

        match outcome {
            Ok(outcome) => {
                self.send_frame(outcome.snapshot);
                for frame in outcome.replay {
                    self.send_frame(frame);
                }
                self.joined = Some(Joined {
                    session_id,
                    participant_id: outcome.participant_id,
                    role: outcome.role,
                });
                true
            }
            Err(error) => {
                services().registry.leave(&self.room_id, session_id);
                self.send_error(&error, request_id.as_deref());
                false
            }
        }
    }

    /// Handles one text frame after the join. Returns `true` when the client
    /// asked to leave and the session should close normally.
    async fn handle_joined(&mut self, text: &str) -> bool {
        let Some(envelope) = self.decode(text) else {
            return false;
        };
        let request_id = envelope.request_id.clone();

        // Retransmission: answer from the cache, never re-apply
        if let Some(request_id) = request_id.as_deref() {
            if let Some(cached) = self.dedup_lookup(request_id) {
                if let Some(frame) = cached {
                    self.send_frame(frame);
                }
                return false;
            }
        }

        let message = match ClientMessage::parse(&envelope) {
            Ok(message) => message,
            Err(error) => {
                self.send_error(&error, request_id.as_deref());
                return false;
            }
        };

        let joined = self.joined.as_ref().expect("session is joined");
        if let Err(error) = services().auth.check_message_role(joined.role, &message) {
            self.send_error(&error, request_id.as_deref());
            return false;
        }

        let participant_id = joined.participant_id.clone();
        match message {
            ClientMessage::Join(_) => {
                self.send_error(
                    &Error::BadRequest(ErrorCode::InvalidState, "Already joined."),
                    request_id.as_deref(),
                );
                false
            }
            ClientMessage::Leave => true,
            ClientMessage::Sync => {
                let result = services()
                    .rooms
                    .snapshot(&self.room_id, participant_id, request_id.clone())
                    .await;
                match result {
                    Ok(frame) => self.send_frame(frame),
                    Err(error) => self.send_error(&error, request_id.as_deref()),
                }
                false
            }
            ClientMessage::StartRound(payload) => {
                let result = services()
                    .rooms
                    .start_round(
                        &self.room_id,
                        participant_id,
                        payload.story_title,
                        payload.timer_seconds,
                        request_id.clone(),
                    )
                    .await;
                self.finish_command(result, request_id.as_deref());
                false
            }
            ClientMessage::CastVote(payload) => {
                let result = services()
                    .rooms
                    .cast_vote(
                        &self.room_id,
                        participant_id,
                        payload.card_value,
                        request_id.clone(),
                    )
                    .await;
                self.finish_command(result, request_id.as_deref());
                false
            }
            ClientMessage::Reveal => {
                let result = services()
                    .rooms
                    .reveal(&self.room_id, participant_id, request_id.clone())
                    .await;
                self.finish_command(result, request_id.as_deref());
                false
            }
            ClientMessage::Reset(payload) => {
                let result = services()
                    .rooms
                    .reset(
                        &self.room_id,
                        participant_id,
                        payload.clear_votes,
                        request_id.clone(),
                    )
                    .await;
                self.finish_command(result, request_id.as_deref());
                false
            }
            ClientMessage::Chat(payload) => {
                let result = services()
                    .rooms
                    .chat(
                        &self.room_id,
                        participant_id,
                        payload.message,
                        payload.reply_to,
                        request_id.clone(),
                    )
                    .await;
                self.finish_command(result, request_id.as_deref());
                false
            }
        }
    }

    fn finish_command(
        &mut self,
        result: crate::Result<crate::service::rooms::CommandAck>,
        request_id: Option<&str>,
    ) {
        match result {
            Ok(ack) => {
                // The broadcast is the reply; remember it for retransmits
                if let Some(request_id) = request_id {
                    self.dedup.insert(
                        request_id.to_owned(),
                        CachedReply {
                            frame: ack.frame,
                            cached_at: Instant::now(),
                        },
                    );
                }
            }
            Err(error) => {
                let frame = error_frame_for(&error, request_id);
                self.send_frame(frame.clone());
                if let Some(request_id) = request_id {
                    self.dedup.insert(
                        request_id.to_owned(),
                        CachedReply {
                            frame: Some(frame),
                            cached_at: Instant::now(),
                        },
                    );
                }
            }
        }
    }

    fn dedup_lookup(&mut self, request_id: &str) -> Option<Option<String>> {
        let fresh = match self.dedup.get_mut(request_id) {
            None => return None,
            Some(cached) => cached.cached_at.elapsed() <= DEDUP_TTL,
        };

        if fresh {
            self.dedup.get_mut(request_id).map(|cached| cached.frame.clone())
        } else {
            self.dedup.remove(request_id);
            None
        }
    }

    /// Decodes an envelope, enforcing the per-connection rate limit first.
    /// Returns `None` after answering with the appropriate error.
    fn decode(&mut self, text: &str) -> Option<Envelope> {
        if !self.inbound_bucket.try_acquire() {
            // Does not propagate further
            self.send_frame(error_frame(
                ErrorCode::RateLimited,
                "You are sending messages too quickly.",
                None,
                None,
            ));
            return None;
        }

        match Envelope::decode(text) {
            Ok(envelope) => Some(envelope),
            Err(error) => {
                // Deliberately no requestId echo, the frame wasn't parsable
                self.send_error(&error, None);
                None
            }
        }
    }

    fn send_frame(&self, frame: String) {
        let _ = self.outbound.send(Message::Text(frame));
    }

    fn send_error(&self, error: &Error, request_id: Option<&str>) {
        if matches!(error.wire_code(), ErrorCode::Internal) {
            warn!("command failed: {error}");
        }
        self.send_frame(error_frame_for(error, request_id));

        // A frame we cannot serialize means this connection's view of the
        // room can no longer be trusted
        if matches!(error, Error::JsonError { .. }) {
            self.close(close_code::INTERNAL, "encoding failure");
        }
    }

    fn close(&self, code: u16, reason: &'static str) {
        let _ = self.outbound.send(Message::Close(Some(CloseFrame {
            code,
            reason: Cow::Borrowed(reason),
        })));
    }
}
