mod actor;
pub mod model;
pub mod replay;

pub use actor::{CommandAck, RegisterOutcome, RoomCommand};

use std::{collections::HashMap, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::{
    protocol::{ParticipantId, Role, RoomId},
    service::{auth::Principal, bus, store},
    utils::error::ErrorCode,
    Config, Error, Result,
};

use actor::{RoomActor, Shared};

const COMMAND_QUEUE_DEPTH: usize = 64;

/// Registry of room actors. Actors spawn lazily on the first command for
/// their room and unload after sitting idle; a stale entry here just means
/// the next command respawns one.
pub struct Service {
    shared: Arc<Shared>,
    actors: Mutex<HashMap<RoomId, mpsc::Sender<RoomCommand>>>,
}

impl Service {
    pub fn build(
        db: &'static dyn store::Data,
        bus: Arc<bus::Service>,
        config: &Config,
    ) -> Self {
        let shared = Arc::new(Shared {
            db,
            bus,
            room_capacity: config.room_capacity,
            free_tier_room_capacity: config.capacity_for_free_tier(),
            grace_period: Duration::from_secs(config.grace_period_s),
            idle_timeout: Duration::from_secs(config.actor_idle_timeout_s),
            replay_window: Duration::from_secs(config.replay_window_s),
            replay_capacity: config.replay_capacity,
            chat_rate_limit: config.chat_rate_limit,
            chat_rate_window: Duration::from_secs(30),
            decks: config.decks.clone(),
            default_deck: config.default_deck.clone(),
        });

        Self {
            shared,
            actors: Mutex::new(HashMap::new()),
        }
    }

    async fn send_command(&self, room_id: &RoomId, mut command: RoomCommand) {
        loop {
            let sender = self.actor_sender(room_id);
            match sender.send(command).await {
                Ok(()) => return,
                // The actor unloaded between lookup and send; respawn
                Err(mpsc::error::SendError(returned)) => {
                    self.actors.lock().remove(room_id);
                    command = returned;
                }
            }
        }
    }

    fn actor_sender(&self, room_id: &RoomId) -> mpsc::Sender<RoomCommand> {
        let mut actors = self.actors.lock();
        if let Some(sender) = actors.get(room_id) {
            if !sender.is_closed() {
                return sender.clone();
            }
        }

        let (sender, receiver) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let actor = RoomActor::new(room_id.clone(), Arc::clone(&self.shared), receiver);
        tokio::spawn(actor.run());
        actors.insert(room_id.clone(), sender.clone());
        sender
    }

    fn actor_gone<T>() -> Result<T> {
        Err(Error::BadRequest(
            ErrorCode::Internal,
            "Room actor went away.",
        ))
    }

    #[tracing::instrument(skip(self, principal, request_id))]
    pub async fn register(
        &self,
        room_id: &RoomId,
        principal: Principal,
        display_name: String,
        requested_role: Option<Role>,
        last_event_id: Option<u64>,
        request_id: Option<String>,
    ) -> Result<RegisterOutcome> {
        let (reply, rx) = oneshot::channel();
        self.send_command(
            room_id,
            RoomCommand::Register {
                principal,
                display_name,
                requested_role,
                last_event_id,
                request_id,
                reply,
            },
        )
        .await;
        rx.await.unwrap_or_else(|_| Self::actor_gone())
    }

    pub async fn leave(&self, room_id: &RoomId, participant_id: ParticipantId, reason: &str) {
        self.send_command(
            room_id,
            RoomCommand::Leave {
                participant_id,
                reason: reason.to_owned(),
            },
        )
        .await;
    }

    pub async fn disconnected(&self, room_id: &RoomId, participant_id: ParticipantId) {
        self.send_command(room_id, RoomCommand::Disconnected { participant_id })
            .await;
    }

    pub async fn snapshot(
        &self,
        room_id: &RoomId,
        participant_id: ParticipantId,
        request_id: Option<String>,
    ) -> Result<String> {
        let (reply, rx) = oneshot::channel();
        self.send_command(
            room_id,
            RoomCommand::Snapshot {
                participant_id,
                request_id,
                reply,
            },
        )
        .await;
        rx.await.unwrap_or_else(|_| Self::actor_gone())
    }

    pub async fn start_round(
        &self,
        room_id: &RoomId,
        participant_id: ParticipantId,
        story_title: Option<String>,
        timer_seconds: Option<u64>,
        request_id: Option<String>,
    ) -> Result<CommandAck> {
        let (reply, rx) = oneshot::channel();
        self.send_command(
            room_id,
            RoomCommand::StartRound {
                participant_id,
                story_title,
                timer_seconds,
                request_id,
                reply,
            },
        )
        .await;
        rx.await.unwrap_or_else(|_| Self::actor_gone())
    }

    pub async fn cast_vote(
        &self,
        room_id: &RoomId,
        participant_id: ParticipantId,
        card_value: String,
        request_id: Option<String>,
    ) -> Result<CommandAck> {
        let (reply, rx) = oneshot::channel();
        self.send_command(
            room_id,
            RoomCommand::CastVote {
                participant_id,
                card_value,
                request_id,
                reply,
            },
        )
        .await;
        rx.await.unwrap_or_else(|_| Self::actor_gone())
    }

    pub async fn reveal(
        &self,
        room_id: &RoomId,
        participant_id: ParticipantId,
        request_id: Option<String>,
    ) -> Result<CommandAck> {
        let (reply, rx) = oneshot::channel();
        self.send_command(
            room_id,
            RoomCommand::Reveal {
                participant_id,
                request_id,
                reply,
            },
        )
        .await;
        rx.await.unwrap_or_else(|_| Self::actor_gone())
    }

    pub async fn reset(
        &self,
        room_id: &RoomId,
        participant_id: ParticipantId,
        clear_votes: bool,
        request_id: Option<String>,
    ) -> Result<CommandAck> {
        let (reply, rx) = oneshot::channel();
        self.send_command(
            room_id,
            RoomCommand::Reset {
                participant_id,
                clear_votes,
                request_id,
                reply,
            },
        )
        .await;
        rx.await.unwrap_or_else(|_| Self::actor_gone())
    }

    pub async fn chat(
        &self,
        room_id: &RoomId,
        participant_id: ParticipantId,
        message: String,
        reply_to: Option<String>,
        request_id: Option<String>,
    ) -> Result<CommandAck> {
        let (reply, rx) = oneshot::channel();
        self.send_command(
            room_id,
            RoomCommand::Chat {
                participant_id,
                message,
                reply_to,
                request_id,
                reply,
            },
        )
        .await;
        rx.await.unwrap_or_else(|_| Self::actor_gone())
    }
}
