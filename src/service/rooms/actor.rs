use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};

use serde_json::json;
use tokio::{
    sync::{mpsc, oneshot},
    time::{sleep_until, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    protocol::{
        ParticipantId, RevealedVote, Role, RoomId, RoomStateSnapshot, RoundInfo, RoundState,
        ServerEvent, Tier,
    },
    service::{auth::Principal, bus, rate_limiting::TokenBucket, store},
    utils::{self, error::ErrorCode},
    Error, Result,
};

use super::{
    model::{compute_stats, Participant, Round, SessionHistoryEntry, Vote},
    replay::ReplayBuffer,
};

/// Dependencies and limits shared by every room actor on this node.
pub(super) struct Shared {
    pub db: &'static dyn store::Data,
    pub bus: Arc<bus::Service>,
    pub room_capacity: usize,
    pub free_tier_room_capacity: usize,
    pub grace_period: Duration,
    pub idle_timeout: Duration,
    pub replay_window: Duration,
    pub replay_capacity: usize,
    pub chat_rate_limit: u32,
    pub chat_rate_window: Duration,
    pub decks: BTreeMap<String, Vec<String>>,
    pub default_deck: String,
}

impl Shared {
    fn deck(&self, name: &str) -> Vec<String> {
        self.decks
            .get(name)
            .or_else(|| self.decks.get(&self.default_deck))
            .cloned()
            .unwrap_or_default()
    }
}

/// What a successful `room.join.v1` hands back to the session: the state
/// snapshot to send first, then any buffered events the client missed.
pub struct RegisterOutcome {
    pub participant_id: ParticipantId,
    pub role: Role,
    pub snapshot: String,
    pub replay: Vec<String>,
}

/// Reply to a state-changing command. `frame` is the primary broadcast the
/// command produced; sessions keep it in the dedup cache so a retransmitted
/// requestId can be answered without re-applying.
pub struct CommandAck {
    pub frame: Option<String>,
}

type AckReply = oneshot::Sender<Result<CommandAck>>;

pub enum RoomCommand {
    Register {
        principal: Principal,
        display_name: String,
        requested_role: Option<Role>,
        last_event_id: Option<u64>,
        request_id: Option<String>,
        reply: oneshot::Sender<Result<RegisterOutcome>>,
    },
    Leave {
        participant_id: ParticipantId,
        reason: String,
    },
    Disconnected {
        participant_id: ParticipantId,
    },
    Snapshot {
        participant_id: ParticipantId,
        request_id: Option<String>,
        reply: oneshot::Sender<Result<String>>,
    },
    StartRound {
        participant_id: ParticipantId,
        story_title: Option<String>,
        timer_seconds: Option<u64>,
        request_id: Option<String>,
        reply: AckReply,
    },
    CastVote {
        participant_id: ParticipantId,
        card_value: String,
        request_id: Option<String>,
        reply: AckReply,
    },
    Reveal {
        participant_id: ParticipantId,
        request_id: Option<String>,
        reply: AckReply,
    },
    Reset {
        participant_id: ParticipantId,
        clear_votes: bool,
        request_id: Option<String>,
        reply: AckReply,
    },
    Chat {
        participant_id: ParticipantId,
        message: String,
        reply_to: Option<String>,
        request_id: Option<String>,
        reply: AckReply,
    },
}

/// One room's single writer. All mutations of the room's state pass through
/// this task in a total order; the sequence of published event ids is that
/// order made observable.
pub(super) struct RoomActor {
    room_id: RoomId,
    shared: Arc<Shared>,
    rx: mpsc::Receiver<RoomCommand>,
    state: Option<State>,
    replay: ReplayBuffer,
}

struct State {
    room: super::model::Room,
    participants: HashMap<ParticipantId, Participant>,
    round: Option<Round>,
    votes: HashMap<ParticipantId, Vote>,
    last_event_id: u64,
    chat_buckets: HashMap<ParticipantId, TokenBucket>,
    grace_timers: HashMap<ParticipantId, Instant>,
    round_deadline: Option<Instant>,
    idle_since: Option<Instant>,
}

impl State {
    fn has_host(&self) -> bool {
        self.participants.values().any(|p| p.role == Role::Host)
    }

    fn open_round(&self) -> Option<&Round> {
        self.round
            .as_ref()
            .filter(|round| round.state == RoundState::Open)
    }
}

impl RoomActor {
    pub(super) fn new(
        room_id: RoomId,
        shared: Arc<Shared>,
        rx: mpsc::Receiver<RoomCommand>,
    ) -> Self {
        let replay = ReplayBuffer::new(shared.replay_window, shared.replay_capacity);
        Self {
            room_id,
            shared,
            rx,
            state: None,
            replay,
        }
    }

    pub(super) async fn run(mut self) {
        debug!(room_id = %self.room_id, "room actor started");

        loop {
            let deadline = self.next_deadline();

            tokio::select! {
                command = self.rx.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                () = async { sleep_until(deadline.expect("guarded by condition")).await },
                    if deadline.is_some() =>
                {
                    if self.handle_deadlines().await {
                        break;
                    }
                }
            }
        }

        debug!(room_id = %self.room_id, "room actor stopped");
    }

    fn next_deadline(&self) -> Option<Instant> {
        let state = self.state.as_ref()?;

        let mut next = state.grace_timers.values().min().copied();
        for candidate in [
            state.round_deadline,
            state
                .idle_since
                .map(|since| since + self.shared.idle_timeout),
        ]
        .into_iter()
        .flatten()
        {
            next = Some(match next {
                Some(current) => current.min(candidate),
                None => candidate,
            });
        }
        next
    }

    async fn handle(&mut self, command: RoomCommand) {
        if let Err(error) = self.ensure_loaded() {
            reject(command, error);
            return;
        }

        match command {
            RoomCommand::Register {
                principal,
                display_name,
                requested_role,
                last_event_id,
                request_id,
                reply,
            } => {
                let result = self
                    .register(
                        principal,
                        display_name,
                        requested_role,
                        last_event_id,
                        request_id.as_deref(),
                    )
                    .await;
                let _ = reply.send(result);
            }
            RoomCommand::Leave {
                participant_id,
                reason,
            } => self.leave(&participant_id, &reason).await,
            RoomCommand::Disconnected { participant_id } => {
                self.disconnected(&participant_id).await;
            }
            RoomCommand::Snapshot {
                participant_id,
                request_id,
                reply,
            } => {
                let result = self.snapshot_for(&participant_id, request_id.as_deref());
                let _ = reply.send(result);
            }
            RoomCommand::StartRound {
                participant_id,
                story_title,
                timer_seconds,
                request_id,
                reply,
            } => {
                let result = self
                    .start_round(
                        &participant_id,
                        story_title,
                        timer_seconds,
                        request_id.as_deref(),
                    )
                    .await;
                let _ = reply.send(result);
            }
            RoomCommand::CastVote {
                participant_id,
                card_value,
                request_id,
                reply,
            } => {
                let result = self
                    .cast_vote(&participant_id, card_value, request_id.as_deref())
                    .await;
                let _ = reply.send(result);
            }
            RoomCommand::Reveal {
                participant_id,
                request_id,
                reply,
            } => {
                let result = self.reveal(&participant_id, request_id.as_deref()).await;
                let _ = reply.send(result);
            }
            RoomCommand::Reset {
                participant_id,
                clear_votes,
                request_id,
                reply,
            } => {
                let result = self
                    .reset(&participant_id, clear_votes, request_id.as_deref())
                    .await;
                let _ = reply.send(result);
            }
            RoomCommand::Chat {
                participant_id,
                message,
                reply_to,
                request_id,
                reply,
            } => {
                let result = self
                    .chat(&participant_id, message, reply_to, request_id.as_deref())
                    .await;
                let _ = reply.send(result);
            }
        }
    }

    /// Lazily loads the room and its surviving participants, round and votes
    /// from the store. Runs again after an idle unload.
    fn ensure_loaded(&mut self) -> Result<()> {
        if self.state.is_some() {
            return Ok(());
        }

        let room = self
            .shared
            .db
            .room(&self.room_id)?
            .ok_or(Error::BadRequest(
                ErrorCode::RoomNotFound,
                "Room does not exist.",
            ))?;
        if room.deleted_at.is_some() {
            return Err(Error::BadRequest(
                ErrorCode::RoomNotFound,
                "Room was deleted.",
            ));
        }

        let now_ms = utils::millis_since_unix_epoch();
        let now = Instant::now();

        let mut participants = HashMap::new();
        let mut grace_timers = HashMap::new();
        for mut participant in self.shared.db.participants_in_room(&self.room_id)? {
            if participant.is_connected() {
                // Row says connected but we just loaded: the previous process
                // died with the socket. Give the client the usual grace.
                participant.disconnected_at = Some(now_ms);
                participant.grace_deadline =
                    Some(now_ms + self.shared.grace_period.as_millis() as u64);
                if let Err(e) = self.shared.db.upsert_participant(&participant) {
                    warn!("failed to persist participant grace state: {e}");
                }
            }

            match participant.grace_deadline {
                Some(deadline_ms) if deadline_ms > now_ms => {
                    grace_timers.insert(
                        participant.participant_id.clone(),
                        now + Duration::from_millis(deadline_ms - now_ms),
                    );
                    participants.insert(participant.participant_id.clone(), participant);
                }
                // Grace expired or never granted: the participant is gone
                _ => {}
            }
        }

        let round = self
            .shared
            .db
            .rounds_in_room(&self.room_id)?
            .into_iter()
            .filter(|round| round.state != RoundState::Reset)
            .last();

        let votes = match &round {
            Some(round) => self
                .shared
                .db
                .votes_for_round(&round.round_id)?
                .into_iter()
                .map(|vote| (vote.participant_id.clone(), vote))
                .collect(),
            None => HashMap::new(),
        };

        let last_event_id = self.shared.db.room_event_counter(&self.room_id)?;

        let idle_since = participants.is_empty().then_some(now);
        self.state = Some(State {
            room,
            participants,
            round,
            votes,
            last_event_id,
            chat_buckets: HashMap::new(),
            grace_timers,
            round_deadline: None,
            idle_since,
        });

        Ok(())
    }

    fn state(&mut self) -> &mut State {
        self.state.as_mut().expect("state is loaded")
    }

    /// Fires due grace expiries and the round timer; returns `true` when the
    /// actor has been idle long enough to unload.
    async fn handle_deadlines(&mut self) -> bool {
        let now = Instant::now();

        let expired: Vec<ParticipantId> = self
            .state()
            .grace_timers
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for participant_id in expired {
            self.grace_expired(&participant_id).await;
        }

        if self
            .state()
            .round_deadline
            .map(|deadline| deadline <= now)
            .unwrap_or(false)
        {
            self.state().round_deadline = None;
            self.round_timer_fired().await;
        }

        // Participants still in grace keep the actor (and its replay buffer)
        // loaded; only a fully empty room counts as idle
        let idle_timeout = self.shared.idle_timeout;
        let (empty, idle_since) = {
            let state = self.state();
            (state.participants.is_empty(), state.idle_since)
        };
        if empty {
            if let Some(since) = idle_since {
                if now >= since + idle_timeout {
                    info!(room_id = %self.room_id, "room idle, unloading actor");
                    self.state = None;
                    return true;
                }
            }
        } else if idle_since.is_some() {
            self.state().idle_since = None;
        }

        false
    }

    async fn grace_expired(&mut self, participant_id: &ParticipantId) {
        let state = self.state();
        state.grace_timers.remove(participant_id);
        let Some(participant) = state.participants.remove(participant_id) else {
            return;
        };

        debug!(%participant_id, "grace period expired, participant is gone");
        if let Err(e) = self.shared.db.upsert_participant(&participant) {
            warn!("failed to persist departed participant: {e}");
        }

        self.broadcast(
            ServerEvent::ParticipantLeft {
                participant_id: participant_id.clone(),
                reason: "grace_expired".to_owned(),
            },
            None,
        )
        .await;

        if participant.role == Role::Host {
            self.migrate_host().await;
        }
        self.update_idle();
    }

    async fn round_timer_fired(&mut self) {
        let state = self.state();
        let auto_reveal = state.room.config.auto_reveal;
        let can_reveal = state.open_round().is_some() && !state.votes.is_empty();

        // The timer is advisory; clients render the countdown. Only rooms
        // with auto_reveal flip the cards on expiry.
        if auto_reveal && can_reveal {
            if let Err(e) = self.do_reveal(None).await {
                warn!("auto reveal on timer failed: {e}");
            }
        }
    }

    async fn register(
        &mut self,
        principal: Principal,
        display_name: String,
        requested_role: Option<Role>,
        last_event_id: Option<u64>,
        request_id: Option<&str>,
    ) -> Result<RegisterOutcome> {
        let now_ms = utils::millis_since_unix_epoch();

        // A join with lastEventId from a principal still in grace is a
        // reconnection: same participant, timers canceled, missed events
        // replayed. A pong on the dead socket never restores; this does.
        if last_event_id.is_some() {
            let reconnecting = self
                .state()
                .participants
                .values()
                .find(|p| {
                    !p.is_connected() && p.user_id.as_deref() == Some(principal.user_id.as_str())
                })
                .map(|p| p.participant_id.clone());

            if let Some(participant_id) = reconnecting {
                return self
                    .restore(&participant_id, last_event_id.expect("checked"), request_id)
                    .await;
            }
        }

        let capacity = match self.state().room.owner_tier {
            Tier::Free => self.shared.free_tier_room_capacity,
            _ => self.shared.room_capacity,
        };

        let state = self.state();
        if state.participants.len() >= capacity {
            return Err(Error::BadRequest(ErrorCode::RoomFull, "Room is full."));
        }

        let is_owner = principal.user_id == state.room.owner_user_id;
        let has_host = state.has_host();
        let role = match requested_role {
            Some(Role::Host) => {
                if is_owner || !has_host {
                    Role::Host
                } else {
                    return Err(Error::BadRequest(
                        ErrorCode::Forbidden,
                        "This room already has a host.",
                    ));
                }
            }
            Some(Role::Observer) => Role::Observer,
            Some(Role::Voter) => Role::Voter,
            None => {
                if is_owner && !has_host {
                    Role::Host
                } else {
                    Role::Voter
                }
            }
        };

        let participant = Participant {
            participant_id: ParticipantId::new(),
            room_id: self.room_id.clone(),
            user_id: Some(principal.user_id.clone()),
            display_name,
            role,
            connected_at: now_ms,
            disconnected_at: None,
            grace_deadline: None,
        };
        let participant_id = participant.participant_id.clone();

        if let Err(e) = self.shared.db.upsert_participant(&participant) {
            // Presence-class write, the join itself stands
            warn!("failed to persist participant: {e}");
        }
        let state = self.state();
        state
            .participants
            .insert(participant_id.clone(), participant.clone());
        state.idle_since = None;

        self.broadcast(
            ServerEvent::ParticipantJoined {
                participant: participant.info(),
            },
            request_id,
        )
        .await;

        // The owner reclaiming the host seat demotes whoever held it, so
        // there is never more than one host
        if role == Role::Host {
            let former = self
                .state()
                .participants
                .values()
                .find(|p| p.role == Role::Host && p.participant_id != participant_id)
                .map(|p| p.participant_id.clone());
            if let Some(former) = former {
                self.change_role(&former, Role::Voter, "host_changed").await;
            }
        }

        // A voter walking into a hostless room takes the host seat
        if role == Role::Voter && !self.state().has_host() {
            self.promote(&participant_id, "host_claimed").await;
        }

        let (replay, full_resync) = self.replay_for(last_event_id);
        let snapshot = self.snapshot_frame(request_id, full_resync)?;
        let role = self
            .state()
            .participants
            .get(&participant_id)
            .map(|p| p.role)
            .unwrap_or(role);

        Ok(RegisterOutcome {
            participant_id,
            role,
            snapshot,
            replay,
        })
    }

    async fn restore(
        &mut self,
        participant_id: &ParticipantId,
        last_event_id: u64,
        request_id: Option<&str>,
    ) -> Result<RegisterOutcome> {
        let state = self.state();
        state.grace_timers.remove(participant_id);
        let participant = state
            .participants
            .get_mut(participant_id)
            .expect("participant was found above");
        participant.disconnected_at = None;
        participant.grace_deadline = None;
        let role = participant.role;
        let persisted = participant.clone();
        state.idle_since = None;

        if let Err(e) = self.shared.db.upsert_participant(&persisted) {
            warn!("failed to persist reconnected participant: {e}");
        }

        debug!(%participant_id, "participant reconnected within grace");

        // Snapshot and replay first, so they cover exactly the gap; the
        // presence update reaches this client through the fan-out like
        // everyone else
        let (replay, full_resync) = self.replay_for(Some(last_event_id));
        let snapshot = self.snapshot_frame(request_id, full_resync)?;

        self.broadcast(
            ServerEvent::PresenceUpdate {
                participant_id: participant_id.clone(),
                role,
                reason: "reconnected".to_owned(),
            },
            request_id,
        )
        .await;

        Ok(RegisterOutcome {
            participant_id: participant_id.clone(),
            role,
            snapshot,
            replay,
        })
    }

    fn replay_for(&mut self, last_event_id: Option<u64>) -> (Vec<String>, bool) {
        let Some(last_event_id) = last_event_id else {
            return (Vec::new(), false);
        };
        let latest = self.state().last_event_id;
        match self.replay.replay_from(last_event_id, latest) {
            Some(frames) => (frames, false),
            None => (Vec::new(), true),
        }
    }

    async fn leave(&mut self, participant_id: &ParticipantId, reason: &str) {
        let state = self.state();
        state.grace_timers.remove(participant_id);
        let Some(mut participant) = state.participants.remove(participant_id) else {
            return;
        };

        participant.disconnected_at = Some(utils::millis_since_unix_epoch());
        participant.grace_deadline = None;
        if let Err(e) = self.shared.db.upsert_participant(&participant) {
            warn!("failed to persist leaving participant: {e}");
        }

        self.broadcast(
            ServerEvent::ParticipantLeft {
                participant_id: participant_id.clone(),
                reason: reason.to_owned(),
            },
            None,
        )
        .await;

        if participant.role == Role::Host {
            self.migrate_host().await;
        }
        self.update_idle();
    }

    async fn disconnected(&mut self, participant_id: &ParticipantId) {
        let now_ms = utils::millis_since_unix_epoch();
        let grace_period = self.shared.grace_period;
        let grace_deadline = now_ms + grace_period.as_millis() as u64;

        let state = self.state();
        let Some(participant) = state.participants.get_mut(participant_id) else {
            return;
        };
        if !participant.is_connected() {
            return;
        }

        participant.disconnected_at = Some(now_ms);
        participant.grace_deadline = Some(grace_deadline);
        let persisted = participant.clone();
        state
            .grace_timers
            .insert(participant_id.clone(), Instant::now() + grace_period);

        if let Err(e) = self.shared.db.upsert_participant(&persisted) {
            warn!("failed to persist disconnected participant: {e}");
        }

        self.broadcast(
            ServerEvent::ParticipantDisconnected {
                participant_id: participant_id.clone(),
                grace_deadline,
            },
            None,
        )
        .await;
        self.update_idle();
    }

    /// Deterministic promotion: among connected voters, lowest connected_at,
    /// then lexicographic participant id.
    async fn migrate_host(&mut self) {
        let candidate = self
            .state()
            .participants
            .values()
            .filter(|p| p.is_connected() && p.role == Role::Voter)
            .min_by(|a, b| {
                a.connected_at
                    .cmp(&b.connected_at)
                    .then_with(|| a.participant_id.cmp(&b.participant_id))
            })
            .map(|p| p.participant_id.clone());

        match candidate {
            Some(participant_id) => self.promote(&participant_id, "host_migrated").await,
            // No voter to promote; host-only commands fail until one appears
            None => debug!(room_id = %self.room_id, "no voter to promote, room is hostless"),
        }
    }

    async fn promote(&mut self, participant_id: &ParticipantId, reason: &str) {
        self.change_role(participant_id, Role::Host, reason).await;
    }

    async fn change_role(&mut self, participant_id: &ParticipantId, role: Role, reason: &str) {
        let state = self.state();
        let Some(participant) = state.participants.get_mut(participant_id) else {
            return;
        };
        participant.role = role;
        let persisted = participant.clone();

        if let Err(e) = self.shared.db.upsert_participant(&persisted) {
            warn!("failed to persist role change: {e}");
        }

        info!(%participant_id, ?role, reason, "participant role changed");
        self.broadcast(
            ServerEvent::PresenceUpdate {
                participant_id: participant_id.clone(),
                role,
                reason: reason.to_owned(),
            },
            None,
        )
        .await;
    }

    fn require_participant(&self, participant_id: &ParticipantId) -> Result<&Participant> {
        self.state
            .as_ref()
            .expect("state is loaded")
            .participants
            .get(participant_id)
            .ok_or(Error::BadRequest(
                ErrorCode::Forbidden,
                "You are not in this room.",
            ))
    }

    fn require_host(&self, participant_id: &ParticipantId) -> Result<()> {
        let participant = self.require_participant(participant_id)?;
        if participant.role == Role::Host {
            Ok(())
        } else {
            Err(Error::BadRequest(
                ErrorCode::Forbidden,
                "Only the host can do that.",
            ))
        }
    }

    async fn start_round(
        &mut self,
        participant_id: &ParticipantId,
        story_title: Option<String>,
        timer_seconds: Option<u64>,
        request_id: Option<&str>,
    ) -> Result<CommandAck> {
        self.require_host(participant_id)?;

        if let Some(timer) = timer_seconds {
            if !(10..=600).contains(&timer) {
                return Err(Error::BadRequest(
                    ErrorCode::Validation,
                    "Round timer must be between 10 and 600 seconds.",
                ));
            }
        }

        if self.state().open_round().is_some() {
            return Err(Error::BadRequest(
                ErrorCode::InvalidState,
                "A round is already open.",
            ));
        }

        let (deck_name, timer_default) = {
            let state = self.state();
            (
                state.room.config.deck.clone(),
                state.room.config.timer_seconds,
            )
        };
        let deck_snapshot = self.shared.deck(&deck_name);
        let timer_seconds = timer_seconds.or(timer_default);
        let mut round = Round {
            round_id: crate::protocol::RoundId::new(),
            room_id: self.room_id.clone(),
            round_number: self.shared.db.max_round_number(&self.room_id)? + 1,
            story_title,
            started_at: utils::millis_since_unix_epoch(),
            revealed_at: None,
            deck_snapshot,
            state: RoundState::Open,
            timer_seconds,
            average: None,
            median: None,
            consensus_reached: None,
        };

        self.insert_round_with_retry(&mut round)?;

        let state = self.state();
        state.votes.clear();
        state.round_deadline =
            timer_seconds.map(|timer| Instant::now() + Duration::from_secs(timer));
        state.round = Some(round.clone());

        let info = round_info(&round, &self.state().votes);
        let frame = self
            .broadcast(ServerEvent::RoundStarted(info), request_id)
            .await;

        Ok(CommandAck { frame })
    }

    /// A round-number collision means another writer won the race; re-read
    /// and retry exactly once.
    fn insert_round_with_retry(&mut self, round: &mut Round) -> Result<()> {
        match self.shared.db.insert_round(round) {
            Ok(()) => Ok(()),
            Err(Error::RoundNumberTaken(_)) => {
                round.round_number = self.shared.db.max_round_number(&self.room_id)? + 1;
                self.shared.db.insert_round(round)
            }
            Err(e) => Err(e),
        }
    }

    async fn cast_vote(
        &mut self,
        participant_id: &ParticipantId,
        card_value: String,
        request_id: Option<&str>,
    ) -> Result<CommandAck> {
        let participant = self.require_participant(participant_id)?;
        if participant.role == Role::Observer {
            return Err(Error::BadRequest(
                ErrorCode::Forbidden,
                "Observers cannot vote.",
            ));
        }

        let state = self.state.as_ref().expect("state is loaded");
        let Some(round) = state.open_round() else {
            return Err(Error::BadRequest(
                ErrorCode::InvalidState,
                "There is no open round.",
            ));
        };

        if !round.deck_snapshot.contains(&card_value) {
            return Err(Error::Detailed(
                ErrorCode::InvalidVote,
                "Card value is not in the deck.",
                json!({ "validValues": round.deck_snapshot }),
            ));
        }

        if state.votes.contains_key(participant_id) {
            return Err(Error::BadRequest(
                ErrorCode::InvalidVote,
                "You already voted in this round.",
            ));
        }

        let vote = Vote {
            round_id: round.round_id.clone(),
            participant_id: participant_id.clone(),
            card_value,
            voted_at: utils::millis_since_unix_epoch(),
        };

        // Critical write: the vote is durable before anyone hears about it.
        // A duplicate-key rejection collapses to "already voted".
        self.shared.db.insert_vote(&vote)?;

        let round_id = vote.round_id.clone();
        self.state().votes.insert(participant_id.clone(), vote);

        let frame = self
            .broadcast(
                ServerEvent::VoteRecorded {
                    round_id,
                    participant_id: participant_id.clone(),
                },
                request_id,
            )
            .await;

        let state = self.state.as_ref().expect("state is loaded");
        if state.room.config.auto_reveal {
            let eligible = state
                .participants
                .values()
                .filter(|p| p.is_connected() && p.role != Role::Observer)
                .count();
            if state.votes.len() >= eligible {
                self.do_reveal(None).await?;
            }
        }

        Ok(CommandAck { frame })
    }

    async fn reveal(
        &mut self,
        participant_id: &ParticipantId,
        request_id: Option<&str>,
    ) -> Result<CommandAck> {
        self.require_host(participant_id)?;
        self.do_reveal(request_id).await
    }

    async fn do_reveal(&mut self, request_id: Option<&str>) -> Result<CommandAck> {
        let state = self.state();
        let Some(round) = state.open_round() else {
            return Err(Error::BadRequest(
                ErrorCode::InvalidState,
                "There is no open round to reveal.",
            ));
        };
        if state.votes.is_empty() {
            return Err(Error::BadRequest(
                ErrorCode::InvalidState,
                "Cannot reveal a round with no votes.",
            ));
        }

        let mut round = round.clone();
        let votes: Vec<Vote> = state.votes.values().cloned().collect();
        let stats = compute_stats(&votes, &round.deck_snapshot);

        round.revealed_at = Some(utils::millis_since_unix_epoch());
        round.state = RoundState::Revealed;
        round.average = stats.average;
        round.median = stats.median;
        round.consensus_reached = Some(stats.consensus_reached);

        // Critical write, confirmed before the values go out. A state
        // conflict means someone else revealed first.
        self.shared
            .db
            .update_round(&round, RoundState::Open)
            .map_err(|e| match e {
                Error::RoundStateConflict => {
                    Error::BadRequest(ErrorCode::InvalidState, "The round is not open.")
                }
                other => other,
            })?;

        let state = self.state();
        state.round = Some(round.clone());
        state.round_deadline = None;

        let mut revealed: Vec<RevealedVote> = votes
            .iter()
            .map(|vote| RevealedVote {
                participant_id: vote.participant_id.clone(),
                card_value: vote.card_value.clone(),
            })
            .collect();
        revealed.sort_by(|a, b| a.participant_id.cmp(&b.participant_id));

        let frame = self
            .broadcast(
                ServerEvent::RoundRevealed {
                    round_id: round.round_id.clone(),
                    votes: revealed,
                    stats: stats.clone(),
                },
                request_id,
            )
            .await;

        self.append_history(&round, &stats);

        Ok(CommandAck { frame })
    }

    /// Reporting feed; failures are logged, the reveal stands.
    fn append_history(&mut self, round: &Round, stats: &crate::protocol::RevealStats) {
        let state = self.state.as_ref().expect("state is loaded");

        let total_stories = self
            .shared
            .db
            .rounds_in_room(&self.room_id)
            .map(|rounds| {
                rounds
                    .iter()
                    .filter(|r| r.story_title.is_some())
                    .count() as u64
            })
            .unwrap_or(0);

        let participants: Vec<_> = state.participants.values().map(Participant::info).collect();
        let entry = SessionHistoryEntry {
            session_id: utils::random_string(16),
            room_id: self.room_id.clone(),
            started_at: round.started_at,
            ended_at: round.revealed_at.unwrap_or(round.started_at),
            total_rounds: round.round_number,
            total_stories,
            summary_stats_json: serde_json::to_value(stats).unwrap_or_default(),
            participants_json: serde_json::to_value(participants).unwrap_or_default(),
        };

        if let Err(e) = self.shared.db.append_session_history(&entry) {
            warn!("failed to append session history: {e}");
        }
    }

    async fn reset(
        &mut self,
        participant_id: &ParticipantId,
        clear_votes: bool,
        request_id: Option<&str>,
    ) -> Result<CommandAck> {
        self.require_host(participant_id)?;

        let Some(current) = self.state().round.clone() else {
            return Err(Error::BadRequest(
                ErrorCode::InvalidState,
                "There is no round to reset.",
            ));
        };

        // Resets are never in-place: the current round closes terminally and
        // a fresh one (with a new number) may take its story over.
        let expected = current.state;
        let mut closed = current.clone();
        closed.state = RoundState::Reset;
        self.shared.db.update_round(&closed, expected)?;

        let state = self.state();
        state.round = None;
        state.votes.clear();
        state.round_deadline = None;

        let new_round = if clear_votes {
            let state = self.state.as_ref().expect("state is loaded");
            let deck_snapshot = self.shared.deck(&state.room.config.deck);
            let timer_seconds = state.room.config.timer_seconds;
            let mut round = Round {
                round_id: crate::protocol::RoundId::new(),
                room_id: self.room_id.clone(),
                round_number: self.shared.db.max_round_number(&self.room_id)? + 1,
                story_title: current.story_title.clone(),
                started_at: utils::millis_since_unix_epoch(),
                revealed_at: None,
                deck_snapshot,
                state: RoundState::Open,
                timer_seconds,
                average: None,
                median: None,
                consensus_reached: None,
            };
            self.insert_round_with_retry(&mut round)?;

            let state = self.state();
            state.round_deadline =
                timer_seconds.map(|timer| Instant::now() + Duration::from_secs(timer));
            state.round = Some(round.clone());
            Some(round_info(&round, &HashMap::new()))
        } else {
            None
        };

        let frame = self
            .broadcast(
                ServerEvent::RoundReset {
                    round_id: current.round_id,
                    new_round,
                },
                request_id,
            )
            .await;

        Ok(CommandAck { frame })
    }

    async fn chat(
        &mut self,
        participant_id: &ParticipantId,
        message: String,
        reply_to: Option<String>,
        request_id: Option<&str>,
    ) -> Result<CommandAck> {
        let participant = self.require_participant(participant_id)?;
        let display_name = participant.display_name.clone();
        let is_observer = participant.role == Role::Observer;

        let limit = self.shared.chat_rate_limit;
        let window = self.shared.chat_rate_window;

        let state = self.state();
        if is_observer && !state.room.config.observers_can_chat {
            return Err(Error::BadRequest(
                ErrorCode::Forbidden,
                "Observers cannot chat in this room.",
            ));
        }

        let length = message.chars().count();
        if length == 0 || length > 2000 {
            return Err(Error::BadRequest(
                ErrorCode::Validation,
                "Chat messages must be between 1 and 2000 characters.",
            ));
        }

        let bucket = state
            .chat_buckets
            .entry(participant_id.clone())
            .or_insert_with(|| TokenBucket::new(limit, limit, window));
        if !bucket.try_acquire() {
            return Err(Error::BadRequest(
                ErrorCode::RateLimited,
                "You are sending chat messages too quickly.",
            ));
        }

        let sent_at = utils::millis_since_unix_epoch();
        let frame = self
            .broadcast(
                ServerEvent::ChatMessage {
                    participant_id: participant_id.clone(),
                    display_name,
                    message,
                    reply_to,
                    sent_at,
                },
                request_id,
            )
            .await;

        // Non-critical write; chat is broadcast either way
        if let Err(e) = self
            .shared
            .db
            .set_room_last_active(&self.room_id, sent_at)
        {
            warn!("failed to update room last_active_at: {e}");
        }

        Ok(CommandAck { frame })
    }

    fn snapshot_for(
        &self,
        participant_id: &ParticipantId,
        request_id: Option<&str>,
    ) -> Result<String> {
        self.require_participant(participant_id)?;
        self.snapshot_frame(request_id, false)
    }

    fn snapshot_frame(&self, request_id: Option<&str>, full_resync: bool) -> Result<String> {
        let state = self.state.as_ref().expect("state is loaded");

        let mut participants: Vec<_> =
            state.participants.values().map(Participant::info).collect();
        participants.sort_by(|a, b| a.participant_id.cmp(&b.participant_id));

        let snapshot = RoomStateSnapshot {
            room_id: state.room.room_id.clone(),
            title: state.room.title.clone(),
            privacy_mode: state.room.privacy_mode,
            deck: self.shared.deck(&state.room.config.deck),
            participants,
            round: state.round.as_ref().map(|round| round_info(round, &state.votes)),
            last_event_id: state.last_event_id,
            full_resync,
        };

        ServerEvent::RoomState(snapshot).encode(request_id, None)
    }

    fn update_idle(&mut self) {
        let state = self.state();
        if state.participants.is_empty() {
            if state.idle_since.is_none() {
                state.idle_since = Some(Instant::now());
            }
        } else {
            state.idle_since = None;
        }
    }

    /// Assigns the next event id, stores the frame for replay and hands it
    /// to the bus. The emission order here is the canonical room order.
    async fn broadcast(
        &mut self,
        event: ServerEvent,
        request_id: Option<&str>,
    ) -> Option<String> {
        let state = self.state();
        let event_id = state.last_event_id + 1;

        let request_id = request_id
            .map(ToOwned::to_owned)
            .unwrap_or_else(utils::server_request_id);

        let frame = match event.encode(Some(request_id.as_str()), Some(event_id)) {
            Ok(frame) => frame,
            Err(e) => {
                // Encoding must never take the room down
                warn!("failed to encode {} broadcast: {e}", event.kind());
                return None;
            }
        };

        state.last_event_id = event_id;
        self.replay.push(event_id, frame.clone());

        if let Err(e) = self
            .shared
            .db
            .set_room_event_counter(&self.room_id, event_id)
        {
            warn!("failed to persist event counter: {e}");
        }

        if let Err(e) = self.shared.bus.publish(&self.room_id, frame.clone()).await {
            // Publish is fire-and-forget; a broker gap loses remote
            // delivery, reconnecting clients recover through replay
            warn!("failed to publish event {event_id}: {e}");
        }

        Some(frame)
    }
}

fn round_info(round: &Round, votes: &HashMap<ParticipantId, Vote>) -> RoundInfo {
    let mut voted: Vec<ParticipantId> = votes.keys().cloned().collect();
    voted.sort();

    let (votes_out, stats) = if round.state == RoundState::Revealed {
        let all: Vec<Vote> = votes.values().cloned().collect();
        let mut revealed: Vec<RevealedVote> = all
            .iter()
            .map(|vote| RevealedVote {
                participant_id: vote.participant_id.clone(),
                card_value: vote.card_value.clone(),
            })
            .collect();
        revealed.sort_by(|a, b| a.participant_id.cmp(&b.participant_id));
        (
            Some(revealed),
            Some(compute_stats(&all, &round.deck_snapshot)),
        )
    } else {
        (None, None)
    };

    RoundInfo {
        round_id: round.round_id.clone(),
        round_number: round.round_number,
        story_title: round.story_title.clone(),
        state: round.state,
        started_at: round.started_at,
        timer_seconds: round.timer_seconds,
        voted,
        votes: votes_out,
        stats,
    }
}

fn reject(command: RoomCommand, error: Error) {
    match command {
        RoomCommand::Register { reply, .. } => {
            let _ = reply.send(Err(error));
        }
        RoomCommand::Snapshot { reply, .. } => {
            let _ = reply.send(Err(error));
        }
        RoomCommand::StartRound { reply, .. }
        | RoomCommand::CastVote { reply, .. }
        | RoomCommand::Reveal { reply, .. }
        | RoomCommand::Reset { reply, .. }
        | RoomCommand::Chat { reply, .. } => {
            let _ = reply.send(Err(error));
        }
        RoomCommand::Leave { .. } | RoomCommand::Disconnected { .. } => {}
    }
}
