use crate::{
    protocol::{RoomId, RoundId, RoundState},
    service::rooms::model::{Participant, Room, Round, SessionHistoryEntry, Vote},
    Result,
};

pub trait Data: Send + Sync {
    fn room(&self, room_id: &RoomId) -> Result<Option<Room>>;

    /// Seeds a room row. Room CRUD lives outside the core; this exists for
    /// fixtures and the admin tooling that shares the database.
    fn put_room(&self, room: &Room) -> Result<()>;

    fn set_room_last_active(&self, room_id: &RoomId, timestamp: u64) -> Result<()>;

    fn upsert_participant(&self, participant: &Participant) -> Result<()>;

    fn participants_in_room(&self, room_id: &RoomId) -> Result<Vec<Participant>>;

    /// Fails with `Error::RoundNumberTaken` when `(room_id, round_number)`
    /// already exists.
    fn insert_round(&self, round: &Round) -> Result<()>;

    /// Optimistic update: fails with `Error::RoundStateConflict` unless the
    /// stored round is still in `expected_state`.
    fn update_round(&self, round: &Round, expected_state: RoundState) -> Result<()>;

    fn round(&self, room_id: &RoomId, round_number: u64) -> Result<Option<Round>>;

    fn rounds_in_room(&self, room_id: &RoomId) -> Result<Vec<Round>>;

    fn max_round_number(&self, room_id: &RoomId) -> Result<u64>;

    /// Fails with `Error::DuplicateVote` when this participant already voted
    /// in this round. The `(round_id, participant_id)` key is the primary
    /// key; there is no update path, votes are immutable.
    fn insert_vote(&self, vote: &Vote) -> Result<()>;

    fn votes_for_round(&self, round_id: &RoundId) -> Result<Vec<Vote>>;

    fn append_session_history(&self, entry: &SessionHistoryEntry) -> Result<()>;

    /// Last event id this room ever published, 0 if none. Seeds the actor's
    /// counter across unload/reload so ids stay monotonic.
    fn room_event_counter(&self, room_id: &RoomId) -> Result<u64>;

    fn set_room_event_counter(&self, room_id: &RoomId, value: u64) -> Result<()>;
}
