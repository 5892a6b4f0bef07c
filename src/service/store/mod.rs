mod data;

pub use data::Data;

use crate::{
    protocol::{RoomId, RoundId, RoundState},
    service::rooms::model::{Participant, Room, Round, SessionHistoryEntry, Vote},
    Result,
};

/// System-of-record access. The room actor is the only writer for a room's
/// rows; sessions and the gateway read through here.
pub struct Service {
    pub db: &'static dyn Data,
}

impl Service {
    #[tracing::instrument(skip(self))]
    pub fn room(&self, room_id: &RoomId) -> Result<Option<Room>> {
        self.db.room(room_id)
    }

    pub fn put_room(&self, room: &Room) -> Result<()> {
        self.db.put_room(room)
    }

    pub fn set_room_last_active(&self, room_id: &RoomId, timestamp: u64) -> Result<()> {
        self.db.set_room_last_active(room_id, timestamp)
    }

    pub fn upsert_participant(&self, participant: &Participant) -> Result<()> {
        self.db.upsert_participant(participant)
    }

    pub fn participants_in_room(&self, room_id: &RoomId) -> Result<Vec<Participant>> {
        self.db.participants_in_room(room_id)
    }

    pub fn insert_round(&self, round: &Round) -> Result<()> {
        self.db.insert_round(round)
    }

    pub fn update_round(&self, round: &Round, expected_state: RoundState) -> Result<()> {
        self.db.update_round(round, expected_state)
    }

    pub fn round(&self, room_id: &RoomId, round_number: u64) -> Result<Option<Round>> {
        self.db.round(room_id, round_number)
    }

    pub fn rounds_in_room(&self, room_id: &RoomId) -> Result<Vec<Round>> {
        self.db.rounds_in_room(room_id)
    }

    pub fn max_round_number(&self, room_id: &RoomId) -> Result<u64> {
        self.db.max_round_number(room_id)
    }

    pub fn insert_vote(&self, vote: &Vote) -> Result<()> {
        self.db.insert_vote(vote)
    }

    pub fn votes_for_round(&self, round_id: &RoundId) -> Result<Vec<Vote>> {
        self.db.votes_for_round(round_id)
    }

    pub fn append_session_history(&self, entry: &SessionHistoryEntry) -> Result<()> {
        self.db.append_session_history(entry)
    }

    pub fn room_event_counter(&self, room_id: &RoomId) -> Result<u64> {
        self.db.room_event_counter(room_id)
    }

    pub fn set_room_event_counter(&self, room_id: &RoomId, value: u64) -> Result<()> {
        self.db.set_room_event_counter(room_id, value)
    }
}
