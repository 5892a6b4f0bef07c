use crate::{
    database::KeyValueDatabase,
    protocol::{RoomId, RoundId, RoundState},
    service::{
        self,
        rooms::model::{Participant, Room, Round, SessionHistoryEntry, Vote},
    },
    utils, Error, Result,
};

fn room_scoped_key(room_id: &RoomId, suffix: &[u8]) -> Vec<u8> {
    let mut key = room_id.as_str().as_bytes().to_vec();
    key.push(0xff);
    key.extend_from_slice(suffix);
    key
}

impl service::store::Data for KeyValueDatabase {
    fn room(&self, room_id: &RoomId) -> Result<Option<Room>> {
        self.roomid_room
            .get(room_id.as_str().as_bytes())?
            .map(|bytes| {
                serde_json::from_slice(&bytes)
                    .map_err(|_| Error::bad_database("Room in db is invalid."))
            })
            .transpose()
    }

    fn put_room(&self, room: &Room) -> Result<()> {
        self.roomid_room.insert(
            room.room_id.as_str().as_bytes(),
            &serde_json::to_vec(room)?,
        )
    }

    fn set_room_last_active(&self, room_id: &RoomId, timestamp: u64) -> Result<()> {
        let Some(mut room) = self.room(room_id)? else {
            return Err(Error::bad_database("Touched a room that does not exist."));
        };
        room.last_active_at = timestamp;
        self.put_room(&room)
    }

    fn upsert_participant(&self, participant: &Participant) -> Result<()> {
        let key = room_scoped_key(
            &participant.room_id,
            participant.participant_id.as_str().as_bytes(),
        );
        self.roomparticipantid_participant
            .insert(&key, &serde_json::to_vec(participant)?)
    }

    fn participants_in_room(&self, room_id: &RoomId) -> Result<Vec<Participant>> {
        self.roomparticipantid_participant
            .scan_prefix(room_scoped_key(room_id, &[]))?
            .iter()
            .map(|(_, bytes)| {
                serde_json::from_slice(bytes)
                    .map_err(|_| Error::bad_database("Participant in db is invalid."))
            })
            .collect()
    }

    fn insert_round(&self, round: &Round) -> Result<()> {
        let key = room_scoped_key(&round.room_id, &round.round_number.to_be_bytes());

        // (room_id, round_number) is unique; a lost race surfaces as a
        // distinct error so the actor can re-read and retry once
        if self.roomroundnumberid_round.get(&key)?.is_some() {
            return Err(Error::RoundNumberTaken(round.round_number));
        }

        self.roomroundnumberid_round
            .insert(&key, &serde_json::to_vec(round)?)
    }

    fn update_round(&self, round: &Round, expected_state: RoundState) -> Result<()> {
        let key = room_scoped_key(&round.room_id, &round.round_number.to_be_bytes());

        let current: Round = self
            .roomroundnumberid_round
            .get(&key)?
            .map(|bytes| {
                serde_json::from_slice(&bytes)
                    .map_err(|_| Error::bad_database("Round in db is invalid."))
            })
            .transpose()?
            .ok_or_else(|| Error::bad_database("Updated a round that does not exist."))?;

        if current.state != expected_state {
            return Err(Error::RoundStateConflict);
        }

        self.roomroundnumberid_round
            .insert(&key, &serde_json::to_vec(round)?)
    }

    fn round(&self, room_id: &RoomId, round_number: u64) -> Result<Option<Round>> {
        self.roomroundnumberid_round
            .get(&room_scoped_key(room_id, &round_number.to_be_bytes()))?
            .map(|bytes| {
                serde_json::from_slice(&bytes)
                    .map_err(|_| Error::bad_database("Round in db is invalid."))
            })
            .transpose()
    }

    fn rounds_in_room(&self, room_id: &RoomId) -> Result<Vec<Round>> {
        self.roomroundnumberid_round
            .scan_prefix(room_scoped_key(room_id, &[]))?
            .iter()
            .map(|(_, bytes)| {
                serde_json::from_slice(bytes)
                    .map_err(|_| Error::bad_database("Round in db is invalid."))
            })
            .collect()
    }

    fn max_round_number(&self, room_id: &RoomId) -> Result<u64> {
        Ok(self
            .roomroundnumberid_round
            .scan_prefix(room_scoped_key(room_id, &[]))?
            .last()
            .map(|(key, _)| {
                // Key layout puts the BE64 round number last
                let suffix = &key[key.len() - std::mem::size_of::<u64>()..];
                utils::u64_from_bytes(suffix).unwrap_or(0)
            })
            .unwrap_or(0))
    }

    fn insert_vote(&self, vote: &Vote) -> Result<()> {
        let mut key = vote.round_id.as_str().as_bytes().to_vec();
        key.push(0xff);
        key.extend_from_slice(vote.participant_id.as_str().as_bytes());

        if self.roundparticipantid_vote.get(&key)?.is_some() {
            return Err(Error::DuplicateVote);
        }

        self.roundparticipantid_vote
            .insert(&key, &serde_json::to_vec(vote)?)
    }

    fn votes_for_round(&self, round_id: &RoundId) -> Result<Vec<Vote>> {
        let mut prefix = round_id.as_str().as_bytes().to_vec();
        prefix.push(0xff);

        self.roundparticipantid_vote
            .scan_prefix(prefix)?
            .iter()
            .map(|(_, bytes)| {
                serde_json::from_slice(bytes)
                    .map_err(|_| Error::bad_database("Vote in db is invalid."))
            })
            .collect()
    }

    fn append_session_history(&self, entry: &SessionHistoryEntry) -> Result<()> {
        let count = self
            .roomid_historycount
            .increment(entry.room_id.as_str().as_bytes())?;
        let key = room_scoped_key(&entry.room_id, &count);

        self.roomhistoryid_sessionhistory
            .insert(&key, &serde_json::to_vec(entry)?)
    }

    fn room_event_counter(&self, room_id: &RoomId) -> Result<u64> {
        Ok(self
            .roomid_lasteventid
            .get(room_id.as_str().as_bytes())?
            .map(|bytes| utils::u64_from_bytes(&bytes).unwrap_or(0))
            .unwrap_or(0))
    }

    fn set_room_event_counter(&self, room_id: &RoomId, value: u64) -> Result<()> {
        self.roomid_lasteventid
            .insert(room_id.as_str().as_bytes(), &value.to_be_bytes())
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        config::Config,
        database::KeyValueDatabase,
        protocol::{ParticipantId, PrivacyMode, Role, RoomId, RoundId, RoundState},
        service::{
            rooms::model::{Participant, Room, RoomConfig, Round, Vote},
            store::Data,
        },
        Error,
    };
    use assert_matches::assert_matches;

    fn test_config() -> Config {
        figment::Figment::new()
            .merge(figment::providers::Serialized::defaults(
                serde_json::json!({
                    "database_backend": "memory",
                    "database_path": "",
                    "jwt_secret": "secret",
                }),
            ))
            .extract()
            .unwrap()
    }

    fn db() -> KeyValueDatabase {
        KeyValueDatabase::memory_for_tests(&test_config()).unwrap()
    }

    fn room(id: &str) -> Room {
        Room {
            room_id: RoomId::parse(id).unwrap(),
            title: "Sprint 42".to_owned(),
            owner_user_id: "carol".to_owned(),
            privacy_mode: PrivacyMode::Public,
            org: None,
            owner_tier: crate::protocol::Tier::Pro,
            config: RoomConfig::default(),
            created_at: 1,
            last_active_at: 1,
            deleted_at: None,
        }
    }

    fn open_round(room_id: &RoomId, number: u64) -> Round {
        Round {
            round_id: RoundId::new(),
            room_id: room_id.clone(),
            round_number: number,
            story_title: None,
            started_at: 1,
            revealed_at: None,
            deck_snapshot: vec!["1".to_owned(), "2".to_owned()],
            state: RoundState::Open,
            timer_seconds: None,
            average: None,
            median: None,
            consensus_reached: None,
        }
    }

    #[test]
    fn duplicate_votes_are_rejected_distinctly() {
        let db = db();
        let round_id = RoundId::new();
        let vote = Vote {
            round_id: round_id.clone(),
            participant_id: ParticipantId::new(),
            card_value: "5".to_owned(),
            voted_at: 1,
        };

        db.insert_vote(&vote).unwrap();
        assert_matches!(db.insert_vote(&vote), Err(Error::DuplicateVote));
        assert_eq!(db.votes_for_round(&round_id).unwrap().len(), 1);
    }

    #[test]
    fn round_number_collisions_are_distinct() {
        let db = db();
        let room = room("abc123");
        db.put_room(&room).unwrap();

        db.insert_round(&open_round(&room.room_id, 1)).unwrap();
        assert_matches!(
            db.insert_round(&open_round(&room.room_id, 1)),
            Err(Error::RoundNumberTaken(1))
        );
        assert_eq!(db.max_round_number(&room.room_id).unwrap(), 1);
    }

    #[test]
    fn optimistic_round_update_checks_prior_state() {
        let db = db();
        let room = room("abc123");
        let mut round = open_round(&room.room_id, 1);
        db.insert_round(&round).unwrap();

        round.state = RoundState::Revealed;
        db.update_round(&round, RoundState::Open).unwrap();

        // Second reveal no longer finds an open round
        assert_matches!(
            db.update_round(&round, RoundState::Open),
            Err(Error::RoundStateConflict)
        );
    }

    #[test]
    fn participants_scan_is_room_scoped() {
        let db = db();
        for (room_id, name) in [("abc123", "alice"), ("xyz789", "zelda")] {
            let participant = Participant {
                participant_id: ParticipantId::new(),
                room_id: RoomId::parse(room_id).unwrap(),
                user_id: Some(name.to_owned()),
                display_name: name.to_owned(),
                role: Role::Voter,
                connected_at: 1,
                disconnected_at: None,
                grace_deadline: None,
            };
            db.upsert_participant(&participant).unwrap();
        }

        let room_id = RoomId::parse("abc123").unwrap();
        let participants = db.participants_in_room(&room_id).unwrap();
        assert_eq!(participants.len(), 1);
        assert_eq!(participants[0].display_name, "alice");
    }

    #[test]
    fn event_counter_survives_reload() {
        let db = db();
        let room_id = RoomId::parse("abc123").unwrap();
        assert_eq!(db.room_event_counter(&room_id).unwrap(), 0);
        db.set_room_event_counter(&room_id, 44).unwrap();
        assert_eq!(db.room_event_counter(&room_id).unwrap(), 44);
    }
}
