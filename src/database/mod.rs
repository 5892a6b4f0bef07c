pub mod abstraction;
pub mod key_value;

use std::sync::Arc;

use tracing::info;

use abstraction::{KeyValueDatabaseEngine, KvTree};

use crate::{Config, Error, Result, Services, SERVICES};

pub struct KeyValueDatabase {
    _db: Arc<dyn KeyValueDatabaseEngine>,

    //pub store: store::Service
    pub(super) roomid_room: Arc<dyn KvTree>,
    pub(super) roomparticipantid_participant: Arc<dyn KvTree>, // Key = RoomId + ParticipantId
    pub(super) roomroundnumberid_round: Arc<dyn KvTree>, // Key = RoomId + BE64(RoundNumber)
    pub(super) roundparticipantid_vote: Arc<dyn KvTree>, // Key = RoundId + ParticipantId, primary key for votes
    pub(super) roomhistoryid_sessionhistory: Arc<dyn KvTree>, // Key = RoomId + Count, append-only
    pub(super) roomid_historycount: Arc<dyn KvTree>,     // Count = u64
    pub(super) roomid_lasteventid: Arc<dyn KvTree>,      // LastEventId = u64
}

impl KeyValueDatabase {
    fn open(config: &Config) -> Result<Self> {
        let engine: Arc<dyn KeyValueDatabaseEngine> = match config.database_backend.as_str() {
            "sqlite" => abstraction::sqlite::Engine::open(config)?,
            "memory" => abstraction::memory::Engine::open(config)?,
            _ => {
                return Err(Error::bad_config(
                    "Database backend must be one of: sqlite, memory.",
                ))
            }
        };

        Ok(Self {
            roomid_room: engine.open_tree("roomid_room")?,
            roomparticipantid_participant: engine.open_tree("roomparticipantid_participant")?,
            roomroundnumberid_round: engine.open_tree("roomroundnumberid_round")?,
            roundparticipantid_vote: engine.open_tree("roundparticipantid_vote")?,
            roomhistoryid_sessionhistory: engine.open_tree("roomhistoryid_sessionhistory")?,
            roomid_historycount: engine.open_tree("roomid_historycount")?,
            roomid_lasteventid: engine.open_tree("roomid_lasteventid")?,
            _db: engine,
        })
    }

    /// Opens the database and wires up the global services. Everything after
    /// this call goes through `services()`.
    pub async fn load_or_create(config: Config) -> Result<()> {
        let db: &'static Self = Box::leak(Box::new(Self::open(&config)?));

        let services = Services::build(db, config)?;
        *SERVICES.write().unwrap() = Some(Box::leak(Box::new(services)));

        info!("Database ready");

        Ok(())
    }

    /// A fresh in-memory database for tests.
    pub fn memory_for_tests(config: &Config) -> Result<Self> {
        let mut config = config.clone();
        config.database_backend = "memory".to_owned();
        Self::open(&config)
    }
}
