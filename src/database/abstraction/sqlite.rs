use std::{
    ops::Deref,
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, DatabaseName::Main, OptionalExtension};
use tracing::warn;

use super::{increment_bytes, KeyValueDatabaseEngine, KvTree};
use crate::{Config, Result};

struct Pool {
    writer: Mutex<Connection>,
    readers: Vec<Mutex<Connection>>,
    path: PathBuf,
}

enum HoldingConn<'a> {
    FromGuard(MutexGuard<'a, Connection>),
    FromOwned(Connection),
}

impl Deref for HoldingConn<'_> {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        match self {
            HoldingConn::FromGuard(guard) => guard.deref(),
            HoldingConn::FromOwned(conn) => conn,
        }
    }
}

impl Pool {
    fn new<P: AsRef<Path>>(path: P, num_readers: usize) -> Result<Self> {
        let writer = Mutex::new(Self::prepare_conn(&path)?);

        let mut readers = Vec::with_capacity(num_readers);
        for _ in 0..num_readers {
            readers.push(Mutex::new(Self::prepare_conn(&path)?));
        }

        Ok(Self {
            writer,
            readers,
            path: path.as_ref().to_path_buf(),
        })
    }

    fn prepare_conn<P: AsRef<Path>>(path: P) -> Result<Connection> {
        let conn = Connection::open(path)?;

        conn.pragma_update(Some(Main), "journal_mode", "WAL")?;
        conn.pragma_update(Some(Main), "synchronous", "NORMAL")?;

        Ok(conn)
    }

    fn write_lock(&self) -> MutexGuard<'_, Connection> {
        self.writer.lock()
    }

    fn read_lock(&self) -> Result<HoldingConn<'_>> {
        for r in &self.readers {
            if let Some(reader) = r.try_lock() {
                return Ok(HoldingConn::FromGuard(reader));
            }
        }

        warn!("all readers locked, creating spillover reader");
        Ok(HoldingConn::FromOwned(Self::prepare_conn(&self.path)?))
    }
}

pub struct Engine {
    pool: Pool,
}

impl KeyValueDatabaseEngine for Engine {
    fn open(config: &Config) -> Result<Arc<Self>> {
        let pool = Pool::new(
            format!("{}/croupier.db", &config.database_path),
            num_cpus::get(),
        )?;

        Ok(Arc::new(Engine { pool }))
    }

    fn open_tree(self: &Arc<Self>, name: &'static str) -> Result<Arc<dyn KvTree>> {
        self.pool.write_lock().execute(
            format!(
                "CREATE TABLE IF NOT EXISTS {name} ( \"key\" BLOB PRIMARY KEY, \"value\" BLOB NOT NULL )"
            )
            .as_str(),
            [],
        )?;

        Ok(Arc::new(SqliteTable {
            engine: Arc::clone(self),
            name,
        }))
    }

    fn flush(self: &Arc<Self>) -> Result<()> {
        self.pool
            .write_lock()
            .execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")
            .map_err(Into::into)
    }
}

pub struct SqliteTable {
    engine: Arc<Engine>,
    name: &'static str,
}

impl SqliteTable {
    fn get_with_guard(&self, guard: &Connection, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(guard
            .prepare(format!("SELECT value FROM {} WHERE key = ?", self.name).as_str())?
            .query_row([key], |row| row.get(0))
            .optional()?)
    }

    fn insert_with_guard(&self, guard: &Connection, key: &[u8], value: &[u8]) -> Result<()> {
        guard.execute(
            format!(
                "INSERT INTO {} (key, value) VALUES (?, ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                self.name
            )
            .as_str(),
            [key, value],
        )?;
        Ok(())
    }
}

impl KvTree for SqliteTable {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let guard = self.engine.pool.read_lock()?;
        self.get_with_guard(&guard, key)
    }

    fn insert(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let guard = self.engine.pool.write_lock();
        self.insert_with_guard(&guard, key, value)
    }

    fn remove(&self, key: &[u8]) -> Result<()> {
        let guard = self.engine.pool.write_lock();
        guard.execute(
            format!("DELETE FROM {} WHERE key = ?", self.name).as_str(),
            [key],
        )?;
        Ok(())
    }

    fn scan_prefix(&self, prefix: Vec<u8>) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let guard = self.engine.pool.read_lock()?;

        let mut statement = guard.prepare(
            format!(
                "SELECT key, value FROM {} WHERE key >= ? ORDER BY key ASC",
                self.name
            )
            .as_str(),
        )?;

        let rows = statement
            .query_map([&prefix], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<(Vec<u8>, Vec<u8>)>, _>>()?;

        Ok(rows
            .into_iter()
            .take_while(|(key, _)| key.starts_with(&prefix))
            .collect())
    }

    fn increment(&self, key: &[u8]) -> Result<Vec<u8>> {
        let guard = self.engine.pool.write_lock();

        let old = self.get_with_guard(&guard, key)?;
        let new = increment_bytes(old.as_deref());
        self.insert_with_guard(&guard, key, &new)?;

        Ok(new)
    }
}
