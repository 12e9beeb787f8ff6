//! # Storage Module - Durable Message Store
//!
//! Append-only persistence of [`Message`]s plus a line-oriented diagnostic log.
//!
//! ## Layout
//!
//! ```text
//! ~/.retrobadge/
//! ├── meshtastic.db    ← SQLite, table messages(ts REAL, src TEXT, txt TEXT)
//! ├── meshtastic.log   ← JSON lines: raw packets and link events
//! └── retrobadge.lock  ← advisory lock held while a console owns the directory
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use retrobadge::message::Message;
//! use retrobadge::storage::Store;
//!
//! fn main() -> anyhow::Result<()> {
//!     let store = Store::open("/tmp/retrobadge", true)?;
//!     if let Some(msg) = Message::new(1_700_000_000.0, "!a1b2c3d4", "hello mesh", 240) {
//!         store.append(&msg);
//!     }
//!     for msg in store.load_recent(2000)? {
//!         println!("{} {}", msg.sender(), msg.text());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Concurrency
//!
//! The SQLite connection sits behind a mutex, so every write is serialised no matter
//! how many tasks append. [`Store::append`] never returns an error: failures are
//! logged under the `store` target and counted, and the caller carries on.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use fs2::FileExt;
use log::warn;
use rusqlite::{params, Connection, OpenFlags};
use serde_json::json;
use thiserror::Error;

use crate::message::{now_seconds, Message, RawPacket};
use crate::metrics;

pub const DB_FILE: &str = "meshtastic.db";
pub const LOG_FILE: &str = "meshtastic.log";
pub const LOCK_FILE: &str = "retrobadge.lock";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("data directory {0} is in use by another console")]
    Locked(PathBuf),

    #[error("store lock poisoned")]
    Poisoned,
}

pub struct Store {
    root: PathBuf,
    conn: Mutex<Connection>,
    log: Option<Mutex<File>>,
    _lock: Option<File>,
}

impl Store {
    /// Open (creating if needed) the store under `dir`. `raw_log` enables the JSON
    /// lines diagnostic log. Fails if another process holds the directory lock.
    pub fn open(dir: impl AsRef<Path>, raw_log: bool) -> Result<Self, StoreError> {
        let root = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;

        let lock = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(root.join(LOCK_FILE))?;
        lock.try_lock_exclusive()
            .map_err(|_| StoreError::Locked(root.clone()))?;

        let conn = Connection::open(root.join(DB_FILE))?;
        conn.busy_timeout(Duration::from_secs(2))?;
        // journal_mode answers with a row, so it goes through query_row.
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
        Self::init_schema(&conn)?;

        let log = if raw_log {
            let fh = OpenOptions::new()
                .create(true)
                .append(true)
                .open(root.join(LOG_FILE))?;
            Some(Mutex::new(fh))
        } else {
            None
        };

        Ok(Self {
            root,
            conn: Mutex::new(conn),
            log,
            _lock: Some(lock),
        })
    }

    /// Read-only view of an existing store under `dir`. Takes no directory lock, so it
    /// works next to a running console; WAL mode lets it read while that console writes.
    pub fn open_reader(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = dir.as_ref().to_path_buf();
        let conn = Connection::open_with_flags(
            root.join(DB_FILE),
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(Duration::from_secs(2))?;
        Ok(Self {
            root,
            conn: Mutex::new(conn),
            log: None,
            _lock: None,
        })
    }

    /// An unlocked, file-less store for tests.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            root: PathBuf::new(),
            conn: Mutex::new(conn),
            log: None,
            _lock: None,
        })
    }

    fn init_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS messages (
                ts  REAL NOT NULL,
                src TEXT NOT NULL,
                txt TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS messages_ts ON messages(ts);",
        )?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Durably insert `msg`. Errors are logged and counted, never returned.
    pub fn append(&self, msg: &Message) {
        if let Err(e) = self.try_append(msg) {
            metrics::inc_store_failures();
            warn!(target: "store", "append failed ({}): {}", msg.sender(), e);
        }
    }

    pub fn try_append(&self, msg: &Message) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO messages (ts, src, txt) VALUES (?1, ?2, ?3)",
            params![msg.timestamp(), msg.sender(), msg.text()],
        )?;
        Ok(())
    }

    /// Up to `limit` most recent messages, oldest first. Ties on timestamp keep
    /// insertion order.
    pub fn load_recent(&self, limit: usize) -> Result<Vec<Message>, StoreError> {
        let conn = self.conn()?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = conn.prepare(
            "SELECT ts, src, txt FROM messages ORDER BY ts DESC, rowid DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok(Message::from_row(row.get(0)?, row.get(1)?, row.get(2)?))
        })?;
        let mut out = rows.collect::<Result<Vec<_>, _>>()?;
        out.reverse();
        Ok(out)
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        Ok(usize::try_from(n).unwrap_or(0))
    }

    /// Append a raw packet to the diagnostic log.
    pub fn log_packet(&self, packet: &RawPacket) {
        self.write_log_line(|| {
            Ok(json!({ "kind": "packet", "at": now_seconds(), "packet": packet }).to_string())
        });
    }

    /// Append a free-form link event to the diagnostic log.
    pub fn log_event(&self, detail: &str) {
        self.write_log_line(|| {
            Ok(json!({ "kind": "event", "at": now_seconds(), "detail": detail }).to_string())
        });
    }

    fn write_log_line(&self, render: impl FnOnce() -> Result<String, StoreError>) {
        let Some(log) = &self.log else {
            return;
        };
        let result = render().and_then(|line| {
            let mut fh = log.lock().map_err(|_| StoreError::Poisoned)?;
            writeln!(fh, "{}", line)?;
            Ok(())
        });
        if let Err(e) = result {
            warn!(target: "store", "diagnostic log write failed: {}", e);
        }
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(ts: f64, src: &str, txt: &str) -> Message {
        Message::new(ts, src, txt, 240).unwrap()
    }

    #[test]
    fn load_recent_is_oldest_first_and_limited() {
        let store = Store::in_memory().unwrap();
        store.append(&msg(30.0, "c", "third"));
        store.append(&msg(10.0, "a", "first"));
        store.append(&msg(20.0, "b", "second"));

        let all = store.load_recent(10).unwrap();
        let texts: Vec<&str> = all.iter().map(|m| m.text()).collect();
        assert_eq!(texts, vec!["first", "second", "third"]);

        let last_two = store.load_recent(2).unwrap();
        let texts: Vec<&str> = last_two.iter().map(|m| m.text()).collect();
        assert_eq!(texts, vec!["second", "third"]);
    }

    #[test]
    fn equal_timestamps_keep_insertion_order() {
        let store = Store::in_memory().unwrap();
        store.append(&msg(5.0, "x", "one"));
        store.append(&msg(5.0, "x", "two"));
        let texts: Vec<String> = store
            .load_recent(5)
            .unwrap()
            .into_iter()
            .map(|m| m.text().to_string())
            .collect();
        assert_eq!(texts, vec!["one", "two"]);
    }

    #[test]
    fn zero_limit_returns_nothing() {
        let store = Store::in_memory().unwrap();
        store.append(&msg(1.0, "x", "one"));
        assert!(store.load_recent(0).unwrap().is_empty());
        assert_eq!(store.count().unwrap(), 1);
    }
}
