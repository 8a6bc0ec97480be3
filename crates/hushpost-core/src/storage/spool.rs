//! Persistent outbound spooler.
//!
//! A durable single-flight queue: frames wait here until the connection
//! is logged in, exactly one frame is in flight at a time, and every
//! entry survives a crash until its acknowledgment arrives. Persistence
//! is a SQLite journal keyed by a monotonically increasing sequence
//! number; the sequence also serves as the local bookkeeping key, which
//! is wider than the 4-byte wire correlation id and immune to its
//! collisions.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::protocol::{data_id_for, DATA_ID_SIZE};

/// One-shot callback invoked when an entry is acknowledged.
pub type Completion = Box<dyn FnOnce() + Send>;

/// A queued outbound frame payload.
#[derive(Debug, Clone)]
pub struct SpoolEntry {
    pub seq: i64,
    pub data_id: [u8; DATA_ID_SIZE],
    pub frame: Vec<u8>,
}

struct SpoolInner {
    queue: VecDeque<SpoolEntry>,
    in_flight: Option<SpoolEntry>,
    completions: HashMap<i64, Completion>,
    next_seq: i64,
}

/// Durable at-least-once outbound queue.
pub struct Spooler {
    db: Option<Arc<Mutex<Connection>>>,
    inner: Mutex<SpoolInner>,
}

impl Spooler {
    /// Open a file-backed spooler, replaying any entries whose
    /// acknowledgment was never recorded.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// In-memory SQLite backing, used in tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn)
    }

    /// No persistence at all; entries do not survive a restart.
    pub fn transient() -> Self {
        Self {
            db: None,
            inner: Mutex::new(SpoolInner {
                queue: VecDeque::new(),
                in_flight: None,
                completions: HashMap::new(),
                next_seq: 1,
            }),
        }
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS spool (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                data_id BLOB NOT NULL,
                frame BLOB NOT NULL
            )",
            [],
        )?;

        // replay unacknowledged entries oldest first, then re-persist
        // them through the normal enqueue path
        let recovered: Vec<Vec<u8>> = {
            let mut stmt = conn.prepare("SELECT frame FROM spool ORDER BY seq ASC")?;
            let rows = stmt.query_map([], |row| row.get::<_, Vec<u8>>(0))?;
            rows.collect::<std::result::Result<_, _>>()?
        };
        conn.execute("DELETE FROM spool", [])?;

        let spooler = Self {
            db: Some(Arc::new(Mutex::new(conn))),
            inner: Mutex::new(SpoolInner {
                queue: VecDeque::new(),
                in_flight: None,
                completions: HashMap::new(),
                next_seq: 1,
            }),
        };

        if !recovered.is_empty() {
            debug!(count = recovered.len(), "recovered unacknowledged spool entries");
        }
        for frame in recovered {
            spooler.enqueue(frame, None)?;
        }
        Ok(spooler)
    }

    /// Append a frame payload to the queue, persisting it first.
    ///
    /// Returns the wire correlation id and whether the queue was idle
    /// before this call (meaning the send loop needs a kick). Storage
    /// failure is surfaced synchronously; nothing is queued in that case.
    pub fn enqueue(
        &self,
        frame: Vec<u8>,
        completion: Option<Completion>,
    ) -> Result<([u8; DATA_ID_SIZE], bool)> {
        let data_id = data_id_for(&frame);

        let seq = match &self.db {
            Some(db) => {
                let db = db.lock().map_err(|_| Error::Storage("spool lock poisoned".into()))?;
                db.execute(
                    "INSERT INTO spool (data_id, frame) VALUES (?1, ?2)",
                    params![data_id.as_slice(), frame.as_slice()],
                )?;
                db.last_insert_rowid()
            }
            None => 0,
        };

        let mut inner = self
            .inner
            .lock()
            .map_err(|_| Error::Storage("spool lock poisoned".into()))?;
        let seq = if self.db.is_some() {
            seq
        } else {
            let s = inner.next_seq;
            inner.next_seq += 1;
            s
        };

        let was_idle = inner.queue.is_empty() && inner.in_flight.is_none();
        inner.queue.push_back(SpoolEntry {
            seq,
            data_id,
            frame,
        });
        if let Some(completion) = completion {
            inner.completions.insert(seq, completion);
        }
        Ok((data_id, was_idle))
    }

    /// Pop the next entry for sending. Returns `None` while an earlier
    /// send is still awaiting its acknowledgment; single flight is what
    /// keeps delivery ordered across reconnects.
    pub fn take_next(&self) -> Option<SpoolEntry> {
        let mut inner = self.inner.lock().ok()?;
        if inner.in_flight.is_some() {
            return None;
        }
        let entry = inner.queue.pop_front()?;
        inner.in_flight = Some(entry.clone());
        Some(entry)
    }

    /// Return the in-flight entry to the head of the queue, unmodified.
    /// Called when the connection drops before its acknowledgment.
    pub fn return_in_flight(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            if let Some(entry) = inner.in_flight.take() {
                debug!(seq = entry.seq, "returning in-flight entry to queue");
                inner.queue.push_front(entry);
            }
        }
    }

    /// Record an acknowledgment for the in-flight entry.
    ///
    /// Removes the persisted record, runs the registered completion, and
    /// returns the entry's sequence number. An acknowledgment that does
    /// not match the in-flight correlation id is ignored.
    pub fn acknowledge(&self, data_id: &[u8; DATA_ID_SIZE]) -> Result<Option<i64>> {
        let (entry, completion) = {
            let mut inner = self
                .inner
                .lock()
                .map_err(|_| Error::Storage("spool lock poisoned".into()))?;
            let entry = match inner.in_flight.take() {
                Some(entry) if entry.data_id == *data_id => entry,
                other => {
                    inner.in_flight = other;
                    warn!(data_id = %hex::encode(data_id), "unmatched acknowledgment");
                    return Ok(None);
                }
            };
            let completion = inner.completions.remove(&entry.seq);
            (entry, completion)
        };

        if let Some(db) = &self.db {
            let db = db.lock().map_err(|_| Error::Storage("spool lock poisoned".into()))?;
            db.execute("DELETE FROM spool WHERE seq = ?1", params![entry.seq])?;
        }
        if let Some(completion) = completion {
            completion();
        }
        Ok(Some(entry.seq))
    }

    /// True while a sent entry is still awaiting its acknowledgment.
    pub fn has_in_flight(&self) -> bool {
        self.inner
            .lock()
            .map(|inner| inner.in_flight.is_some())
            .unwrap_or(false)
    }

    /// Number of entries waiting or in flight.
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.queue.len() + usize::from(inner.in_flight.is_some()))
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
