//! Receive-side duplicate detection.
//!
//! A bounded FIFO set of recent payload fingerprints. At-least-once
//! delivery means the router may redeliver a frame whose confirmation
//! it never saw; this filter makes that redelivery idempotent. It is a
//! delivery aid, never a security control.
//!
//! Fingerprints are full 32-byte double hashes and the on-disk format
//! is a flat file of fixed 32-byte records, rewritten atomically via a
//! temp file. The set is small enough that rewriting it wholesale on
//! every insert is cheaper than anything cleverer.

use std::collections::VecDeque;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::crypto::double_hash;
use crate::error::{Error, Result};

/// How many recent fingerprints are remembered.
pub const DEDUP_CAPACITY: usize = 20;

const FINGERPRINT_SIZE: usize = 32;

struct DedupInner {
    recent: VecDeque<[u8; FINGERPRINT_SIZE]>,
    path: Option<PathBuf>,
}

/// FIFO-bounded duplicate filter with optional persistence.
pub struct DuplicateFilter {
    inner: Mutex<DedupInner>,
}

impl DuplicateFilter {
    /// Volatile filter; duplicates are only caught within one process
    /// lifetime.
    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(DedupInner {
                recent: VecDeque::with_capacity(DEDUP_CAPACITY),
                path: None,
            }),
        }
    }

    /// File-backed filter, reloading any previously persisted
    /// fingerprints so duplicates are caught across restarts.
    pub fn open(path: PathBuf) -> Result<Self> {
        let mut recent = VecDeque::with_capacity(DEDUP_CAPACITY);
        match fs::read(&path) {
            Ok(bytes) => {
                for chunk in bytes.chunks_exact(FINGERPRINT_SIZE) {
                    let mut fp = [0u8; FINGERPRINT_SIZE];
                    fp.copy_from_slice(chunk);
                    recent.push_back(fp);
                    if recent.len() > DEDUP_CAPACITY {
                        recent.pop_front();
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::Storage(e.to_string())),
        }
        Ok(Self {
            inner: Mutex::new(DedupInner {
                recent,
                path: Some(path),
            }),
        })
    }

    /// Record a payload, reporting whether it was already seen.
    ///
    /// Returns `true` for a duplicate. New payloads are inserted,
    /// evicting the oldest fingerprint at capacity.
    pub fn check_and_insert(&self, payload: &[u8]) -> Result<bool> {
        let fingerprint = double_hash(payload);
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| Error::Storage("dedup lock poisoned".into()))?;

        if inner.recent.contains(&fingerprint) {
            return Ok(true);
        }
        if inner.recent.len() >= DEDUP_CAPACITY {
            inner.recent.pop_front();
        }
        inner.recent.push_back(fingerprint);

        if let Some(path) = inner.path.clone() {
            persist(&path, &inner.recent)?;
        }
        Ok(false)
    }
}

fn persist(path: &Path, recent: &VecDeque<[u8; FINGERPRINT_SIZE]>) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let mut file = fs::File::create(&tmp).map_err(|e| Error::Storage(e.to_string()))?;
    for fp in recent {
        file.write_all(fp).map_err(|e| Error::Storage(e.to_string()))?;
    }
    file.sync_all().map_err(|e| Error::Storage(e.to_string()))?;
    fs::rename(&tmp, path).map_err(|e| Error::Storage(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeat_is_duplicate() {
        let filter = DuplicateFilter::in_memory();
        assert!(!filter.check_and_insert(b"payload").unwrap());
        assert!(filter.check_and_insert(b"payload").unwrap());
    }

    #[test]
    fn test_fifo_eviction() {
        let filter = DuplicateFilter::in_memory();
        assert!(!filter.check_and_insert(&[0u8]).unwrap());
        for i in 1..=DEDUP_CAPACITY as u8 {
            assert!(!filter.check_and_insert(&[i]).unwrap());
        }
        // 21 distinct payloads seen, the first was evicted
        assert!(!filter.check_and_insert(&[0u8]).unwrap());
        // the second-oldest survivor is still caught
        assert!(filter.check_and_insert(&[2u8]).unwrap());
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dedup.bin");

        {
            let filter = DuplicateFilter::open(path.clone()).unwrap();
            assert!(!filter.check_and_insert(b"seen before").unwrap());
        }

        let reopened = DuplicateFilter::open(path).unwrap();
        assert!(reopened.check_and_insert(b"seen before").unwrap());
        assert!(!reopened.check_and_insert(b"brand new").unwrap());
    }
}
