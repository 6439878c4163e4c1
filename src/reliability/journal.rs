//! Append-only, hash-chained event journal.
//!
//! One JSON object per line. Each entry's hash covers the previous entry's
//! hash, the canonical payload serialization and the sequence number, so a
//! silent edit anywhere breaks the chain from that point on. `append` is
//! the only mutator and fsyncs before acknowledging: an acknowledged entry
//! survives a crash, an unacknowledged one leaves the chain consistent at
//! the prior entry.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::logging::ts_epoch;

/// prev_hash of entry 0.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

pub mod event_type {
    pub const TRANSITION: &str = "transition";
    pub const COMMAND_RECEIVED: &str = "command_received";
    pub const COMMAND_EXECUTED: &str = "command_executed";
    pub const COMMAND_REJECTED: &str = "command_rejected";
    pub const ALERT: &str = "alert";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub seq: u64,
    pub ts: u64,
    pub correlation_id: String,
    pub event_type: String,
    pub payload: Value,
    pub prev_hash: String,
    pub hash: String,
}

/// Canonical payload bytes. serde_json maps are key-sorted by default, so
/// serialize-parse-serialize is a fixed point.
fn canonical(payload: &Value) -> Vec<u8> {
    serde_json::to_vec(payload).unwrap_or_else(|_| b"null".to_vec())
}

fn entry_hash(prev_hash: &str, payload: &Value, seq: u64) -> String {
    let mut h = Sha256::new();
    h.update(prev_hash.as_bytes());
    h.update(canonical(payload));
    h.update(seq.to_string().as_bytes());
    hex::encode(h.finalize())
}

#[derive(Debug)]
pub struct Journal {
    file: File,
    path: String,
    next_seq: u64,
    tail_hash: String,
}

impl Journal {
    /// Open (or create) a journal, picking up the chain tail from the last
    /// persisted entry. An unparseable tail is a hard error: the chain must
    /// be repaired or the file moved aside before the runtime proceeds.
    pub fn open(path: &str) -> std::io::Result<Self> {
        let (next_seq, tail_hash) = match Self::tail(path)? {
            Some(last) => (last.seq + 1, last.hash),
            None => (0, GENESIS_HASH.to_string()),
        };
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file, path: path.to_string(), next_seq, tail_hash })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Append one entry and fsync. The only mutator.
    pub fn append(
        &mut self,
        event_type: &str,
        payload: Value,
        correlation_id: &str,
    ) -> std::io::Result<JournalEntry> {
        let seq = self.next_seq;
        let prev_hash = self.tail_hash.clone();
        let hash = entry_hash(&prev_hash, &payload, seq);
        let entry = JournalEntry {
            seq,
            ts: ts_epoch(),
            correlation_id: correlation_id.to_string(),
            event_type: event_type.to_string(),
            payload,
            prev_hash,
            hash: hash.clone(),
        };
        let line = serde_json::to_string(&entry)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")?;
        self.file.sync_data()?;
        self.next_seq = seq + 1;
        self.tail_hash = hash;
        Ok(entry)
    }

    /// All entries in seq order. Missing file reads as empty.
    pub fn read_all(path: &str) -> std::io::Result<Vec<JournalEntry>> {
        if !Path::new(path).exists() {
            return Ok(vec![]);
        }
        let file = OpenOptions::new().read(true).open(path)?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: JournalEntry = serde_json::from_str(&line)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Entries with `from_seq <= seq <= to_seq`, in order.
    pub fn read_range(path: &str, from_seq: u64, to_seq: u64) -> std::io::Result<Vec<JournalEntry>> {
        let entries = Self::read_all(path)?;
        Ok(entries
            .into_iter()
            .filter(|e| e.seq >= from_seq && e.seq <= to_seq)
            .collect())
    }

    /// Last persisted entry, if any. Tolerates nothing: a malformed line is
    /// an error, not a silent truncation.
    pub fn tail(path: &str) -> std::io::Result<Option<JournalEntry>> {
        Ok(Self::read_all(path)?.into_iter().last())
    }

    /// Recompute the chain front to back. Returns `(true, None)` for an
    /// untouched journal, otherwise `(false, first_broken_seq)`; entries
    /// before the break remain verified.
    pub fn verify_chain(path: &str) -> std::io::Result<(bool, Option<u64>)> {
        let entries = Self::read_all(path)?;
        let mut running = GENESIS_HASH.to_string();
        for (idx, entry) in entries.iter().enumerate() {
            let expected_seq = idx as u64;
            if entry.seq != expected_seq || entry.prev_hash != running {
                return Ok((false, Some(expected_seq)));
            }
            let recomputed = entry_hash(&entry.prev_hash, &entry.payload, entry.seq);
            if recomputed != entry.hash {
                return Ok((false, Some(entry.seq)));
            }
            running = entry.hash.clone();
        }
        Ok((true, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_path(name: &str) -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(name).to_string_lossy().to_string();
        (dir, path)
    }

    #[test]
    fn test_append_links_chain() {
        let (_dir, path) = temp_path("chain.journal");
        let mut j = Journal::open(&path).unwrap();
        let e0 = j.append(event_type::TRANSITION, json!({"n": 0}), "ep-1").unwrap();
        let e1 = j.append(event_type::TRANSITION, json!({"n": 1}), "ep-1").unwrap();
        assert_eq!(e0.seq, 0);
        assert_eq!(e0.prev_hash, GENESIS_HASH);
        assert_eq!(e1.prev_hash, e0.hash);
        assert_ne!(e0.hash, e1.hash);
    }

    #[test]
    fn test_verify_untouched_journal() {
        let (_dir, path) = temp_path("ok.journal");
        let mut j = Journal::open(&path).unwrap();
        for i in 0..5 {
            j.append(event_type::TRANSITION, json!({"n": i}), "ep-1").unwrap();
        }
        assert_eq!(Journal::verify_chain(&path).unwrap(), (true, None));
    }

    #[test]
    fn test_verify_detects_payload_tamper() {
        let (_dir, path) = temp_path("tamper.journal");
        let mut j = Journal::open(&path).unwrap();
        for i in 0..5 {
            j.append(event_type::TRANSITION, json!({"n": i}), "ep-1").unwrap();
        }
        // Flip one payload value in entry 2.
        let content = std::fs::read_to_string(&path).unwrap();
        let patched: Vec<String> = content
            .lines()
            .enumerate()
            .map(|(i, l)| if i == 2 { l.replace("\"n\":2", "\"n\":9") } else { l.to_string() })
            .collect();
        std::fs::write(&path, patched.join("\n") + "\n").unwrap();

        let (ok, broken) = Journal::verify_chain(&path).unwrap();
        assert!(!ok);
        assert_eq!(broken, Some(2));
    }

    #[test]
    fn test_verify_detects_deleted_entry() {
        let (_dir, path) = temp_path("gap.journal");
        let mut j = Journal::open(&path).unwrap();
        for i in 0..4 {
            j.append(event_type::TRANSITION, json!({"n": i}), "ep-1").unwrap();
        }
        let content = std::fs::read_to_string(&path).unwrap();
        let kept: Vec<&str> = content.lines().enumerate().filter(|(i, _)| *i != 1).map(|(_, l)| l).collect();
        std::fs::write(&path, kept.join("\n") + "\n").unwrap();

        let (ok, broken) = Journal::verify_chain(&path).unwrap();
        assert!(!ok);
        assert_eq!(broken, Some(1));
    }

    #[test]
    fn test_reopen_continues_chain() {
        let (_dir, path) = temp_path("reopen.journal");
        let tail = {
            let mut j = Journal::open(&path).unwrap();
            j.append(event_type::COMMAND_RECEIVED, json!({"id": "C-1"}), "ep-1").unwrap();
            j.append(event_type::COMMAND_EXECUTED, json!({"id": "C-1"}), "ep-1").unwrap()
        };
        let mut j = Journal::open(&path).unwrap();
        assert_eq!(j.next_seq(), 2);
        let e = j.append(event_type::TRANSITION, json!({"n": 2}), "ep-1").unwrap();
        assert_eq!(e.prev_hash, tail.hash);
        assert_eq!(Journal::verify_chain(&path).unwrap(), (true, None));
    }

    #[test]
    fn test_read_range_inclusive() {
        let (_dir, path) = temp_path("range.journal");
        let mut j = Journal::open(&path).unwrap();
        for i in 0..6 {
            j.append(event_type::TRANSITION, json!({"n": i}), "ep-1").unwrap();
        }
        let slice = Journal::read_range(&path, 2, 4).unwrap();
        assert_eq!(slice.len(), 3);
        assert_eq!(slice[0].seq, 2);
        assert_eq!(slice[2].seq, 4);
    }

    #[test]
    fn test_missing_file_is_empty() {
        assert!(Journal::read_all("/tmp/does-not-exist.journal").unwrap().is_empty());
        assert_eq!(
            Journal::verify_chain("/tmp/does-not-exist.journal").unwrap(),
            (true, None)
        );
    }
}
