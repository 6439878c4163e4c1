//! Periodic operational snapshots in sqlite. The journal is the source of
//! truth; this table exists for quick inspection and dashboards, so writes
//! here are best-effort and never gate command processing.

use anyhow::{Context, Result};
use rusqlite::{params, Connection};

use crate::bus::BusCounters;

pub struct StateStore {
    conn: Connection,
}

impl StateStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).with_context(|| format!("open sqlite {}", path))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS runtime_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts INTEGER NOT NULL,
                state TEXT NOT NULL,
                accepted INTEGER NOT NULL,
                rejected_contract INTEGER NOT NULL,
                rejected_auth INTEGER NOT NULL,
                rejected_transition INTEGER NOT NULL,
                rejected_handler INTEGER NOT NULL,
                transitions_applied INTEGER NOT NULL
            );",
        )?;
        Ok(Self { conn })
    }

    pub fn persist_counters(&self, ts: u64, state: &str, counters: &BusCounters) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO runtime_snapshots
                 (ts, state, accepted, rejected_contract, rejected_auth,
                  rejected_transition, rejected_handler, transitions_applied)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    ts as i64,
                    state,
                    counters.accepted as i64,
                    counters.rejected_contract as i64,
                    counters.rejected_auth as i64,
                    counters.rejected_transition as i64,
                    counters.rejected_handler as i64,
                    counters.transitions_applied as i64,
                ],
            )
            .context("insert runtime snapshot")?;
        Ok(())
    }

    pub fn latest_snapshot(&self) -> Result<Option<(u64, String)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT ts, state FROM runtime_snapshots ORDER BY id DESC LIMIT 1")?;
        let mut rows = stmt.query([])?;
        match rows.next()? {
            Some(row) => {
                let ts: i64 = row.get(0)?;
                let state: String = row.get(1)?;
                Ok(Some((ts as u64, state)))
            }
            None => Ok(None),
        }
    }
}
