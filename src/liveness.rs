//! Liveness registry: each supervised component periodically proves it is
//! alive by overwriting its own record; the guardian only ever reads.
//!
//! The backend is a trait so the two processes never assume a specific OS
//! mechanism. The file backend writes a temp file and renames it into
//! place, so a reader never observes a half-written record.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessRecord {
    pub component_id: String,
    /// ISO-8601 UTC heartbeat timestamp.
    pub hb_ts: String,
    pub pid: u32,
}

impl LivenessRecord {
    pub fn now(component_id: &str) -> Self {
        Self {
            component_id: component_id.to_string(),
            hb_ts: Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            pid: std::process::id(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LivenessError {
    Missing,
    Unreadable(String),
    /// hb_ts is ahead of the reader's clock. Fail-closed: never "fresh".
    ClockSkew { ahead_secs: i64 },
}

impl std::fmt::Display for LivenessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LivenessError::Missing => write!(f, "liveness record missing"),
            LivenessError::Unreadable(e) => write!(f, "liveness record unreadable: {}", e),
            LivenessError::ClockSkew { ahead_secs } => {
                write!(f, "liveness record {}s ahead of reader clock", ahead_secs)
            }
        }
    }
}

/// Age of a record relative to `now`, in whole seconds. Negative computed
/// age is an error condition, not freshness.
pub fn record_age_secs(record: &LivenessRecord, now: DateTime<Utc>) -> Result<u64, LivenessError> {
    let hb: DateTime<Utc> = record
        .hb_ts
        .parse()
        .map_err(|e: chrono::ParseError| LivenessError::Unreadable(e.to_string()))?;
    let age = (now - hb).num_seconds();
    if age < 0 {
        return Err(LivenessError::ClockSkew { ahead_secs: -age });
    }
    Ok(age as u64)
}

/// `IsFresh(record, threshold)`: true iff `0 <= now - hb_ts <= threshold`.
pub fn is_fresh(
    record: &LivenessRecord,
    now: DateTime<Utc>,
    threshold_secs: u64,
) -> Result<bool, LivenessError> {
    Ok(record_age_secs(record, now)? <= threshold_secs)
}

pub trait LivenessRegistry: Send + Sync {
    /// Overwrite this component's record with a fresh heartbeat.
    fn beat(&self, record: &LivenessRecord) -> std::io::Result<()>;
    /// Read a component's record. Read-only; the guardian's view.
    fn read(&self, component_id: &str) -> Result<LivenessRecord, LivenessError>;
}

/// Filesystem-backed registry: one JSON file per component.
pub struct FileRegistry {
    dir: PathBuf,
}

impl FileRegistry {
    pub fn new(dir: &str) -> std::io::Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self { dir: PathBuf::from(dir) })
    }

    fn record_path(&self, component_id: &str) -> PathBuf {
        self.dir.join(format!("{}.liveness.json", component_id))
    }
}

impl LivenessRegistry for FileRegistry {
    fn beat(&self, record: &LivenessRecord) -> std::io::Result<()> {
        let path = self.record_path(&record.component_id);
        let tmp = path.with_extension("tmp");
        let body = serde_json::to_string(record)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        fs::write(&tmp, body)?;
        fs::rename(&tmp, &path)
    }

    fn read(&self, component_id: &str) -> Result<LivenessRecord, LivenessError> {
        let path = self.record_path(component_id);
        if !Path::new(&path).exists() {
            return Err(LivenessError::Missing);
        }
        let body = fs::read_to_string(&path).map_err(|e| LivenessError::Unreadable(e.to_string()))?;
        serde_json::from_str(&body).map_err(|e| LivenessError::Unreadable(e.to_string()))
    }
}
