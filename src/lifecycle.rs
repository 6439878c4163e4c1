//! Trading lifecycle state machine.
//!
//! The runtime only ever occupies one of the states below, and may only
//! move along the fixed successor table. Every attempt, applied or not,
//! lands in the journal; rejected attempts leave the state untouched and
//! produce an alert-severity entry.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::logging::ts_epoch;
use crate::reliability::journal::{event_type, Journal, JournalEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeState {
    Idle,
    Scanning,
    SignalReceived,
    Deciding,
    Ordering,
    PendingFill,
    PositionOpen,
    Monitoring,
    Closing,
    Closed,
}

impl TradeState {
    /// Initial state, and the only state reachable from `Closed`.
    pub const GENESIS: TradeState = TradeState::Idle;

    /// Allowed successor set, fixed at build time.
    pub fn successors(&self) -> &'static [TradeState] {
        use TradeState::*;
        match self {
            Idle => &[Scanning],
            Scanning => &[SignalReceived, Idle],
            SignalReceived => &[Deciding],
            Deciding => &[Ordering, Idle],
            Ordering => &[PendingFill, Idle],
            PendingFill => &[PositionOpen, Idle],
            PositionOpen => &[Monitoring],
            Monitoring => &[Closing],
            Closing => &[Closed],
            Closed => &[Idle],
        }
    }

    pub fn can_reach(&self, to: TradeState) -> bool {
        self.successors().contains(&to)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TradeState::Idle => "IDLE",
            TradeState::Scanning => "SCANNING",
            TradeState::SignalReceived => "SIGNAL_RECEIVED",
            TradeState::Deciding => "DECIDING",
            TradeState::Ordering => "ORDERING",
            TradeState::PendingFill => "PENDING_FILL",
            TradeState::PositionOpen => "POSITION_OPEN",
            TradeState::Monitoring => "MONITORING",
            TradeState::Closing => "CLOSING",
            TradeState::Closed => "CLOSED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransitionOutcome {
    Applied,
    RejectedInvalid,
    RolledBack,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from_state: TradeState,
    pub to_state: TradeState,
    pub trigger_command_id: String,
    pub correlation_id: String,
    pub timestamp: u64,
    pub outcome: TransitionOutcome,
}

#[derive(Debug)]
pub struct StateMachine {
    current: TradeState,
}

impl StateMachine {
    pub fn new() -> Self {
        Self { current: TradeState::GENESIS }
    }

    pub fn with_state(state: TradeState) -> Self {
        Self { current: state }
    }

    pub fn current(&self) -> TradeState {
        self.current
    }

    fn record(
        &self,
        to_state: TradeState,
        trigger_command_id: &str,
        correlation_id: &str,
        outcome: TransitionOutcome,
    ) -> TransitionRecord {
        TransitionRecord {
            from_state: self.current,
            to_state,
            trigger_command_id: trigger_command_id.to_string(),
            correlation_id: correlation_id.to_string(),
            timestamp: ts_epoch(),
            outcome,
        }
    }

    fn journal_record(
        journal: &mut Journal,
        record: &TransitionRecord,
        severity: &str,
    ) -> std::io::Result<()> {
        journal
            .append(
                event_type::TRANSITION,
                json!({
                    "from": record.from_state.as_str(),
                    "to": record.to_state.as_str(),
                    "trigger_command_id": record.trigger_command_id,
                    "outcome": record.outcome,
                    "severity": severity,
                }),
                &record.correlation_id,
            )
            .map(|_| ())
    }

    /// Attempt a transition. Applied transitions are journaled before this
    /// returns; rejected attempts journal an ALERT-severity record and leave
    /// the state untouched. A journal write failure is surfaced as-is and
    /// the state is not changed (fail-closed).
    pub fn attempt(
        &mut self,
        to_state: TradeState,
        trigger_command_id: &str,
        correlation_id: &str,
        journal: &mut Journal,
    ) -> std::io::Result<TransitionRecord> {
        if !self.current.can_reach(to_state) {
            let record = self.record(
                to_state,
                trigger_command_id,
                correlation_id,
                TransitionOutcome::RejectedInvalid,
            );
            Self::journal_record(journal, &record, "ALERT")?;
            return Ok(record);
        }
        let record = self.record(
            to_state,
            trigger_command_id,
            correlation_id,
            TransitionOutcome::Applied,
        );
        Self::journal_record(journal, &record, "INFO")?;
        self.current = to_state;
        Ok(record)
    }

    /// Compensating transition after a handler failure. Journaled as a
    /// distinct ROLLED_BACK record. Compensation may traverse the reverse
    /// of the forward edge the failed command just applied; anything
    /// further apart leaves the state untouched and the caller must
    /// escalate.
    pub fn rollback_to(
        &mut self,
        last_good: TradeState,
        trigger_command_id: &str,
        correlation_id: &str,
        journal: &mut Journal,
    ) -> std::io::Result<TransitionRecord> {
        if self.current == last_good {
            // Nothing was applied; report an already-settled rollback.
            let record =
                self.record(last_good, trigger_command_id, correlation_id, TransitionOutcome::RolledBack);
            return Ok(record);
        }
        if !self.current.can_reach(last_good) && !last_good.can_reach(self.current) {
            let record = self.record(
                last_good,
                trigger_command_id,
                correlation_id,
                TransitionOutcome::RejectedInvalid,
            );
            Self::journal_record(journal, &record, "ALERT")?;
            return Ok(record);
        }
        let record = self.record(
            last_good,
            trigger_command_id,
            correlation_id,
            TransitionOutcome::RolledBack,
        );
        Self::journal_record(journal, &record, "WARN")?;
        self.current = last_good;
        Ok(record)
    }

    /// Fold APPLIED (and ROLLED_BACK) transition entries in seq order onto
    /// the genesis state. The crash-recovery path: deterministic for any
    /// journal produced through `attempt`/`rollback_to`.
    pub fn replay(entries: &[JournalEntry]) -> TradeState {
        let mut state = TradeState::GENESIS;
        for entry in entries {
            if entry.event_type != event_type::TRANSITION {
                continue;
            }
            let outcome = entry.payload.get("outcome").and_then(|v| v.as_str());
            if outcome != Some("APPLIED") && outcome != Some("ROLLED_BACK") {
                continue;
            }
            if let Some(to) = entry
                .payload
                .get("to")
                .and_then(|v| v.as_str())
                .and_then(parse_state)
            {
                state = to;
            }
        }
        state
    }
}

fn parse_state(name: &str) -> Option<TradeState> {
    use TradeState::*;
    Some(match name {
        "IDLE" => Idle,
        "SCANNING" => Scanning,
        "SIGNAL_RECEIVED" => SignalReceived,
        "DECIDING" => Deciding,
        "ORDERING" => Ordering,
        "PENDING_FILL" => PendingFill,
        "POSITION_OPEN" => PositionOpen,
        "MONITORING" => Monitoring,
        "CLOSING" => Closing,
        "CLOSED" => Closed,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_journal() -> (tempfile::TempDir, Journal) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sm.journal").to_string_lossy().to_string();
        let journal = Journal::open(&path).unwrap();
        (dir, journal)
    }

    #[test]
    fn test_happy_path_walks_full_graph() {
        let (_dir, mut journal) = temp_journal();
        let mut sm = StateMachine::new();
        let path = [
            TradeState::Scanning,
            TradeState::SignalReceived,
            TradeState::Deciding,
            TradeState::Ordering,
            TradeState::PendingFill,
            TradeState::PositionOpen,
            TradeState::Monitoring,
            TradeState::Closing,
            TradeState::Closed,
            TradeState::Idle,
        ];
        for (i, to) in path.iter().enumerate() {
            let rec = sm
                .attempt(*to, &format!("C-{}", i), "ep-1", &mut journal)
                .unwrap();
            assert_eq!(rec.outcome, TransitionOutcome::Applied);
        }
        assert_eq!(sm.current(), TradeState::Idle);
    }

    #[test]
    fn test_illegal_jump_rejected_and_state_kept() {
        let (_dir, mut journal) = temp_journal();
        let mut sm = StateMachine::new();
        let rec = sm
            .attempt(TradeState::Ordering, "C-1", "ep-1", &mut journal)
            .unwrap();
        assert_eq!(rec.outcome, TransitionOutcome::RejectedInvalid);
        assert_eq!(sm.current(), TradeState::Idle);

        // Rejection itself must be journaled at alert severity.
        let entries = Journal::read_all(journal.path()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].payload["severity"], "ALERT");
        assert_eq!(entries[0].payload["outcome"], "REJECTED_INVALID");
    }

    #[test]
    fn test_rollback_journaled_distinctly() {
        let (_dir, mut journal) = temp_journal();
        let mut sm = StateMachine::new();
        sm.attempt(TradeState::Scanning, "C-1", "ep-1", &mut journal).unwrap();
        sm.attempt(TradeState::SignalReceived, "C-2", "ep-1", &mut journal).unwrap();
        sm.attempt(TradeState::Deciding, "C-3", "ep-1", &mut journal).unwrap();
        sm.attempt(TradeState::Ordering, "C-4", "ep-1", &mut journal).unwrap();

        // Order submission failed downstream: compensate back to Idle.
        let rec = sm.rollback_to(TradeState::Idle, "C-4", "ep-1", &mut journal).unwrap();
        assert_eq!(rec.outcome, TransitionOutcome::RolledBack);
        assert_eq!(sm.current(), TradeState::Idle);

        let entries = Journal::read_all(journal.path()).unwrap();
        let last = entries.last().unwrap();
        assert_eq!(last.payload["outcome"], "ROLLED_BACK");
    }

    #[test]
    fn test_rollback_reverses_just_applied_edge() {
        let (_dir, mut journal) = temp_journal();
        let mut sm = StateMachine::new();
        sm.attempt(TradeState::Scanning, "C-1", "ep-1", &mut journal).unwrap();
        sm.attempt(TradeState::SignalReceived, "C-2", "ep-1", &mut journal).unwrap();
        sm.attempt(TradeState::Deciding, "C-3", "ep-1", &mut journal).unwrap();
        sm.attempt(TradeState::Ordering, "C-4", "ep-1", &mut journal).unwrap();

        // ORDERING has no forward edge to DECIDING, but the failed command
        // applied DECIDING -> ORDERING, so compensation walks it backwards.
        let rec = sm
            .rollback_to(TradeState::Deciding, "C-4", "ep-1", &mut journal)
            .unwrap();
        assert_eq!(rec.outcome, TransitionOutcome::RolledBack);
        assert_eq!(sm.current(), TradeState::Deciding);
    }

    #[test]
    fn test_rollback_across_multiple_hops_is_rejected() {
        let (_dir, mut journal) = temp_journal();
        let mut sm = StateMachine::new();
        sm.attempt(TradeState::Scanning, "C-1", "ep-1", &mut journal).unwrap();
        sm.attempt(TradeState::SignalReceived, "C-2", "ep-1", &mut journal).unwrap();
        sm.attempt(TradeState::Deciding, "C-3", "ep-1", &mut journal).unwrap();

        // No edge between DECIDING and SCANNING in either direction;
        // caller must escalate.
        let rec = sm
            .rollback_to(TradeState::Scanning, "C-3", "ep-1", &mut journal)
            .unwrap();
        assert_eq!(rec.outcome, TransitionOutcome::RejectedInvalid);
        assert_eq!(sm.current(), TradeState::Deciding);
    }

    #[test]
    fn test_replay_reconstructs_state() {
        let (_dir, mut journal) = temp_journal();
        let mut sm = StateMachine::new();
        sm.attempt(TradeState::Scanning, "C-1", "ep-1", &mut journal).unwrap();
        sm.attempt(TradeState::SignalReceived, "C-2", "ep-1", &mut journal).unwrap();
        sm.attempt(TradeState::Deciding, "C-3", "ep-1", &mut journal).unwrap();
        // A rejected attempt must not affect replay.
        sm.attempt(TradeState::Closed, "C-4", "ep-1", &mut journal).unwrap();

        let entries = Journal::read_all(journal.path()).unwrap();
        assert_eq!(StateMachine::replay(&entries), TradeState::Deciding);
        assert_eq!(StateMachine::replay(&entries), sm.current());
    }

    #[test]
    fn test_replay_includes_rollbacks() {
        let (_dir, mut journal) = temp_journal();
        let mut sm = StateMachine::new();
        sm.attempt(TradeState::Scanning, "C-1", "ep-1", &mut journal).unwrap();
        sm.attempt(TradeState::Idle, "C-2", "ep-1", &mut journal).unwrap();
        sm.attempt(TradeState::Scanning, "C-3", "ep-2", &mut journal).unwrap();
        sm.attempt(TradeState::SignalReceived, "C-4", "ep-2", &mut journal).unwrap();
        sm.attempt(TradeState::Deciding, "C-5", "ep-2", &mut journal).unwrap();
        sm.attempt(TradeState::Ordering, "C-6", "ep-2", &mut journal).unwrap();
        sm.rollback_to(TradeState::Idle, "C-6", "ep-2", &mut journal).unwrap();

        let entries = Journal::read_all(journal.path()).unwrap();
        assert_eq!(StateMachine::replay(&entries), TradeState::Idle);
        assert_eq!(StateMachine::replay(&entries), sm.current());
    }

    #[test]
    fn test_closed_only_reaches_idle() {
        assert_eq!(TradeState::Closed.successors(), &[TradeState::Idle]);
        assert!(!TradeState::Closed.can_reach(TradeState::Scanning));
    }
}
